//! Round-trips tar layers through the archive store and layered filesystem.

use skiff_lib::{
    archive::EntryKind,
    layerfs::LayerFs,
    registry::ingest_layer,
    store::Image,
    transform::Compression,
    Digest, ImageConfig,
};
use tokio_tar::{Builder, EntryType, Header};

/// Build an uncompressed tar blob from (path, kind, content/target, mode).
async fn build_tar(entries: &[(&str, EntryType, &str, u32)]) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    for (path, kind, content, mode) in entries {
        let mut header = Header::new_gnu();
        header.set_entry_type(*kind);
        header.set_mode(*mode);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(1_700_000_000);
        match kind {
            EntryType::Regular => {
                header.set_size(content.len() as u64);
                builder
                    .append_data(&mut header, *path, content.as_bytes())
                    .await
                    .expect("append file");
            }
            EntryType::Symlink | EntryType::Link => {
                header.set_size(0);
                header.set_link_name(content).expect("link name");
                builder
                    .append_data(&mut header, *path, &[][..])
                    .await
                    .expect("append link");
            }
            EntryType::Directory => {
                header.set_size(0);
                builder
                    .append_data(&mut header, *path, &[][..])
                    .await
                    .expect("append dir");
            }
            other => panic!("unsupported test entry type {other:?}"),
        }
    }
    builder.into_inner().await.expect("finish tar")
}

/// Ingest a tar blob as a layer archive, returning the archive's digest.
async fn ingest(dir: &std::path::Path, tag: &str, tar: &[u8]) -> Digest {
    let blob = dir.join(format!("{tag}.tar"));
    tokio::fs::write(&blob, tar).await.expect("write blob");
    let digest = Digest::of_bytes(tag.as_bytes());
    ingest_layer(&blob, Compression::None, dir, &digest)
        .await
        .expect("ingest layer");
    digest
}

#[tokio::test]
async fn tar_to_layerfs_roundtrip_preserves_metadata() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tar = build_tar(&[
        ("etc/", EntryType::Directory, "", 0o755),
        ("etc/hostname", EntryType::Regular, "skiff\n", 0o644),
        ("etc/motd", EntryType::Regular, "welcome aboard\n", 0o600),
        ("etc/hosts-link", EntryType::Symlink, "hostname", 0o777),
        ("usr/bin/tool", EntryType::Regular, "#!/bin/sh\n", 0o755),
    ])
    .await;

    let digest = ingest(dir.path(), "base", &tar).await;
    let image = Image {
        dir: dir.path().to_path_buf(),
        config: ImageConfig::builder().layers(vec![digest]).build(),
    };
    let fs = LayerFs::new(image.open_layers().expect("open layers"), "/");

    // Contents survive byte for byte.
    let located = fs.lookup("/etc/hostname").expect("lookup");
    assert_eq!(located.entry.mode, 0o644);
    assert_eq!(located.entry.mtime, 1_700_000_000);
    assert_eq!(
        fs.read_file(&located, 0, usize::MAX).expect("read"),
        b"skiff\n"
    );

    let secret = fs.lookup("/etc/motd").expect("lookup");
    assert_eq!(secret.entry.mode, 0o600);

    // Symlink targets survive.
    let link = fs.lookup("/etc/hosts-link").expect("lookup");
    assert_eq!(link.entry.kind, EntryKind::Symlink);
    assert_eq!(link.entry.link.as_deref(), Some("hostname"));
    assert_eq!(fs.resolve("/etc/hosts-link").expect("resolve"), "/etc/hostname");

    // Directory listings are stable and sorted.
    let names = fs
        .read_dir("/etc")
        .expect("read_dir")
        .into_iter()
        .map(|e| e.name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["hostname", "hosts-link", "motd"]);
}

#[tokio::test]
async fn whiteouts_mask_lower_layers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let base = build_tar(&[
        ("etc/", EntryType::Directory, "", 0o755),
        ("etc/foo", EntryType::Regular, "from base\n", 0o644),
        ("etc/bar", EntryType::Regular, "stays\n", 0o644),
    ])
    .await;
    let top = build_tar(&[("etc/.wh.foo", EntryType::Regular, "", 0o644)]).await;

    let base_digest = ingest(dir.path(), "base", &base).await;
    let top_digest = ingest(dir.path(), "top", &top).await;

    let image = Image {
        dir: dir.path().to_path_buf(),
        config: ImageConfig::builder()
            .layers(vec![base_digest, top_digest])
            .build(),
    };
    let fs = LayerFs::new(image.open_layers().expect("open layers"), "/");

    // The whiteout masks the base layer's file.
    assert!(fs.lookup("/etc/foo").is_err());
    let names = fs
        .read_dir("/etc")
        .expect("read_dir")
        .into_iter()
        .map(|e| e.name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["bar"]);
}

#[tokio::test]
async fn hardlinks_read_their_target() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tar = build_tar(&[
        ("data/", EntryType::Directory, "", 0o755),
        ("data/original", EntryType::Regular, "shared bytes", 0o644),
        ("data/alias", EntryType::Link, "data/original", 0o644),
    ])
    .await;

    let digest = ingest(dir.path(), "links", &tar).await;
    let image = Image {
        dir: dir.path().to_path_buf(),
        config: ImageConfig::builder().layers(vec![digest]).build(),
    };
    let fs = LayerFs::new(image.open_layers().expect("open layers"), "/");

    let located = fs.lookup("/data/alias").expect("lookup");
    assert_eq!(located.entry.kind, EntryKind::Hardlink);
    assert_eq!(
        fs.read_file(&located, 0, usize::MAX).expect("read"),
        b"shared bytes"
    );
}

#[tokio::test]
async fn gzip_layers_decompress_during_ingest() {
    use std::io::Write;

    let dir = tempfile::tempdir().expect("tempdir");
    let tar = build_tar(&[("greeting", EntryType::Regular, "hello from gzip", 0o644)]).await;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar).expect("compress");
    let compressed = encoder.finish().expect("finish");

    let blob = dir.path().join("layer.tar.gz");
    tokio::fs::write(&blob, &compressed).await.expect("write blob");
    let digest = Digest::of_bytes(b"gzip-layer");
    ingest_layer(&blob, Compression::Gzip, dir.path(), &digest)
        .await
        .expect("ingest");

    let image = Image {
        dir: dir.path().to_path_buf(),
        config: ImageConfig::builder().layers(vec![digest]).build(),
    };
    let fs = LayerFs::new(image.open_layers().expect("open layers"), "/");
    let located = fs.lookup("/greeting").expect("lookup");
    assert_eq!(
        fs.read_file(&located, 0, usize::MAX).expect("read"),
        b"hello from gzip"
    );
}
