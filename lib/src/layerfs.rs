//! Overlays ordered layer archives into a single virtual filesystem.
//!
//! Layers are ordered base first. Lookup scans from the top layer down;
//! the first hit wins, and a whiteout hit masks everything beneath it.
//! All operations are pure functions of the layer-set snapshot.

use std::collections::BTreeMap;

use tracing::trace;

use crate::{
    archive::{Archive, Entry, EntryKind},
    error::{ArchiveError, FsError},
};

/// Hard bound on symlink traversals during [`LayerFs::resolve`].
const MAX_LINK_DEPTH: usize = 40;

/// An entry located in a specific layer.
#[derive(Debug, Clone)]
pub struct Located {
    /// Index of the owning layer (base = 0).
    pub layer: usize,
    pub entry: Entry,
}

/// One name in a merged directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// A read-only filesystem assembled from ordered layer archives.
#[derive(Debug, Clone)]
pub struct LayerFs {
    layers: Vec<Archive>,
    workdir: String,
}

impl LayerFs {
    /// Assemble a filesystem from layers (base first) and the image's
    /// working directory, which anchors relative paths.
    pub fn new(layers: Vec<Archive>, workdir: impl Into<String>) -> Self {
        let workdir = workdir.into();
        let workdir = if workdir.starts_with('/') {
            workdir
        } else {
            format!("/{workdir}")
        };
        Self { layers, workdir }
    }

    /// Number of layers in the set.
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Normalize `path` to a canonical absolute form: anchored at the image
    /// workdir if relative, `.` collapsed, `..` resolved without escaping
    /// the root.
    pub fn normalize(&self, path: &str) -> Result<String, FsError> {
        if path.contains('\0') {
            return Err(FsError::InvalidPath(path.replace('\0', "\\0")));
        }
        let anchored = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{path}", self.workdir)
        };

        let mut components: Vec<&str> = Vec::new();
        for component in anchored.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    if components.pop().is_none() {
                        return Err(FsError::InvalidPath(path.to_string()));
                    }
                }
                other => components.push(other),
            }
        }
        Ok(format!("/{}", components.join("/")))
    }

    /// Find the topmost entry for `path` without following symlinks.
    ///
    /// A whiteout hit short-circuits to `NotFound`. Directories that exist
    /// only implicitly (as a prefix of deeper entries) are synthesized.
    pub fn lookup(&self, path: &str) -> Result<Located, FsError> {
        let canonical = self.normalize(path)?;
        let rel = canonical.trim_start_matches('/');

        // The root always exists, owned by the top layer.
        if rel.is_empty() {
            return Ok(Located {
                layer: self.layers.len().saturating_sub(1),
                entry: synthetic_dir(String::new()),
            });
        }

        for (layer, archive) in self.layers.iter().enumerate().rev() {
            if let Some(entry) = lookup_verbatim(archive, rel, &canonical) {
                trace!(%canonical, layer, kind = ?entry.kind, "lookup hit");
                if entry.is_deleted() {
                    return Err(FsError::NotFound(canonical));
                }
                return Ok(Located {
                    layer,
                    entry: entry.clone(),
                });
            }
            if has_child(archive, rel) {
                trace!(%canonical, layer, "lookup implicit directory");
                return Ok(Located {
                    layer,
                    entry: synthetic_dir(rel.to_string()),
                });
            }
        }
        Err(FsError::NotFound(canonical))
    }

    /// Walk `path` component by component, following symlinks at each step,
    /// and return the canonical non-symlink path.
    pub fn resolve(&self, path: &str) -> Result<String, FsError> {
        let mut remaining: Vec<String> = {
            let canonical = self.normalize(path)?;
            canonical
                .split('/')
                .filter(|c| !c.is_empty())
                .rev()
                .map(str::to_string)
                .collect()
        };
        let mut resolved = String::new();
        let mut traversals = 0usize;

        while let Some(component) = remaining.pop() {
            let candidate = format!("{resolved}/{component}");
            let located = self.lookup(&candidate)?;

            if located.entry.kind != EntryKind::Symlink {
                resolved = candidate;
                continue;
            }

            traversals += 1;
            if traversals > MAX_LINK_DEPTH {
                return Err(FsError::Loop(self.normalize(path)?));
            }

            let target = located.entry.link.clone().unwrap_or_default();
            // Rebase the walk at the link target, keeping unconsumed
            // components to append after it.
            let base = if target.starts_with('/') {
                target
            } else {
                format!("{resolved}/{target}")
            };
            let rebased = self.normalize(&base)?;
            let mut rest: Vec<String> = rebased
                .split('/')
                .filter(|c| !c.is_empty())
                .rev()
                .map(str::to_string)
                .collect();
            std::mem::swap(&mut remaining, &mut rest);
            // `rest` now holds the old remaining tail; walk it after the target.
            remaining.splice(0..0, rest);
            resolved = String::new();
        }

        if resolved.is_empty() {
            resolved.push('/');
        }
        Ok(resolved)
    }

    /// Read a window of a regular file. Hardlinks chase their target within
    /// the owning layer first, then across the layer set.
    pub fn read_file(
        &self,
        located: &Located,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>, ArchiveError> {
        let archive = &self.layers[located.layer];
        match located.entry.kind {
            EntryKind::File => archive.read(&located.entry, offset, length),
            EntryKind::Hardlink => {
                let target = located.entry.link.clone().unwrap_or_default();
                let rel = target.trim_start_matches('/');
                if let Some(entry) = archive.lookup(rel).or_else(|| archive.lookup(&target)) {
                    if entry.kind == EntryKind::File {
                        return archive.read(entry, offset, length);
                    }
                }
                let located = self
                    .lookup(&format!("/{rel}"))
                    .map_err(|e| ArchiveError::Corrupt(format!("dangling hardlink: {e}")))?;
                self.read_file(&located, offset, length)
            }
            _ => Err(ArchiveError::Corrupt(format!(
                "read of non-file entry {:?}",
                located.entry.path
            ))),
        }
    }

    /// Merged directory listing, sorted by name.
    ///
    /// Whiteouts in higher layers mask lower entries; a name present in
    /// several layers takes its highest-layer version.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let canonical = self.normalize(path)?;
        let located = self.lookup(&canonical)?;
        if located.entry.kind != EntryKind::Dir {
            return Err(FsError::NotADirectory(canonical));
        }
        let rel = canonical.trim_start_matches('/');

        let mut merged: BTreeMap<String, EntryKind> = BTreeMap::new();
        for archive in self.layers.iter().take(located.layer + 1) {
            for entry in archive.entries() {
                let Some(name) = direct_child(&entry.path, rel) else {
                    continue;
                };
                let exact = entry.path.trim_start_matches('/').trim_end_matches('/')
                    == join_rel(rel, name);
                match entry.kind {
                    EntryKind::Deleted if exact => {
                        merged.remove(name);
                    }
                    // A whiteout deeper down leaves the child itself alone.
                    EntryKind::Deleted => {}
                    kind if exact => {
                        merged.insert(name.to_string(), kind);
                    }
                    // A deeper path implies an intermediate directory.
                    _ => {
                        merged.entry(name.to_string()).or_insert(EntryKind::Dir);
                    }
                }
            }
        }

        Ok(merged
            .into_iter()
            .map(|(name, kind)| DirEntry { name, kind })
            .collect())
    }
}

/// Archives store paths verbatim; try the canonical relative form and the
/// leading-slash form.
fn lookup_verbatim<'a>(archive: &'a Archive, rel: &str, canonical: &str) -> Option<&'a Entry> {
    archive.lookup(rel).or_else(|| archive.lookup(canonical))
}

fn has_child(archive: &Archive, rel: &str) -> bool {
    archive
        .entries()
        .any(|entry| direct_or_deep_child(&entry.path, rel) && !entry.is_deleted())
}

fn direct_or_deep_child(stored: &str, rel: &str) -> bool {
    stored
        .trim_start_matches('/')
        .strip_prefix(rel)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|rest| !rest.is_empty())
}

/// If `stored` names something inside `rel` (possibly deeper), return the
/// first path component below `rel`.
fn direct_child<'a>(stored: &'a str, rel: &str) -> Option<&'a str> {
    let stored = stored.trim_start_matches('/').trim_end_matches('/');
    let rest = if rel.is_empty() {
        stored
    } else {
        stored.strip_prefix(rel)?.strip_prefix('/')?
    };
    let name = rest.split('/').next()?;
    (!name.is_empty()).then_some(name)
}

fn join_rel(rel: &str, name: &str) -> String {
    if rel.is_empty() {
        name.to_string()
    } else {
        format!("{rel}/{name}")
    }
}

fn synthetic_dir(path: String) -> Entry {
    Entry {
        kind: EntryKind::Dir,
        path,
        link: None,
        size: 0,
        mode: 0o755,
        uid: 0,
        gid: 0,
        mtime: 0,
        offset: 0,
        length: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveWriter, EntryMeta};
    use crate::Digest;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    async fn writer(dir: &Path, tag: &str) -> ArchiveWriter {
        ArchiveWriter::create(dir.join(tag)).await.expect("create")
    }

    async fn seal(writer: ArchiveWriter, tag: &str) -> Archive {
        let paths = writer
            .finish(&Digest::of_bytes(tag.as_bytes()))
            .await
            .expect("finish");
        Archive::open(&paths.index).expect("open")
    }

    async fn base_layer(dir: &Path) -> Archive {
        let mut w = writer(dir, "base").await;
        w.push_dir("etc", EntryMeta { mode: 0o755, ..Default::default() });
        w.push_file("etc/foo", EntryMeta { mode: 0o644, ..Default::default() }, &b"base foo"[..])
            .await
            .expect("push");
        w.push_file("etc/keep", EntryMeta { mode: 0o644, ..Default::default() }, &b"keep"[..])
            .await
            .expect("push");
        w.push_symlink("etc/alias", "foo", EntryMeta::default());
        w.push_file("bin/tool", EntryMeta { mode: 0o755, ..Default::default() }, &b"#!"[..])
            .await
            .expect("push");
        seal(w, "base").await
    }

    #[tokio::test]
    async fn whiteout_masks_lower_layer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = base_layer(dir.path()).await;
        let top = {
            let mut w = writer(dir.path(), "top").await;
            w.push_whiteout("etc/foo");
            seal(w, "top").await
        };

        let fs = LayerFs::new(vec![base, top], "/");
        assert_eq!(
            fs.lookup("/etc/foo").expect_err("masked by whiteout"),
            FsError::NotFound("/etc/foo".into())
        );

        let names = fs
            .read_dir("/etc")
            .expect("read_dir")
            .into_iter()
            .map(|e| e.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["alias", "keep"]);
    }

    #[tokio::test]
    async fn higher_layer_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = base_layer(dir.path()).await;
        let top = {
            let mut w = writer(dir.path(), "top").await;
            w.push_file("etc/foo", EntryMeta::default(), &b"top foo"[..])
                .await
                .expect("push");
            seal(w, "top").await
        };

        let fs = LayerFs::new(vec![base, top], "/");
        let located = fs.lookup("/etc/foo").expect("lookup");
        assert_eq!(located.layer, 1);
        assert_eq!(fs.read_file(&located, 0, 64).expect("read"), b"top foo");
    }

    #[tokio::test]
    async fn listings_are_sorted_and_merged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = base_layer(dir.path()).await;
        let top = {
            let mut w = writer(dir.path(), "top").await;
            w.push_file("etc/zz", EntryMeta::default(), &b"z"[..])
                .await
                .expect("push");
            w.push_file("etc/aa", EntryMeta::default(), &b"a"[..])
                .await
                .expect("push");
            seal(w, "top").await
        };

        let fs = LayerFs::new(vec![base, top], "/");
        let names = fs
            .read_dir("/etc")
            .expect("read_dir")
            .into_iter()
            .map(|e| e.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["aa", "alias", "foo", "keep", "zz"]);
    }

    #[tokio::test]
    async fn implicit_directories_exist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = base_layer(dir.path()).await;

        // `bin` was never written as a directory entry, only as a prefix.
        let fs = LayerFs::new(vec![base], "/");
        let located = fs.lookup("/bin").expect("lookup");
        assert_eq!(located.entry.kind, EntryKind::Dir);

        let names = fs
            .read_dir("/")
            .expect("read_dir")
            .into_iter()
            .map(|e| e.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["bin", "etc"]);
    }

    #[tokio::test]
    async fn symlinks_resolve() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = base_layer(dir.path()).await;
        let fs = LayerFs::new(vec![base], "/");

        assert_eq!(fs.resolve("/etc/alias").expect("resolve"), "/etc/foo");
        // lookup itself does not follow links.
        let located = fs.lookup("/etc/alias").expect("lookup");
        assert_eq!(located.entry.kind, EntryKind::Symlink);
    }

    #[tokio::test]
    async fn symlink_loops_are_bounded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let looped = {
            let mut w = writer(dir.path(), "loop").await;
            w.push_symlink("a", "b", EntryMeta::default());
            w.push_symlink("b", "a", EntryMeta::default());
            seal(w, "loop").await
        };

        let fs = LayerFs::new(vec![looped], "/");
        assert_eq!(fs.resolve("/a"), Err(FsError::Loop("/a".into())));
    }

    #[tokio::test]
    async fn relative_paths_anchor_at_workdir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = base_layer(dir.path()).await;
        let fs = LayerFs::new(vec![base], "/etc");

        let located = fs.lookup("foo").expect("lookup");
        assert_eq!(located.entry.path, "etc/foo");
    }

    #[test]
    fn normalize_rejects_escapes() {
        let fs = LayerFs::new(Vec::new(), "/");
        assert_eq!(fs.normalize("/a/./b/../c").expect("normalize"), "/a/c");
        assert!(fs.normalize("/../etc").is_err());
        assert!(fs.normalize("/etc\0/passwd").is_err());
    }
}
