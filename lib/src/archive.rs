//! Indexed, content-addressed layer archives.
//!
//! A layer is stored as two sibling files: `<hex>.idx` holds one JSON record
//! per entry in write order, and `<hex>.contents` holds the concatenated
//! payloads of regular files. The writer runs on the async pull/build
//! pipelines; the reader is synchronous and does positioned reads so the
//! in-VM serving path never touches a runtime.

use std::{
    collections::HashMap,
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::{error::ArchiveError, Digest};

/// Extension of the index file of an archive pair.
pub const INDEX_EXT: &str = "idx";

/// Extension of the contents file of an archive pair.
pub const CONTENTS_EXT: &str = "contents";

/// The kind of filesystem object an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file with a payload window into the contents file.
    File,
    Dir,
    /// Symbolic link; `link` holds the target.
    Symlink,
    /// Hard link; `link` holds the path of the linked entry.
    Hardlink,
    /// Whiteout: the named path is deleted by this layer.
    Deleted,
}

/// One record in a layer archive index.
///
/// Paths are stored verbatim as written; normalization is the caller's
/// responsibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,

    /// POSIX path with forward slashes.
    pub path: String,

    /// Link target for symlinks and hardlinks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,

    #[serde(default)]
    pub size: u64,

    #[serde(default)]
    pub mode: u32,

    #[serde(default)]
    pub uid: u32,

    #[serde(default)]
    pub gid: u32,

    /// Modification time, seconds since the epoch.
    #[serde(default)]
    pub mtime: i64,

    /// Byte window into the contents file; zero for payload-free kinds.
    #[serde(default)]
    pub offset: u64,

    #[serde(default)]
    pub length: u64,
}

impl Entry {
    /// Whether this entry masks lower layers rather than providing content.
    pub fn is_deleted(&self) -> bool {
        self.kind == EntryKind::Deleted
    }
}

/// Metadata for an entry being written, minus the payload window
/// (the writer fills that in).
#[derive(Debug, Clone, Default)]
pub struct EntryMeta {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
}

/// Streams a new archive pair to disk.
///
/// Entries appear in the index in the order written. Regular-file payloads
/// are appended to the contents file and the index records the byte window;
/// all other kinds write no payload.
pub struct ArchiveWriter {
    dir: PathBuf,
    entries: Vec<Entry>,
    contents: BufWriter<tokio::fs::File>,
    contents_path: PathBuf,
    written: u64,
    hasher: Sha256,
}

impl ArchiveWriter {
    /// Start a new archive in `dir`. Content is staged under temporary names
    /// until [`finish`](Self::finish) renames the pair into place.
    pub async fn create(dir: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let contents_path = dir.join(format!(".staging-{}.contents", std::process::id()));
        let contents = tokio::fs::File::create(&contents_path).await?;
        Ok(Self {
            dir,
            entries: Vec::new(),
            contents: BufWriter::new(contents),
            contents_path,
            written: 0,
            hasher: Sha256::new(),
        })
    }

    /// Append a regular file, streaming its payload into the contents file.
    pub async fn push_file(
        &mut self,
        path: impl Into<String>,
        meta: EntryMeta,
        mut payload: impl AsyncRead + Unpin,
    ) -> Result<(), ArchiveError> {
        let offset = self.written;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = payload.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.contents.write_all(&buf[..n]).await?;
            self.hasher.update(&buf[..n]);
            self.written += n as u64;
        }
        let length = self.written - offset;
        self.push(Entry {
            kind: EntryKind::File,
            path: path.into(),
            link: None,
            size: length,
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            mtime: meta.mtime,
            offset,
            length,
        });
        Ok(())
    }

    /// Append a directory entry.
    pub fn push_dir(&mut self, path: impl Into<String>, meta: EntryMeta) {
        self.push(Entry {
            kind: EntryKind::Dir,
            path: path.into(),
            link: None,
            size: 0,
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            mtime: meta.mtime,
            offset: 0,
            length: 0,
        });
    }

    /// Append a symlink entry pointing at `target`.
    pub fn push_symlink(
        &mut self,
        path: impl Into<String>,
        target: impl Into<String>,
        meta: EntryMeta,
    ) {
        self.push(Entry {
            kind: EntryKind::Symlink,
            path: path.into(),
            link: Some(target.into()),
            size: 0,
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            mtime: meta.mtime,
            offset: 0,
            length: 0,
        });
    }

    /// Append a hardlink entry referring to `target` within the same archive.
    pub fn push_hardlink(
        &mut self,
        path: impl Into<String>,
        target: impl Into<String>,
        meta: EntryMeta,
    ) {
        self.push(Entry {
            kind: EntryKind::Hardlink,
            path: path.into(),
            link: Some(target.into()),
            size: 0,
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            mtime: meta.mtime,
            offset: 0,
            length: 0,
        });
    }

    /// Append a whiteout marking `path` as deleted.
    pub fn push_whiteout(&mut self, path: impl Into<String>) {
        self.push(Entry {
            kind: EntryKind::Deleted,
            path: path.into(),
            link: None,
            size: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            mtime: 0,
            offset: 0,
            length: 0,
        });
    }

    fn push(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    /// Number of entries written so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries have been written.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flush and rename the pair to `<digest-hex>.{idx,contents}`.
    ///
    /// The caller supplies the digest the archive is addressed by, typically
    /// the layer's blob digest from the registry.
    pub async fn finish(self, digest: &Digest) -> Result<ArchivePaths, ArchiveError> {
        self.finish_named(digest.as_hex()).await
    }

    /// Like [`finish`](Self::finish), but derives the digest from the content
    /// written: the running hash of payload bytes folded with each index
    /// record. Used for build-produced layers which have no registry digest.
    pub async fn finish_content_addressed(
        mut self,
    ) -> Result<(Digest, ArchivePaths), ArchiveError> {
        for entry in &self.entries {
            let line = serde_json::to_vec(entry)
                .map_err(|e| ArchiveError::Corrupt(format!("encode index record: {e}")))?;
            self.hasher.update(&line);
        }
        let digest = Digest::from_hash(std::mem::take(&mut self.hasher).finalize().to_vec());
        let paths = self.finish_named(digest.as_hex()).await?;
        Ok((digest, paths))
    }

    async fn finish_named(mut self, hex: String) -> Result<ArchivePaths, ArchiveError> {
        self.contents.flush().await?;
        self.contents.into_inner().sync_all().await?;

        let index_path = self.dir.join(format!("{hex}.{INDEX_EXT}"));
        let contents_dest = self.dir.join(format!("{hex}.{CONTENTS_EXT}"));

        let mut index = Vec::new();
        for entry in &self.entries {
            let line = serde_json::to_vec(entry)
                .map_err(|e| ArchiveError::Corrupt(format!("encode index record: {e}")))?;
            index.extend_from_slice(&line);
            index.push(b'\n');
        }
        tokio::fs::write(&index_path, index).await?;
        tokio::fs::rename(&self.contents_path, &contents_dest).await?;

        debug!(entries = self.entries.len(), path = %index_path.display(), "archive written");
        Ok(ArchivePaths {
            index: index_path,
            contents: contents_dest,
        })
    }
}

/// Paths of a finished archive pair.
#[derive(Debug, Clone)]
pub struct ArchivePaths {
    pub index: PathBuf,
    pub contents: PathBuf,
}

/// An immutable layer archive opened for reading.
///
/// The index is held in memory; payload reads go straight to the contents
/// file through a shared handle.
#[derive(Clone)]
pub struct Archive {
    inner: Arc<ArchiveInner>,
}

struct ArchiveInner {
    entries: Vec<Entry>,
    /// Exact-path lookup; last entry with a given path wins.
    by_path: HashMap<String, usize>,
    contents: Mutex<File>,
    contents_len: u64,
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("entries", &self.inner.entries.len())
            .finish()
    }
}

impl Archive {
    /// Open the archive whose index lives at `index_path`; the contents file
    /// is the sibling with the [`CONTENTS_EXT`] extension.
    pub fn open(index_path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let index_path = index_path.as_ref();
        let contents_path = index_path.with_extension(CONTENTS_EXT);

        let index = std::fs::read(index_path)?;
        let contents = File::open(&contents_path)?;
        let contents_len = contents.metadata()?.len();

        let mut entries = Vec::new();
        let mut by_path = HashMap::new();
        for (lineno, line) in index.split(|&b| b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            let entry: Entry = serde_json::from_slice(line).map_err(|e| {
                ArchiveError::Corrupt(format!("index record {}: {e}", lineno + 1))
            })?;
            if entry.kind == EntryKind::File
                && entry.offset.saturating_add(entry.length) > contents_len
            {
                return Err(ArchiveError::WindowOutOfRange {
                    offset: entry.offset,
                    length: entry.length,
                    size: contents_len,
                });
            }
            by_path.insert(entry.path.clone(), entries.len());
            entries.push(entry);
        }

        Ok(Self {
            inner: Arc::new(ArchiveInner {
                entries,
                by_path,
                contents: Mutex::new(contents),
                contents_len,
            }),
        })
    }

    /// Iterate entries in write order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.inner.entries.iter()
    }

    /// Number of entries in the archive.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the archive holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Look up an entry by its exact stored path. A miss is not an error.
    pub fn lookup(&self, path: &str) -> Option<&Entry> {
        self.inner
            .by_path
            .get(path)
            .map(|&idx| &self.inner.entries[idx])
    }

    /// Read up to `length` bytes of a regular-file entry starting at
    /// `offset` within the file. Reads past EOF return a short (possibly
    /// empty) result.
    pub fn read(&self, entry: &Entry, offset: u64, length: usize) -> Result<Vec<u8>, ArchiveError> {
        if entry.kind != EntryKind::File {
            return Err(ArchiveError::Corrupt(format!(
                "read of non-file entry {:?}",
                entry.path
            )));
        }
        if entry.offset.saturating_add(entry.length) > self.inner.contents_len {
            return Err(ArchiveError::WindowOutOfRange {
                offset: entry.offset,
                length: entry.length,
                size: self.inner.contents_len,
            });
        }
        if offset >= entry.length {
            return Ok(Vec::new());
        }

        let available = (entry.length - offset) as usize;
        let want = length.min(available);
        let mut buf = vec![0u8; want];

        let mut contents = self.inner.contents.lock();
        contents.seek(SeekFrom::Start(entry.offset + offset))?;
        contents.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read the whole payload of a regular-file entry.
    pub fn read_all(&self, entry: &Entry) -> Result<Vec<u8>, ArchiveError> {
        self.read(entry, 0, entry.length as usize)
    }
}
