//! Adapts a [`LayerFs`] to the file-protocol verbs the guest transport
//! issues.
//!
//! Handles are opaque nonzero integers allocated here; handle 1 is the root
//! directory. Every `lookup` allocates or bumps a handle and every `release`
//! decrements it; a handle stays valid until its refcount drops to zero.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::{
    archive::EntryKind,
    error::{ArchiveError, FsError},
    layerfs::{DirEntry, LayerFs, Located},
};

/// The well-known handle of the filesystem root.
pub const ROOT_HANDLE: u64 = 1;

/// Attributes returned for a handle, shaped for the guest transport's
/// `getattr` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub handle: u64,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
}

struct Node {
    path: String,
    located: Located,
    refcount: u64,
}

#[derive(Default)]
struct HandleTable {
    next: u64,
    by_handle: HashMap<u64, Node>,
    by_path: HashMap<String, u64>,
}

/// The guest-facing filesystem backend.
pub struct VirtioFs {
    fs: LayerFs,
    table: Mutex<HandleTable>,
}

impl VirtioFs {
    /// Wrap a layered filesystem, installing the root at [`ROOT_HANDLE`].
    pub fn new(fs: LayerFs) -> Result<Self, FsError> {
        let root = fs.lookup("/")?;
        let mut table = HandleTable {
            next: ROOT_HANDLE + 1,
            ..Default::default()
        };
        table.by_handle.insert(
            ROOT_HANDLE,
            Node {
                path: "/".to_string(),
                located: root,
                refcount: 1,
            },
        );
        table.by_path.insert("/".to_string(), ROOT_HANDLE);
        Ok(Self {
            fs,
            table: Mutex::new(table),
        })
    }

    /// Look up `name` under the directory `parent`, allocating or bumping a
    /// handle for the result.
    pub fn lookup(&self, parent: u64, name: &str) -> Result<Attr, FsError> {
        let parent_path = {
            let table = self.table.lock();
            let node = table
                .by_handle
                .get(&parent)
                .ok_or(FsError::StaleHandle(parent))?;
            if node.located.entry.kind != EntryKind::Dir {
                return Err(FsError::NotADirectory(node.path.clone()));
            }
            node.path.clone()
        };

        let path = self.fs.normalize(&format!("{parent_path}/{name}"))?;
        let located = self.fs.lookup(&path)?;

        let mut table = self.table.lock();
        let existing = table.by_path.get(&path).copied();
        let handle = match existing {
            Some(handle) => {
                let node = table
                    .by_handle
                    .get_mut(&handle)
                    .expect("path map entries have live nodes");
                node.refcount += 1;
                handle
            }
            None => {
                let handle = table.next;
                table.next += 1;
                table.by_handle.insert(
                    handle,
                    Node {
                        path: path.clone(),
                        located: located.clone(),
                        refcount: 1,
                    },
                );
                table.by_path.insert(path.clone(), handle);
                handle
            }
        };
        trace!(%path, handle, "lookup");
        Ok(attr_of(handle, &located))
    }

    /// Attributes of an open handle.
    pub fn getattr(&self, handle: u64) -> Result<Attr, FsError> {
        let table = self.table.lock();
        let node = table
            .by_handle
            .get(&handle)
            .ok_or(FsError::StaleHandle(handle))?;
        Ok(attr_of(handle, &node.located))
    }

    /// Validate a handle for reading. Only regular files (and hardlinks to
    /// them) can be opened.
    pub fn open(&self, handle: u64) -> Result<(), FsError> {
        let table = self.table.lock();
        let node = table
            .by_handle
            .get(&handle)
            .ok_or(FsError::StaleHandle(handle))?;
        match node.located.entry.kind {
            EntryKind::File | EntryKind::Hardlink => Ok(()),
            EntryKind::Dir => Err(FsError::IsADirectory(node.path.clone())),
            _ => Err(FsError::NotFound(node.path.clone())),
        }
    }

    /// Read a window of an open file. Windows past EOF return a short read.
    pub fn read(&self, handle: u64, offset: u64, length: usize) -> Result<Vec<u8>, ArchiveError> {
        let located = {
            let table = self.table.lock();
            table
                .by_handle
                .get(&handle)
                .map(|node| node.located.clone())
                .ok_or_else(|| ArchiveError::Corrupt(format!("stale handle {handle}")))?
        };
        self.fs.read_file(&located, offset, length)
    }

    /// Merged listing of an open directory.
    pub fn readdir(&self, handle: u64) -> Result<Vec<DirEntry>, FsError> {
        let path = {
            let table = self.table.lock();
            table
                .by_handle
                .get(&handle)
                .map(|node| node.path.clone())
                .ok_or(FsError::StaleHandle(handle))?
        };
        self.fs.read_dir(&path)
    }

    /// Target of a symlink handle.
    pub fn readlink(&self, handle: u64) -> Result<String, FsError> {
        let table = self.table.lock();
        let node = table
            .by_handle
            .get(&handle)
            .ok_or(FsError::StaleHandle(handle))?;
        match node.located.entry.kind {
            EntryKind::Symlink => Ok(node.located.entry.link.clone().unwrap_or_default()),
            _ => Err(FsError::NotFound(node.path.clone())),
        }
    }

    /// Drop one reference to a handle, freeing it at zero. The root is never
    /// freed.
    pub fn release(&self, handle: u64) {
        if handle == ROOT_HANDLE {
            return;
        }
        let mut table = self.table.lock();
        if let Some(node) = table.by_handle.get_mut(&handle) {
            node.refcount -= 1;
            if node.refcount == 0 {
                let path = node.path.clone();
                table.by_handle.remove(&handle);
                table.by_path.remove(&path);
                trace!(%path, handle, "handle released");
            }
        }
    }

    /// Number of live handles, root included.
    pub fn live_handles(&self) -> usize {
        self.table.lock().by_handle.len()
    }
}

fn attr_of(handle: u64, located: &Located) -> Attr {
    let entry = &located.entry;
    let size = match entry.kind {
        EntryKind::File => entry.length,
        EntryKind::Symlink => entry.link.as_deref().map(str::len).unwrap_or(0) as u64,
        _ => 0,
    };
    Attr {
        handle,
        kind: entry.kind,
        size,
        mode: entry.mode,
        uid: entry.uid,
        gid: entry.gid,
        mtime: entry.mtime,
    }
}
