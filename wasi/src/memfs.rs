//! In-memory filesystem driver.
//!
//! A tree of directory and file nodes addressed by inode. File contents
//! are either owned bytes or a lazy reader invoked on first access, so a
//! host can mount large assets without paying for them up front. The host
//! populates the tree through the builder methods before mounting; after
//! that everything goes through the WASI surface.

use std::sync::Mutex;

use hashbrown::HashMap;

use crate::driver::{derive_child_rights, DeviceDriver, DeviceId};
use crate::fd::FileDescriptor;
use crate::paths;
use crate::types::{
    Advice, Dirent, Fdflags, Filestat, Filetype, Lookupflags, Oflags, Rights, WasiError,
    WasiResult, Whence,
};

/// Inode of the device root directory.
const ROOT_INODE: u64 = 1;

/// A lazy file body, produced on first access.
pub type LazyReader = Box<dyn FnMut() -> WasiResult<Vec<u8>> + Send>;

/// File body: owned bytes, or a reader deferred until first use.
pub enum FileContent {
    Bytes(Vec<u8>),
    Lazy(LazyReader),
}

enum NodeKind {
    Directory { entries: std::collections::BTreeMap<String, u64> },
    File { content: FileContent },
}

struct Node {
    parent: u64,
    kind: NodeKind,
}

struct Inner {
    nodes: HashMap<u64, Node>,
    next_inode: u64,
}

impl Inner {
    fn node(&self, inode: u64) -> WasiResult<&Node> {
        self.nodes.get(&inode).ok_or(WasiError::NoEnt)
    }

    fn node_mut(&mut self, inode: u64) -> WasiResult<&mut Node> {
        self.nodes.get_mut(&inode).ok_or(WasiError::NoEnt)
    }

    /// Walk an absolute, normalised device path down from the root.
    fn resolve(&self, path: &str) -> WasiResult<u64> {
        let path = paths::normalize(path);
        let mut inode = ROOT_INODE;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match &self.node(inode)?.kind {
                NodeKind::Directory { entries } => {
                    inode = *entries.get(segment).ok_or(WasiError::NoEnt)?;
                }
                NodeKind::File { .. } => return Err(WasiError::NotDir),
            }
        }
        Ok(inode)
    }

    fn alloc_inode(&mut self) -> u64 {
        let inode = self.next_inode;
        self.next_inode += 1;
        inode
    }

    /// Force a lazy body into owned bytes and return it.
    fn materialize(&mut self, inode: u64) -> WasiResult<&mut Vec<u8>> {
        let node = self.node_mut(inode)?;
        match &mut node.kind {
            NodeKind::Directory { .. } => Err(WasiError::IsDir),
            NodeKind::File { content } => {
                if let FileContent::Lazy(reader) = content {
                    let bytes = reader()?;
                    *content = FileContent::Bytes(bytes);
                }
                match content {
                    FileContent::Bytes(bytes) => Ok(bytes),
                    FileContent::Lazy(_) => unreachable!("materialised above"),
                }
            }
        }
    }

    fn filetype(&self, inode: u64) -> WasiResult<Filetype> {
        Ok(match self.node(inode)?.kind {
            NodeKind::Directory { .. } => Filetype::Directory,
            NodeKind::File { .. } => Filetype::RegularFile,
        })
    }

    fn filestat(&mut self, device: DeviceId, inode: u64) -> WasiResult<Filestat> {
        let filetype = self.filetype(inode)?;
        let size = match filetype {
            Filetype::Directory => 0,
            _ => self.materialize(inode)?.len() as u64,
        };
        Ok(Filestat {
            dev: device.0,
            ino: inode,
            filetype: filetype as u8,
            nlink: 1,
            size,
            ..Filestat::default()
        })
    }

    /// Create a file node under `parent`; the entry must not exist.
    fn create_file(&mut self, parent: u64, name: &str, content: FileContent) -> WasiResult<u64> {
        let inode = self.alloc_inode();
        match &mut self.node_mut(parent)?.kind {
            NodeKind::Directory { entries } => {
                if entries.contains_key(name) {
                    return Err(WasiError::Exist);
                }
                entries.insert(String::from(name), inode);
            }
            NodeKind::File { .. } => return Err(WasiError::NotDir),
        }
        self.nodes.insert(
            inode,
            Node {
                parent,
                kind: NodeKind::File { content },
            },
        );
        Ok(inode)
    }
}

/// The in-memory filesystem device.
pub struct InMemoryFileSystemDevice {
    id: DeviceId,
    read_only: bool,
    inner: Mutex<Inner>,
}

impl InMemoryFileSystemDevice {
    /// An empty filesystem containing only the root directory.
    pub fn new(read_only: bool) -> InMemoryFileSystemDevice {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INODE,
            Node {
                parent: ROOT_INODE,
                kind: NodeKind::Directory {
                    entries: std::collections::BTreeMap::new(),
                },
            },
        );
        InMemoryFileSystemDevice {
            id: DeviceId::next(),
            read_only,
            inner: Mutex::new(Inner {
                nodes,
                next_inode: ROOT_INODE + 1,
            }),
        }
    }

    // ── Builder surface (host side, before mounting) ───────────────

    /// Create a directory and any missing ancestors.
    pub fn create_dir_all(&self, path: &str) -> WasiResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let path = paths::normalize(path);
        let mut inode = ROOT_INODE;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let existing = match &inner.node(inode)?.kind {
                NodeKind::Directory { entries } => entries.get(segment).copied(),
                NodeKind::File { .. } => return Err(WasiError::NotDir),
            };
            inode = match existing {
                Some(child) => child,
                None => {
                    let child = inner.alloc_inode();
                    match &mut inner.node_mut(inode)?.kind {
                        NodeKind::Directory { entries } => {
                            entries.insert(String::from(segment), child);
                        }
                        NodeKind::File { .. } => return Err(WasiError::NotDir),
                    }
                    inner.nodes.insert(
                        child,
                        Node {
                            parent: inode,
                            kind: NodeKind::Directory {
                                entries: std::collections::BTreeMap::new(),
                            },
                        },
                    );
                    child
                }
            };
        }
        Ok(())
    }

    /// Add a file with owned contents, creating parent directories.
    pub fn add_file(&self, path: &str, content: Vec<u8>) -> WasiResult<()> {
        self.add(path, FileContent::Bytes(content))
    }

    /// Add a file whose contents come from `reader` on first access.
    pub fn add_lazy_file(&self, path: &str, reader: LazyReader) -> WasiResult<()> {
        self.add(path, FileContent::Lazy(reader))
    }

    fn add(&self, path: &str, content: FileContent) -> WasiResult<()> {
        let path = paths::normalize(path);
        let (parent, name) = paths::split(&path);
        if name.is_empty() {
            return Err(WasiError::Inval);
        }
        self.create_dir_all(parent)?;
        let mut inner = self.inner.lock().unwrap();
        let parent_inode = inner.resolve(parent)?;
        inner.create_file(parent_inode, name, content)?;
        Ok(())
    }

    /// Read a file's contents (host-side convenience).
    pub fn contents(&self, path: &str) -> WasiResult<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let inode = inner.resolve(path)?;
        Ok(inner.materialize(inode)?.clone())
    }

    fn resolve_from(&self, fd: &FileDescriptor, path: &str) -> String {
        paths::resolve(&fd.path, path)
    }
}

impl DeviceDriver for InMemoryFileSystemDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn fd_advise(
        &self,
        _fd: &mut FileDescriptor,
        _offset: u64,
        _length: u64,
        _advice: Advice,
    ) -> WasiResult<()> {
        // Nothing to advise; accept and ignore.
        Ok(())
    }

    fn fd_allocate(&self, fd: &mut FileDescriptor, offset: u64, len: u64) -> WasiResult<()> {
        self.assert_writable()?;
        let mut inner = self.inner.lock().unwrap();
        let bytes = inner.materialize(fd.inode)?;
        let end = (offset + len) as usize;
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        Ok(())
    }

    fn fd_datasync(&self, _fd: &FileDescriptor) -> WasiResult<()> {
        Ok(())
    }

    fn fd_filestat_get(&self, fd: &FileDescriptor) -> WasiResult<Filestat> {
        self.inner.lock().unwrap().filestat(self.id, fd.inode)
    }

    fn fd_filestat_set_size(&self, fd: &mut FileDescriptor, size: u64) -> WasiResult<()> {
        self.assert_writable()?;
        let mut inner = self.inner.lock().unwrap();
        let bytes = inner.materialize(fd.inode)?;
        bytes.resize(size as usize, 0);
        Ok(())
    }

    fn fd_pread(&self, fd: &mut FileDescriptor, offset: u64, buf: &mut [u8]) -> WasiResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        let bytes = inner.materialize(fd.inode)?;
        let start = (offset as usize).min(bytes.len());
        let count = buf.len().min(bytes.len() - start);
        buf[..count].copy_from_slice(&bytes[start..start + count]);
        Ok(count)
    }

    fn fd_pwrite(&self, fd: &mut FileDescriptor, offset: u64, buf: &[u8]) -> WasiResult<usize> {
        self.assert_writable()?;
        let mut inner = self.inner.lock().unwrap();
        let bytes = inner.materialize(fd.inode)?;
        let end = offset as usize + buf.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn fd_read(&self, fd: &mut FileDescriptor, buf: &mut [u8]) -> WasiResult<usize> {
        let cursor = fd.cursor;
        let count = self.fd_pread(fd, cursor, buf)?;
        fd.cursor += count as u64;
        Ok(count)
    }

    fn fd_readdir(&self, fd: &mut FileDescriptor, cookie: u64) -> WasiResult<Vec<Dirent>> {
        let inner = self.inner.lock().unwrap();
        let node = inner.node(fd.inode)?;
        let entries = match &node.kind {
            NodeKind::Directory { entries } => entries,
            NodeKind::File { .. } => return Err(WasiError::NotDir),
        };

        let mut out = Vec::new();
        let mut listing: Vec<(String, u64, Filetype)> = vec![
            (String::from("."), fd.inode, Filetype::Directory),
            (String::from(".."), node.parent, Filetype::Directory),
        ];
        for (name, &inode) in entries {
            listing.push((name.clone(), inode, inner.filetype(inode)?));
        }
        for (index, (name, inode, filetype)) in listing.into_iter().enumerate() {
            if (index as u64) < cookie {
                continue;
            }
            out.push(Dirent {
                d_next: index as u64 + 1,
                d_ino: inode,
                d_type: filetype,
                name,
            });
        }
        Ok(out)
    }

    fn fd_seek(&self, fd: &mut FileDescriptor, offset: i64, whence: Whence) -> WasiResult<u64> {
        let size = {
            let mut inner = self.inner.lock().unwrap();
            inner.materialize(fd.inode)?.len() as i64
        };
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => fd.cursor as i64,
            Whence::End => size,
        };
        let target = base + offset;
        if target < 0 {
            return Err(WasiError::Inval);
        }
        fd.cursor = target as u64;
        Ok(fd.cursor)
    }

    fn fd_sync(&self, _fd: &FileDescriptor) -> WasiResult<()> {
        Ok(())
    }

    fn fd_write(&self, fd: &mut FileDescriptor, buf: &[u8]) -> WasiResult<usize> {
        self.assert_writable()?;
        let offset = if fd.fdflags.contains(Fdflags::APPEND) {
            let mut inner = self.inner.lock().unwrap();
            inner.materialize(fd.inode)?.len() as u64
        } else {
            fd.cursor
        };
        let count = self.fd_pwrite(fd, offset, buf)?;
        fd.cursor = offset + count as u64;
        Ok(count)
    }

    fn fd_bytes_available(&self, fd: &FileDescriptor) -> WasiResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.materialize(fd.inode)?.len() as u64;
        Ok(len.saturating_sub(fd.cursor))
    }

    fn path_create_directory(&self, fd: &FileDescriptor, path: &str) -> WasiResult<()> {
        self.assert_writable()?;
        let full = self.resolve_from(fd, path);
        let (parent, name) = paths::split(&full);
        let mut inner = self.inner.lock().unwrap();
        let parent_inode = inner.resolve(parent)?;
        let child = inner.alloc_inode();
        match &mut inner.node_mut(parent_inode)?.kind {
            NodeKind::Directory { entries } => {
                if entries.contains_key(name) {
                    return Err(WasiError::Exist);
                }
                entries.insert(String::from(name), child);
            }
            NodeKind::File { .. } => return Err(WasiError::NotDir),
        }
        inner.nodes.insert(
            child,
            Node {
                parent: parent_inode,
                kind: NodeKind::Directory {
                    entries: std::collections::BTreeMap::new(),
                },
            },
        );
        Ok(())
    }

    fn path_filestat_get(
        &self,
        fd: &FileDescriptor,
        _flags: Lookupflags,
        path: &str,
    ) -> WasiResult<Filestat> {
        let full = self.resolve_from(fd, path);
        let mut inner = self.inner.lock().unwrap();
        let inode = inner.resolve(&full)?;
        inner.filestat(self.id, inode)
    }

    fn path_open(
        &self,
        parent: &FileDescriptor,
        _dirflags: Lookupflags,
        path: &str,
        oflags: Oflags,
        rights_base: Rights,
        rights_inheriting: Rights,
        fdflags: Fdflags,
        new_fd: u32,
    ) -> WasiResult<FileDescriptor> {
        let full = self.resolve_from(parent, path);
        let mut inner = self.inner.lock().unwrap();

        let existing = inner.resolve(&full);
        let inode = match existing {
            Ok(inode) => {
                if oflags.contains(Oflags::CREAT) && oflags.contains(Oflags::EXCL) {
                    return Err(WasiError::Exist);
                }
                inode
            }
            Err(WasiError::NoEnt) if oflags.contains(Oflags::CREAT) => {
                self.assert_writable()?;
                let (dir, name) = paths::split(&full);
                let parent_inode = inner.resolve(dir)?;
                inner.create_file(parent_inode, name, FileContent::Bytes(Vec::new()))?
            }
            Err(e) => return Err(e),
        };

        let filetype = inner.filetype(inode)?;
        if oflags.contains(Oflags::DIRECTORY) && filetype != Filetype::Directory {
            return Err(WasiError::NotDir);
        }
        if oflags.contains(Oflags::TRUNC) {
            self.assert_writable()?;
            inner.materialize(inode)?.clear();
        }

        let directory = filetype == Filetype::Directory;
        let (base, inheriting) = derive_child_rights(
            parent,
            rights_base,
            rights_inheriting,
            directory,
            self.read_only,
        );
        Ok(FileDescriptor {
            device: self.id,
            fd: new_fd,
            filetype,
            rights_base: base,
            rights_inheriting: inheriting,
            fdflags,
            inode,
            cursor: 0,
            path: full,
            preopen_path: None,
        })
    }

    fn path_readlink(&self, _fd: &FileDescriptor, _path: &str) -> WasiResult<String> {
        // The tree has no symbolic links.
        Err(WasiError::Inval)
    }

    fn path_remove_directory(&self, fd: &FileDescriptor, path: &str) -> WasiResult<()> {
        self.assert_writable()?;
        let full = self.resolve_from(fd, path);
        let mut inner = self.inner.lock().unwrap();
        let inode = inner.resolve(&full)?;
        if inode == ROOT_INODE {
            return Err(WasiError::Acces);
        }
        match &inner.node(inode)?.kind {
            NodeKind::Directory { entries } => {
                if !entries.is_empty() {
                    return Err(WasiError::NotEmpty);
                }
            }
            NodeKind::File { .. } => return Err(WasiError::NotDir),
        }
        let parent = inner.node(inode)?.parent;
        let (_, name) = paths::split(&full);
        if let NodeKind::Directory { entries } = &mut inner.node_mut(parent)?.kind {
            entries.remove(name);
        }
        inner.nodes.remove(&inode);
        Ok(())
    }

    fn path_rename(
        &self,
        old_fd: &FileDescriptor,
        old_path: &str,
        new_fd: &FileDescriptor,
        new_path: &str,
    ) -> WasiResult<()> {
        self.assert_writable()?;
        let old_full = self.resolve_from(old_fd, old_path);
        let new_full = self.resolve_from(new_fd, new_path);
        let mut inner = self.inner.lock().unwrap();

        let inode = inner.resolve(&old_full)?;
        if inode == ROOT_INODE {
            return Err(WasiError::Acces);
        }
        let (new_dir, new_name) = paths::split(&new_full);
        let new_parent = inner.resolve(new_dir)?;
        match &inner.node(new_parent)?.kind {
            NodeKind::Directory { entries } => {
                if entries.contains_key(new_name) {
                    return Err(WasiError::Exist);
                }
            }
            NodeKind::File { .. } => return Err(WasiError::NotDir),
        }

        // Unhook from the old parent, rehook under the new name.
        let old_parent = inner.node(inode)?.parent;
        let (_, old_name) = paths::split(&old_full);
        if let NodeKind::Directory { entries } = &mut inner.node_mut(old_parent)?.kind {
            entries.remove(old_name);
        }
        if let NodeKind::Directory { entries } = &mut inner.node_mut(new_parent)?.kind {
            entries.insert(String::from(new_name), inode);
        }
        inner.node_mut(inode)?.parent = new_parent;
        Ok(())
    }

    fn path_unlink_file(&self, fd: &FileDescriptor, path: &str) -> WasiResult<()> {
        self.assert_writable()?;
        let full = self.resolve_from(fd, path);
        let mut inner = self.inner.lock().unwrap();
        let inode = inner.resolve(&full)?;
        match inner.node(inode)?.kind {
            NodeKind::Directory { .. } => return Err(WasiError::IsDir),
            NodeKind::File { .. } => {}
        }
        let parent = inner.node(inode)?.parent;
        let (_, name) = paths::split(&full);
        if let NodeKind::Directory { entries } = &mut inner.node_mut(parent)?.kind {
            entries.remove(name);
        }
        inner.nodes.remove(&inode);
        Ok(())
    }
}

impl core::fmt::Debug for InMemoryFileSystemDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryFileSystemDevice")
            .field("id", &self.id)
            .field("read_only", &self.read_only)
            .finish()
    }
}
