//! Workspace-backed filesystem driver.
//!
//! Delegates to the host editor's file-system API, modelled by the
//! [`WorkspaceFileSystem`] trait: whole-file reads and writes, directory
//! listings, stat, delete and a single backend `rename`. The backend has
//! no inodes, so numbers are manufactured from a monotonic counter keyed
//! by absolute path, and no symbolic links, so `path_readlink` answers
//! "not a symlink".
//!
//! Open files are cached whole; writes mark the cache dirty and are
//! flushed back on `fd_sync`/`fd_datasync`/`fd_close`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use crate::driver::{derive_child_rights, DeviceDriver, DeviceId};
use crate::fd::FileDescriptor;
use crate::paths;
use crate::types::{
    Advice, Dirent, Fdflags, Filestat, Filetype, Lookupflags, Oflags, Rights, WasiError,
    WasiResult, Whence,
};

/// What the editor API distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceFileType {
    File,
    Directory,
}

/// Stat record of the editor API.
#[derive(Debug, Clone, Copy)]
pub struct WorkspaceStat {
    pub file_type: WorkspaceFileType,
    pub size: u64,
    /// Modification time, nanoseconds since the epoch.
    pub mtime_ns: u64,
    /// Creation time, nanoseconds since the epoch.
    pub ctime_ns: u64,
}

/// The host editor's file-system API, as consumed by this driver.
pub trait WorkspaceFileSystem: Send + Sync {
    fn stat(&self, path: &str) -> WasiResult<WorkspaceStat>;
    fn read_directory(&self, path: &str) -> WasiResult<Vec<(String, WorkspaceFileType)>>;
    fn read_file(&self, path: &str) -> WasiResult<Vec<u8>>;
    /// Create or overwrite a file with the given contents.
    fn write_file(&self, path: &str, content: &[u8]) -> WasiResult<()>;
    fn create_directory(&self, path: &str) -> WasiResult<()>;
    fn delete(&self, path: &str, recursive: bool) -> WasiResult<()>;
    /// Move a file or directory. Metadata preservation is the backend's
    /// responsibility.
    fn rename(&self, from: &str, to: &str) -> WasiResult<()>;
}

/// Cached contents of an open file.
struct OpenFile {
    content: Vec<u8>,
    dirty: bool,
}

/// Filesystem driver over a [`WorkspaceFileSystem`].
pub struct WorkspaceFileSystemDevice {
    id: DeviceId,
    read_only: bool,
    fs: Arc<dyn WorkspaceFileSystem>,
    open_files: Mutex<HashMap<u32, OpenFile>>,
    inodes: Mutex<HashMap<String, u64>>,
    next_inode: AtomicU64,
}

impl WorkspaceFileSystemDevice {
    /// A driver over the given editor file system.
    pub fn new(fs: Arc<dyn WorkspaceFileSystem>, read_only: bool) -> WorkspaceFileSystemDevice {
        WorkspaceFileSystemDevice {
            id: DeviceId::next(),
            read_only,
            fs,
            open_files: Mutex::new(HashMap::new()),
            inodes: Mutex::new(HashMap::new()),
            next_inode: AtomicU64::new(1),
        }
    }

    fn resolve_from(&self, fd: &FileDescriptor, path: &str) -> String {
        paths::resolve(&fd.path, path)
    }

    fn inode(&self, path: &str) -> u64 {
        let mut inodes = self.inodes.lock().unwrap();
        if let Some(&ino) = inodes.get(path) {
            return ino;
        }
        let ino = self.next_inode.fetch_add(1, Ordering::Relaxed);
        inodes.insert(String::from(path), ino);
        ino
    }

    fn forget_inode(&self, path: &str) {
        self.inodes.lock().unwrap().remove(path);
    }

    fn filestat_of(&self, path: &str, stat: WorkspaceStat) -> Filestat {
        let filetype = match stat.file_type {
            WorkspaceFileType::File => Filetype::RegularFile,
            WorkspaceFileType::Directory => Filetype::Directory,
        };
        Filestat {
            dev: self.id.0,
            ino: self.inode(path),
            filetype: filetype as u8,
            nlink: 1,
            size: stat.size,
            atim: stat.mtime_ns,
            mtim: stat.mtime_ns,
            ctim: stat.ctime_ns,
        }
    }

    fn with_open<F, R>(&self, fd: u32, f: F) -> WasiResult<R>
    where
        F: FnOnce(&mut OpenFile) -> WasiResult<R>,
    {
        let mut open_files = self.open_files.lock().unwrap();
        let file = open_files.get_mut(&fd).ok_or(WasiError::BadF)?;
        f(file)
    }

    fn flush(&self, fd: &FileDescriptor) -> WasiResult<()> {
        let content = {
            let mut open_files = self.open_files.lock().unwrap();
            match open_files.get_mut(&fd.fd) {
                Some(file) if file.dirty => {
                    file.dirty = false;
                    Some(file.content.clone())
                }
                _ => None,
            }
        };
        match content {
            Some(content) => self.fs.write_file(&fd.path, &content),
            None => Ok(()),
        }
    }
}

impl DeviceDriver for WorkspaceFileSystemDevice {
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
        Ok(())
    }

    fn fd_allocate(&self, fd: &mut FileDescriptor, offset: u64, len: u64) -> WasiResult<()> {
        self.assert_writable()?;
        self.with_open(fd.fd, |file| {
            let end = (offset + len) as usize;
            if end > file.content.len() {
                file.content.resize(end, 0);
                file.dirty = true;
            }
            Ok(())
        })
    }

    fn fd_close(&self, fd: &FileDescriptor) -> WasiResult<()> {
        self.flush(fd)?;
        self.open_files.lock().unwrap().remove(&fd.fd);
        Ok(())
    }

    fn fd_datasync(&self, fd: &FileDescriptor) -> WasiResult<()> {
        self.flush(fd)
    }

    fn fd_filestat_get(&self, fd: &FileDescriptor) -> WasiResult<Filestat> {
        if fd.filetype == Filetype::RegularFile {
            let cached = {
                let open_files = self.open_files.lock().unwrap();
                open_files.get(&fd.fd).map(|f| f.content.len() as u64)
            };
            if let Some(size) = cached {
                let mut stat = self.filestat_of(&fd.path, self.fs.stat(&fd.path).unwrap_or(
                    WorkspaceStat {
                        file_type: WorkspaceFileType::File,
                        size,
                        mtime_ns: 0,
                        ctime_ns: 0,
                    },
                ));
                stat.size = size;
                return Ok(stat);
            }
        }
        let stat = self.fs.stat(&fd.path)?;
        Ok(self.filestat_of(&fd.path, stat))
    }

    fn fd_filestat_set_size(&self, fd: &mut FileDescriptor, size: u64) -> WasiResult<()> {
        self.assert_writable()?;
        self.with_open(fd.fd, |file| {
            file.content.resize(size as usize, 0);
            file.dirty = true;
            Ok(())
        })
    }

    fn fd_pread(&self, fd: &mut FileDescriptor, offset: u64, buf: &mut [u8]) -> WasiResult<usize> {
        self.with_open(fd.fd, |file| {
            let start = (offset as usize).min(file.content.len());
            let count = buf.len().min(file.content.len() - start);
            buf[..count].copy_from_slice(&file.content[start..start + count]);
            Ok(count)
        })
    }

    fn fd_pwrite(&self, fd: &mut FileDescriptor, offset: u64, buf: &[u8]) -> WasiResult<usize> {
        self.assert_writable()?;
        self.with_open(fd.fd, |file| {
            let end = offset as usize + buf.len();
            if end > file.content.len() {
                file.content.resize(end, 0);
            }
            file.content[offset as usize..end].copy_from_slice(buf);
            file.dirty = true;
            Ok(buf.len())
        })
    }

    fn fd_read(&self, fd: &mut FileDescriptor, buf: &mut [u8]) -> WasiResult<usize> {
        let cursor = fd.cursor;
        let count = self.fd_pread(fd, cursor, buf)?;
        fd.cursor += count as u64;
        Ok(count)
    }

    fn fd_renumber(&self, fd: &FileDescriptor, to: u32) -> WasiResult<()> {
        let mut open_files = self.open_files.lock().unwrap();
        if let Some(file) = open_files.remove(&fd.fd) {
            open_files.insert(to, file);
        }
        Ok(())
    }

    fn fd_readdir(&self, fd: &mut FileDescriptor, cookie: u64) -> WasiResult<Vec<Dirent>> {
        let children = self.fs.read_directory(&fd.path)?;
        let mut listing: Vec<(String, Filetype, u64)> = vec![
            (String::from("."), Filetype::Directory, fd.inode),
            (
                String::from(".."),
                Filetype::Directory,
                self.inode(paths::split(&fd.path).0),
            ),
        ];
        for (name, file_type) in children {
            let child_path = paths::resolve(&fd.path, &name);
            let filetype = match file_type {
                WorkspaceFileType::File => Filetype::RegularFile,
                WorkspaceFileType::Directory => Filetype::Directory,
            };
            listing.push((name, filetype, self.inode(&child_path)));
        }
        Ok(listing
            .into_iter()
            .enumerate()
            .skip(cookie as usize)
            .map(|(index, (name, d_type, d_ino))| Dirent {
                d_next: index as u64 + 1,
                d_ino,
                d_type,
                name,
            })
            .collect())
    }

    fn fd_seek(&self, fd: &mut FileDescriptor, offset: i64, whence: Whence) -> WasiResult<u64> {
        let size = self.with_open(fd.fd, |file| Ok(file.content.len() as i64))?;
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

    fn fd_sync(&self, fd: &FileDescriptor) -> WasiResult<()> {
        self.flush(fd)
    }

    fn fd_write(&self, fd: &mut FileDescriptor, buf: &[u8]) -> WasiResult<usize> {
        self.assert_writable()?;
        let offset = if fd.fdflags.contains(Fdflags::APPEND) {
            self.with_open(fd.fd, |file| Ok(file.content.len() as u64))?
        } else {
            fd.cursor
        };
        let count = self.fd_pwrite(fd, offset, buf)?;
        fd.cursor = offset + count as u64;
        Ok(count)
    }

    fn fd_bytes_available(&self, fd: &FileDescriptor) -> WasiResult<u64> {
        self.with_open(fd.fd, |file| {
            Ok((file.content.len() as u64).saturating_sub(fd.cursor))
        })
    }

    fn path_create_directory(&self, fd: &FileDescriptor, path: &str) -> WasiResult<()> {
        self.assert_writable()?;
        let full = self.resolve_from(fd, path);
        if self.fs.stat(&full).is_ok() {
            return Err(WasiError::Exist);
        }
        self.fs.create_directory(&full)
    }

    fn path_filestat_get(
        &self,
        fd: &FileDescriptor,
        _flags: Lookupflags,
        path: &str,
    ) -> WasiResult<Filestat> {
        let full = self.resolve_from(fd, path);
        let stat = self.fs.stat(&full)?;
        Ok(self.filestat_of(&full, stat))
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
        let existing = self.fs.stat(&full);

        let (filetype, content) = match existing {
            Ok(stat) => {
                if oflags.contains(Oflags::CREAT) && oflags.contains(Oflags::EXCL) {
                    return Err(WasiError::Exist);
                }
                match stat.file_type {
                    WorkspaceFileType::Directory => {
                        if oflags.contains(Oflags::TRUNC) {
                            return Err(WasiError::IsDir);
                        }
                        (Filetype::Directory, None)
                    }
                    WorkspaceFileType::File => {
                        if oflags.contains(Oflags::DIRECTORY) {
                            return Err(WasiError::NotDir);
                        }
                        let content = if oflags.contains(Oflags::TRUNC) {
                            self.assert_writable()?;
                            Vec::new()
                        } else {
                            self.fs.read_file(&full)?
                        };
                        (Filetype::RegularFile, Some(content))
                    }
                }
            }
            Err(WasiError::NoEnt) if oflags.contains(Oflags::CREAT) => {
                self.assert_writable()?;
                self.fs.write_file(&full, &[])?;
                (Filetype::RegularFile, Some(Vec::new()))
            }
            Err(e) => return Err(e),
        };

        if oflags.contains(Oflags::DIRECTORY) && filetype != Filetype::Directory {
            return Err(WasiError::NotDir);
        }

        let directory = filetype == Filetype::Directory;
        let (base, inheriting) = derive_child_rights(
            parent,
            rights_base,
            rights_inheriting,
            directory,
            self.read_only,
        );
        let descriptor = FileDescriptor {
            device: self.id,
            fd: new_fd,
            filetype,
            rights_base: base,
            rights_inheriting: inheriting,
            fdflags,
            inode: self.inode(&full),
            cursor: 0,
            path: full,
            preopen_path: None,
        };
        if let Some(content) = content {
            let dirty = oflags.contains(Oflags::TRUNC);
            self.open_files
                .lock()
                .unwrap()
                .insert(new_fd, OpenFile { content, dirty });
        }
        Ok(descriptor)
    }

    fn path_readlink(&self, _fd: &FileDescriptor, _path: &str) -> WasiResult<String> {
        // The editor API has no symbolic links.
        Err(WasiError::Inval)
    }

    fn path_remove_directory(&self, fd: &FileDescriptor, path: &str) -> WasiResult<()> {
        self.assert_writable()?;
        let full = self.resolve_from(fd, path);
        let stat = self.fs.stat(&full)?;
        if stat.file_type != WorkspaceFileType::Directory {
            return Err(WasiError::NotDir);
        }
        if !self.fs.read_directory(&full)?.is_empty() {
            return Err(WasiError::NotEmpty);
        }
        self.fs.delete(&full, false)?;
        self.forget_inode(&full);
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
        self.fs.rename(&old_full, &new_full)?;
        self.forget_inode(&old_full);
        self.forget_inode(&new_full);
        Ok(())
    }

    fn path_unlink_file(&self, fd: &FileDescriptor, path: &str) -> WasiResult<()> {
        self.assert_writable()?;
        let full = self.resolve_from(fd, path);
        let stat = self.fs.stat(&full)?;
        if stat.file_type == WorkspaceFileType::Directory {
            return Err(WasiError::IsDir);
        }
        self.fs.delete(&full, false)?;
        self.forget_inode(&full);
        Ok(())
    }
}

impl core::fmt::Debug for WorkspaceFileSystemDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkspaceFileSystemDevice")
            .field("id", &self.id)
            .field("read_only", &self.read_only)
            .finish()
    }
}
