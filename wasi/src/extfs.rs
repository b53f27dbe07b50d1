//! Extension-resource driver: a read-only mount over bundled assets.
//!
//! The backing store is a [`ResourceProvider`], typically the assets an
//! extension ships with. Every mutating operation answers `Perm` without
//! consulting the provider.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use crate::driver::{derive_child_rights, DeviceDriver, DeviceId};
use crate::fd::FileDescriptor;
use crate::paths;
use crate::types::{
    Advice, Dirent, Fdflags, Filestat, Filetype, Fstflags, Lookupflags, Oflags, Rights,
    WasiError, WasiResult, Whence,
};

/// Source of bundled, immutable assets.
pub trait ResourceProvider: Send + Sync {
    /// Bytes of the asset at `path`, or `None` if it is not a file.
    fn read(&self, path: &str) -> Option<Vec<u8>>;
    /// Entries of the directory at `path` as `(name, is_directory)`, or
    /// `None` if it is not a directory.
    fn list(&self, path: &str) -> Option<Vec<(String, bool)>>;
}

/// A provider over a fixed path → bytes map; directories are implied by
/// the file paths.
#[derive(Debug, Default)]
pub struct StaticResourceProvider {
    files: BTreeMap<String, Vec<u8>>,
}

impl StaticResourceProvider {
    /// Build from `(path, contents)` pairs.
    pub fn new(entries: impl IntoIterator<Item = (String, Vec<u8>)>) -> StaticResourceProvider {
        StaticResourceProvider {
            files: entries
                .into_iter()
                .map(|(path, bytes)| (paths::normalize(&path), bytes))
                .collect(),
        }
    }
}

impl ResourceProvider for StaticResourceProvider {
    fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(&paths::normalize(path)).cloned()
    }

    fn list(&self, path: &str) -> Option<Vec<(String, bool)>> {
        let path = paths::normalize(path);
        let prefix = if path == "/" {
            String::from("/")
        } else {
            format!("{}/", path)
        };
        let mut seen: BTreeMap<String, bool> = BTreeMap::new();
        let mut is_dir = path == "/";
        for key in self.files.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                is_dir = true;
                match rest.split_once('/') {
                    Some((dir, _)) => {
                        seen.insert(String::from(dir), true);
                    }
                    None if !rest.is_empty() => {
                        seen.insert(String::from(rest), false);
                    }
                    None => {}
                }
            }
        }
        if !is_dir {
            return None;
        }
        Some(seen.into_iter().collect())
    }
}

/// Read-only filesystem over a [`ResourceProvider`].
pub struct ExtensionResourceDevice {
    id: DeviceId,
    provider: Arc<dyn ResourceProvider>,
    open: Mutex<HashMap<u32, Vec<u8>>>,
    inodes: Mutex<HashMap<String, u64>>,
    next_inode: AtomicU64,
}

impl ExtensionResourceDevice {
    /// A driver over the given provider.
    pub fn new(provider: Arc<dyn ResourceProvider>) -> ExtensionResourceDevice {
        ExtensionResourceDevice {
            id: DeviceId::next(),
            provider,
            open: Mutex::new(HashMap::new()),
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

    fn stat_path(&self, path: &str) -> WasiResult<Filestat> {
        if let Some(bytes) = self.provider.read(path) {
            return Ok(Filestat {
                dev: self.id.0,
                ino: self.inode(path),
                filetype: Filetype::RegularFile as u8,
                nlink: 1,
                size: bytes.len() as u64,
                ..Filestat::default()
            });
        }
        if self.provider.list(path).is_some() {
            return Ok(Filestat {
                dev: self.id.0,
                ino: self.inode(path),
                filetype: Filetype::Directory as u8,
                nlink: 1,
                size: 0,
                ..Filestat::default()
            });
        }
        Err(WasiError::NoEnt)
    }
}

impl DeviceDriver for ExtensionResourceDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn read_only(&self) -> bool {
        true
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

    fn fd_allocate(&self, _fd: &mut FileDescriptor, _offset: u64, _len: u64) -> WasiResult<()> {
        self.assert_writable()
    }

    fn fd_close(&self, fd: &FileDescriptor) -> WasiResult<()> {
        self.open.lock().unwrap().remove(&fd.fd);
        Ok(())
    }

    fn fd_datasync(&self, _fd: &FileDescriptor) -> WasiResult<()> {
        Ok(())
    }

    fn fd_filestat_get(&self, fd: &FileDescriptor) -> WasiResult<Filestat> {
        self.stat_path(&fd.path)
    }

    fn fd_filestat_set_size(&self, _fd: &mut FileDescriptor, _size: u64) -> WasiResult<()> {
        self.assert_writable()
    }

    fn fd_filestat_set_times(
        &self,
        _fd: &mut FileDescriptor,
        _atim: u64,
        _mtim: u64,
        _fst_flags: Fstflags,
    ) -> WasiResult<()> {
        self.assert_writable()
    }

    fn fd_pread(&self, fd: &mut FileDescriptor, offset: u64, buf: &mut [u8]) -> WasiResult<usize> {
        let open = self.open.lock().unwrap();
        let bytes = open.get(&fd.fd).ok_or(WasiError::BadF)?;
        let start = (offset as usize).min(bytes.len());
        let count = buf.len().min(bytes.len() - start);
        buf[..count].copy_from_slice(&bytes[start..start + count]);
        Ok(count)
    }

    fn fd_pwrite(&self, _fd: &mut FileDescriptor, _offset: u64, _buf: &[u8]) -> WasiResult<usize> {
        self.assert_writable().map(|_| 0)
    }

    fn fd_read(&self, fd: &mut FileDescriptor, buf: &mut [u8]) -> WasiResult<usize> {
        let cursor = fd.cursor;
        let count = self.fd_pread(fd, cursor, buf)?;
        fd.cursor += count as u64;
        Ok(count)
    }

    fn fd_renumber(&self, fd: &FileDescriptor, to: u32) -> WasiResult<()> {
        let mut open = self.open.lock().unwrap();
        if let Some(content) = open.remove(&fd.fd) {
            open.insert(to, content);
        }
        Ok(())
    }

    fn fd_readdir(&self, fd: &mut FileDescriptor, cookie: u64) -> WasiResult<Vec<Dirent>> {
        let children = self.provider.list(&fd.path).ok_or(WasiError::NotDir)?;
        let mut listing: Vec<(String, Filetype, u64)> = vec![
            (String::from("."), Filetype::Directory, fd.inode),
            (
                String::from(".."),
                Filetype::Directory,
                self.inode(paths::split(&fd.path).0),
            ),
        ];
        for (name, is_dir) in children {
            let child = paths::resolve(&fd.path, &name);
            let filetype = if is_dir {
                Filetype::Directory
            } else {
                Filetype::RegularFile
            };
            listing.push((name, filetype, self.inode(&child)));
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
        let size = {
            let open = self.open.lock().unwrap();
            open.get(&fd.fd).ok_or(WasiError::BadF)?.len() as i64
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

    fn fd_write(&self, _fd: &mut FileDescriptor, _buf: &[u8]) -> WasiResult<usize> {
        self.assert_writable().map(|_| 0)
    }

    fn fd_bytes_available(&self, fd: &FileDescriptor) -> WasiResult<u64> {
        let open = self.open.lock().unwrap();
        let bytes = open.get(&fd.fd).ok_or(WasiError::BadF)?;
        Ok((bytes.len() as u64).saturating_sub(fd.cursor))
    }

    fn path_create_directory(&self, _fd: &FileDescriptor, _path: &str) -> WasiResult<()> {
        self.assert_writable()
    }

    fn path_filestat_get(
        &self,
        fd: &FileDescriptor,
        _flags: Lookupflags,
        path: &str,
    ) -> WasiResult<Filestat> {
        self.stat_path(&self.resolve_from(fd, path))
    }

    fn path_filestat_set_times(
        &self,
        _fd: &FileDescriptor,
        _flags: Lookupflags,
        _path: &str,
        _atim: u64,
        _mtim: u64,
        _fst_flags: Fstflags,
    ) -> WasiResult<()> {
        self.assert_writable()
    }

    fn path_link(
        &self,
        _old_fd: &FileDescriptor,
        _old_flags: Lookupflags,
        _old_path: &str,
        _new_fd: &FileDescriptor,
        _new_path: &str,
    ) -> WasiResult<()> {
        self.assert_writable()
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
        if oflags.intersects(Oflags::CREAT | Oflags::TRUNC) {
            return Err(WasiError::Perm);
        }
        let full = self.resolve_from(parent, path);

        let (filetype, content) = if let Some(bytes) = self.provider.read(&full) {
            if oflags.contains(Oflags::DIRECTORY) {
                return Err(WasiError::NotDir);
            }
            (Filetype::RegularFile, Some(bytes))
        } else if self.provider.list(&full).is_some() {
            (Filetype::Directory, None)
        } else {
            return Err(WasiError::NoEnt);
        };

        let directory = filetype == Filetype::Directory;
        let (base, inheriting) =
            derive_child_rights(parent, rights_base, rights_inheriting, directory, true);
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
            self.open.lock().unwrap().insert(new_fd, content);
        }
        Ok(descriptor)
    }

    fn path_readlink(&self, _fd: &FileDescriptor, _path: &str) -> WasiResult<String> {
        Err(WasiError::Inval)
    }

    fn path_remove_directory(&self, _fd: &FileDescriptor, _path: &str) -> WasiResult<()> {
        self.assert_writable()
    }

    fn path_rename(
        &self,
        _old_fd: &FileDescriptor,
        _old_path: &str,
        _new_fd: &FileDescriptor,
        _new_path: &str,
    ) -> WasiResult<()> {
        self.assert_writable()
    }

    fn path_symlink(
        &self,
        _old_path: &str,
        _fd: &FileDescriptor,
        _new_path: &str,
    ) -> WasiResult<()> {
        self.assert_writable()
    }

    fn path_unlink_file(&self, _fd: &FileDescriptor, _path: &str) -> WasiResult<()> {
        self.assert_writable()
    }
}

impl core::fmt::Debug for ExtensionResourceDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExtensionResourceDevice")
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> ExtensionResourceDevice {
        let provider = StaticResourceProvider::new([
            (String::from("/bin/tool.wasm"), vec![0, 97, 115, 109]),
            (String::from("/share/readme.md"), b"docs".to_vec()),
        ]);
        ExtensionResourceDevice::new(Arc::new(provider))
    }

    fn dir_fd(device: &ExtensionResourceDevice) -> FileDescriptor {
        FileDescriptor {
            device: device.id,
            fd: 3,
            filetype: Filetype::Directory,
            rights_base: Rights::DIRECTORY_BASE & Rights::READ_ONLY_MASK,
            rights_inheriting: Rights::DIRECTORY_INHERITING & Rights::READ_ONLY_MASK,
            fdflags: Fdflags::empty(),
            inode: 0,
            cursor: 0,
            path: String::from("/"),
            preopen_path: Some(String::from("/")),
        }
    }

    #[test]
    fn test_provider_listing_implies_directories() {
        let provider = StaticResourceProvider::new([(
            String::from("/a/b/c.txt"),
            b"x".to_vec(),
        )]);
        assert_eq!(
            provider.list("/"),
            Some(vec![(String::from("a"), true)])
        );
        assert_eq!(
            provider.list("/a"),
            Some(vec![(String::from("b"), true)])
        );
        assert_eq!(
            provider.list("/a/b"),
            Some(vec![(String::from("c.txt"), false)])
        );
        assert_eq!(provider.list("/a/b/c.txt"), None);
    }

    #[test]
    fn test_open_and_read_asset() {
        let device = device();
        let parent = dir_fd(&device);
        let mut fd = device
            .path_open(
                &parent,
                Lookupflags::empty(),
                "bin/tool.wasm",
                Oflags::empty(),
                Rights::FD_READ,
                Rights::empty(),
                Fdflags::empty(),
                4,
            )
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(device.fd_read(&mut fd, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[0, 97, 115, 109]);
    }

    #[test]
    fn test_every_mutation_is_perm() {
        let device = device();
        let parent = dir_fd(&device);
        let mut fd = device
            .path_open(
                &parent,
                Lookupflags::empty(),
                "share/readme.md",
                Oflags::empty(),
                Rights::FD_READ,
                Rights::empty(),
                Fdflags::empty(),
                4,
            )
            .unwrap();
        assert_eq!(device.fd_write(&mut fd, b"x").err(), Some(WasiError::Perm));
        assert_eq!(
            device.path_unlink_file(&parent, "share/readme.md").err(),
            Some(WasiError::Perm)
        );
        assert_eq!(
            device.path_create_directory(&parent, "new").err(),
            Some(WasiError::Perm)
        );
        let create = device.path_open(
            &parent,
            Lookupflags::empty(),
            "fresh.txt",
            Oflags::CREAT,
            Rights::FD_WRITE,
            Rights::empty(),
            Fdflags::empty(),
            5,
        );
        assert_eq!(create.err(), Some(WasiError::Perm));
    }

    #[test]
    fn test_readdir_lists_assets() {
        let device = device();
        let mut fd = dir_fd(&device);
        let entries = device.fd_readdir(&mut fd, 0).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "bin", "share"]);
    }
}
