//! Host-native filesystem driver.
//!
//! Operations delegate to `std::fs`/`std::io` beneath a host root
//! directory; native errors are translated onto the WASI errno surface
//! through the fixed table in [`crate::types`]. Inode numbers are
//! manufactured from a per-device counter keyed by absolute host path, so
//! they stay stable for the life of the process and deleted-then-recreated
//! paths get a fresh number.
//!
//! Directory streams are single-use: `fd_readdir` materialises the host
//! stream once and re-opens it when the guest restarts the walk at
//! cookie 0.

use std::fs::{File, FileTimes, Metadata, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;

use crate::driver::{derive_child_rights, DeviceDriver, DeviceId};
use crate::fd::FileDescriptor;
use crate::paths;
use crate::types::{
    Advice, Dirent, Fdflags, Filestat, Filetype, Fstflags, Lookupflags, Oflags, Rights,
    WasiError, WasiResult, Whence,
};

/// One materialised directory listing.
struct DirStream {
    entries: Vec<Dirent>,
}

/// Backend state of an open descriptor.
struct HostHandle {
    file: Option<File>,
    stream: Option<DirStream>,
}

/// Filesystem driver over a host directory.
pub struct HostFileSystemDevice {
    id: DeviceId,
    root: PathBuf,
    read_only: bool,
    handles: Mutex<HashMap<u32, HostHandle>>,
    inodes: Mutex<HashMap<PathBuf, u64>>,
    next_inode: AtomicU64,
}

impl HostFileSystemDevice {
    /// A driver rooted at `root` on the host filesystem.
    pub fn new(root: impl Into<PathBuf>, read_only: bool) -> HostFileSystemDevice {
        HostFileSystemDevice {
            id: DeviceId::next(),
            root: root.into(),
            read_only,
            handles: Mutex::new(HashMap::new()),
            inodes: Mutex::new(HashMap::new()),
            next_inode: AtomicU64::new(1),
        }
    }

    fn host_path(&self, device_path: &str) -> PathBuf {
        let normalized = paths::normalize(device_path);
        self.root.join(normalized.trim_start_matches('/'))
    }

    fn resolve_from(&self, fd: &FileDescriptor, path: &str) -> String {
        paths::resolve(&fd.path, path)
    }

    /// Stable manufactured inode for a host path.
    fn inode(&self, path: &Path) -> u64 {
        let mut inodes = self.inodes.lock().unwrap();
        if let Some(&ino) = inodes.get(path) {
            return ino;
        }
        let ino = self.next_inode.fetch_add(1, Ordering::Relaxed);
        inodes.insert(path.to_path_buf(), ino);
        ino
    }

    /// Deleted paths give up their inode; recreation mints a fresh one.
    fn forget_inode(&self, path: &Path) {
        self.inodes.lock().unwrap().remove(path);
    }

    fn filetype_of(metadata: &Metadata) -> Filetype {
        if metadata.is_dir() {
            Filetype::Directory
        } else if metadata.is_symlink() {
            Filetype::SymbolicLink
        } else if metadata.is_file() {
            Filetype::RegularFile
        } else {
            Filetype::Unknown
        }
    }

    fn filestat_from(&self, path: &Path, metadata: &Metadata) -> Filestat {
        fn nanos(time: std::io::Result<SystemTime>) -> u64 {
            time.ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_nanos() as u64)
        }
        Filestat {
            dev: self.id.0,
            ino: self.inode(path),
            filetype: Self::filetype_of(metadata) as u8,
            nlink: 1,
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            atim: nanos(metadata.accessed()),
            mtim: nanos(metadata.modified()),
            ctim: nanos(metadata.created()),
        }
    }

    fn with_file<F, R>(&self, fd: &FileDescriptor, f: F) -> WasiResult<R>
    where
        F: FnOnce(&mut File) -> std::io::Result<R>,
    {
        let mut handles = self.handles.lock().unwrap();
        let handle = handles.get_mut(&fd.fd).ok_or(WasiError::BadF)?;
        let file = handle.file.as_mut().ok_or(WasiError::BadF)?;
        f(file).map_err(WasiError::from)
    }

    fn timestamp(now_flag: bool, explicit_flag: bool, value: u64) -> Option<SystemTime> {
        if now_flag {
            Some(SystemTime::now())
        } else if explicit_flag {
            Some(UNIX_EPOCH + Duration::from_nanos(value))
        } else {
            None
        }
    }

    fn read_dir_entries(&self, fd: &FileDescriptor) -> WasiResult<Vec<Dirent>> {
        let host = self.host_path(&fd.path);
        let mut listing: Vec<(String, Filetype, u64)> = vec![
            (String::from("."), Filetype::Directory, fd.inode),
            (
                String::from(".."),
                Filetype::Directory,
                self.inode(host.parent().unwrap_or(&host)),
            ),
        ];
        let mut children = Vec::new();
        for entry in std::fs::read_dir(&host).map_err(WasiError::from)? {
            let entry = entry.map_err(WasiError::from)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let filetype = entry
                .file_type()
                .map(|t| {
                    if t.is_dir() {
                        Filetype::Directory
                    } else if t.is_symlink() {
                        Filetype::SymbolicLink
                    } else {
                        Filetype::RegularFile
                    }
                })
                .unwrap_or(Filetype::Unknown);
            children.push((name, filetype, self.inode(&entry.path())));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));
        listing.extend(children);

        Ok(listing
            .into_iter()
            .enumerate()
            .map(|(index, (name, d_type, d_ino))| Dirent {
                d_next: index as u64 + 1,
                d_ino,
                d_type,
                name,
            })
            .collect())
    }
}

impl DeviceDriver for HostFileSystemDevice {
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
        // No host advisory interface; accept and ignore.
        Ok(())
    }

    fn fd_allocate(&self, fd: &mut FileDescriptor, offset: u64, len: u64) -> WasiResult<()> {
        self.assert_writable()?;
        self.with_file(fd, |file| {
            let current = file.metadata()?.len();
            let wanted = offset + len;
            if wanted > current {
                file.set_len(wanted)?;
            }
            Ok(())
        })
    }

    fn fd_close(&self, fd: &FileDescriptor) -> WasiResult<()> {
        self.handles.lock().unwrap().remove(&fd.fd);
        Ok(())
    }

    fn fd_datasync(&self, fd: &FileDescriptor) -> WasiResult<()> {
        let mut handles = self.handles.lock().unwrap();
        let handle = handles.get_mut(&fd.fd).ok_or(WasiError::BadF)?;
        match handle.file.as_mut() {
            Some(file) => file.sync_data().map_err(WasiError::from),
            None => Ok(()),
        }
    }

    fn fd_filestat_get(&self, fd: &FileDescriptor) -> WasiResult<Filestat> {
        let host = self.host_path(&fd.path);
        let metadata = std::fs::metadata(&host).map_err(WasiError::from)?;
        Ok(self.filestat_from(&host, &metadata))
    }

    fn fd_filestat_set_size(&self, fd: &mut FileDescriptor, size: u64) -> WasiResult<()> {
        self.assert_writable()?;
        self.with_file(fd, |file| file.set_len(size))
    }

    fn fd_filestat_set_times(
        &self,
        fd: &mut FileDescriptor,
        atim: u64,
        mtim: u64,
        fst_flags: Fstflags,
    ) -> WasiResult<()> {
        self.assert_writable()?;
        let mut times = FileTimes::new();
        if let Some(t) = Self::timestamp(
            fst_flags.contains(Fstflags::ATIM_NOW),
            fst_flags.contains(Fstflags::ATIM),
            atim,
        ) {
            times = times.set_accessed(t);
        }
        if let Some(t) = Self::timestamp(
            fst_flags.contains(Fstflags::MTIM_NOW),
            fst_flags.contains(Fstflags::MTIM),
            mtim,
        ) {
            times = times.set_modified(t);
        }
        self.with_file(fd, |file| file.set_times(times))
    }

    fn fd_pread(&self, fd: &mut FileDescriptor, offset: u64, buf: &mut [u8]) -> WasiResult<usize> {
        self.with_file(fd, |file| {
            file.seek(SeekFrom::Start(offset))?;
            read_full(file, buf)
        })
    }

    fn fd_pwrite(&self, fd: &mut FileDescriptor, offset: u64, buf: &[u8]) -> WasiResult<usize> {
        self.assert_writable()?;
        self.with_file(fd, |file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)?;
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
        let mut handles = self.handles.lock().unwrap();
        if let Some(handle) = handles.remove(&fd.fd) {
            handles.insert(to, handle);
        }
        Ok(())
    }

    fn fd_readdir(&self, fd: &mut FileDescriptor, cookie: u64) -> WasiResult<Vec<Dirent>> {
        // Cookie 0 restarts the walk: re-open the single-use stream.
        let needs_reopen = {
            let handles = self.handles.lock().unwrap();
            let handle = handles.get(&fd.fd).ok_or(WasiError::BadF)?;
            cookie == 0 || handle.stream.is_none()
        };
        if needs_reopen {
            let entries = self.read_dir_entries(fd)?;
            let mut handles = self.handles.lock().unwrap();
            let handle = handles.get_mut(&fd.fd).ok_or(WasiError::BadF)?;
            handle.stream = Some(DirStream { entries });
        }

        let handles = self.handles.lock().unwrap();
        let handle = handles.get(&fd.fd).ok_or(WasiError::BadF)?;
        let stream = handle.stream.as_ref().ok_or(WasiError::BadF)?;
        Ok(stream
            .entries
            .iter()
            .skip(cookie as usize)
            .cloned()
            .collect())
    }

    fn fd_seek(&self, fd: &mut FileDescriptor, offset: i64, whence: Whence) -> WasiResult<u64> {
        let size = self.fd_filestat_get(fd)?.size as i64;
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
        let mut handles = self.handles.lock().unwrap();
        let handle = handles.get_mut(&fd.fd).ok_or(WasiError::BadF)?;
        match handle.file.as_mut() {
            Some(file) => file.sync_all().map_err(WasiError::from),
            None => Ok(()),
        }
    }

    fn fd_write(&self, fd: &mut FileDescriptor, buf: &[u8]) -> WasiResult<usize> {
        self.assert_writable()?;
        if fd.fdflags.contains(Fdflags::APPEND) {
            let end = self.with_file(fd, |file| {
                let end = file.seek(SeekFrom::End(0))?;
                file.write_all(buf)?;
                Ok(end)
            })?;
            fd.cursor = end + buf.len() as u64;
            return Ok(buf.len());
        }
        let cursor = fd.cursor;
        let count = self.fd_pwrite(fd, cursor, buf)?;
        fd.cursor += count as u64;
        Ok(count)
    }

    fn fd_bytes_available(&self, fd: &FileDescriptor) -> WasiResult<u64> {
        let size = self.fd_filestat_get(fd)?.size;
        Ok(size.saturating_sub(fd.cursor))
    }

    fn path_create_directory(&self, fd: &FileDescriptor, path: &str) -> WasiResult<()> {
        self.assert_writable()?;
        let host = self.host_path(&self.resolve_from(fd, path));
        std::fs::create_dir(&host).map_err(WasiError::from)
    }

    fn path_filestat_get(
        &self,
        fd: &FileDescriptor,
        flags: Lookupflags,
        path: &str,
    ) -> WasiResult<Filestat> {
        let host = self.host_path(&self.resolve_from(fd, path));
        let metadata = if flags.contains(Lookupflags::SYMLINK_FOLLOW) {
            std::fs::metadata(&host)
        } else {
            std::fs::symlink_metadata(&host)
        }
        .map_err(WasiError::from)?;
        Ok(self.filestat_from(&host, &metadata))
    }

    fn path_filestat_set_times(
        &self,
        fd: &FileDescriptor,
        _flags: Lookupflags,
        path: &str,
        atim: u64,
        mtim: u64,
        fst_flags: Fstflags,
    ) -> WasiResult<()> {
        self.assert_writable()?;
        let host = self.host_path(&self.resolve_from(fd, path));
        let file = File::open(&host).map_err(WasiError::from)?;
        let mut times = FileTimes::new();
        if let Some(t) = Self::timestamp(
            fst_flags.contains(Fstflags::ATIM_NOW),
            fst_flags.contains(Fstflags::ATIM),
            atim,
        ) {
            times = times.set_accessed(t);
        }
        if let Some(t) = Self::timestamp(
            fst_flags.contains(Fstflags::MTIM_NOW),
            fst_flags.contains(Fstflags::MTIM),
            mtim,
        ) {
            times = times.set_modified(t);
        }
        file.set_times(times).map_err(WasiError::from)
    }

    fn path_link(
        &self,
        old_fd: &FileDescriptor,
        _old_flags: Lookupflags,
        old_path: &str,
        new_fd: &FileDescriptor,
        new_path: &str,
    ) -> WasiResult<()> {
        self.assert_writable()?;
        let old_host = self.host_path(&self.resolve_from(old_fd, old_path));
        let new_host = self.host_path(&self.resolve_from(new_fd, new_path));
        std::fs::hard_link(old_host, new_host).map_err(WasiError::from)
    }

    fn path_open(
        &self,
        parent: &FileDescriptor,
        dirflags: Lookupflags,
        path: &str,
        oflags: Oflags,
        rights_base: Rights,
        rights_inheriting: Rights,
        fdflags: Fdflags,
        new_fd: u32,
    ) -> WasiResult<FileDescriptor> {
        let device_path = self.resolve_from(parent, path);
        let host = self.host_path(&device_path);

        let creating = oflags.contains(Oflags::CREAT);
        let truncating = oflags.contains(Oflags::TRUNC);
        if (creating || truncating) && self.read_only {
            return Err(WasiError::Perm);
        }

        let existing = if dirflags.contains(Lookupflags::SYMLINK_FOLLOW) {
            std::fs::metadata(&host)
        } else {
            std::fs::symlink_metadata(&host)
        };

        let is_directory = match &existing {
            Ok(metadata) => metadata.is_dir(),
            Err(_) => false,
        };
        if oflags.contains(Oflags::DIRECTORY) && !is_directory {
            return Err(WasiError::NotDir);
        }

        let (filetype, file) = if is_directory {
            // Directory descriptors carry no host file handle.
            existing.map_err(WasiError::from)?;
            (Filetype::Directory, None)
        } else {
            let readable = rights_base.contains(Rights::FD_READ);
            let writable = rights_base.contains(Rights::FD_WRITE)
                || fdflags.contains(Fdflags::APPEND)
                || truncating;
            let mut options = OpenOptions::new();
            options
                .read(readable || !writable)
                .write(writable)
                .truncate(truncating);
            if creating && oflags.contains(Oflags::EXCL) {
                options.create_new(true);
            } else if creating {
                options.create(true);
            }
            let file = options.open(&host).map_err(WasiError::from)?;
            let metadata = file.metadata().map_err(WasiError::from)?;
            (Self::filetype_of(&metadata), Some(file))
        };

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
            inode: self.inode(&host),
            cursor: 0,
            path: device_path,
            preopen_path: None,
        };
        self.handles.lock().unwrap().insert(
            new_fd,
            HostHandle {
                file,
                stream: None,
            },
        );
        Ok(descriptor)
    }

    fn path_readlink(&self, fd: &FileDescriptor, path: &str) -> WasiResult<String> {
        let host = self.host_path(&self.resolve_from(fd, path));
        let target = std::fs::read_link(&host).map_err(WasiError::from)?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn path_remove_directory(&self, fd: &FileDescriptor, path: &str) -> WasiResult<()> {
        self.assert_writable()?;
        let host = self.host_path(&self.resolve_from(fd, path));
        std::fs::remove_dir(&host).map_err(WasiError::from)?;
        self.forget_inode(&host);
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
        let old_host = self.host_path(&self.resolve_from(old_fd, old_path));
        let new_host = self.host_path(&self.resolve_from(new_fd, new_path));
        std::fs::rename(&old_host, &new_host).map_err(WasiError::from)?;
        self.forget_inode(&old_host);
        self.forget_inode(&new_host);
        Ok(())
    }

    fn path_symlink(&self, old_path: &str, fd: &FileDescriptor, new_path: &str) -> WasiResult<()> {
        self.assert_writable()?;
        #[cfg(unix)]
        {
            let new_host = self.host_path(&self.resolve_from(fd, new_path));
            std::os::unix::fs::symlink(old_path, new_host).map_err(WasiError::from)
        }
        #[cfg(not(unix))]
        {
            let _ = (old_path, fd, new_path);
            Err(WasiError::NoSys)
        }
    }

    fn path_unlink_file(&self, fd: &FileDescriptor, path: &str) -> WasiResult<()> {
        self.assert_writable()?;
        let host = self.host_path(&self.resolve_from(fd, path));
        let metadata = std::fs::symlink_metadata(&host).map_err(WasiError::from)?;
        if metadata.is_dir() {
            return Err(WasiError::IsDir);
        }
        std::fs::remove_file(&host).map_err(WasiError::from)?;
        self.forget_inode(&host);
        Ok(())
    }
}

/// Read until the buffer is full or the file is exhausted.
fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let count = file.read(&mut buf[total..])?;
        if count == 0 {
            break;
        }
        total += count;
    }
    Ok(total)
}

impl core::fmt::Debug for HostFileSystemDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostFileSystemDevice")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "wasmbed-hostfs-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn dir_fd(device: &HostFileSystemDevice) -> FileDescriptor {
        FileDescriptor {
            device: device.id,
            fd: 3,
            filetype: Filetype::Directory,
            rights_base: Rights::DIRECTORY_BASE,
            rights_inheriting: Rights::DIRECTORY_INHERITING,
            fdflags: Fdflags::empty(),
            inode: 0,
            cursor: 0,
            path: String::from("/"),
            preopen_path: Some(String::from("/")),
        }
    }

    #[test]
    fn test_create_write_reopen_read() {
        let root = scratch_dir("rw");
        let fs = HostFileSystemDevice::new(&root, false);
        let parent = dir_fd(&fs);

        let mut fd = fs
            .path_open(
                &parent,
                Lookupflags::empty(),
                "a.txt",
                Oflags::CREAT | Oflags::TRUNC,
                Rights::FD_READ | Rights::FD_WRITE,
                Rights::empty(),
                Fdflags::empty(),
                4,
            )
            .unwrap();
        assert_eq!(fs.fd_write(&mut fd, b"hi").unwrap(), 2);
        fs.fd_close(&fd).unwrap();

        let mut fd = fs
            .path_open(
                &parent,
                Lookupflags::empty(),
                "a.txt",
                Oflags::empty(),
                Rights::FD_READ,
                Rights::empty(),
                Fdflags::empty(),
                5,
            )
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(fs.fd_read(&mut fd, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");

        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_missing_file_maps_to_noent() {
        let root = scratch_dir("noent");
        let fs = HostFileSystemDevice::new(&root, false);
        let parent = dir_fd(&fs);
        let result = fs.path_open(
            &parent,
            Lookupflags::empty(),
            "missing.txt",
            Oflags::empty(),
            Rights::FD_READ,
            Rights::empty(),
            Fdflags::empty(),
            4,
        );
        assert_eq!(result.err(), Some(WasiError::NoEnt));
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_inode_stability_and_refresh() {
        let root = scratch_dir("inode");
        let fs = HostFileSystemDevice::new(&root, false);
        let parent = dir_fd(&fs);
        std::fs::write(root.join("f"), b"1").unwrap();

        let first = fs
            .path_filestat_get(&parent, Lookupflags::empty(), "f")
            .unwrap()
            .ino;
        let again = fs
            .path_filestat_get(&parent, Lookupflags::empty(), "f")
            .unwrap()
            .ino;
        assert_eq!(first, again);

        fs.path_unlink_file(&parent, "f").unwrap();
        std::fs::write(root.join("f"), b"2").unwrap();
        let recreated = fs
            .path_filestat_get(&parent, Lookupflags::empty(), "f")
            .unwrap()
            .ino;
        assert_ne!(first, recreated);
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_readdir_materialises_and_restarts() {
        let root = scratch_dir("readdir");
        let fs = HostFileSystemDevice::new(&root, false);
        std::fs::write(root.join("x"), b"").unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();

        let mut fd = dir_fd(&fs);
        fs.handles.lock().unwrap().insert(
            3,
            HostHandle {
                file: None,
                stream: None,
            },
        );
        let entries = fs.fd_readdir(&mut fd, 0).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "sub", "x"]);

        // Continue from a cookie without re-reading the host.
        let rest = fs.fd_readdir(&mut fd, 3).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, "x");
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_read_only_mutations_rejected() {
        let root = scratch_dir("ro");
        std::fs::write(root.join("f"), b"data").unwrap();
        let fs = HostFileSystemDevice::new(&root, true);
        let parent = dir_fd(&fs);

        assert_eq!(
            fs.path_create_directory(&parent, "d"),
            Err(WasiError::Perm)
        );
        assert_eq!(
            fs.path_unlink_file(&parent, "f"),
            Err(WasiError::Perm)
        );
        let result = fs.path_open(
            &parent,
            Lookupflags::empty(),
            "new.txt",
            Oflags::CREAT,
            Rights::FD_WRITE,
            Rights::empty(),
            Fdflags::empty(),
            4,
        );
        assert_eq!(result.err(), Some(WasiError::Perm));
        // Plain reads still work.
        assert!(fs
            .path_filestat_get(&parent, Lookupflags::empty(), "f")
            .is_ok());
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_seek_and_pread() {
        let root = scratch_dir("seek");
        let fs = HostFileSystemDevice::new(&root, false);
        std::fs::write(root.join("f"), b"abcdef").unwrap();
        let parent = dir_fd(&fs);
        let mut fd = fs
            .path_open(
                &parent,
                Lookupflags::empty(),
                "f",
                Oflags::empty(),
                Rights::FD_READ | Rights::FD_SEEK | Rights::FD_TELL,
                Rights::empty(),
                Fdflags::empty(),
                4,
            )
            .unwrap();
        assert_eq!(fs.fd_seek(&mut fd, -2, Whence::End).unwrap(), 4);
        let mut buf = [0u8; 2];
        assert_eq!(fs.fd_read(&mut fd, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"ef");
        assert_eq!(fs.fd_pread(&mut fd, 0, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(fs.fd_tell(&fd).unwrap(), 6);
        std::fs::remove_dir_all(root).unwrap();
    }
}
