//! The device-driver surface shared by every backend.
//!
//! A device driver implements the WASI file surface against one backend.
//! Defaults answer `NoSys`, so a backend only spells out what it actually
//! supports. Dispatch among the concrete drivers is a closed sum type
//! ([`Device`]); the root filesystem picks the device by mount lookup and
//! the process layer calls through [`Device::driver`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::chardev::CharacterDeviceDriver;
use crate::extfs::ExtensionResourceDevice;
use crate::fd::FileDescriptor;
use crate::hostfs::HostFileSystemDevice;
use crate::memfs::InMemoryFileSystemDevice;
use crate::types::{
    Advice, Dirent, Fdflags, Filestat, Fstflags, Lookupflags, Oflags, Rights, WasiError,
    WasiResult, Whence,
};
use crate::workspacefs::WorkspaceFileSystemDevice;

/// Device identity, unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u64);

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

impl DeviceId {
    /// Mint the next device id.
    pub fn next() -> DeviceId {
        DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The WASI surface a backend implements. Unimplemented operations answer
/// [`WasiError::NoSys`].
#[allow(unused_variables)]
pub trait DeviceDriver: Send + Sync {
    /// This device's identity.
    fn id(&self) -> DeviceId;

    /// Whether the device rejects mutation (mounted read-only).
    fn read_only(&self) -> bool {
        false
    }

    /// Guard for mutating operations on read-only mounts.
    fn assert_writable(&self) -> WasiResult<()> {
        if self.read_only() {
            Err(WasiError::Perm)
        } else {
            Ok(())
        }
    }

    fn fd_advise(
        &self,
        fd: &mut FileDescriptor,
        offset: u64,
        length: u64,
        advice: Advice,
    ) -> WasiResult<()> {
        Err(WasiError::NoSys)
    }

    fn fd_allocate(&self, fd: &mut FileDescriptor, offset: u64, len: u64) -> WasiResult<()> {
        Err(WasiError::NoSys)
    }

    fn fd_close(&self, fd: &FileDescriptor) -> WasiResult<()> {
        Ok(())
    }

    fn fd_datasync(&self, fd: &FileDescriptor) -> WasiResult<()> {
        Err(WasiError::NoSys)
    }

    fn fd_fdstat_set_flags(&self, fd: &mut FileDescriptor, flags: Fdflags) -> WasiResult<()> {
        fd.fdflags = flags;
        Ok(())
    }

    fn fd_filestat_get(&self, fd: &FileDescriptor) -> WasiResult<Filestat> {
        Err(WasiError::NoSys)
    }

    fn fd_filestat_set_size(&self, fd: &mut FileDescriptor, size: u64) -> WasiResult<()> {
        Err(WasiError::NoSys)
    }

    fn fd_filestat_set_times(
        &self,
        fd: &mut FileDescriptor,
        atim: u64,
        mtim: u64,
        fst_flags: Fstflags,
    ) -> WasiResult<()> {
        Err(WasiError::NoSys)
    }

    fn fd_pread(&self, fd: &mut FileDescriptor, offset: u64, buf: &mut [u8]) -> WasiResult<usize> {
        Err(WasiError::NoSys)
    }

    fn fd_pwrite(&self, fd: &mut FileDescriptor, offset: u64, buf: &[u8]) -> WasiResult<usize> {
        Err(WasiError::NoSys)
    }

    fn fd_read(&self, fd: &mut FileDescriptor, buf: &mut [u8]) -> WasiResult<usize> {
        Err(WasiError::NoSys)
    }

    /// Re-key backend state attached to `fd`'s number after the table
    /// moved it to `to`.
    fn fd_renumber(&self, fd: &FileDescriptor, to: u32) -> WasiResult<()> {
        Ok(())
    }

    /// Materialise directory entries starting at `cookie`. The stream is
    /// re-opened when `cookie` is 0.
    fn fd_readdir(&self, fd: &mut FileDescriptor, cookie: u64) -> WasiResult<Vec<Dirent>> {
        Err(WasiError::NoSys)
    }

    fn fd_seek(&self, fd: &mut FileDescriptor, offset: i64, whence: Whence) -> WasiResult<u64> {
        Err(WasiError::NoSys)
    }

    fn fd_sync(&self, fd: &FileDescriptor) -> WasiResult<()> {
        Err(WasiError::NoSys)
    }

    fn fd_tell(&self, fd: &FileDescriptor) -> WasiResult<u64> {
        Ok(fd.cursor)
    }

    fn fd_write(&self, fd: &mut FileDescriptor, buf: &[u8]) -> WasiResult<usize> {
        Err(WasiError::NoSys)
    }

    /// Bytes readable without blocking (used by `poll_oneoff` and the
    /// character devices).
    fn fd_bytes_available(&self, fd: &FileDescriptor) -> WasiResult<u64> {
        Err(WasiError::NoSys)
    }

    fn path_create_directory(&self, fd: &FileDescriptor, path: &str) -> WasiResult<()> {
        Err(WasiError::NoSys)
    }

    fn path_filestat_get(
        &self,
        fd: &FileDescriptor,
        flags: Lookupflags,
        path: &str,
    ) -> WasiResult<Filestat> {
        Err(WasiError::NoSys)
    }

    fn path_filestat_set_times(
        &self,
        fd: &FileDescriptor,
        flags: Lookupflags,
        path: &str,
        atim: u64,
        mtim: u64,
        fst_flags: Fstflags,
    ) -> WasiResult<()> {
        Err(WasiError::NoSys)
    }

    fn path_link(
        &self,
        old_fd: &FileDescriptor,
        old_flags: Lookupflags,
        old_path: &str,
        new_fd: &FileDescriptor,
        new_path: &str,
    ) -> WasiResult<()> {
        Err(WasiError::NoSys)
    }

    /// Open a file or directory relative to `parent`. The process layer
    /// has already asserted the parent's rights; the driver resolves the
    /// backend object and builds the child descriptor under `new_fd`.
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
        Err(WasiError::NoSys)
    }

    fn path_readlink(&self, fd: &FileDescriptor, path: &str) -> WasiResult<String> {
        Err(WasiError::NoSys)
    }

    fn path_remove_directory(&self, fd: &FileDescriptor, path: &str) -> WasiResult<()> {
        Err(WasiError::NoSys)
    }

    fn path_rename(
        &self,
        old_fd: &FileDescriptor,
        old_path: &str,
        new_fd: &FileDescriptor,
        new_path: &str,
    ) -> WasiResult<()> {
        Err(WasiError::NoSys)
    }

    fn path_symlink(&self, old_path: &str, fd: &FileDescriptor, new_path: &str) -> WasiResult<()> {
        Err(WasiError::NoSys)
    }

    fn path_unlink_file(&self, fd: &FileDescriptor, path: &str) -> WasiResult<()> {
        Err(WasiError::NoSys)
    }
}

/// The closed set of backends.
pub enum Device {
    /// Host-native filesystem.
    HostFs(HostFileSystemDevice),
    /// Host-editor workspace filesystem.
    WorkspaceFs(WorkspaceFileSystemDevice),
    /// In-memory filesystem.
    MemFs(InMemoryFileSystemDevice),
    /// Read-only extension resources.
    ExtensionFs(ExtensionResourceDevice),
    /// Character device (stdio, terminal, pipe).
    Char(CharacterDeviceDriver),
}

impl Device {
    /// The driver implementing this device's surface.
    pub fn driver(&self) -> &dyn DeviceDriver {
        match self {
            Device::HostFs(d) => d,
            Device::WorkspaceFs(d) => d,
            Device::MemFs(d) => d,
            Device::ExtensionFs(d) => d,
            Device::Char(d) => d,
        }
    }

    /// Device identity.
    pub fn id(&self) -> DeviceId {
        self.driver().id()
    }

    /// Whether this is a filesystem backend (mountable, pre-openable).
    pub fn is_filesystem(&self) -> bool {
        !matches!(self, Device::Char(_))
    }

    /// Pre-open rights for this device's mount directory, honouring
    /// read-only mounts.
    pub fn preopen_rights(&self) -> (Rights, Rights) {
        let mut base = Rights::DIRECTORY_BASE;
        let mut inheriting = Rights::DIRECTORY_INHERITING;
        if self.driver().read_only() {
            base &= Rights::READ_ONLY_MASK;
            inheriting &= Rights::READ_ONLY_MASK;
        }
        (base, inheriting)
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match self {
            Device::HostFs(_) => "HostFs",
            Device::WorkspaceFs(_) => "WorkspaceFs",
            Device::MemFs(_) => "MemFs",
            Device::ExtensionFs(_) => "ExtensionFs",
            Device::Char(_) => "Char",
        };
        f.debug_struct("Device")
            .field("kind", &kind)
            .field("id", &self.id())
            .finish()
    }
}

/// Rights arithmetic for `path_open`, shared by every filesystem driver.
#[derive(Debug, Clone, Copy)]
pub struct PathOpenRights {
    /// Rights the parent directory's base set must contain.
    pub needed_base: Rights,
    /// Rights the parent directory's inheriting set must contain.
    pub needed_inheriting: Rights,
    /// The effective base rights requested for the child.
    pub requested_base: Rights,
}

/// Derive the rights demanded by an open, per the open/descriptor flags.
pub fn path_open_rights(
    oflags: Oflags,
    fdflags: Fdflags,
    rights_base: Rights,
    rights_inheriting: Rights,
) -> PathOpenRights {
    let mut needed_base = Rights::PATH_OPEN;
    if oflags.contains(Oflags::CREAT) {
        needed_base |= Rights::PATH_CREATE_FILE;
    }
    if oflags.contains(Oflags::TRUNC) {
        needed_base |= Rights::PATH_FILESTAT_SET_SIZE;
    }
    if fdflags.contains(Fdflags::DSYNC) {
        needed_base |= Rights::FD_DATASYNC;
    }
    if fdflags.contains(Fdflags::RSYNC) || fdflags.contains(Fdflags::SYNC) {
        needed_base |= Rights::FD_SYNC;
    }

    let mut requested_base = rights_base;
    if requested_base.contains(Rights::FD_WRITE)
        && !fdflags.contains(Fdflags::APPEND)
        && !oflags.contains(Oflags::TRUNC)
    {
        // A writable, non-append, non-truncating open implies seeking.
        requested_base |= Rights::FD_SEEK;
    }

    PathOpenRights {
        needed_base,
        needed_inheriting: requested_base | rights_inheriting,
        requested_base,
    }
}

/// Mask requested child rights by what the opened filetype can support.
pub fn mask_rights_for_filetype(rights: Rights, directory: bool) -> Rights {
    if directory {
        rights & (Rights::DIRECTORY_BASE | Rights::FILE_BASE)
    } else {
        rights & Rights::FILE_BASE
    }
}

/// Compute the rights of a freshly opened child descriptor: the parent's
/// inheriting set intersected with the request, masked by filetype, and
/// clamped again on read-only devices.
pub fn derive_child_rights(
    parent: &FileDescriptor,
    requested_base: Rights,
    requested_inheriting: Rights,
    directory: bool,
    read_only: bool,
) -> (Rights, Rights) {
    let mut base = mask_rights_for_filetype(parent.rights_inheriting & requested_base, directory);
    let mut inheriting = if directory {
        parent.rights_inheriting & requested_inheriting
    } else {
        Rights::FILE_INHERITING
    };
    if read_only {
        base &= Rights::READ_ONLY_MASK;
        inheriting &= Rights::READ_ONLY_MASK;
    }
    (base, inheriting)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_open_rights_derivation() {
        let derived = path_open_rights(
            Oflags::CREAT | Oflags::TRUNC,
            Fdflags::DSYNC,
            Rights::FD_READ | Rights::FD_WRITE,
            Rights::empty(),
        );
        assert!(derived.needed_base.contains(Rights::PATH_OPEN));
        assert!(derived.needed_base.contains(Rights::PATH_CREATE_FILE));
        assert!(derived.needed_base.contains(Rights::PATH_FILESTAT_SET_SIZE));
        assert!(derived.needed_base.contains(Rights::FD_DATASYNC));
        // trunc suppresses the implied seek
        assert!(!derived.requested_base.contains(Rights::FD_SEEK));

        let derived = path_open_rights(
            Oflags::empty(),
            Fdflags::empty(),
            Rights::FD_WRITE,
            Rights::empty(),
        );
        assert!(derived.requested_base.contains(Rights::FD_SEEK));
    }

    #[test]
    fn test_filetype_masking() {
        let requested = Rights::FD_READ | Rights::PATH_OPEN | Rights::FD_WRITE;
        let file = mask_rights_for_filetype(requested, false);
        assert!(file.contains(Rights::FD_READ));
        assert!(!file.contains(Rights::PATH_OPEN));
        let dir = mask_rights_for_filetype(requested, true);
        assert!(dir.contains(Rights::PATH_OPEN));
    }
}
