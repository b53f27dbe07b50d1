//! File descriptors and the per-process descriptor table.
//!
//! Fd 0/1/2 are reserved for stdio; pre-opened directories occupy 3..N;
//! `path_open` allocates the lowest unused fd after those. Capability
//! checks happen here, against the descriptor's rights, before any
//! backend is contacted.

use std::collections::BTreeMap;

use crate::driver::DeviceId;
use crate::types::{Fdflags, Fdstat, Filetype, Rights, WasiError, WasiResult};

/// First fd available to pre-opens and `path_open`.
pub const FIRST_PREOPEN_FD: u32 = 3;

/// An open file descriptor.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    /// Owning device.
    pub device: DeviceId,
    /// The fd number this descriptor is registered under.
    pub fd: u32,
    /// Descriptor filetype.
    pub filetype: Filetype,
    /// What this descriptor may do.
    pub rights_base: Rights,
    /// What descriptors opened through this one may do.
    pub rights_inheriting: Rights,
    /// Descriptor flags.
    pub fdflags: Fdflags,
    /// Inode of the underlying object, unique per device.
    pub inode: u64,
    /// Read/write cursor for seekable descriptors.
    pub cursor: u64,
    /// Device-relative path of the object ("" for character devices).
    pub path: String,
    /// Guest-visible mount-point name, set only on pre-opened directories.
    pub preopen_path: Option<String>,
}

impl FileDescriptor {
    /// Require `needed ⊆ rights_base`.
    pub fn assert_base_rights(&self, needed: Rights) -> WasiResult<()> {
        if self.rights_base.contains(needed) {
            Ok(())
        } else {
            Err(WasiError::NotCapable)
        }
    }

    /// Require `needed ⊆ rights_inheriting`.
    pub fn assert_inheriting_rights(&self, needed: Rights) -> WasiResult<()> {
        if self.rights_inheriting.contains(needed) {
            Ok(())
        } else {
            Err(WasiError::NotCapable)
        }
    }

    /// Require the descriptor to be a directory.
    pub fn assert_directory(&self) -> WasiResult<()> {
        if self.filetype == Filetype::Directory {
            Ok(())
        } else {
            Err(WasiError::NotDir)
        }
    }

    /// The `fdstat` image of this descriptor.
    pub fn fdstat(&self) -> Fdstat {
        Fdstat {
            fs_filetype: self.filetype,
            fs_flags: self.fdflags,
            fs_rights_base: self.rights_base,
            fs_rights_inheriting: self.rights_inheriting,
        }
    }
}

/// The per-process fd → descriptor map.
#[derive(Debug, Default)]
pub struct FdTable {
    entries: BTreeMap<u32, FileDescriptor>,
}

impl FdTable {
    /// An empty table.
    pub fn new() -> FdTable {
        FdTable {
            entries: BTreeMap::new(),
        }
    }

    /// Look up a descriptor.
    pub fn get(&self, fd: u32) -> WasiResult<&FileDescriptor> {
        self.entries.get(&fd).ok_or(WasiError::BadF)
    }

    /// Look up a descriptor mutably.
    pub fn get_mut(&mut self, fd: u32) -> WasiResult<&mut FileDescriptor> {
        self.entries.get_mut(&fd).ok_or(WasiError::BadF)
    }

    /// Lowest unused fd, never below [`FIRST_PREOPEN_FD`].
    pub fn next_free_fd(&self) -> u32 {
        let mut fd = FIRST_PREOPEN_FD;
        while self.entries.contains_key(&fd) {
            fd += 1;
        }
        fd
    }

    /// Install a descriptor under its own fd number.
    pub fn insert(&mut self, descriptor: FileDescriptor) {
        self.entries.insert(descriptor.fd, descriptor);
    }

    /// Remove a descriptor.
    pub fn remove(&mut self, fd: u32) -> WasiResult<FileDescriptor> {
        self.entries.remove(&fd).ok_or(WasiError::BadF)
    }

    /// Atomically move `from` over `to`, replacing any descriptor that was
    /// registered at `to`. Keeps fd → descriptor a partial function.
    pub fn renumber(&mut self, from: u32, to: u32) -> WasiResult<()> {
        if from == to {
            // Still requires `from` to exist.
            self.get(from)?;
            return Ok(());
        }
        let mut descriptor = self.entries.remove(&from).ok_or(WasiError::BadF)?;
        descriptor.fd = to;
        self.entries.insert(to, descriptor);
        Ok(())
    }

    /// Iterate all descriptors in fd order.
    pub fn iter(&self) -> impl Iterator<Item = &FileDescriptor> {
        self.entries.values()
    }

    /// Number of open descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(fd: u32) -> FileDescriptor {
        FileDescriptor {
            device: DeviceId(1),
            fd,
            filetype: Filetype::RegularFile,
            rights_base: Rights::FILE_BASE,
            rights_inheriting: Rights::FILE_INHERITING,
            fdflags: Fdflags::empty(),
            inode: 1,
            cursor: 0,
            path: String::from("/f"),
            preopen_path: None,
        }
    }

    #[test]
    fn test_rights_assertions() {
        let fd = descriptor(4);
        assert!(fd.assert_base_rights(Rights::FD_READ).is_ok());
        assert_eq!(
            fd.assert_base_rights(Rights::PATH_OPEN),
            Err(WasiError::NotCapable)
        );
        assert_eq!(
            fd.assert_inheriting_rights(Rights::FD_READ),
            Err(WasiError::NotCapable)
        );
    }

    #[test]
    fn test_next_free_skips_used() {
        let mut table = FdTable::new();
        assert_eq!(table.next_free_fd(), 3);
        table.insert(descriptor(3));
        table.insert(descriptor(4));
        assert_eq!(table.next_free_fd(), 5);
        table.remove(3).unwrap();
        assert_eq!(table.next_free_fd(), 3);
    }

    #[test]
    fn test_renumber_replaces_target() {
        let mut table = FdTable::new();
        let mut a = descriptor(3);
        a.inode = 10;
        let mut b = descriptor(4);
        b.inode = 20;
        table.insert(a);
        table.insert(b);

        table.renumber(3, 4).unwrap();
        assert_eq!(table.len(), 1);
        let moved = table.get(4).unwrap();
        assert_eq!(moved.inode, 10);
        assert_eq!(moved.fd, 4);
        assert_eq!(table.get(3).err(), Some(WasiError::BadF));
    }

    #[test]
    fn test_renumber_missing_source() {
        let mut table = FdTable::new();
        assert_eq!(table.renumber(9, 10), Err(WasiError::BadF));
    }
}
