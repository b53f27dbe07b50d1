//! WASI Preview 1 device-driver layer.
//!
//! A virtual file system backing WASI syscalls against heterogeneous
//! backends: the host-native filesystem, the host editor's workspace API,
//! in-memory trees and bundled extension resources, plus character
//! devices for stdio. File descriptors carry capability rights that are
//! checked before any backend is contacted; a mount table with pre-opened
//! directories gives the guest its view of the world.
//!
//! The crate is organised the way the data flows: [`types`] defines the
//! WASI value vocabulary, [`fd`] the descriptor table and capability
//! policy, [`driver`] the backend surface, the driver modules implement
//! it, [`rootfs`] multiplexes mounts, and [`process`] assembles a guest
//! process and serves its calls.

pub mod chardev;
pub mod driver;
pub mod extfs;
pub mod fd;
pub mod hostfs;
pub mod memfs;
pub mod paths;
pub mod process;
pub mod rootfs;
pub mod types;
pub mod workspacefs;

pub use chardev::{CharacterDevice, Console, Pipe, TerminalConnection};
pub use driver::{Device, DeviceDriver, DeviceId};
pub use extfs::{ExtensionResourceDevice, ResourceProvider, StaticResourceProvider};
pub use fd::{FdTable, FileDescriptor};
pub use hostfs::HostFileSystemDevice;
pub use memfs::InMemoryFileSystemDevice;
pub use process::{
    Encoding, MountPointDescriptor, ProcessOptions, StdioDescriptor, StdioOptions,
    WasiProcess,
};
pub use rootfs::{MountPoint, RootFileSystem};
pub use types::{
    Advice, Clockid, Dirent, Event, Fdflags, Fdstat, Filestat, Filetype, Fstflags,
    Lookupflags, Oflags, Prestat, Rights, Subscription, WasiError, WasiResult, Whence,
};
pub use workspacefs::{
    WorkspaceFileSystem, WorkspaceFileSystemDevice, WorkspaceFileType, WorkspaceStat,
};
