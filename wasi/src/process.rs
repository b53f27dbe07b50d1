//! Guest process assembly and the WASI call surface.
//!
//! `WasiProcess::new` turns a set of mount descriptors and stdio slots
//! into a device table, installs the mounts into the root filesystem,
//! emits the pre-open sequence (fds 3..N) and seeds stdio (fds 0/1/2).
//! After that every WASI call flows through here: fd-table lookup,
//! capability check, device dispatch, optional trace event.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;

use wasmbed_rpc::RpcClient;

use crate::chardev::{CharacterDeviceDriver, Console, Pipe, TerminalConnection};
use crate::driver::{path_open_rights, Device, DeviceId};
use crate::extfs::{ExtensionResourceDevice, ResourceProvider};
use crate::fd::{FdTable, FileDescriptor, FIRST_PREOPEN_FD};
use crate::hostfs::HostFileSystemDevice;
use crate::memfs::InMemoryFileSystemDevice;
use crate::rootfs::RootFileSystem;
use crate::types::{
    Advice, Clockid, Dirent, Event, EventFdReadwrite, Eventrwflags, Eventtype, Fdflags,
    Fdstat, Filestat, Filetype, Fstflags, Lookupflags, Oflags, Prestat, Rights,
    Subscription, SubscriptionU, WasiError, WasiResult, Whence,
};
use crate::workspacefs::{WorkspaceFileSystem, WorkspaceFileSystemDevice};

/// Supported argv/environ encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// The only supported value.
    #[default]
    Utf8,
}

/// Where a mounted subtree comes from.
pub enum MountPointDescriptor {
    /// A workspace folder on the host's native filesystem.
    WorkspaceFolder {
        path: PathBuf,
        mount_point: String,
        read_only: bool,
    },
    /// Bundled extension resources (always read-only).
    ExtensionLocation {
        provider: Arc<dyn ResourceProvider>,
        mount_point: String,
    },
    /// A filesystem reached through the host editor's API.
    VscodeFileSystem {
        file_system: Arc<dyn WorkspaceFileSystem>,
        mount_point: String,
        read_only: bool,
    },
    /// A pre-populated in-memory filesystem.
    InMemoryFileSystem {
        file_system: InMemoryFileSystemDevice,
        mount_point: String,
    },
}

/// One stdio slot.
pub enum StdioDescriptor {
    /// Redirect to a file in the mounted tree (guest path).
    File { path: String },
    /// A terminal reached over the RPC transport.
    Terminal { client: Arc<Mutex<RpcClient>> },
    /// An in-process pipe.
    Pipe(Pipe),
    /// The developer console.
    Console,
}

/// The three stdio slots. Unset slots fall back to the console.
#[derive(Default)]
pub struct StdioOptions {
    pub stdin: Option<StdioDescriptor>,
    pub stdout: Option<StdioDescriptor>,
    pub stderr: Option<StdioDescriptor>,
}

/// Everything needed to assemble a guest process.
pub struct ProcessOptions {
    pub encoding: Encoding,
    /// `argv`, in order. The first entry is conventionally the program
    /// name.
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Mounts, in pre-open order.
    pub mount_points: Vec<MountPointDescriptor>,
    pub stdio: StdioOptions,
    /// Emit a structured trace event per WASI call.
    pub trace: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        ProcessOptions {
            encoding: Encoding::Utf8,
            args: Vec::new(),
            env: BTreeMap::new(),
            mount_points: Vec::new(),
            stdio: StdioOptions::default(),
            trace: false,
        }
    }
}

macro_rules! trace_call {
    ($self:ident, $($arg:tt)*) => {
        if $self.trace {
            log::trace!(target: "wasmbed::wasi", $($arg)*);
        }
    };
}

/// A guest process: device table, mounts, fd table and the WASI surface.
pub struct WasiProcess {
    devices: HashMap<DeviceId, Arc<Device>>,
    root: RootFileSystem,
    fds: FdTable,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    trace: bool,
    exit_code: Option<u32>,
    start: Instant,
    random_state: u64,
}

impl WasiProcess {
    /// Assemble a process from its options.
    pub fn new(options: ProcessOptions) -> WasiResult<WasiProcess> {
        let mut devices: HashMap<DeviceId, Arc<Device>> = HashMap::new();
        let mut root = RootFileSystem::new();

        for descriptor in options.mount_points {
            let (mount_point, device) = match descriptor {
                MountPointDescriptor::WorkspaceFolder {
                    path,
                    mount_point,
                    read_only,
                } => (
                    mount_point,
                    Device::HostFs(HostFileSystemDevice::new(path, read_only)),
                ),
                MountPointDescriptor::ExtensionLocation {
                    provider,
                    mount_point,
                } => (
                    mount_point,
                    Device::ExtensionFs(ExtensionResourceDevice::new(provider)),
                ),
                MountPointDescriptor::VscodeFileSystem {
                    file_system,
                    mount_point,
                    read_only,
                } => (
                    mount_point,
                    Device::WorkspaceFs(WorkspaceFileSystemDevice::new(file_system, read_only)),
                ),
                MountPointDescriptor::InMemoryFileSystem {
                    file_system,
                    mount_point,
                } => (mount_point, Device::MemFs(file_system)),
            };
            let device = Arc::new(device);
            devices.insert(device.id(), device.clone());
            root.mount(&mount_point, device)?;
        }

        let mut process = WasiProcess {
            devices,
            root,
            fds: FdTable::new(),
            args: options.args,
            env: options.env,
            trace: options.trace,
            exit_code: None,
            start: Instant::now(),
            random_state: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0x9E37_79B9_7F4A_7C15, |d| d.as_nanos() as u64)
                | 1,
        };

        // Stdio first (fds 0/1/2), then the pre-open sequence from 3.
        process.install_stdio(options.stdio)?;
        process.install_preopens()?;
        Ok(process)
    }

    fn install_stdio(&mut self, stdio: StdioOptions) -> WasiResult<()> {
        let slots = [
            (0u32, stdio.stdin, Rights::STDIN_BASE),
            (1u32, stdio.stdout, Rights::STDOUT_BASE),
            (2u32, stdio.stderr, Rights::STDOUT_BASE),
        ];
        for (fd, slot, rights) in slots {
            let descriptor = match slot.unwrap_or(StdioDescriptor::Console) {
                StdioDescriptor::Console => self.install_char_device(fd, Box::new(Console), rights),
                StdioDescriptor::Pipe(pipe) => {
                    self.install_char_device(fd, Box::new(pipe), rights)
                }
                StdioDescriptor::Terminal { client } => self.install_char_device(
                    fd,
                    Box::new(TerminalConnection::new(client)),
                    rights,
                ),
                StdioDescriptor::File { path } => {
                    let oflags = if fd == 0 {
                        Oflags::empty()
                    } else {
                        Oflags::CREAT
                    };
                    let requested = if fd == 0 {
                        Rights::FD_READ | Rights::FD_SEEK | Rights::FD_FILESTAT_GET
                    } else {
                        Rights::FD_WRITE | Rights::FD_SEEK | Rights::FD_FILESTAT_GET
                    };
                    self.open_via_root(&path, oflags, requested, fd)?
                }
            };
            self.fds.insert(descriptor);
        }
        Ok(())
    }

    fn install_char_device(
        &mut self,
        fd: u32,
        device: Box<dyn crate::chardev::CharacterDevice>,
        rights: Rights,
    ) -> FileDescriptor {
        let driver = Arc::new(Device::Char(CharacterDeviceDriver::new(device)));
        let id = driver.id();
        self.devices.insert(id, driver);
        FileDescriptor {
            device: id,
            fd,
            filetype: Filetype::CharacterDevice,
            rights_base: rights,
            rights_inheriting: Rights::empty(),
            fdflags: Fdflags::empty(),
            inode: fd as u64,
            cursor: 0,
            path: String::new(),
            preopen_path: None,
        }
    }

    /// Open an absolute guest path against the mount table with a
    /// synthetic root-directory parent.
    fn open_via_root(
        &mut self,
        path: &str,
        oflags: Oflags,
        rights: Rights,
        new_fd: u32,
    ) -> WasiResult<FileDescriptor> {
        let (device, residual, parent) = {
            let (mount, residual) = self.root.resolve(path)?;
            let (base, inheriting) = mount.device.preopen_rights();
            let parent = FileDescriptor {
                device: mount.device.id(),
                fd: u32::MAX,
                filetype: Filetype::Directory,
                rights_base: base,
                rights_inheriting: inheriting,
                fdflags: Fdflags::empty(),
                inode: 0,
                cursor: 0,
                path: String::from("/"),
                preopen_path: None,
            };
            (mount.device.clone(), residual, parent)
        };
        device.driver().path_open(
            &parent,
            Lookupflags::empty(),
            &residual,
            oflags,
            rights,
            Rights::empty(),
            Fdflags::empty(),
            new_fd,
        )
    }

    fn install_preopens(&mut self) -> WasiResult<()> {
        let mut preopens = Vec::new();
        let mut next_fd = FIRST_PREOPEN_FD;
        for mount in self.root.mounts() {
            let (base, inheriting) = mount.device.preopen_rights();
            let mut descriptor = FileDescriptor {
                device: mount.device.id(),
                fd: next_fd,
                filetype: Filetype::Directory,
                rights_base: base,
                rights_inheriting: inheriting,
                fdflags: Fdflags::empty(),
                inode: 0,
                cursor: 0,
                path: String::from("/"),
                preopen_path: Some(mount.path.clone()),
            };
            // Best effort: give the pre-open its real root inode.
            if let Ok(stat) = mount
                .device
                .driver()
                .path_filestat_get(&descriptor, Lookupflags::empty(), ".")
            {
                descriptor.inode = stat.ino;
            }
            preopens.push(descriptor);
            next_fd += 1;
        }
        for descriptor in preopens {
            self.fds.insert(descriptor);
        }
        Ok(())
    }

    fn device(&self, id: DeviceId) -> WasiResult<Arc<Device>> {
        self.devices.get(&id).cloned().ok_or(WasiError::BadF)
    }

    /// Device + mutable descriptor for an fd op, after a base-rights
    /// check.
    fn for_fd(
        &mut self,
        fd: u32,
        needed: Rights,
    ) -> WasiResult<(Arc<Device>, &mut FileDescriptor)> {
        let descriptor = self.fds.get(fd)?;
        descriptor.assert_base_rights(needed)?;
        let device = self.device(descriptor.device)?;
        Ok((device, self.fds.get_mut(fd)?))
    }

    /// Device + directory descriptor for a path op.
    fn for_dir(&self, fd: u32, needed: Rights) -> WasiResult<(Arc<Device>, &FileDescriptor)> {
        let descriptor = self.fds.get(fd)?;
        descriptor.assert_directory()?;
        descriptor.assert_base_rights(needed)?;
        let device = self.device(descriptor.device)?;
        Ok((device, descriptor))
    }

    /// Like [`WasiProcess::for_dir`] for mutating path ops: the read-only
    /// wrapper answers `Perm` before any capability check, without
    /// touching the backend.
    fn for_dir_writable(
        &self,
        fd: u32,
        needed: Rights,
    ) -> WasiResult<(Arc<Device>, &FileDescriptor)> {
        let descriptor = self.fds.get(fd)?;
        descriptor.assert_directory()?;
        let device = self.device(descriptor.device)?;
        if device.driver().read_only() {
            return Err(WasiError::Perm);
        }
        descriptor.assert_base_rights(needed)?;
        Ok((device, descriptor))
    }

    // ─── Process-level surface ─────────────────────────────────────

    /// Command-line arguments.
    pub fn args_get(&self) -> &[String] {
        &self.args
    }

    /// `(argc, byte size of the argv buffer including NUL terminators)`.
    pub fn args_sizes_get(&self) -> (usize, usize) {
        let bytes = self.args.iter().map(|a| a.len() + 1).sum();
        (self.args.len(), bytes)
    }

    /// Environment as `key=value` strings.
    pub fn environ_get(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    /// `(count, byte size of the environ buffer including NULs)`.
    pub fn environ_sizes_get(&self) -> (usize, usize) {
        let bytes = self.env.iter().map(|(k, v)| k.len() + 1 + v.len() + 1).sum();
        (self.env.len(), bytes)
    }

    /// Clock resolution in nanoseconds.
    pub fn clock_res_get(&self, _clock: Clockid) -> WasiResult<u64> {
        Ok(1)
    }

    /// Current clock value in nanoseconds.
    pub fn clock_time_get(&self, clock: Clockid, _precision: u64) -> WasiResult<u64> {
        match clock {
            Clockid::Realtime => Ok(SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_nanos() as u64)),
            Clockid::Monotonic | Clockid::ProcessCputimeId | Clockid::ThreadCputimeId => {
                Ok(self.start.elapsed().as_nanos() as u64)
            }
        }
    }

    /// Fill `buf` with pseudo-random bytes.
    pub fn random_get(&mut self, buf: &mut [u8]) -> WasiResult<()> {
        for byte in buf.iter_mut() {
            self.random_state ^= self.random_state << 13;
            self.random_state ^= self.random_state >> 7;
            self.random_state ^= self.random_state << 17;
            *byte = (self.random_state & 0xFF) as u8;
        }
        Ok(())
    }

    /// Yield the guest thread.
    pub fn sched_yield(&self) -> WasiResult<()> {
        std::thread::yield_now();
        Ok(())
    }

    /// Record the exit code. The embedder tears the process down.
    pub fn proc_exit(&mut self, code: u32) {
        trace_call!(self, "proc_exit(code={})", code);
        self.exit_code = Some(code);
    }

    /// Exit code recorded by `proc_exit`, if any.
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    // ─── fd surface ────────────────────────────────────────────────

    pub fn fd_advise(
        &mut self,
        fd: u32,
        offset: u64,
        len: u64,
        advice: Advice,
    ) -> WasiResult<()> {
        trace_call!(self, "fd_advise(fd={}, offset={}, len={})", fd, offset, len);
        let (device, descriptor) = self.for_fd(fd, Rights::FD_ADVISE)?;
        device.driver().fd_advise(descriptor, offset, len, advice)
    }

    pub fn fd_allocate(&mut self, fd: u32, offset: u64, len: u64) -> WasiResult<()> {
        trace_call!(self, "fd_allocate(fd={}, offset={}, len={})", fd, offset, len);
        let (device, descriptor) = self.for_fd(fd, Rights::FD_ALLOCATE)?;
        device.driver().fd_allocate(descriptor, offset, len)
    }

    pub fn fd_close(&mut self, fd: u32) -> WasiResult<()> {
        trace_call!(self, "fd_close(fd={})", fd);
        if fd < FIRST_PREOPEN_FD {
            return Err(WasiError::Acces);
        }
        let descriptor = self.fds.get(fd)?;
        let device = self.device(descriptor.device)?;
        device.driver().fd_close(descriptor)?;
        self.fds.remove(fd)?;
        Ok(())
    }

    pub fn fd_datasync(&mut self, fd: u32) -> WasiResult<()> {
        trace_call!(self, "fd_datasync(fd={})", fd);
        let (device, descriptor) = self.for_fd(fd, Rights::FD_DATASYNC)?;
        device.driver().fd_datasync(descriptor)
    }

    pub fn fd_fdstat_get(&self, fd: u32) -> WasiResult<Fdstat> {
        trace_call!(self, "fd_fdstat_get(fd={})", fd);
        Ok(self.fds.get(fd)?.fdstat())
    }

    pub fn fd_fdstat_set_flags(&mut self, fd: u32, flags: Fdflags) -> WasiResult<()> {
        trace_call!(self, "fd_fdstat_set_flags(fd={}, flags={:?})", fd, flags);
        let (device, descriptor) = self.for_fd(fd, Rights::FD_FDSTAT_SET_FLAGS)?;
        device.driver().fd_fdstat_set_flags(descriptor, flags)
    }

    pub fn fd_filestat_get(&mut self, fd: u32) -> WasiResult<Filestat> {
        trace_call!(self, "fd_filestat_get(fd={})", fd);
        let (device, descriptor) = self.for_fd(fd, Rights::FD_FILESTAT_GET)?;
        device.driver().fd_filestat_get(descriptor)
    }

    pub fn fd_filestat_set_size(&mut self, fd: u32, size: u64) -> WasiResult<()> {
        trace_call!(self, "fd_filestat_set_size(fd={}, size={})", fd, size);
        let (device, descriptor) = self.for_fd(fd, Rights::FD_FILESTAT_SET_SIZE)?;
        device.driver().fd_filestat_set_size(descriptor, size)
    }

    pub fn fd_filestat_set_times(
        &mut self,
        fd: u32,
        atim: u64,
        mtim: u64,
        fst_flags: Fstflags,
    ) -> WasiResult<()> {
        trace_call!(self, "fd_filestat_set_times(fd={})", fd);
        let (device, descriptor) = self.for_fd(fd, Rights::FD_FILESTAT_SET_TIMES)?;
        device
            .driver()
            .fd_filestat_set_times(descriptor, atim, mtim, fst_flags)
    }

    pub fn fd_pread(&mut self, fd: u32, offset: u64, buf: &mut [u8]) -> WasiResult<usize> {
        trace_call!(self, "fd_pread(fd={}, offset={}, len={})", fd, offset, buf.len());
        let (device, descriptor) = self.for_fd(fd, Rights::FD_READ | Rights::FD_SEEK)?;
        device.driver().fd_pread(descriptor, offset, buf)
    }

    pub fn fd_pwrite(&mut self, fd: u32, offset: u64, buf: &[u8]) -> WasiResult<usize> {
        trace_call!(self, "fd_pwrite(fd={}, offset={}, len={})", fd, offset, buf.len());
        let (device, descriptor) = self.for_fd(fd, Rights::FD_WRITE | Rights::FD_SEEK)?;
        device.driver().fd_pwrite(descriptor, offset, buf)
    }

    pub fn fd_read(&mut self, fd: u32, buf: &mut [u8]) -> WasiResult<usize> {
        trace_call!(self, "fd_read(fd={}, len={})", fd, buf.len());
        let (device, descriptor) = self.for_fd(fd, Rights::FD_READ)?;
        device.driver().fd_read(descriptor, buf)
    }

    /// Materialised directory entries from `cookie` on.
    pub fn fd_readdir(&mut self, fd: u32, cookie: u64) -> WasiResult<Vec<Dirent>> {
        trace_call!(self, "fd_readdir(fd={}, cookie={})", fd, cookie);
        let (device, descriptor) = self.for_fd(fd, Rights::FD_READDIR)?;
        descriptor.assert_directory()?;
        device.driver().fd_readdir(descriptor, cookie)
    }

    /// ABI form of `fd_readdir`: encode entries into `buf` until it is
    /// full. A final partial entry is truncated, exactly as the WASI
    /// contract requires.
    pub fn fd_readdir_bytes(&mut self, fd: u32, buf: &mut [u8], cookie: u64) -> WasiResult<usize> {
        let entries = self.fd_readdir(fd, cookie)?;
        let mut written = 0;
        for entry in entries {
            let remaining = buf.len() - written;
            if remaining == 0 {
                break;
            }
            let size = entry.encoded_size();
            if size <= remaining {
                entry.encode(&mut buf[written..written + size]);
                written += size;
            } else {
                let mut image = vec![0u8; size];
                entry.encode(&mut image);
                buf[written..].copy_from_slice(&image[..remaining]);
                written = buf.len();
                break;
            }
        }
        Ok(written)
    }

    pub fn fd_renumber(&mut self, from: u32, to: u32) -> WasiResult<()> {
        trace_call!(self, "fd_renumber(from={}, to={})", from, to);
        if from == to {
            self.fds.get(from)?;
            return Ok(());
        }
        // Close whatever currently occupies the target.
        if let Ok(existing) = self.fds.get(to) {
            let device = self.device(existing.device)?;
            device.driver().fd_close(existing)?;
            self.fds.remove(to)?;
        }
        let descriptor = self.fds.get(from)?;
        let device = self.device(descriptor.device)?;
        device.driver().fd_renumber(descriptor, to)?;
        self.fds.renumber(from, to)
    }

    pub fn fd_seek(&mut self, fd: u32, offset: i64, whence: Whence) -> WasiResult<u64> {
        trace_call!(self, "fd_seek(fd={}, offset={}, whence={:?})", fd, offset, whence);
        // Character devices cannot seek, independent of rights.
        if self.fds.get(fd)?.filetype == Filetype::CharacterDevice {
            return Err(WasiError::SPipe);
        }
        let (device, descriptor) = self.for_fd(fd, Rights::FD_SEEK)?;
        device.driver().fd_seek(descriptor, offset, whence)
    }

    pub fn fd_sync(&mut self, fd: u32) -> WasiResult<()> {
        trace_call!(self, "fd_sync(fd={})", fd);
        let (device, descriptor) = self.for_fd(fd, Rights::FD_SYNC)?;
        device.driver().fd_sync(descriptor)
    }

    pub fn fd_tell(&mut self, fd: u32) -> WasiResult<u64> {
        trace_call!(self, "fd_tell(fd={})", fd);
        let (device, descriptor) = self.for_fd(fd, Rights::FD_TELL)?;
        device.driver().fd_tell(descriptor)
    }

    pub fn fd_write(&mut self, fd: u32, buf: &[u8]) -> WasiResult<usize> {
        trace_call!(self, "fd_write(fd={}, len={})", fd, buf.len());
        let (device, descriptor) = self.for_fd(fd, Rights::FD_WRITE)?;
        device.driver().fd_write(descriptor, buf)
    }

    /// Bytes readable without blocking.
    pub fn fd_bytes_available(&mut self, fd: u32) -> WasiResult<u64> {
        let (device, descriptor) = self.for_fd(fd, Rights::empty())?;
        device.driver().fd_bytes_available(descriptor)
    }

    pub fn fd_prestat_get(&self, fd: u32) -> WasiResult<Prestat> {
        let descriptor = self.fds.get(fd)?;
        let name = descriptor.preopen_path.as_ref().ok_or(WasiError::BadF)?;
        Ok(Prestat::dir(name.len() as u32))
    }

    pub fn fd_prestat_dir_name(&self, fd: u32, buf: &mut [u8]) -> WasiResult<()> {
        let descriptor = self.fds.get(fd)?;
        let name = descriptor.preopen_path.as_ref().ok_or(WasiError::BadF)?;
        if buf.len() < name.len() {
            return Err(WasiError::Overflow);
        }
        buf[..name.len()].copy_from_slice(name.as_bytes());
        Ok(())
    }

    // ─── path surface ──────────────────────────────────────────────

    pub fn path_create_directory(&mut self, fd: u32, path: &str) -> WasiResult<()> {
        trace_call!(self, "path_create_directory(fd={}, path={:?})", fd, path);
        let (device, descriptor) = self.for_dir_writable(fd, Rights::PATH_CREATE_DIRECTORY)?;
        device.driver().path_create_directory(descriptor, path)
    }

    pub fn path_filestat_get(
        &mut self,
        fd: u32,
        flags: Lookupflags,
        path: &str,
    ) -> WasiResult<Filestat> {
        trace_call!(self, "path_filestat_get(fd={}, path={:?})", fd, path);
        let (device, descriptor) = self.for_dir(fd, Rights::PATH_FILESTAT_GET)?;
        device.driver().path_filestat_get(descriptor, flags, path)
    }

    pub fn path_filestat_set_times(
        &mut self,
        fd: u32,
        flags: Lookupflags,
        path: &str,
        atim: u64,
        mtim: u64,
        fst_flags: Fstflags,
    ) -> WasiResult<()> {
        trace_call!(self, "path_filestat_set_times(fd={}, path={:?})", fd, path);
        let (device, descriptor) = self.for_dir_writable(fd, Rights::PATH_FILESTAT_SET_TIMES)?;
        device
            .driver()
            .path_filestat_set_times(descriptor, flags, path, atim, mtim, fst_flags)
    }

    pub fn path_link(
        &mut self,
        old_fd: u32,
        old_flags: Lookupflags,
        old_path: &str,
        new_fd: u32,
        new_path: &str,
    ) -> WasiResult<()> {
        trace_call!(self, "path_link({}:{:?} -> {}:{:?})", old_fd, old_path, new_fd, new_path);
        let (device, old_descriptor) = self.for_dir(old_fd, Rights::PATH_LINK_SOURCE)?;
        let (new_device, new_descriptor) = self.for_dir_writable(new_fd, Rights::PATH_LINK_TARGET)?;
        if device.id() != new_device.id() {
            return Err(WasiError::XDev);
        }
        device
            .driver()
            .path_link(old_descriptor, old_flags, old_path, new_descriptor, new_path)
    }

    pub fn path_open(
        &mut self,
        fd: u32,
        dirflags: Lookupflags,
        path: &str,
        oflags: Oflags,
        rights_base: Rights,
        rights_inheriting: Rights,
        fdflags: Fdflags,
    ) -> WasiResult<u32> {
        trace_call!(
            self,
            "path_open(fd={}, path={:?}, oflags={:?}, fdflags={:?})",
            fd,
            path,
            oflags,
            fdflags
        );
        let derived = path_open_rights(oflags, fdflags, rights_base, rights_inheriting);
        let new_fd = self.fds.next_free_fd();
        let mutates = oflags.intersects(Oflags::CREAT | Oflags::TRUNC)
            || rights_base.contains(Rights::FD_WRITE);
        let (device, descriptor) = if mutates {
            self.for_dir_writable(fd, derived.needed_base)?
        } else {
            self.for_dir(fd, derived.needed_base)?
        };
        descriptor.assert_inheriting_rights(derived.needed_inheriting)?;
        let child = device.driver().path_open(
            descriptor,
            dirflags,
            path,
            oflags,
            derived.requested_base,
            rights_inheriting,
            fdflags,
            new_fd,
        )?;
        self.fds.insert(child);
        Ok(new_fd)
    }

    pub fn path_readlink(&mut self, fd: u32, path: &str) -> WasiResult<String> {
        trace_call!(self, "path_readlink(fd={}, path={:?})", fd, path);
        let (device, descriptor) = self.for_dir(fd, Rights::PATH_READLINK)?;
        device.driver().path_readlink(descriptor, path)
    }

    pub fn path_remove_directory(&mut self, fd: u32, path: &str) -> WasiResult<()> {
        trace_call!(self, "path_remove_directory(fd={}, path={:?})", fd, path);
        let (device, descriptor) = self.for_dir_writable(fd, Rights::PATH_REMOVE_DIRECTORY)?;
        device.driver().path_remove_directory(descriptor, path)
    }

    pub fn path_rename(
        &mut self,
        old_fd: u32,
        old_path: &str,
        new_fd: u32,
        new_path: &str,
    ) -> WasiResult<()> {
        trace_call!(self, "path_rename({}:{:?} -> {}:{:?})", old_fd, old_path, new_fd, new_path);
        let (device, old_descriptor) = self.for_dir_writable(old_fd, Rights::PATH_RENAME_SOURCE)?;
        let (new_device, new_descriptor) = self.for_dir_writable(new_fd, Rights::PATH_RENAME_TARGET)?;
        if device.id() != new_device.id() {
            return Err(WasiError::XDev);
        }
        device
            .driver()
            .path_rename(old_descriptor, old_path, new_descriptor, new_path)
    }

    pub fn path_symlink(&mut self, old_path: &str, fd: u32, new_path: &str) -> WasiResult<()> {
        trace_call!(self, "path_symlink({:?} at {}:{:?})", old_path, fd, new_path);
        let (device, descriptor) = self.for_dir_writable(fd, Rights::PATH_SYMLINK)?;
        device.driver().path_symlink(old_path, descriptor, new_path)
    }

    pub fn path_unlink_file(&mut self, fd: u32, path: &str) -> WasiResult<()> {
        trace_call!(self, "path_unlink_file(fd={}, path={:?})", fd, path);
        let (device, descriptor) = self.for_dir_writable(fd, Rights::PATH_UNLINK_FILE)?;
        device.driver().path_unlink_file(descriptor, path)
    }

    // ─── poll ──────────────────────────────────────────────────────

    /// Wait for the first of the given subscriptions.
    pub fn poll_oneoff(&mut self, subscriptions: &[Subscription]) -> WasiResult<Vec<Event>> {
        trace_call!(self, "poll_oneoff(count={})", subscriptions.len());
        if subscriptions.is_empty() {
            return Err(WasiError::Inval);
        }

        let started = Instant::now();
        let mut clock_deadline: Option<(u64, Duration)> = None;
        for subscription in subscriptions {
            if let SubscriptionU::Clock(clock) = subscription.u {
                let relative = if clock
                    .flags
                    .contains(crate::types::Subclockflags::SUBSCRIPTION_CLOCK_ABSTIME)
                {
                    let now = self.clock_time_get(clock.id, 0)?;
                    Duration::from_nanos(clock.timeout.saturating_sub(now))
                } else {
                    Duration::from_nanos(clock.timeout)
                };
                if clock_deadline.map_or(true, |(_, d)| relative < d) {
                    clock_deadline = Some((subscription.userdata, relative));
                }
            }
        }

        loop {
            let mut events = Vec::new();
            for subscription in subscriptions {
                match subscription.u {
                    SubscriptionU::Clock(_) => {}
                    SubscriptionU::FdRead(sub) => {
                        match self.fd_bytes_available(sub.file_descriptor) {
                            Ok(0) => {}
                            Ok(nbytes) => events.push(Event {
                                userdata: subscription.userdata,
                                error: WasiError::Success as u16,
                                r#type: Eventtype::FdRead,
                                fd_readwrite: EventFdReadwrite {
                                    nbytes,
                                    flags: Eventrwflags::empty(),
                                },
                            }),
                            Err(e) => events.push(Event {
                                userdata: subscription.userdata,
                                error: e as u16,
                                r#type: Eventtype::FdRead,
                                fd_readwrite: EventFdReadwrite::default(),
                            }),
                        }
                    }
                    SubscriptionU::FdWrite(sub) => {
                        // Writes never block in this host; report ready.
                        let error = match self.fds.get(sub.file_descriptor) {
                            Ok(_) => WasiError::Success as u16,
                            Err(e) => e as u16,
                        };
                        events.push(Event {
                            userdata: subscription.userdata,
                            error,
                            r#type: Eventtype::FdWrite,
                            fd_readwrite: EventFdReadwrite::default(),
                        });
                    }
                }
            }
            if !events.is_empty() {
                return Ok(events);
            }
            if let Some((userdata, deadline)) = clock_deadline {
                if started.elapsed() >= deadline {
                    return Ok(vec![Event {
                        userdata,
                        error: WasiError::Success as u16,
                        r#type: Eventtype::Clock,
                        fd_readwrite: EventFdReadwrite::default(),
                    }]);
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl core::fmt::Debug for WasiProcess {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WasiProcess")
            .field("devices", &self.devices.len())
            .field("fds", &self.fds.len())
            .field("trace", &self.trace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memfs_options() -> ProcessOptions {
        let fs = InMemoryFileSystemDevice::new(false);
        fs.add_file("/hello.txt", b"Hello from VFS!".to_vec()).unwrap();
        ProcessOptions {
            args: vec![String::from("app"), String::from("--flag")],
            mount_points: vec![MountPointDescriptor::InMemoryFileSystem {
                file_system: fs,
                mount_point: String::from("/app"),
            }],
            ..ProcessOptions::default()
        }
    }

    #[test]
    fn test_preopen_sequence_and_names() {
        let process = WasiProcess::new(memfs_options()).unwrap();
        let prestat = process.fd_prestat_get(3).unwrap();
        assert_eq!(prestat.pr_name_len, 4);
        let mut buf = vec![0u8; 4];
        process.fd_prestat_dir_name(3, &mut buf).unwrap();
        assert_eq!(&buf, b"/app");
        assert_eq!(process.fd_prestat_get(4).err(), Some(WasiError::BadF));
    }

    #[test]
    fn test_open_read_through_preopen() {
        let mut process = WasiProcess::new(memfs_options()).unwrap();
        let fd = process
            .path_open(
                3,
                Lookupflags::empty(),
                "hello.txt",
                Oflags::empty(),
                Rights::FD_READ | Rights::FD_SEEK,
                Rights::empty(),
                Fdflags::empty(),
            )
            .unwrap();
        assert_eq!(fd, 4);
        let mut buf = [0u8; 64];
        let count = process.fd_read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..count], b"Hello from VFS!");
        process.fd_close(fd).unwrap();
    }

    #[test]
    fn test_rights_enforced_before_driver() {
        let mut process = WasiProcess::new(memfs_options()).unwrap();
        let fd = process
            .path_open(
                3,
                Lookupflags::empty(),
                "hello.txt",
                Oflags::empty(),
                Rights::FD_READ,
                Rights::empty(),
                Fdflags::empty(),
            )
            .unwrap();
        // The descriptor was opened read-only; a write must fail the
        // capability check with NotCapable, not reach the backend.
        assert_eq!(process.fd_write(fd, b"x").err(), Some(WasiError::NotCapable));
    }

    #[test]
    fn test_args_and_environ_sizes() {
        let mut options = memfs_options();
        options.env.insert(String::from("HOME"), String::from("/app"));
        options.env.insert(String::from("A"), String::from("B"));
        let process = WasiProcess::new(options).unwrap();
        let (argc, argv_bytes) = process.args_sizes_get();
        assert_eq!(argc, 2);
        assert_eq!(argv_bytes, 4 + 7);
        let (envc, env_bytes) = process.environ_sizes_get();
        assert_eq!(envc, 2);
        assert_eq!(env_bytes, 4 + 10);
        assert_eq!(process.environ_get(), vec!["A=B", "HOME=/app"]);
    }

    #[test]
    fn test_stdio_defaults_installed() {
        let process = WasiProcess::new(memfs_options()).unwrap();
        let stdin = process.fd_fdstat_get(0).unwrap();
        assert_eq!(stdin.fs_filetype, Filetype::CharacterDevice);
        assert!(stdin.fs_rights_base.contains(Rights::FD_READ));
        let stdout = process.fd_fdstat_get(1).unwrap();
        assert!(stdout.fs_rights_base.contains(Rights::FD_WRITE));
        assert!(!stdout.fs_rights_base.contains(Rights::FD_READ));
    }

    #[test]
    fn test_stdio_close_rejected() {
        let mut process = WasiProcess::new(memfs_options()).unwrap();
        assert_eq!(process.fd_close(0).err(), Some(WasiError::Acces));
        assert_eq!(process.fd_close(2).err(), Some(WasiError::Acces));
    }

    #[test]
    fn test_fd_renumber_moves_open_file() {
        let mut process = WasiProcess::new(memfs_options()).unwrap();
        let fd = process
            .path_open(
                3,
                Lookupflags::empty(),
                "hello.txt",
                Oflags::empty(),
                Rights::FD_READ,
                Rights::empty(),
                Fdflags::empty(),
            )
            .unwrap();
        process.fd_renumber(fd, 9).unwrap();
        assert_eq!(process.fd_read(fd, &mut [0u8; 4]).err(), Some(WasiError::BadF));
        let mut buf = [0u8; 5];
        assert_eq!(process.fd_read(9, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"Hello");
    }

    #[test]
    fn test_clock_and_random() {
        let mut process = WasiProcess::new(ProcessOptions::default()).unwrap();
        let t1 = process.clock_time_get(Clockid::Monotonic, 0).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let t2 = process.clock_time_get(Clockid::Monotonic, 0).unwrap();
        assert!(t2 > t1);
        let mut buf = [0u8; 32];
        process.random_get(&mut buf).unwrap();
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_pipe_stdout_capture() {
        let out = Pipe::new();
        let capture = out.clone();
        let mut options = memfs_options();
        options.stdio.stdout = Some(StdioDescriptor::Pipe(out));
        let mut process = WasiProcess::new(options).unwrap();
        process.fd_write(1, b"Done!\n").unwrap();
        assert_eq!(capture.drain(), b"Done!\n");
    }

    #[test]
    fn test_poll_oneoff_clock_fires() {
        let mut process = WasiProcess::new(memfs_options()).unwrap();
        let subscription = Subscription {
            userdata: 42,
            u: SubscriptionU::Clock(crate::types::SubscriptionClock {
                id: Clockid::Monotonic,
                timeout: 2_000_000, // 2ms
                precision: 0,
                flags: crate::types::Subclockflags::empty(),
            }),
        };
        let events = process.poll_oneoff(&[subscription]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].userdata, 42);
        assert_eq!(events[0].r#type, Eventtype::Clock);
    }

    #[test]
    fn test_readdir_bytes_truncates() {
        let mut process = WasiProcess::new(memfs_options()).unwrap();
        let mut big = vec![0u8; 512];
        let full = process.fd_readdir_bytes(3, &mut big, 0).unwrap();
        assert!(full > 0);
        // A buffer smaller than the listing is filled exactly.
        let mut small = vec![0u8; 30];
        let written = process.fd_readdir_bytes(3, &mut small, 0).unwrap();
        assert_eq!(written, 30);
    }
}
