//! WASI Preview 1 value types and constants.
//!
//! Every enumeration and bitmask matches the WASI snapshot-01 numbering
//! exactly, and every binary structure encodes to the little-endian image
//! the specification prescribes, at the documented size and alignment.
//! The encode/decode pairs below are the only place byte offsets appear;
//! drivers and the process layer work with the plain Rust structs.

use bitflags::bitflags;

use wasmbed_shm::MemoryRange;

// ─── Errno ─────────────────────────────────────────────────────────

/// WASI error codes (Preview 1), `success = 0 … notcapable = 76`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum WasiError {
    /// Success.
    Success = 0,
    /// Argument list too long.
    TooBig = 1,
    /// Permission denied.
    Acces = 2,
    /// Address in use.
    AddrInUse = 3,
    /// Address not available.
    AddrNotAvail = 4,
    /// Address family not supported.
    AfNoSupport = 5,
    /// Resource unavailable, or operation would block.
    Again = 6,
    /// Connection already in progress.
    Already = 7,
    /// Bad file descriptor.
    BadF = 8,
    /// Bad message.
    BadMsg = 9,
    /// Device or resource busy.
    Busy = 10,
    /// Operation canceled.
    Canceled = 11,
    /// No child processes.
    Child = 12,
    /// Connection aborted.
    ConnAborted = 13,
    /// Connection refused.
    ConnRefused = 14,
    /// Connection reset.
    ConnReset = 15,
    /// Resource deadlock would occur.
    DeadLk = 16,
    /// Destination address required.
    DestAddrReq = 17,
    /// Mathematics argument out of domain of function.
    Dom = 18,
    /// Reserved (quota exceeded).
    DQuot = 19,
    /// File exists.
    Exist = 20,
    /// Bad address.
    Fault = 21,
    /// File too large.
    FBig = 22,
    /// Host is unreachable.
    HostUnreach = 23,
    /// Identifier removed.
    IdRm = 24,
    /// Illegal byte sequence.
    IlSeq = 25,
    /// Operation in progress.
    InProgress = 26,
    /// Interrupted function.
    Intr = 27,
    /// Invalid argument.
    Inval = 28,
    /// I/O error.
    Io = 29,
    /// Socket is connected.
    IsConn = 30,
    /// Is a directory.
    IsDir = 31,
    /// Too many levels of symbolic links.
    Loop = 32,
    /// File descriptor value too large.
    MFile = 33,
    /// Too many links.
    MLink = 34,
    /// Message too large.
    MsgSize = 35,
    /// Reserved (multihop attempted).
    Multihop = 36,
    /// Filename too long.
    NameTooLong = 37,
    /// Network is down.
    NetDown = 38,
    /// Connection aborted by network.
    NetReset = 39,
    /// Network unreachable.
    NetUnreach = 40,
    /// Too many files open in system.
    NFile = 41,
    /// No buffer space available.
    NoBufs = 42,
    /// No such device.
    NoDev = 43,
    /// No such file or directory.
    NoEnt = 44,
    /// Executable file format error.
    NoExec = 45,
    /// No locks available.
    NoLck = 46,
    /// Reserved (link has been severed).
    NoLink = 47,
    /// Not enough space.
    NoMem = 48,
    /// No message of the desired type.
    NoMsg = 49,
    /// Protocol not available.
    NoProtoOpt = 50,
    /// No space left on device.
    NoSpc = 51,
    /// Function not supported.
    NoSys = 52,
    /// The socket is not connected.
    NotConn = 53,
    /// Not a directory or a symbolic link to a directory.
    NotDir = 54,
    /// Directory not empty.
    NotEmpty = 55,
    /// State not recoverable.
    NotRecoverable = 56,
    /// Not a socket.
    NotSock = 57,
    /// Not supported, or operation not supported on socket.
    NotSup = 58,
    /// Inappropriate I/O control operation.
    NoTty = 59,
    /// No such device or address.
    NxIo = 60,
    /// Value too large to be stored in data type.
    Overflow = 61,
    /// Previous owner died.
    OwnerDead = 62,
    /// Operation not permitted.
    Perm = 63,
    /// Broken pipe.
    Pipe = 64,
    /// Protocol error.
    Proto = 65,
    /// Protocol not supported.
    ProtoNoSupport = 66,
    /// Protocol wrong type for socket.
    ProtoType = 67,
    /// Result too large.
    Range = 68,
    /// Read-only file system.
    RoFs = 69,
    /// Invalid seek.
    SPipe = 70,
    /// No such process.
    SRch = 71,
    /// Reserved (stale file handle).
    Stale = 72,
    /// Connection timed out.
    TimedOut = 73,
    /// Text file busy.
    TxtBsy = 74,
    /// Cross-device link.
    XDev = 75,
    /// Extension: capabilities insufficient.
    NotCapable = 76,
}

impl WasiError {
    /// The 16-bit errno image.
    pub fn to_errno(self) -> u16 {
        self as u16
    }
}

impl core::fmt::Display for WasiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} (errno {})", self, *self as u16)
    }
}

impl std::error::Error for WasiError {}

/// Map a host I/O failure onto the WASI errno surface.
impl From<std::io::Error> for WasiError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => WasiError::NoEnt,
            ErrorKind::PermissionDenied => WasiError::Acces,
            ErrorKind::AlreadyExists => WasiError::Exist,
            ErrorKind::WouldBlock => WasiError::Again,
            ErrorKind::InvalidInput => WasiError::Inval,
            ErrorKind::TimedOut => WasiError::TimedOut,
            ErrorKind::Interrupted => WasiError::Intr,
            ErrorKind::Unsupported => WasiError::NotSup,
            ErrorKind::OutOfMemory => WasiError::NoMem,
            ErrorKind::NotADirectory => WasiError::NotDir,
            ErrorKind::IsADirectory => WasiError::IsDir,
            ErrorKind::DirectoryNotEmpty => WasiError::NotEmpty,
            ErrorKind::ReadOnlyFilesystem => WasiError::RoFs,
            ErrorKind::StorageFull => WasiError::NoSpc,
            ErrorKind::BrokenPipe => WasiError::Pipe,
            // Everything else counts as a backend failure.
            _ => WasiError::Io,
        }
    }
}

/// Driver operation result.
pub type WasiResult<T> = Result<T, WasiError>;

// ─── Enumerations ──────────────────────────────────────────────────

/// The type of a file descriptor or file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Filetype {
    Unknown = 0,
    BlockDevice = 1,
    CharacterDevice = 2,
    Directory = 3,
    RegularFile = 4,
    SocketDgram = 5,
    SocketStream = 6,
    SymbolicLink = 7,
}

impl Filetype {
    /// Parse the wire value.
    pub fn from_u8(value: u8) -> Option<Filetype> {
        match value {
            0 => Some(Filetype::Unknown),
            1 => Some(Filetype::BlockDevice),
            2 => Some(Filetype::CharacterDevice),
            3 => Some(Filetype::Directory),
            4 => Some(Filetype::RegularFile),
            5 => Some(Filetype::SocketDgram),
            6 => Some(Filetype::SocketStream),
            7 => Some(Filetype::SymbolicLink),
            _ => None,
        }
    }
}

/// Position base for `fd_seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Whence {
    /// Seek from beginning.
    Set = 0,
    /// Seek from current position.
    Cur = 1,
    /// Seek from end.
    End = 2,
}

impl Whence {
    pub fn from_u8(value: u8) -> Option<Whence> {
        match value {
            0 => Some(Whence::Set),
            1 => Some(Whence::Cur),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

/// Clock identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Clockid {
    Realtime = 0,
    Monotonic = 1,
    ProcessCputimeId = 2,
    ThreadCputimeId = 3,
}

impl Clockid {
    pub fn from_u32(value: u32) -> Option<Clockid> {
        match value {
            0 => Some(Clockid::Realtime),
            1 => Some(Clockid::Monotonic),
            2 => Some(Clockid::ProcessCputimeId),
            3 => Some(Clockid::ThreadCputimeId),
            _ => None,
        }
    }
}

/// File access advisory information for `fd_advise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Advice {
    Normal = 0,
    Sequential = 1,
    Random = 2,
    WillNeed = 3,
    DontNeed = 4,
    NoReuse = 5,
}

impl Advice {
    pub fn from_u8(value: u8) -> Option<Advice> {
        match value {
            0 => Some(Advice::Normal),
            1 => Some(Advice::Sequential),
            2 => Some(Advice::Random),
            3 => Some(Advice::WillNeed),
            4 => Some(Advice::DontNeed),
            5 => Some(Advice::NoReuse),
            _ => None,
        }
    }
}

/// The only pre-open kind: a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Preopentype {
    Dir = 0,
}

/// Subscription/event type for `poll_oneoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Eventtype {
    Clock = 0,
    FdRead = 1,
    FdWrite = 2,
}

impl Eventtype {
    pub fn from_u8(value: u8) -> Option<Eventtype> {
        match value {
            0 => Some(Eventtype::Clock),
            1 => Some(Eventtype::FdRead),
            2 => Some(Eventtype::FdWrite),
            _ => None,
        }
    }
}

// ─── Flags and rights ──────────────────────────────────────────────

bitflags! {
    /// File descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Fdflags: u16 {
        const APPEND = 1 << 0;
        const DSYNC = 1 << 1;
        const NONBLOCK = 1 << 2;
        const RSYNC = 1 << 3;
        const SYNC = 1 << 4;
    }
}

bitflags! {
    /// Open flags for `path_open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Oflags: u16 {
        const CREAT = 1 << 0;
        const DIRECTORY = 1 << 1;
        const EXCL = 1 << 2;
        const TRUNC = 1 << 3;
    }
}

bitflags! {
    /// Path lookup flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Lookupflags: u32 {
        const SYMLINK_FOLLOW = 1 << 0;
    }
}

bitflags! {
    /// Which file time attributes to adjust.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Fstflags: u16 {
        const ATIM = 1 << 0;
        const ATIM_NOW = 1 << 1;
        const MTIM = 1 << 2;
        const MTIM_NOW = 1 << 3;
    }
}

bitflags! {
    /// State of a file descriptor polled for read/write readiness.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Eventrwflags: u16 {
        const FD_READWRITE_HANGUP = 1 << 0;
    }
}

bitflags! {
    /// How to interpret a clock subscription's timeout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Subclockflags: u16 {
        const SUBSCRIPTION_CLOCK_ABSTIME = 1 << 0;
    }
}

bitflags! {
    /// Capability rights, WASI snapshot-01 bit positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u64 {
        const FD_DATASYNC = 1 << 0;
        const FD_READ = 1 << 1;
        const FD_SEEK = 1 << 2;
        const FD_FDSTAT_SET_FLAGS = 1 << 3;
        const FD_SYNC = 1 << 4;
        const FD_TELL = 1 << 5;
        const FD_WRITE = 1 << 6;
        const FD_ADVISE = 1 << 7;
        const FD_ALLOCATE = 1 << 8;
        const PATH_CREATE_DIRECTORY = 1 << 9;
        const PATH_CREATE_FILE = 1 << 10;
        const PATH_LINK_SOURCE = 1 << 11;
        const PATH_LINK_TARGET = 1 << 12;
        const PATH_OPEN = 1 << 13;
        const FD_READDIR = 1 << 14;
        const PATH_READLINK = 1 << 15;
        const PATH_RENAME_SOURCE = 1 << 16;
        const PATH_RENAME_TARGET = 1 << 17;
        const PATH_FILESTAT_GET = 1 << 18;
        const PATH_FILESTAT_SET_SIZE = 1 << 19;
        const PATH_FILESTAT_SET_TIMES = 1 << 20;
        const FD_FILESTAT_GET = 1 << 21;
        const FD_FILESTAT_SET_SIZE = 1 << 22;
        const FD_FILESTAT_SET_TIMES = 1 << 23;
        const PATH_SYMLINK = 1 << 24;
        const PATH_REMOVE_DIRECTORY = 1 << 25;
        const PATH_UNLINK_FILE = 1 << 26;
        const POLL_FD_READWRITE = 1 << 27;
        const SOCK_SHUTDOWN = 1 << 28;
    }
}

impl Rights {
    /// Base rights of a directory descriptor.
    pub const DIRECTORY_BASE: Rights = Rights::PATH_CREATE_DIRECTORY
        .union(Rights::PATH_CREATE_FILE)
        .union(Rights::PATH_LINK_SOURCE)
        .union(Rights::PATH_LINK_TARGET)
        .union(Rights::PATH_OPEN)
        .union(Rights::FD_READDIR)
        .union(Rights::PATH_READLINK)
        .union(Rights::PATH_RENAME_SOURCE)
        .union(Rights::PATH_RENAME_TARGET)
        .union(Rights::PATH_FILESTAT_GET)
        .union(Rights::PATH_FILESTAT_SET_SIZE)
        .union(Rights::PATH_FILESTAT_SET_TIMES)
        .union(Rights::FD_FILESTAT_GET)
        .union(Rights::FD_FILESTAT_SET_TIMES)
        .union(Rights::PATH_SYMLINK)
        .union(Rights::PATH_REMOVE_DIRECTORY)
        .union(Rights::PATH_UNLINK_FILE);

    /// Base rights of a regular-file descriptor.
    pub const FILE_BASE: Rights = Rights::FD_DATASYNC
        .union(Rights::FD_READ)
        .union(Rights::FD_SEEK)
        .union(Rights::FD_FDSTAT_SET_FLAGS)
        .union(Rights::FD_SYNC)
        .union(Rights::FD_TELL)
        .union(Rights::FD_WRITE)
        .union(Rights::FD_ADVISE)
        .union(Rights::FD_ALLOCATE)
        .union(Rights::FD_FILESTAT_GET)
        .union(Rights::FD_FILESTAT_SET_SIZE)
        .union(Rights::FD_FILESTAT_SET_TIMES)
        .union(Rights::POLL_FD_READWRITE);

    /// Rights a directory passes on to its children.
    pub const DIRECTORY_INHERITING: Rights =
        Rights::DIRECTORY_BASE.union(Rights::FILE_BASE);

    /// Rights a file passes on (none; files have no children).
    pub const FILE_INHERITING: Rights = Rights::empty();

    /// Base rights of the stdin descriptor.
    pub const STDIN_BASE: Rights = Rights::FD_READ
        .union(Rights::FD_FILESTAT_GET)
        .union(Rights::POLL_FD_READWRITE);

    /// Base rights of the stdout/stderr descriptors.
    pub const STDOUT_BASE: Rights = Rights::FD_FDSTAT_SET_FLAGS
        .union(Rights::FD_WRITE)
        .union(Rights::FD_FILESTAT_GET)
        .union(Rights::POLL_FD_READWRITE);

    /// Base rights of a generic character device.
    pub const CHARACTER_DEVICE_BASE: Rights = Rights::FD_READ
        .union(Rights::FD_WRITE)
        .union(Rights::FD_FDSTAT_SET_FLAGS)
        .union(Rights::FD_FILESTAT_GET)
        .union(Rights::POLL_FD_READWRITE);

    /// Mask applied to both rights sets when a filesystem is mounted
    /// read-only: everything that can observe, nothing that can mutate.
    pub const READ_ONLY_MASK: Rights = Rights::FD_READ
        .union(Rights::FD_SEEK)
        .union(Rights::FD_TELL)
        .union(Rights::FD_ADVISE)
        .union(Rights::FD_READDIR)
        .union(Rights::PATH_OPEN)
        .union(Rights::PATH_READLINK)
        .union(Rights::PATH_FILESTAT_GET)
        .union(Rights::FD_FILESTAT_GET)
        .union(Rights::POLL_FD_READWRITE);
}

// ─── Binary structures ─────────────────────────────────────────────

fn write_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

/// Adds `store`/`load` over guest memory ranges to a fixed-size binary
/// structure. A bad guest address surfaces as `Fault`.
macro_rules! range_image {
    ($($ty:ty),*) => {$(
        impl $ty {
            /// Write the little-endian image at `offset` of a guest range.
            pub fn store(&self, range: &MemoryRange, offset: u32) -> WasiResult<()> {
                let mut bytes = [0u8; Self::SIZE];
                self.encode(&mut bytes);
                range
                    .copy_from_slice(offset, &bytes)
                    .map_err(|_| WasiError::Fault)
            }
        }
    )*};
}

/// `filestat`: file attributes. 64 bytes, alignment 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Filestat {
    pub dev: u64,
    pub ino: u64,
    pub filetype: u8,
    pub nlink: u64,
    pub size: u64,
    pub atim: u64,
    pub mtim: u64,
    pub ctim: u64,
}

impl Filestat {
    pub const SIZE: usize = 64;
    pub const ALIGN: usize = 8;

    /// Write the little-endian image at the start of `bytes`.
    pub fn encode(&self, bytes: &mut [u8]) {
        write_u64(bytes, 0, self.dev);
        write_u64(bytes, 8, self.ino);
        bytes[16] = self.filetype;
        bytes[17..24].fill(0);
        write_u64(bytes, 24, self.nlink);
        write_u64(bytes, 32, self.size);
        write_u64(bytes, 40, self.atim);
        write_u64(bytes, 48, self.mtim);
        write_u64(bytes, 56, self.ctim);
    }

    /// Read the little-endian image from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Filestat {
        Filestat {
            dev: read_u64(bytes, 0),
            ino: read_u64(bytes, 8),
            filetype: bytes[16],
            nlink: read_u64(bytes, 24),
            size: read_u64(bytes, 32),
            atim: read_u64(bytes, 40),
            mtim: read_u64(bytes, 48),
            ctim: read_u64(bytes, 56),
        }
    }
}

/// `fdstat`: file descriptor attributes. 24 bytes, alignment 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fdstat {
    pub fs_filetype: Filetype,
    pub fs_flags: Fdflags,
    pub fs_rights_base: Rights,
    pub fs_rights_inheriting: Rights,
}

impl Fdstat {
    pub const SIZE: usize = 24;
    pub const ALIGN: usize = 8;

    pub fn encode(&self, bytes: &mut [u8]) {
        bytes[0] = self.fs_filetype as u8;
        bytes[1] = 0;
        write_u16(bytes, 2, self.fs_flags.bits());
        bytes[4..8].fill(0);
        write_u64(bytes, 8, self.fs_rights_base.bits());
        write_u64(bytes, 16, self.fs_rights_inheriting.bits());
    }

    pub fn decode(bytes: &[u8]) -> Option<Fdstat> {
        Some(Fdstat {
            fs_filetype: Filetype::from_u8(bytes[0])?,
            fs_flags: Fdflags::from_bits_truncate(read_u16(bytes, 2)),
            fs_rights_base: Rights::from_bits_truncate(read_u64(bytes, 8)),
            fs_rights_inheriting: Rights::from_bits_truncate(read_u64(bytes, 16)),
        })
    }
}

/// `iovec`: a writable guest-memory region for scatter reads. 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iovec {
    pub buf: u32,
    pub buf_len: u32,
}

impl Iovec {
    pub const SIZE: usize = 8;
    pub const ALIGN: usize = 4;

    pub fn encode(&self, bytes: &mut [u8]) {
        write_u32(bytes, 0, self.buf);
        write_u32(bytes, 4, self.buf_len);
    }

    pub fn decode(bytes: &[u8]) -> Iovec {
        Iovec {
            buf: read_u32(bytes, 0),
            buf_len: read_u32(bytes, 4),
        }
    }
}

/// `ciovec`: a read-only guest-memory region for gather writes. 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ciovec {
    pub buf: u32,
    pub buf_len: u32,
}

impl Ciovec {
    pub const SIZE: usize = 8;
    pub const ALIGN: usize = 4;

    pub fn encode(&self, bytes: &mut [u8]) {
        write_u32(bytes, 0, self.buf);
        write_u32(bytes, 4, self.buf_len);
    }

    pub fn decode(bytes: &[u8]) -> Ciovec {
        Ciovec {
            buf: read_u32(bytes, 0),
            buf_len: read_u32(bytes, 4),
        }
    }
}

/// A directory entry: the 24-byte `dirent` header followed by the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    /// Cookie of the next entry.
    pub d_next: u64,
    /// Inode of the entry.
    pub d_ino: u64,
    /// Entry filetype.
    pub d_type: Filetype,
    /// Entry name (UTF-8).
    pub name: String,
}

impl Dirent {
    /// Size of the fixed header preceding the name.
    pub const HEADER_SIZE: usize = 24;

    /// Total encoded size including the name bytes.
    pub fn encoded_size(&self) -> usize {
        Self::HEADER_SIZE + self.name.len()
    }

    /// Write header + name at the start of `bytes`; the slice must hold
    /// [`Dirent::encoded_size`] bytes.
    pub fn encode(&self, bytes: &mut [u8]) {
        write_u64(bytes, 0, self.d_next);
        write_u64(bytes, 8, self.d_ino);
        write_u32(bytes, 16, self.name.len() as u32);
        bytes[20] = self.d_type as u8;
        bytes[21..24].fill(0);
        bytes[24..24 + self.name.len()].copy_from_slice(self.name.as_bytes());
    }
}

/// `prestat`: information about a pre-opened capability. 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prestat {
    /// Always [`Preopentype::Dir`].
    pub tag: Preopentype,
    /// Length of the pre-open directory name.
    pub pr_name_len: u32,
}

impl Prestat {
    pub const SIZE: usize = 8;
    pub const ALIGN: usize = 4;

    pub fn dir(name_len: u32) -> Prestat {
        Prestat {
            tag: Preopentype::Dir,
            pr_name_len: name_len,
        }
    }

    pub fn encode(&self, bytes: &mut [u8]) {
        bytes[0] = self.tag as u8;
        bytes[1..4].fill(0);
        write_u32(bytes, 4, self.pr_name_len);
    }

    pub fn decode(bytes: &[u8]) -> Prestat {
        Prestat {
            tag: Preopentype::Dir,
            pr_name_len: read_u32(bytes, 4),
        }
    }
}

/// `event_fd_readwrite`: payload of read/write events. 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventFdReadwrite {
    /// Bytes available for reading or writing.
    pub nbytes: u64,
    pub flags: Eventrwflags,
}

impl Default for Eventrwflags {
    fn default() -> Self {
        Eventrwflags::empty()
    }
}

impl EventFdReadwrite {
    pub const SIZE: usize = 16;
    pub const ALIGN: usize = 8;

    pub fn encode(&self, bytes: &mut [u8]) {
        write_u64(bytes, 0, self.nbytes);
        write_u16(bytes, 8, self.flags.bits());
        bytes[10..16].fill(0);
    }
}

/// `event`: an occurrence delivered by `poll_oneoff`. 32 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub userdata: u64,
    pub error: u16,
    pub r#type: Eventtype,
    pub fd_readwrite: EventFdReadwrite,
}

impl Event {
    pub const SIZE: usize = 32;
    pub const ALIGN: usize = 8;

    pub fn encode(&self, bytes: &mut [u8]) {
        write_u64(bytes, 0, self.userdata);
        write_u16(bytes, 8, self.error);
        bytes[10] = self.r#type as u8;
        bytes[11..16].fill(0);
        self.fd_readwrite.encode(&mut bytes[16..32]);
    }
}

/// `subscription_clock`: clock subscription payload. 32 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionClock {
    pub id: Clockid,
    pub timeout: u64,
    pub precision: u64,
    pub flags: Subclockflags,
}

impl SubscriptionClock {
    pub const SIZE: usize = 32;
    pub const ALIGN: usize = 8;

    pub fn encode(&self, bytes: &mut [u8]) {
        write_u32(bytes, 0, self.id as u32);
        bytes[4..8].fill(0);
        write_u64(bytes, 8, self.timeout);
        write_u64(bytes, 16, self.precision);
        write_u16(bytes, 24, self.flags.bits());
        bytes[26..32].fill(0);
    }

    pub fn decode(bytes: &[u8]) -> Option<SubscriptionClock> {
        Some(SubscriptionClock {
            id: Clockid::from_u32(read_u32(bytes, 0))?,
            timeout: read_u64(bytes, 8),
            precision: read_u64(bytes, 16),
            flags: Subclockflags::from_bits_truncate(read_u16(bytes, 24)),
        })
    }
}

/// `subscription_fd_readwrite`: fd subscription payload. 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionFdReadwrite {
    /// The file descriptor to watch.
    pub file_descriptor: u32,
}

impl SubscriptionFdReadwrite {
    pub const SIZE: usize = 4;
    pub const ALIGN: usize = 4;

    pub fn encode(&self, bytes: &mut [u8]) {
        write_u32(bytes, 0, self.file_descriptor);
    }

    pub fn decode(bytes: &[u8]) -> SubscriptionFdReadwrite {
        SubscriptionFdReadwrite {
            file_descriptor: read_u32(bytes, 0),
        }
    }
}

/// The tagged contents of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionU {
    Clock(SubscriptionClock),
    FdRead(SubscriptionFdReadwrite),
    FdWrite(SubscriptionFdReadwrite),
}

impl SubscriptionU {
    /// The event type this subscription produces.
    pub fn eventtype(&self) -> Eventtype {
        match self {
            SubscriptionU::Clock(_) => Eventtype::Clock,
            SubscriptionU::FdRead(_) => Eventtype::FdRead,
            SubscriptionU::FdWrite(_) => Eventtype::FdWrite,
        }
    }
}

/// `subscription`: what to wait for in `poll_oneoff`. 48 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub userdata: u64,
    pub u: SubscriptionU,
}

impl Subscription {
    pub const SIZE: usize = 48;
    pub const ALIGN: usize = 8;

    pub fn encode(&self, bytes: &mut [u8]) {
        write_u64(bytes, 0, self.userdata);
        bytes[8] = self.u.eventtype() as u8;
        bytes[9..16].fill(0);
        match self.u {
            SubscriptionU::Clock(clock) => clock.encode(&mut bytes[16..48]),
            SubscriptionU::FdRead(fd) | SubscriptionU::FdWrite(fd) => {
                bytes[16..48].fill(0);
                fd.encode(&mut bytes[16..20]);
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Option<Subscription> {
        let userdata = read_u64(bytes, 0);
        let u = match Eventtype::from_u8(bytes[8])? {
            Eventtype::Clock => SubscriptionU::Clock(SubscriptionClock::decode(&bytes[16..48])?),
            Eventtype::FdRead => {
                SubscriptionU::FdRead(SubscriptionFdReadwrite::decode(&bytes[16..20]))
            }
            Eventtype::FdWrite => {
                SubscriptionU::FdWrite(SubscriptionFdReadwrite::decode(&bytes[16..20]))
            }
        };
        Some(Subscription { userdata, u })
    }
}

range_image!(Filestat, Fdstat, Iovec, Ciovec, Prestat, Event, Subscription);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_values_match_wasi() {
        assert_eq!(WasiError::Success as u16, 0);
        assert_eq!(WasiError::Exist as u16, 20);
        assert_eq!(WasiError::NoEnt as u16, 44);
        assert_eq!(WasiError::NoSys as u16, 52);
        assert_eq!(WasiError::NotDir as u16, 54);
        assert_eq!(WasiError::NotEmpty as u16, 55);
        assert_eq!(WasiError::Perm as u16, 63);
        assert_eq!(WasiError::SPipe as u16, 70);
        assert_eq!(WasiError::NotCapable as u16, 76);
    }

    #[test]
    fn test_rights_bit_positions() {
        assert_eq!(Rights::FD_READ.bits(), 1 << 1);
        assert_eq!(Rights::FD_WRITE.bits(), 1 << 6);
        assert_eq!(Rights::PATH_OPEN.bits(), 1 << 13);
        assert_eq!(Rights::POLL_FD_READWRITE.bits(), 1 << 27);
        assert_eq!(Rights::SOCK_SHUTDOWN.bits(), 1 << 28);
    }

    #[test]
    fn test_rights_presets() {
        assert_eq!(
            Rights::DIRECTORY_INHERITING,
            Rights::DIRECTORY_BASE | Rights::FILE_BASE
        );
        assert_eq!(Rights::FILE_INHERITING, Rights::empty());
        assert!(Rights::STDIN_BASE.contains(Rights::FD_READ));
        assert!(!Rights::STDIN_BASE.contains(Rights::FD_WRITE));
        assert!(Rights::STDOUT_BASE.contains(Rights::FD_WRITE));
        assert!(!Rights::READ_ONLY_MASK.contains(Rights::FD_WRITE));
        assert!(!Rights::READ_ONLY_MASK.contains(Rights::PATH_CREATE_FILE));
    }

    #[test]
    fn test_filestat_round_trip() {
        let stat = Filestat {
            dev: 1,
            ino: 42,
            filetype: Filetype::RegularFile as u8,
            nlink: 1,
            size: 4096,
            atim: 10,
            mtim: 20,
            ctim: 30,
        };
        let mut bytes = [0u8; Filestat::SIZE];
        stat.encode(&mut bytes);
        assert_eq!(Filestat::decode(&bytes), stat);
        // Spot-check the layout: filetype at 16, size at 32.
        assert_eq!(bytes[16], 4);
        assert_eq!(read_u64(&bytes, 32), 4096);
    }

    #[test]
    fn test_fdstat_round_trip() {
        let stat = Fdstat {
            fs_filetype: Filetype::Directory,
            fs_flags: Fdflags::APPEND | Fdflags::SYNC,
            fs_rights_base: Rights::DIRECTORY_BASE,
            fs_rights_inheriting: Rights::DIRECTORY_INHERITING,
        };
        let mut bytes = [0u8; Fdstat::SIZE];
        stat.encode(&mut bytes);
        assert_eq!(Fdstat::decode(&bytes), Some(stat));
        assert_eq!(bytes[0], 3);
    }

    #[test]
    fn test_iovec_round_trip() {
        let iov = Iovec { buf: 0x1000, buf_len: 128 };
        let mut bytes = [0u8; Iovec::SIZE];
        iov.encode(&mut bytes);
        assert_eq!(Iovec::decode(&bytes), iov);
        let ciov = Ciovec { buf: 0x2000, buf_len: 64 };
        let mut bytes = [0u8; Ciovec::SIZE];
        ciov.encode(&mut bytes);
        assert_eq!(Ciovec::decode(&bytes), ciov);
    }

    #[test]
    fn test_dirent_layout() {
        let entry = Dirent {
            d_next: 2,
            d_ino: 7,
            d_type: Filetype::RegularFile,
            name: String::from("a.txt"),
        };
        let mut bytes = vec![0u8; entry.encoded_size()];
        entry.encode(&mut bytes);
        assert_eq!(entry.encoded_size(), 29);
        assert_eq!(read_u64(&bytes, 0), 2);
        assert_eq!(read_u64(&bytes, 8), 7);
        assert_eq!(read_u32(&bytes, 16), 5);
        assert_eq!(bytes[20], 4);
        assert_eq!(&bytes[24..], b"a.txt");
    }

    #[test]
    fn test_prestat_round_trip() {
        let prestat = Prestat::dir(11);
        let mut bytes = [0u8; Prestat::SIZE];
        prestat.encode(&mut bytes);
        assert_eq!(Prestat::decode(&bytes), prestat);
        assert_eq!(bytes[0], 0);
    }

    #[test]
    fn test_event_layout() {
        let event = Event {
            userdata: 99,
            error: WasiError::Success as u16,
            r#type: Eventtype::FdRead,
            fd_readwrite: EventFdReadwrite {
                nbytes: 512,
                flags: Eventrwflags::empty(),
            },
        };
        let mut bytes = [0u8; Event::SIZE];
        event.encode(&mut bytes);
        assert_eq!(read_u64(&bytes, 0), 99);
        assert_eq!(bytes[10], 1);
        assert_eq!(read_u64(&bytes, 16), 512);
    }

    #[test]
    fn test_store_into_guest_range() {
        let region = wasmbed_shm::MemoryRegion::new(4096).unwrap();
        let range = region.alloc(8, Filestat::SIZE as u32).unwrap();
        let stat = Filestat {
            dev: 3,
            ino: 9,
            filetype: Filetype::Directory as u8,
            nlink: 1,
            size: 0,
            atim: 0,
            mtim: 0,
            ctim: 0,
        };
        stat.store(&range, 0).unwrap();
        assert_eq!(Filestat::decode(&range.to_vec()), stat);
        // Out-of-bounds guest addresses surface as Fault.
        assert_eq!(stat.store(&range, 8), Err(WasiError::Fault));
        region.free(range).unwrap();
    }

    #[test]
    fn test_subscription_round_trip() {
        let clock = Subscription {
            userdata: 5,
            u: SubscriptionU::Clock(SubscriptionClock {
                id: Clockid::Monotonic,
                timeout: 1_000_000,
                precision: 1,
                flags: Subclockflags::empty(),
            }),
        };
        let mut bytes = [0u8; Subscription::SIZE];
        clock.encode(&mut bytes);
        assert_eq!(Subscription::decode(&bytes), Some(clock));

        let fd_read = Subscription {
            userdata: 6,
            u: SubscriptionU::FdRead(SubscriptionFdReadwrite { file_descriptor: 0 }),
        };
        let mut bytes = [0u8; Subscription::SIZE];
        fd_read.encode(&mut bytes);
        assert_eq!(Subscription::decode(&bytes), Some(fd_read));
    }
}
