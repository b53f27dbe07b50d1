//! Character-device driver: stdio, terminals and pipes.
//!
//! A [`CharacterDevice`] is a byte source/sink without seeking. Reads may
//! block until bytes arrive or the peer signals EOF; that is how a guest's
//! synchronous `fd_read` on stdin waits for a host that produces input
//! asynchronously. The terminal variant blocks through the RPC transport;
//! the pipe variant blocks on an in-process queue.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex};

use wasmbed_rpc::{Params, ResultData, ResultType, RpcClient};

use crate::driver::{DeviceDriver, DeviceId};
use crate::fd::FileDescriptor;
use crate::types::{Advice, Filestat, Filetype, WasiError, WasiResult, Whence};

/// A byte-stream endpoint without seeking.
pub trait CharacterDevice: Send {
    /// Read up to `max` bytes, blocking until bytes arrive. An empty
    /// vector signals EOF.
    fn read(&mut self, max: usize) -> WasiResult<Vec<u8>>;

    /// Write bytes, returning how many were accepted.
    fn write(&mut self, bytes: &[u8]) -> WasiResult<usize>;

    /// Bytes readable without blocking.
    fn bytes_available(&mut self) -> WasiResult<u64> {
        Ok(0)
    }
}

// ─── Pipe ──────────────────────────────────────────────────────────

struct PipeState {
    buffer: Mutex<(VecDeque<u8>, bool)>,
    readable: Condvar,
}

/// An in-process unidirectional byte queue. Clone handles freely: for a
/// stdin slot the host [`Pipe::push`]es and the guest reads; for a stdout
/// slot the guest writes and the host [`Pipe::drain`]s.
#[derive(Clone)]
pub struct Pipe {
    state: Arc<PipeState>,
}

impl Pipe {
    /// A fresh, open pipe.
    pub fn new() -> Pipe {
        Pipe {
            state: Arc::new(PipeState {
                buffer: Mutex::new((VecDeque::new(), false)),
                readable: Condvar::new(),
            }),
        }
    }

    /// Host side: append bytes for the reader.
    pub fn push(&self, bytes: &[u8]) {
        let mut guard = self.state.buffer.lock().unwrap();
        guard.0.extend(bytes);
        self.state.readable.notify_all();
    }

    /// Host side: signal EOF to the reader.
    pub fn close(&self) {
        let mut guard = self.state.buffer.lock().unwrap();
        guard.1 = true;
        self.state.readable.notify_all();
    }

    /// Host side: take everything currently buffered.
    pub fn drain(&self) -> Vec<u8> {
        let mut guard = self.state.buffer.lock().unwrap();
        guard.0.drain(..).collect()
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Pipe::new()
    }
}

impl CharacterDevice for Pipe {
    fn read(&mut self, max: usize) -> WasiResult<Vec<u8>> {
        let mut guard = self.state.buffer.lock().unwrap();
        loop {
            if !guard.0.is_empty() {
                let count = max.min(guard.0.len());
                return Ok(guard.0.drain(..count).collect());
            }
            if guard.1 {
                return Ok(Vec::new());
            }
            guard = self.state.readable.wait(guard).unwrap();
        }
    }

    fn write(&mut self, bytes: &[u8]) -> WasiResult<usize> {
        let mut guard = self.state.buffer.lock().unwrap();
        if guard.1 {
            return Err(WasiError::Pipe);
        }
        guard.0.extend(bytes);
        self.state.readable.notify_all();
        Ok(bytes.len())
    }

    fn bytes_available(&mut self) -> WasiResult<u64> {
        Ok(self.state.buffer.lock().unwrap().0.len() as u64)
    }
}

// ─── Terminal over RPC ─────────────────────────────────────────────

/// Terminal endpoint that crosses into the host through the synchronous
/// transport. `terminal/read` blocks host-side until input exists; the
/// reply carries the bytes as a variable JSON result (`{"bytes": [...]}`,
/// `null` for EOF). `terminal/write` ships the bytes as the inline binary
/// parameter.
pub struct TerminalConnection {
    client: Arc<Mutex<RpcClient>>,
}

impl TerminalConnection {
    /// A terminal over an established client connection.
    pub fn new(client: Arc<Mutex<RpcClient>>) -> TerminalConnection {
        TerminalConnection { client }
    }
}

impl CharacterDevice for TerminalConnection {
    fn read(&mut self, max: usize) -> WasiResult<Vec<u8>> {
        let result = self
            .client
            .lock()
            .unwrap()
            .send_request(
                "terminal/read",
                Some(Params::with("maxBytes", max as u64)),
                ResultType::variable(),
            )
            .map_err(|_| WasiError::Io)?;
        if result.errno != 0 {
            return Err(WasiError::Io);
        }
        match result.data {
            ResultData::Json(serde_json::Value::Null) => Ok(Vec::new()),
            ResultData::Json(value) => {
                let bytes = value
                    .get("bytes")
                    .and_then(|b| b.as_array())
                    .ok_or(WasiError::Io)?
                    .iter()
                    .map(|v| v.as_u64().unwrap_or(0) as u8)
                    .collect();
                Ok(bytes)
            }
            _ => Err(WasiError::Io),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> WasiResult<usize> {
        let params = Params::default().binary(bytes.to_vec());
        let result = self
            .client
            .lock()
            .unwrap()
            .send_request("terminal/write", Some(params), ResultType::none())
            .map_err(|_| WasiError::Io)?;
        if result.errno != 0 {
            return Err(WasiError::Io);
        }
        Ok(bytes.len())
    }
}

// ─── Console ───────────────────────────────────────────────────────

/// Developer-console sink: writes land on the host's stderr, reads are
/// at EOF immediately.
#[derive(Debug, Default)]
pub struct Console;

impl CharacterDevice for Console {
    fn read(&mut self, _max: usize) -> WasiResult<Vec<u8>> {
        Ok(Vec::new())
    }

    fn write(&mut self, bytes: &[u8]) -> WasiResult<usize> {
        std::io::stderr()
            .write_all(bytes)
            .map_err(WasiError::from)?;
        Ok(bytes.len())
    }
}

// ─── Driver ────────────────────────────────────────────────────────

/// Device driver wrapping one character device.
pub struct CharacterDeviceDriver {
    id: DeviceId,
    device: Mutex<Box<dyn CharacterDevice>>,
}

impl CharacterDeviceDriver {
    /// Wrap a character device.
    pub fn new(device: Box<dyn CharacterDevice>) -> CharacterDeviceDriver {
        CharacterDeviceDriver {
            id: DeviceId::next(),
            device: Mutex::new(device),
        }
    }
}

impl DeviceDriver for CharacterDeviceDriver {
    fn id(&self) -> DeviceId {
        self.id
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

    fn fd_filestat_get(&self, fd: &FileDescriptor) -> WasiResult<Filestat> {
        Ok(Filestat {
            dev: self.id.0,
            ino: fd.inode,
            filetype: Filetype::CharacterDevice as u8,
            nlink: 1,
            size: 0,
            ..Filestat::default()
        })
    }

    fn fd_read(&self, _fd: &mut FileDescriptor, buf: &mut [u8]) -> WasiResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let bytes = self.device.lock().unwrap().read(buf.len())?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    fn fd_seek(&self, _fd: &mut FileDescriptor, _offset: i64, _whence: Whence) -> WasiResult<u64> {
        Err(WasiError::SPipe)
    }

    fn fd_sync(&self, _fd: &FileDescriptor) -> WasiResult<()> {
        Ok(())
    }

    fn fd_datasync(&self, _fd: &FileDescriptor) -> WasiResult<()> {
        Ok(())
    }

    fn fd_write(&self, _fd: &mut FileDescriptor, buf: &[u8]) -> WasiResult<usize> {
        self.device.lock().unwrap().write(buf)
    }

    fn fd_bytes_available(&self, _fd: &FileDescriptor) -> WasiResult<u64> {
        self.device.lock().unwrap().bytes_available()
    }
}

impl core::fmt::Debug for CharacterDeviceDriver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CharacterDeviceDriver")
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fdflags, Rights};

    fn char_fd(device: &CharacterDeviceDriver, fd: u32, rights: Rights) -> FileDescriptor {
        FileDescriptor {
            device: device.id,
            fd,
            filetype: Filetype::CharacterDevice,
            rights_base: rights,
            rights_inheriting: Rights::empty(),
            fdflags: Fdflags::empty(),
            inode: 0,
            cursor: 0,
            path: String::new(),
            preopen_path: None,
        }
    }

    #[test]
    fn test_pipe_read_blocks_until_push() {
        let pipe = Pipe::new();
        let writer = pipe.clone();
        let driver = CharacterDeviceDriver::new(Box::new(pipe));
        let mut fd = char_fd(&driver, 0, Rights::STDIN_BASE);

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(20));
                writer.push(b"typed input");
            });
            let mut buf = [0u8; 32];
            let count = driver.fd_read(&mut fd, &mut buf).unwrap();
            assert_eq!(&buf[..count], b"typed input");
        });
    }

    #[test]
    fn test_pipe_eof_after_close() {
        let pipe = Pipe::new();
        let host = pipe.clone();
        let driver = CharacterDeviceDriver::new(Box::new(pipe));
        let mut fd = char_fd(&driver, 0, Rights::STDIN_BASE);

        host.push(b"ab");
        host.close();
        let mut buf = [0u8; 8];
        assert_eq!(driver.fd_read(&mut fd, &mut buf).unwrap(), 2);
        assert_eq!(driver.fd_read(&mut fd, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_pipe_collects_guest_writes() {
        let pipe = Pipe::new();
        let host = pipe.clone();
        let driver = CharacterDeviceDriver::new(Box::new(pipe));
        let mut fd = char_fd(&driver, 1, Rights::STDOUT_BASE);

        driver.fd_write(&mut fd, b"hello ").unwrap();
        driver.fd_write(&mut fd, b"world").unwrap();
        assert_eq!(host.drain(), b"hello world");
    }

    #[test]
    fn test_seek_is_spipe() {
        let driver = CharacterDeviceDriver::new(Box::new(Pipe::new()));
        let mut fd = char_fd(&driver, 0, Rights::STDIN_BASE);
        assert_eq!(
            driver.fd_seek(&mut fd, 0, Whence::Set),
            Err(WasiError::SPipe)
        );
    }

    #[test]
    fn test_filestat_reports_character_device() {
        let driver = CharacterDeviceDriver::new(Box::new(Pipe::new()));
        let fd = char_fd(&driver, 0, Rights::STDIN_BASE);
        let stat = driver.fd_filestat_get(&fd).unwrap();
        assert_eq!(stat.filetype, Filetype::CharacterDevice as u8);
    }

    #[test]
    fn test_bytes_available() {
        let pipe = Pipe::new();
        let host = pipe.clone();
        let driver = CharacterDeviceDriver::new(Box::new(pipe));
        let fd = char_fd(&driver, 0, Rights::STDIN_BASE);
        assert_eq!(driver.fd_bytes_available(&fd).unwrap(), 0);
        host.push(b"abc");
        assert_eq!(driver.fd_bytes_available(&fd).unwrap(), 3);
    }
}
