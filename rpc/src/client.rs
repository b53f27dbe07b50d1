//! The client (guest) side of the transport.

use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use wasmbed_shm::{futex, SharedBuffer};

use crate::error::{errno, TransportError};
use crate::kind::{ResultData, ResultKind, ResultType};
use crate::message::{encode_request, layout, Params, RequestMessage};
use crate::{FETCH_RESULT_METHOD, READY_METHOD};

/// Outcome of a request: the wire errno plus decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResult {
    /// 0 on success; the negative transport taxonomy otherwise.
    pub errno: i32,
    /// Decoded payload (always [`ResultData::None`] when `errno != 0`).
    pub data: ResultData,
}

impl RpcResult {
    fn failure(errno: i32) -> RpcResult {
        RpcResult {
            errno,
            data: ResultData::None,
        }
    }
}

/// The guest-side endpoint. One client serves one guest thread; calls are
/// strictly FIFO because each blocks until the previous returned.
pub struct RpcClient {
    port: Sender<Arc<SharedBuffer>>,
    ready: Arc<SharedBuffer>,
    next_id: u64,
}

impl RpcClient {
    pub(crate) fn new(port: Sender<Arc<SharedBuffer>>, ready: Arc<SharedBuffer>) -> RpcClient {
        RpcClient {
            port,
            ready,
            next_id: 1,
        }
    }

    /// Block until the server announced readiness.
    pub fn wait_ready(&self) {
        let cell = self.ready.atomic_u32(0).expect("ready cell is 4 bytes");
        while cell.load(Ordering::Acquire) == 0 {
            futex::wait(cell, 0);
        }
    }

    /// Send a request and block until the server replies.
    ///
    /// Variable results transparently perform the `$/fetchResult` second
    /// round once the payload size is known.
    pub fn send_request(
        &mut self,
        method: &str,
        params: Option<Params>,
        result: ResultType,
    ) -> Result<RpcResult, TransportError> {
        if method == FETCH_RESULT_METHOD || method == READY_METHOD {
            return Err(TransportError::ReservedMethod);
        }
        self.dispatch(method, params, result)
    }

    fn dispatch(
        &mut self,
        method: &str,
        params: Option<Params>,
        result: ResultType,
    ) -> Result<RpcResult, TransportError> {
        let id = self.next_id;
        self.next_id += 1;

        let (json, binary) = match params {
            Some(p) => (Some(p.value), p.binary),
            None => (None, None),
        };
        let message = RequestMessage {
            id,
            method: String::from(method),
            params: json,
        };
        let buffer = Arc::new(encode_request(&message, binary.as_deref(), result)?);

        self.post_and_wait(&buffer)?;

        let code = buffer.read_u32(layout::ERRNO)? as i32;
        if code != errno::SUCCESS {
            return Ok(RpcResult::failure(code));
        }

        match result.kind() {
            ResultKind::None => Ok(RpcResult {
                errno: errno::SUCCESS,
                data: ResultData::None,
            }),
            ResultKind::Variable => {
                let byte_length = buffer.read_u32(layout::RESULT_LENGTH)?;
                self.fetch_result(id, byte_length)
            }
            kind => {
                let offset = buffer.read_u32(layout::RESULT_OFFSET)?;
                let length = buffer.read_u32(layout::RESULT_LENGTH)?;
                let bytes = buffer.read_bytes(offset, length)?;
                Ok(RpcResult {
                    errno: errno::SUCCESS,
                    data: ResultData::from_bytes(kind, &bytes),
                })
            }
        }
    }

    /// The second round of a variable result: fetch the serialised bytes
    /// now that their length is known, then parse them.
    fn fetch_result(
        &mut self,
        request_id: u64,
        byte_length: u32,
    ) -> Result<RpcResult, TransportError> {
        let params = Params::with("id", request_id);
        let fetched = self.dispatch(
            FETCH_RESULT_METHOD,
            Some(params),
            ResultType::u8(byte_length)?,
        )?;
        if fetched.errno != errno::SUCCESS {
            return Ok(RpcResult::failure(fetched.errno));
        }
        let bytes = match fetched.data {
            ResultData::U8(bytes) => bytes,
            _ => return Ok(RpcResult::failure(errno::VARIABLE_MISSING)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(RpcResult {
                errno: errno::SUCCESS,
                data: ResultData::Json(value),
            }),
            Err(_) => Ok(RpcResult::failure(errno::VARIABLE_PARSE)),
        }
    }

    fn post_and_wait(&self, buffer: &Arc<SharedBuffer>) -> Result<(), TransportError> {
        let sync = buffer.atomic_u32(layout::SYNC)?;
        sync.store(0, Ordering::SeqCst);
        self.port
            .send(buffer.clone())
            .map_err(|_| TransportError::Disconnected)?;
        while sync.load(Ordering::SeqCst) == 0 {
            futex::wait(sync, 0);
        }
        Ok(())
    }
}

impl core::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RpcClient")
            .field("next_id", &self.next_id)
            .finish()
    }
}
