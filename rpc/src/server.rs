//! The server (host) side of the transport.
//!
//! The server drains its port in arrival order on one service thread.
//! Handlers run to completion (they may block on backend I/O) before the
//! sync-word is notified, so the guest never observes a partial result.

use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use hashbrown::HashMap;
use serde_json::Value;

use wasmbed_shm::{futex, SharedBuffer};

use crate::error::{errno, HandlerError, TransportError};
use crate::kind::ResultKind;
use crate::message::{decode_request, layout, DecodedRequest, Params};
use crate::{FETCH_RESULT_METHOD, READY_METHOD};

/// Writable view over a request's pre-allocated result area.
pub struct ResultSink<'a> {
    buffer: &'a SharedBuffer,
    kind: ResultKind,
    offset: u32,
    byte_length: u32,
    json: Option<Value>,
}

impl<'a> ResultSink<'a> {
    /// The result kind the caller asked for.
    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    /// Byte length of the fixed result area (0 for `None`/`Variable`).
    pub fn byte_length(&self) -> u32 {
        self.byte_length
    }

    /// Write raw bytes into a fixed-kind result area, in place.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), HandlerError> {
        match self.kind {
            ResultKind::None | ResultKind::Variable => {
                Err(HandlerError::new("result kind carries no fixed area"))
            }
            _ if bytes.len() as u32 > self.byte_length => {
                Err(HandlerError::new("result exceeds the reserved area"))
            }
            _ => self
                .buffer
                .write_bytes(self.offset, bytes)
                .map_err(|e| HandlerError::new(e.to_string())),
        }
    }

    /// Provide the value of a variable result. Serialised and stored until
    /// the client's `$/fetchResult` round collects it.
    pub fn set_json(&mut self, value: Value) -> Result<(), HandlerError> {
        if self.kind != ResultKind::Variable {
            return Err(HandlerError::new("result kind is not variable"));
        }
        self.json = Some(value);
        Ok(())
    }
}

/// An application request handler.
pub type RequestHandler =
    Box<dyn FnMut(&Params, &mut ResultSink<'_>) -> Result<(), HandlerError> + Send>;

/// The host-side endpoint: a handler registry plus the service port.
pub struct RpcServer {
    receiver: Receiver<Arc<SharedBuffer>>,
    ready: Arc<SharedBuffer>,
    handlers: HashMap<String, RequestHandler>,
    /// Serialised variable results keyed by request id, awaiting fetch.
    variable_results: HashMap<u64, Vec<u8>>,
}

impl RpcServer {
    pub(crate) fn new(receiver: Receiver<Arc<SharedBuffer>>, ready: Arc<SharedBuffer>) -> RpcServer {
        RpcServer {
            receiver,
            ready,
            handlers: HashMap::new(),
            variable_results: HashMap::new(),
        }
    }

    /// Register a handler for `method`. Reserved names are rejected.
    pub fn register(
        &mut self,
        method: &str,
        handler: RequestHandler,
    ) -> Result<(), TransportError> {
        if method == FETCH_RESULT_METHOD || method == READY_METHOD {
            return Err(TransportError::ReservedMethod);
        }
        self.handlers.insert(String::from(method), handler);
        Ok(())
    }

    /// Convenience wrapper around [`RpcServer::register`].
    pub fn on<F>(&mut self, method: &str, handler: F) -> Result<(), TransportError>
    where
        F: FnMut(&Params, &mut ResultSink<'_>) -> Result<(), HandlerError> + Send + 'static,
    {
        self.register(method, Box::new(handler))
    }

    /// Announce readiness to waiting clients.
    pub fn announce_ready(&self) {
        let cell = self.ready.atomic_u32(0).expect("ready cell is 4 bytes");
        cell.store(1, Ordering::Release);
        futex::wake(cell, u32::MAX);
    }

    /// Serve until every client hung up. Run this on a dedicated thread.
    pub fn serve(mut self) {
        self.announce_ready();
        while let Ok(buffer) = self.receiver.recv() {
            self.handle_message(&buffer);
        }
    }

    /// Process at most one queued request. Returns `false` once the port
    /// is disconnected. Useful for driving the server inline in tests.
    pub fn handle_next(&mut self) -> bool {
        match self.receiver.recv() {
            Ok(buffer) => {
                self.handle_message(&buffer);
                true
            }
            Err(_) => false,
        }
    }

    /// Decode, dispatch and answer one request buffer.
    pub fn handle_message(&mut self, buffer: &SharedBuffer) {
        let code = match decode_request(buffer) {
            Ok(request) => self.dispatch(buffer, request),
            Err(e) => {
                log::warn!("malformed rpc request: {}", e);
                errno::MALFORMED
            }
        };
        let _ = buffer.write_u32(layout::ERRNO, code as u32);
        if let Ok(sync) = buffer.atomic_u32(layout::SYNC) {
            sync.store(1, Ordering::SeqCst);
            futex::wake(sync, u32::MAX);
        }
    }

    fn dispatch(&mut self, buffer: &SharedBuffer, request: DecodedRequest) -> i32 {
        if request.message.method == FETCH_RESULT_METHOD {
            return self.fetch_result(buffer, &request);
        }

        let handler = match self.handlers.get_mut(&request.message.method) {
            Some(handler) => handler,
            None => {
                log::warn!("no handler for rpc method {}", request.message.method);
                return errno::NO_HANDLER;
            }
        };

        let params = Params {
            value: request.message.params.unwrap_or_default(),
            binary: request.binary,
        };
        let mut sink = ResultSink {
            buffer,
            kind: request.result_kind,
            offset: request.result_offset,
            byte_length: request.result_length,
            json: None,
        };

        if let Err(e) = handler(&params, &mut sink) {
            log::warn!("rpc handler {} failed: {}", request.message.method, e);
            return errno::HANDLER_FAILED;
        }

        if request.result_kind == ResultKind::Variable {
            let value = sink.json.take().unwrap_or(Value::Null);
            let bytes = match serde_json::to_vec(&value) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("variable result serialisation failed: {}", e);
                    return errno::HANDLER_FAILED;
                }
            };
            let _ = buffer.write_u32(layout::RESULT_LENGTH, bytes.len() as u32);
            self.variable_results.insert(request.message.id, bytes);
        }
        errno::SUCCESS
    }

    /// Second round of a variable result: copy the stored bytes into the
    /// fetch buffer's result area.
    fn fetch_result(&mut self, buffer: &SharedBuffer, request: &DecodedRequest) -> i32 {
        let id = request
            .message
            .params
            .as_ref()
            .and_then(|p| p.get("id"))
            .and_then(Value::as_u64);
        let id = match id {
            Some(id) => id,
            None => return errno::MALFORMED,
        };
        let bytes = match self.variable_results.remove(&id) {
            Some(bytes) => bytes,
            None => return errno::VARIABLE_MISSING,
        };
        if bytes.len() as u32 != request.result_length {
            return errno::VARIABLE_MISSING;
        }
        match buffer.write_bytes(request.result_offset, &bytes) {
            Ok(()) => errno::SUCCESS,
            Err(_) => errno::VARIABLE_MISSING,
        }
    }
}

impl core::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RpcServer")
            .field("handlers", &self.handlers.len())
            .field("pending_variable_results", &self.variable_results.len())
            .finish()
    }
}
