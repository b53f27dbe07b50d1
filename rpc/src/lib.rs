//! Synchronous host-RPC over shared memory.
//!
//! Lets a guest thread make a blocking call into an asynchronous host: the
//! request is framed into a shared buffer, posted to the host's service
//! port, and the guest parks on the buffer's sync-word until the host has
//! written the result and notified it. Variable-size results take a second
//! round through the reserved `$/fetchResult` method once their byte length
//! is known.
//!
//! Buffer layout:
//!
//! ```text
//! | sync-word (4B) | header (32B) | request | binary param | [pad] | result |
//! ```

mod client;
mod error;
mod kind;
mod message;
mod server;

pub use client::{RpcClient, RpcResult};
pub use error::{errno, HandlerError, TransportError};
pub use kind::{ResultData, ResultKind, ResultType};
pub use message::{Params, RequestMessage};
pub use server::{RequestHandler, ResultSink, RpcServer};

use std::sync::mpsc;

/// Method name reserved for the variable-result second round.
pub const FETCH_RESULT_METHOD: &str = "$/fetchResult";
/// Method name reserved for the server's readiness notification.
pub const READY_METHOD: &str = "$/ready";

/// Create a connected client/server pair over an in-process port.
///
/// The server end is driven either by [`RpcServer::serve`] on a dedicated
/// thread or by pumping [`RpcServer::handle_next`] manually.
pub fn connection() -> Result<(RpcClient, RpcServer), TransportError> {
    let (sender, receiver) = mpsc::channel();
    let ready = std::sync::Arc::new(wasmbed_shm::SharedBuffer::new(4)?);
    Ok((
        RpcClient::new(sender, ready.clone()),
        RpcServer::new(receiver, ready),
    ))
}
