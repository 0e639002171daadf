//! Transport contract.
//!
//! The agent never touches sockets. It talks to an implementation of
//! [`Transport`] that promises:
//!
//! - in-order, at-least-once delivery within one non-nil stream id
//! - no ordering across stream ids, nor for [`StreamId::NIL`]
//! - best-effort sends (no acknowledgement, no error to the caller)
//!
//! Received payloads are pushed into a [`MessageHandler`] from whatever
//! thread the transport reads on.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use beacon_core::StreamId;

/// Where a message came from. Opaque to the agent; only used to reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// An endpoint of an in-process [`crate::MemoryNetwork`].
    Endpoint(u64),
    /// A peer reached over the network.
    Socket(SocketAddr),
}

/// One received payload.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub stream_id: StreamId,
    pub contents: Bytes,
    pub origin: Origin,
}

/// Receives every payload while the transport is started.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: &TransportMessage);
}

pub trait Transport: Send + Sync {
    /// Begin delivering received payloads to `handler`.
    /// Must be safe to call before the first send.
    fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError>;

    /// Stop delivering and release the handler.
    fn stop(&self);

    /// Best-effort delivery to every other participant.
    fn broadcast(&self, stream_id: StreamId, payload: Bytes);

    /// Best-effort delivery back to the sender of `original`.
    fn reply(&self, original: &TransportMessage, stream_id: StreamId, payload: Bytes);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is already started")]
    AlreadyStarted,

    #[error("transport needs a tokio runtime")]
    NoRuntime,

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}
