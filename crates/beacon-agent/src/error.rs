//! Errors surfaced to callers of the agent.
//!
//! Only conditions that need a caller decision show up here. Malformed
//! wire traffic and failed sends are handled inside the agent.

use beacon_core::wire::WireError;

use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The agent (or the publisher owning a resource) has been disposed.
    #[error("discovery agent has been disposed")]
    Disposed,

    /// Someone committed an edit after this editor captured its baseline.
    /// Re-read the attributes and edit again.
    #[error("stale edit: baseline serial {baseline}, resource is at {current}")]
    StaleEdit { baseline: u64, current: u64 },

    /// Peers would reject the announcement or query this would produce:
    /// a string over 64 KiB or more than 1024 attributes.
    #[error("cannot be sent on the wire: {0}")]
    Unencodable(#[from] WireError),

    /// The agent needs a tokio runtime for its timers and delivery loop.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
}

impl AgentError {
    pub fn is_stale_edit(&self) -> bool {
        matches!(self, AgentError::StaleEdit { .. })
    }
}
