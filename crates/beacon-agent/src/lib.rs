//! beacon-agent — the discovery agent engine.
//!
//! A [`DiscoveryAgent`] turns any [`Transport`] into a resource registry:
//! publish resources under a category, subscribe to a category, and keep an
//! eventually consistent view of everything announced in it.
//!
//! ```no_run
//! # async fn demo() -> Result<(), beacon_agent::AgentError> {
//! use beacon_agent::{AgentConfig, DiscoveryAgent, MemoryNetwork};
//!
//! let network = MemoryNetwork::new();
//! let host = DiscoveryAgent::new(network.endpoint(), AgentConfig::default())?;
//! let guest = DiscoveryAgent::new(network.endpoint(), AgentConfig::default())?;
//!
//! let room = host.publish("Room", "conn1", None).await?;
//! let rooms = guest.subscribe("Room")?;
//! let mut updates = rooms.updates();
//! while rooms.resources().is_empty() {
//!     let _ = updates.changed().await;
//! }
//!
//! let mut edit = room.request_edit().expect("local resources are editable");
//! edit.put_attribute("map", "harbor");
//! edit.commit().await?;
//!
//! host.dispose().await;
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod agent;
pub mod editor;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod resource;
pub mod subscriber;
pub mod subscription;
pub mod timer;
pub mod transport;

pub use agent::{AgentState, DiscoveryAgent};
pub use beacon_core::config::AgentConfig;
pub use beacon_core::{AttributeMap, Attributes, ResourceId, ResourceInfo, StreamId};
pub use editor::Editor;
pub use error::AgentError;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use resource::{LocalResource, RemoteResource, Resource};
pub use subscription::Subscription;
pub use transport::{MessageHandler, Origin, Transport, TransportError, TransportMessage};

/// Lock a std mutex, recovering the data if a previous holder panicked.
///
/// Every critical section in this crate leaves its data consistent before
/// doing anything that can panic, so poisoning carries no information.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
