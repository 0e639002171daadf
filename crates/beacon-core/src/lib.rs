//! beacon-core — shared resource types, wire format, and configuration.
//! All other Beacon crates depend on this one.

pub mod config;
pub mod resource;
pub mod wire;

pub use resource::{AttributeMap, Attributes, ResourceId, ResourceInfo, StreamId};
pub use wire::{Announcement, Message, WireError};
