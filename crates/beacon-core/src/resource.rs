//! Resource identity and attribute types.
//!
//! A resource is identified by a random 128-bit id for its whole lifetime.
//! The same id doubles as the transport stream id for that resource's
//! announcements, so a peer sees one resource's history in send order.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Attribute mapping carried by every resource. Ordered so encoding is stable.
pub type AttributeMap = BTreeMap<String, String>;

/// Immutable attribute snapshot handed to readers.
///
/// Edits never touch a published snapshot; they build a new map and swap
/// the `Arc`, so a reader always sees one complete version.
pub type Attributes = Arc<AttributeMap>;

/// Globally unique resource identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ResourceId([u8; 16]);

/// Transport ordering key. Announcements use the resource id; queries use
/// [`ResourceId::NIL`], which the transport treats as unordered.
pub type StreamId = ResourceId;

impl ResourceId {
    /// The "don't care" stream id. Never assigned to a resource.
    pub const NIL: ResourceId = ResourceId([0u8; 16]);

    /// Generate a fresh random id.
    pub fn random() -> Self {
        loop {
            let id = ResourceId(rand::random());
            if !id.is_nil() {
                return id;
            }
        }
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        ResourceId(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// First 8 hex chars, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({})", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseResourceIdError {
    #[error("invalid hex in resource id: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("resource id must be 16 bytes, got {0}")]
    WrongLength(usize),
}

impl FromStr for ResourceId {
    type Err = ParseResourceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ParseResourceIdError::WrongLength(bytes.len()))?;
        Ok(ResourceId(bytes))
    }
}

impl Serialize for ResourceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Plain snapshot of a resource, for logs and JSON output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub category: String,
    pub connection: String,
    pub attributes: AttributeMap,
}
