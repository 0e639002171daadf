//! Resource handles returned to applications.
//!
//! A [`LocalResource`] is owned by this agent's publisher and reads its
//! attributes live; a [`RemoteResource`] is an immutable snapshot of what a
//! peer last announced. Both are cheap to clone.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use beacon_core::wire::{self, Announcement};
use beacon_core::{AttributeMap, Attributes, ResourceId, ResourceInfo};

use crate::editor::Editor;
use crate::error::AgentError;
use crate::lock;
use crate::publisher::Publisher;

/// A discovered or published resource.
#[derive(Clone)]
pub enum Resource {
    Local(LocalResource),
    Remote(RemoteResource),
}

impl Resource {
    pub fn id(&self) -> ResourceId {
        match self {
            Resource::Local(r) => r.id(),
            Resource::Remote(r) => r.id(),
        }
    }

    pub fn category(&self) -> &str {
        match self {
            Resource::Local(r) => r.category(),
            Resource::Remote(r) => r.category(),
        }
    }

    pub fn connection(&self) -> &str {
        match self {
            Resource::Local(r) => r.connection(),
            Resource::Remote(r) => r.connection(),
        }
    }

    /// A complete snapshot; later edits never show through it.
    pub fn attributes(&self) -> Attributes {
        match self {
            Resource::Local(r) => r.attributes(),
            Resource::Remote(r) => r.attributes(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Resource::Local(_))
    }

    /// Start an edit. Remote resources cannot be edited and return `None`.
    pub fn request_edit(&self) -> Option<Editor> {
        match self {
            Resource::Local(r) => Some(r.request_edit()),
            Resource::Remote(_) => None,
        }
    }

    /// Current edit serial of a local resource.
    pub fn edit_serial(&self) -> Option<u64> {
        match self {
            Resource::Local(r) => Some(r.edit_serial()),
            Resource::Remote(_) => None,
        }
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id(),
            category: self.category().to_string(),
            connection: self.connection().to_string(),
            attributes: (*self.attributes()).clone(),
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id())
            .field("local", &self.is_local())
            .field("category", &self.category())
            .field("connection", &self.connection())
            .field("attributes", &self.attributes())
            .finish()
    }
}

// ── Local ─────────────────────────────────────────────────────────────────────

struct LocalInner {
    id: ResourceId,
    category: String,
    connection: String,
    expiry_secs: i32,
    state: Mutex<EditState>,
    publisher: Weak<Publisher>,
}

/// Guarded by the resource's own lock. Never held across a send.
struct EditState {
    attributes: Attributes,
    edit_serial: u64,
}

/// A resource published by this agent.
#[derive(Clone)]
pub struct LocalResource {
    inner: Arc<LocalInner>,
}

impl LocalResource {
    pub(crate) fn new(
        category: String,
        connection: String,
        expiry_secs: i32,
        attributes: AttributeMap,
        publisher: Weak<Publisher>,
    ) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                id: ResourceId::random(),
                category,
                connection,
                expiry_secs,
                state: Mutex::new(EditState {
                    attributes: Arc::new(attributes),
                    edit_serial: 0,
                }),
                publisher,
            }),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn category(&self) -> &str {
        &self.inner.category
    }

    pub fn connection(&self) -> &str {
        &self.inner.connection
    }

    pub fn expiry_secs(&self) -> i32 {
        self.inner.expiry_secs
    }

    pub fn attributes(&self) -> Attributes {
        lock(&self.inner.state).attributes.clone()
    }

    pub fn edit_serial(&self) -> u64 {
        lock(&self.inner.state).edit_serial
    }

    /// Capture the current serial as the baseline of a new edit.
    pub fn request_edit(&self) -> Editor {
        Editor::new(self.clone(), self.edit_serial())
    }

    /// Current state as Hello/Reply body.
    pub(crate) fn announcement(&self) -> Announcement {
        Announcement {
            category: self.inner.category.clone(),
            connection: self.inner.connection.clone(),
            expiry_secs: self.inner.expiry_secs,
            attributes: (*self.attributes()).clone(),
        }
    }

    pub(crate) fn publisher(&self) -> Option<Arc<Publisher>> {
        self.inner.publisher.upgrade()
    }

    /// Compare-and-swap the attribute map. Returns the new serial.
    ///
    /// The published snapshot is never mutated; a modified copy replaces it.
    /// A result peers could not decode is refused and nothing changes.
    pub(crate) fn apply_edit(
        &self,
        baseline: u64,
        removes: &BTreeSet<String>,
        puts: &AttributeMap,
    ) -> Result<u64, AgentError> {
        let mut state = lock(&self.inner.state);
        if state.edit_serial != baseline {
            return Err(AgentError::StaleEdit {
                baseline,
                current: state.edit_serial,
            });
        }
        let mut attributes = (*state.attributes).clone();
        for key in removes {
            attributes.remove(key);
        }
        for (key, value) in puts {
            attributes.insert(key.clone(), value.clone());
        }
        wire::check_attributes(&attributes)?;
        state.attributes = Arc::new(attributes);
        state.edit_serial += 1;
        Ok(state.edit_serial)
    }
}

impl fmt::Debug for LocalResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalResource")
            .field("id", &self.inner.id)
            .field("category", &self.inner.category)
            .field("edit_serial", &self.edit_serial())
            .finish()
    }
}

// ── Remote ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct RemoteInner {
    id: ResourceId,
    category: String,
    connection: String,
    attributes: Attributes,
}

/// Snapshot of a resource announced by a peer.
#[derive(Debug, Clone)]
pub struct RemoteResource {
    inner: Arc<RemoteInner>,
}

impl RemoteResource {
    pub(crate) fn from_announcement(id: ResourceId, announcement: Announcement) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                id,
                category: announcement.category,
                connection: announcement.connection,
                attributes: Arc::new(announcement.attributes),
            }),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn category(&self) -> &str {
        &self.inner.category
    }

    pub fn connection(&self) -> &str {
        &self.inner.connection
    }

    pub fn attributes(&self) -> Attributes {
        self.inner.attributes.clone()
    }

    /// Whether `announcement` would change anything a reader can see.
    pub(crate) fn differs_from(&self, announcement: &Announcement) -> bool {
        self.inner.connection != announcement.connection
            || *self.inner.attributes != announcement.attributes
    }
}
