//! Attribute editing with optimistic concurrency.
//!
//! An [`Editor`] records puts and removes against the edit serial it saw
//! when it was created. `commit` applies them only if nobody committed in
//! between; otherwise it fails with [`AgentError::StaleEdit`] and nothing
//! changes. A later operation on a key overrides an earlier one.

use std::collections::BTreeSet;

use beacon_core::AttributeMap;

use crate::error::AgentError;
use crate::resource::LocalResource;

#[derive(Debug)]
pub struct Editor {
    resource: LocalResource,
    baseline: u64,
    puts: AttributeMap,
    removes: BTreeSet<String>,
}

impl Editor {
    pub(crate) fn new(resource: LocalResource, baseline: u64) -> Self {
        Self {
            resource,
            baseline,
            puts: AttributeMap::new(),
            removes: BTreeSet::new(),
        }
    }

    pub fn put_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        self.removes.remove(&key);
        self.puts.insert(key, value.into());
        self
    }

    pub fn remove_attribute(&mut self, key: impl Into<String>) -> &mut Self {
        let key = key.into();
        self.puts.remove(&key);
        self.removes.insert(key);
        self
    }

    /// Serial this edit was started from.
    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.removes.is_empty()
    }

    /// Apply the edit and announce the new state.
    pub async fn commit(self) -> Result<(), AgentError> {
        let publisher = self.resource.publisher().ok_or(AgentError::Disposed)?;
        publisher.commit_edit(&self.resource, self.baseline, &self.removes, &self.puts)
    }
}
