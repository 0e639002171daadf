//! Publisher (server role).
//!
//! Owns the resources this agent published, re-announces each one every
//! 0.45 × its expiry, answers queries, and applies edits.
//!
//! Two locks:
//! - `state` guards the resource table and the announce schedule.
//! - `announce_gate` guards "may we still send Hello/Reply". Every send
//!   happens with it held, so once `stop` has flipped it no Hello can
//!   follow the bye-bye on the same stream. An edit commits under it too,
//!   so a committed edit is always announced before the bye-bye.
//!
//! `state` may be taken while holding the gate, never the reverse, and
//! `state` is never held across a send.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::Instant;

use beacon_core::wire::{self, Message};
use beacon_core::{AttributeMap, ResourceId};

use crate::error::AgentError;
use crate::lock;
use crate::resource::LocalResource;
use crate::timer::DeadlineTimer;
use crate::transport::{Transport, TransportMessage};

/// Fraction of the advertised expiry after which a resource is re-announced.
pub const REANNOUNCE_FRACTION: f64 = 0.45;

/// Floor on the re-announce period, so a zero expiry cannot spin the timer.
pub const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_millis(100);

pub fn announce_interval(expiry_secs: i32) -> Duration {
    let secs = f64::from(expiry_secs.max(0)) * REANNOUNCE_FRACTION;
    Duration::from_secs_f64(secs).max(MIN_ANNOUNCE_INTERVAL)
}

struct Scheduled {
    resource: LocalResource,
    next_announce: Instant,
}

#[derive(Default)]
struct PublisherState {
    resources: HashMap<ResourceId, Scheduled>,
    /// (next_announce, id), earliest first.
    schedule: BTreeSet<(Instant, ResourceId)>,
    stopped: bool,
}

impl PublisherState {
    fn insert(&mut self, resource: LocalResource, next_announce: Instant) {
        let id = resource.id();
        self.schedule.insert((next_announce, id));
        self.resources.insert(
            id,
            Scheduled {
                resource,
                next_announce,
            },
        );
    }

    /// Move a resource's next announcement to `last_announced + interval`.
    fn reschedule(&mut self, id: ResourceId, last_announced: Instant) {
        if let Some(entry) = self.resources.get_mut(&id) {
            self.schedule.remove(&(entry.next_announce, id));
            entry.next_announce = last_announced + announce_interval(entry.resource.expiry_secs());
            self.schedule.insert((entry.next_announce, id));
        }
    }

    /// Everything due at `now`, rescheduled as announced now.
    fn take_due(&mut self, now: Instant) -> Vec<LocalResource> {
        let due: Vec<ResourceId> = self
            .schedule
            .iter()
            .take_while(|(at, _)| *at <= now)
            .map(|(_, id)| *id)
            .collect();
        let mut resources = Vec::with_capacity(due.len());
        for id in due {
            self.reschedule(id, now);
            if let Some(entry) = self.resources.get(&id) {
                resources.push(entry.resource.clone());
            }
        }
        resources
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.schedule.first().map(|(at, _)| *at)
    }
}

pub struct Publisher {
    transport: Arc<dyn Transport>,
    state: Mutex<PublisherState>,
    /// true while announcements may be sent.
    announce_gate: Mutex<bool>,
    timer: DeadlineTimer,
}

impl Publisher {
    pub(crate) fn new(runtime: &Handle, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Publisher>| {
            let weak = weak.clone();
            Publisher {
                transport,
                state: Mutex::new(PublisherState::default()),
                announce_gate: Mutex::new(true),
                timer: DeadlineTimer::spawn(runtime, "announce", move || {
                    if let Some(publisher) = weak.upgrade() {
                        publisher.on_announce_timer();
                    }
                }),
            }
        })
    }

    /// Register a new resource. It is announced on the next timer tick;
    /// nothing here waits on the network.
    ///
    /// Fails with [`AgentError::Unencodable`] if peers could not decode
    /// the announcement.
    pub fn publish(
        self: &Arc<Self>,
        category: String,
        connection: String,
        expiry_secs: i32,
        attributes: AttributeMap,
    ) -> Result<LocalResource, AgentError> {
        wire::check_str(&category)?;
        wire::check_str(&connection)?;
        wire::check_attributes(&attributes)?;
        let resource = LocalResource::new(
            category,
            connection,
            expiry_secs,
            attributes,
            Arc::downgrade(self),
        );
        let now = Instant::now();
        {
            let mut state = lock(&self.state);
            if state.stopped {
                return Err(AgentError::Disposed);
            }
            state.insert(resource.clone(), now);
        }
        self.timer.arm_earlier(now);

        tracing::info!(
            resource = %resource.id(),
            category = resource.category(),
            expiry_secs,
            "resource published"
        );
        Ok(resource)
    }

    /// Resources currently owned, in no particular order.
    pub fn resources(&self) -> Vec<LocalResource> {
        lock(&self.state)
            .resources
            .values()
            .map(|entry| entry.resource.clone())
            .collect()
    }

    fn on_announce_timer(&self) {
        let now = Instant::now();
        let (due, next) = {
            let mut state = lock(&self.state);
            if state.stopped {
                return;
            }
            let due = state.take_due(now);
            (due, state.next_deadline())
        };
        if let Some(next) = next {
            self.timer.arm_earlier(next);
        }
        if !due.is_empty() {
            tracing::debug!(count = due.len(), "re-announcing resources");
            self.announce(&due);
        }
    }

    /// Broadcast a Hello per resource, unless announcing has been shut off.
    fn announce(&self, resources: &[LocalResource]) {
        let gate = lock(&self.announce_gate);
        if *gate {
            self.send_hellos(resources);
        }
    }

    /// Caller holds an open `announce_gate`.
    fn send_hellos(&self, resources: &[LocalResource]) {
        for resource in resources {
            let payload = Message::ServerHello(resource.announcement()).encode();
            tracing::trace!(resource = %resource.id(), bytes = payload.len(), "hello");
            self.transport.broadcast(resource.id(), payload);
        }
    }

    /// Answer a `ClientQuery` with one Reply per matching resource.
    pub(crate) fn on_query(&self, query: &TransportMessage, category: &str) {
        let matches: Vec<LocalResource> = lock(&self.state)
            .resources
            .values()
            .filter(|entry| entry.resource.category() == category)
            .map(|entry| entry.resource.clone())
            .collect();
        if matches.is_empty() {
            return;
        }

        let gate = lock(&self.announce_gate);
        if !*gate {
            return;
        }
        tracing::debug!(category, count = matches.len(), origin = ?query.origin, "answering query");
        for resource in &matches {
            let payload = Message::ServerReply(resource.announcement()).encode();
            self.transport.reply(query, resource.id(), payload);
        }
    }

    /// Validate-and-mutate under the resource lock, then announce.
    ///
    /// The gate is held throughout, so `stop` either refuses the edit or
    /// waits for its Hello to go out.
    pub(crate) fn commit_edit(
        &self,
        resource: &LocalResource,
        baseline: u64,
        removes: &BTreeSet<String>,
        puts: &AttributeMap,
    ) -> Result<(), AgentError> {
        let id = resource.id();
        let gate = lock(&self.announce_gate);
        if !*gate {
            return Err(AgentError::Disposed);
        }
        {
            let state = lock(&self.state);
            if state.stopped || !state.resources.contains_key(&id) {
                return Err(AgentError::Disposed);
            }
        }

        let serial = resource.apply_edit(baseline, removes, puts)?;

        let now = Instant::now();
        let next = {
            let mut state = lock(&self.state);
            state.reschedule(id, now);
            state.next_deadline()
        };
        if let Some(next) = next {
            self.timer.arm_earlier(next);
        }

        tracing::debug!(
            resource = %id,
            serial,
            puts = puts.len(),
            removes = removes.len(),
            "edit committed"
        );
        self.send_hellos(std::slice::from_ref(resource));
        drop(gate);
        Ok(())
    }

    /// Stop announcing and withdraw every resource. Idempotent.
    pub fn stop(&self) {
        let resources: Vec<LocalResource> = {
            let mut state = lock(&self.state);
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.schedule.clear();
            state
                .resources
                .drain()
                .map(|(_, entry)| entry.resource)
                .collect()
        };
        self.timer.close();

        // Waits for any in-flight announce to finish.
        *lock(&self.announce_gate) = false;

        let bye_bye = Message::ServerByeBye.encode();
        for resource in &resources {
            self.transport.broadcast(resource.id(), bye_bye.clone());
        }
        tracing::info!(count = resources.len(), "publisher stopped, bye-bye sent");
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }
}
