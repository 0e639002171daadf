//! Subscriber (client role).
//!
//! Keeps one [`CategoryInfo`] per subscribed category holding what peers
//! announced, drops entries when they expire or say bye-bye, and tells
//! subscriptions when their category changed.
//!
//! Change detection happens under `state`; notification happens on the
//! delivery task with no lock held, so a subscriber callback may call back
//! into the agent (even dispose its own subscription) without deadlocking
//! and a slow callback never stalls message processing.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;

use beacon_core::wire::{self, Announcement, Message};
use beacon_core::{ResourceId, StreamId};

use crate::error::AgentError;
use crate::lock;
use crate::resource::{RemoteResource, Resource};
use crate::subscription::SubscriptionShared;
use crate::timer::DeadlineTimer;
use crate::transport::Transport;

struct RemoteEntry {
    resource: RemoteResource,
    expires_at: Instant,
}

/// Subscriber-side state for one category.
pub(crate) struct CategoryInfo {
    resources: HashMap<ResourceId, RemoteEntry>,
    /// Bumped on every visible change. Shared with subscriptions so they
    /// can check freshness without taking the subscriber lock.
    serial: Arc<AtomicU64>,
    dirty: bool,
    subscriptions: Vec<Arc<SubscriptionShared>>,
}

impl CategoryInfo {
    fn new() -> Self {
        Self {
            resources: HashMap::new(),
            serial: Arc::new(AtomicU64::new(0)),
            dirty: false,
            subscriptions: Vec::new(),
        }
    }

    /// Called with the subscriber lock held.
    fn bump(&mut self) {
        self.serial.fetch_add(1, Ordering::Release);
        self.dirty = true;
    }

    fn snapshot(&self) -> Vec<Resource> {
        let mut list: Vec<Resource> = self
            .resources
            .values()
            .map(|entry| Resource::Remote(entry.resource.clone()))
            .collect();
        list.sort_by_key(Resource::id);
        list
    }
}

#[derive(Default)]
struct SubscriberState {
    categories: HashMap<String, CategoryInfo>,
    /// resource id → category, for bye-bye handling.
    index: HashMap<ResourceId, String>,
    stopped: bool,
}

pub struct Subscriber {
    transport: Arc<dyn Transport>,
    state: Mutex<SubscriberState>,
    expiry_timer: DeadlineTimer,
    /// Wakes the delivery task.
    deliver: Arc<Notify>,
    next_subscription_id: AtomicU64,
}

impl Subscriber {
    pub(crate) fn new(runtime: &Handle, transport: Arc<dyn Transport>) -> Arc<Self> {
        let deliver = Arc::new(Notify::new());
        let subscriber = Arc::new_cyclic(|weak: &Weak<Subscriber>| {
            let weak = weak.clone();
            Subscriber {
                transport,
                state: Mutex::new(SubscriberState::default()),
                expiry_timer: DeadlineTimer::spawn(runtime, "expiry", move || {
                    if let Some(subscriber) = weak.upgrade() {
                        subscriber.on_expiry_timer();
                    }
                }),
                deliver: deliver.clone(),
                next_subscription_id: AtomicU64::new(1),
            }
        });
        runtime.spawn(delivery_loop(Arc::downgrade(&subscriber), deliver));
        subscriber
    }

    /// Register a subscription, creating the category on first use.
    /// A new category triggers one `ClientQuery` so owners reply at once.
    pub(crate) fn subscribe(&self, category: &str) -> Result<Arc<SubscriptionShared>, AgentError> {
        wire::check_str(category)?;
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let (shared, is_new) = {
            let mut state = lock(&self.state);
            if state.stopped {
                return Err(AgentError::Disposed);
            }
            let is_new = !state.categories.contains_key(category);
            let info = state
                .categories
                .entry(category.to_string())
                .or_insert_with(CategoryInfo::new);
            let shared = Arc::new(SubscriptionShared::new(
                id,
                category.to_string(),
                info.serial.clone(),
            ));
            info.subscriptions.push(shared.clone());
            (shared, is_new)
        };

        tracing::debug!(category, subscription = id, is_new, "subscribed");
        if is_new {
            let query = Message::ClientQuery {
                category: category.to_string(),
            };
            self.transport.broadcast(StreamId::NIL, query.encode());
        }
        Ok(shared)
    }

    /// Remove a subscription. The category is forgotten with its last one.
    pub(crate) fn unsubscribe(&self, subscription: &SubscriptionShared) {
        let mut state = lock(&self.state);
        let SubscriberState {
            categories, index, ..
        } = &mut *state;
        let Some(info) = categories.get_mut(subscription.category()) else {
            return;
        };
        info.subscriptions.retain(|s| s.id() != subscription.id());
        if info.subscriptions.is_empty() {
            if let Some(info) = categories.remove(subscription.category()) {
                for id in info.resources.keys() {
                    index.remove(id);
                }
            }
            tracing::debug!(category = subscription.category(), "category dropped");
        }
    }

    /// Serial and resource list of a category, read atomically.
    pub(crate) fn snapshot(&self, category: &str) -> Option<(u64, Vec<Resource>)> {
        let state = lock(&self.state);
        let info = state.categories.get(category)?;
        Some((info.serial.load(Ordering::Acquire), info.snapshot()))
    }

    /// Handle a Hello or Reply for resource `stream_id`.
    pub(crate) fn on_announcement(&self, stream_id: StreamId, announcement: Announcement) {
        if stream_id.is_nil() {
            tracing::trace!("announcement without a resource id, dropping");
            return;
        }
        let lifetime = u64::try_from(announcement.expiry_secs).unwrap_or(0);
        let expires_at = Instant::now() + Duration::from_secs(lifetime);

        let changed = {
            let mut state = lock(&self.state);
            if state.stopped {
                return;
            }
            let SubscriberState {
                categories, index, ..
            } = &mut *state;

            if let Some(known) = index.get(&stream_id) {
                if *known != announcement.category {
                    // The category index cannot move an entry; keep the old one.
                    tracing::warn!(
                        resource = %stream_id,
                        known = known.as_str(),
                        announced = announcement.category.as_str(),
                        "ignoring category change for known resource"
                    );
                    return;
                }
            }

            let Some(info) = categories.get_mut(&announcement.category) else {
                tracing::trace!(category = announcement.category.as_str(), "not subscribed");
                return;
            };

            match info.resources.entry(stream_id) {
                Entry::Vacant(slot) => {
                    index.insert(stream_id, announcement.category.clone());
                    slot.insert(RemoteEntry {
                        resource: RemoteResource::from_announcement(stream_id, announcement),
                        expires_at,
                    });
                    info.bump();
                    tracing::debug!(resource = %stream_id, "resource discovered");
                    true
                }
                Entry::Occupied(mut slot) => {
                    let entry = slot.get_mut();
                    entry.expires_at = expires_at;
                    if entry.resource.differs_from(&announcement) {
                        entry.resource = RemoteResource::from_announcement(stream_id, announcement);
                        info.bump();
                        tracing::debug!(resource = %stream_id, "resource updated");
                        true
                    } else {
                        false
                    }
                }
            }
        };

        self.expiry_timer.arm_earlier(expires_at);
        if changed {
            self.deliver.notify_one();
        }
    }

    pub(crate) fn on_bye_bye(&self, stream_id: StreamId) {
        {
            let mut state = lock(&self.state);
            if state.stopped {
                return;
            }
            let SubscriberState {
                categories, index, ..
            } = &mut *state;
            let Some(category) = index.remove(&stream_id) else {
                return;
            };
            let Some(info) = categories.get_mut(&category) else {
                return;
            };
            if info.resources.remove(&stream_id).is_none() {
                return;
            }
            info.bump();
        }
        tracing::debug!(resource = %stream_id, "resource withdrawn");
        self.deliver.notify_one();
    }

    fn on_expiry_timer(&self) {
        let now = Instant::now();
        let (expired, next) = {
            let mut state = lock(&self.state);
            if state.stopped {
                return;
            }
            let SubscriberState {
                categories, index, ..
            } = &mut *state;

            let mut expired = Vec::new();
            let mut next: Option<Instant> = None;
            for info in categories.values_mut() {
                let before = info.resources.len();
                info.resources.retain(|id, entry| {
                    if entry.expires_at <= now {
                        expired.push(*id);
                        false
                    } else {
                        next = Some(next.map_or(entry.expires_at, |n| n.min(entry.expires_at)));
                        true
                    }
                });
                if info.resources.len() != before {
                    info.bump();
                }
            }
            for id in &expired {
                index.remove(id);
            }
            (expired, next)
        };

        if let Some(next) = next {
            self.expiry_timer.arm_earlier(next);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "expired remote resources");
            self.deliver.notify_one();
        }
    }

    /// Collect the subscriptions of every dirty category and clear the
    /// flags. Returns `None` once stopped.
    fn take_dirty(&self) -> Option<Vec<Arc<SubscriptionShared>>> {
        let mut state = lock(&self.state);
        if state.stopped {
            return None;
        }
        let mut targets = Vec::new();
        for info in state.categories.values_mut() {
            if info.dirty {
                info.dirty = false;
                targets.extend(info.subscriptions.iter().cloned());
            }
        }
        Some(targets)
    }

    /// Stop the expiry timer and the delivery task, forget every category
    /// and dispose the subscriptions still open on them. Each one sees a
    /// last update with an empty list.
    ///
    /// Returns how many subscriptions were disposed here, so the caller can
    /// release their transport usage. Idempotent.
    pub fn stop(&self) -> usize {
        let subscriptions: Vec<Arc<SubscriptionShared>> = {
            let mut state = lock(&self.state);
            if state.stopped {
                return 0;
            }
            state.stopped = true;
            state.index.clear();
            let subscriptions = state
                .categories
                .drain()
                .flat_map(|(_, info)| {
                    info.serial.fetch_add(1, Ordering::Release);
                    info.subscriptions
                })
                .collect();
            subscriptions
        };
        self.expiry_timer.close();
        self.deliver.notify_one();

        let mut disposed = 0;
        for subscription in &subscriptions {
            subscription.notify_updated();
            if subscription.mark_disposed() {
                disposed += 1;
            }
        }
        tracing::info!(subscriptions = disposed, "subscriber stopped");
        disposed
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }

    #[cfg(test)]
    fn category_serial(&self, category: &str) -> Option<u64> {
        lock(&self.state)
            .categories
            .get(category)
            .map(|info| info.serial.load(Ordering::Acquire))
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        // Let the delivery task notice the subscriber is gone.
        self.deliver.notify_one();
    }
}

async fn delivery_loop(subscriber: Weak<Subscriber>, deliver: Arc<Notify>) {
    loop {
        deliver.notified().await;
        let Some(strong) = subscriber.upgrade() else {
            break;
        };
        let Some(targets) = strong.take_dirty() else {
            break;
        };
        drop(strong);

        for subscription in targets {
            subscription.notify_updated();
        }
    }
    tracing::trace!("delivery loop exited");
}
