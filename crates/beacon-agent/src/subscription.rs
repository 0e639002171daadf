//! Subscription handles.
//!
//! A [`Subscription`] watches one category. Reading `resources()` is cheap
//! when nothing changed: the handle compares its cached serial against the
//! category's shared atomic serial and only rebuilds the list on mismatch.
//!
//! Change notifications come two ways, both fired from the subscriber's
//! delivery task with no lock held: callbacks registered with
//! [`Subscription::on_updated`], and a `watch` channel from
//! [`Subscription::updates`] for async waiters.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::agent::TransportUsage;
use crate::lock;
use crate::resource::Resource;
use crate::subscriber::Subscriber;

pub(crate) type UpdatedCallback = Arc<dyn Fn() + Send + Sync>;

struct CachedList {
    serial: Option<u64>,
    resources: Arc<[Resource]>,
}

/// State shared between a handle and its category.
pub(crate) struct SubscriptionShared {
    id: u64,
    category: String,
    category_serial: Arc<AtomicU64>,
    cache: Mutex<CachedList>,
    callbacks: Mutex<Vec<UpdatedCallback>>,
    updates: watch::Sender<u64>,
    /// Set by the handle or by the subscriber when it stops.
    disposed: AtomicBool,
}

impl SubscriptionShared {
    pub(crate) fn new(id: u64, category: String, category_serial: Arc<AtomicU64>) -> Self {
        let (updates, _) = watch::channel(0);
        Self {
            id,
            category,
            category_serial,
            cache: Mutex::new(CachedList {
                serial: None,
                resources: Arc::from(Vec::new()),
            }),
            callbacks: Mutex::new(Vec::new()),
            updates,
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn category(&self) -> &str {
        &self.category
    }

    pub(crate) fn add_callback(&self, callback: UpdatedCallback) {
        lock(&self.callbacks).push(callback);
    }

    /// Returns true for the caller that flipped the flag.
    pub(crate) fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Fire every callback and wake watchers. Called without any agent lock.
    /// A disposed subscription gets nothing, even from a delivery round
    /// collected before it was disposed.
    pub(crate) fn notify_updated(&self) {
        if self.is_disposed() {
            return;
        }
        let serial = self.category_serial.load(Ordering::Acquire);
        self.updates.send_replace(serial);

        // Clone out so a callback may register another without deadlocking.
        let callbacks: Vec<UpdatedCallback> = lock(&self.callbacks).clone();
        for callback in callbacks {
            callback();
        }
    }
}

/// Live view of one category. Dropping it unsubscribes.
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
    subscriber: Arc<Subscriber>,
    usage: Arc<TransportUsage>,
}

impl Subscription {
    pub(crate) fn new(
        shared: Arc<SubscriptionShared>,
        subscriber: Arc<Subscriber>,
        usage: Arc<TransportUsage>,
    ) -> Self {
        Self {
            shared,
            subscriber,
            usage,
        }
    }

    pub fn category(&self) -> &str {
        &self.shared.category
    }

    /// Category serial as of now. Strictly increases with every visible change.
    pub fn serial(&self) -> u64 {
        self.shared.category_serial.load(Ordering::Acquire)
    }

    /// Resources currently known in this category, sorted by id.
    ///
    /// Returns the cached list when the category has not changed since the
    /// last call. Empty once disposed, whether by [`Subscription::dispose`]
    /// or by disposing the agent.
    pub fn resources(&self) -> Arc<[Resource]> {
        if self.is_disposed() {
            return Arc::from(Vec::new());
        }
        let current = self.serial();
        {
            let cache = lock(&self.shared.cache);
            if cache.serial == Some(current) {
                return cache.resources.clone();
            }
        }

        let Some((serial, list)) = self.subscriber.snapshot(&self.shared.category) else {
            return Arc::from(Vec::new());
        };
        let list: Arc<[Resource]> = Arc::from(list);

        let mut cache = lock(&self.shared.cache);
        if cache.serial.map_or(true, |cached| cached < serial) {
            cache.serial = Some(serial);
            cache.resources = list.clone();
        }
        list
    }

    /// Run `callback` whenever a fresher resource list is available.
    ///
    /// Callbacks run on the agent's delivery task and may call back into
    /// the agent, including disposing this subscription.
    pub fn on_updated<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.add_callback(Arc::new(callback));
    }

    /// Watch channel carrying the category serial of the latest notification.
    ///
    /// Create the receiver before checking `resources()` so no update
    /// between the check and the wait is missed.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.shared.updates.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Stop watching the category and release this subscription's hold on
    /// the transport. Idempotent; also runs on drop.
    pub fn dispose(&self) {
        if !self.shared.mark_disposed() {
            return;
        }
        self.subscriber.unsubscribe(&self.shared);
        self.usage.release();
        tracing::debug!(category = self.category(), subscription = self.shared.id, "subscription disposed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("category", &self.shared.category)
            .field("serial", &self.serial())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
