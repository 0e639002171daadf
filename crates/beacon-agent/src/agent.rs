//! Discovery agent facade.
//!
//! Composes the publisher and subscriber (each created on first use) over
//! one shared transport. The transport is started when its usage count
//! leaves zero and stopped when it returns there. Every subscription holds
//! one usage; the publisher holds one until the agent is disposed.
//!
//! Lifecycle: `Created → Active → Disposed`. Disposed is terminal and every
//! operation after it fails with [`AgentError::Disposed`].

use std::sync::{Arc, Mutex, OnceLock};

use tokio::runtime::Handle;

use beacon_core::config::AgentConfig;
use beacon_core::wire::Message;
use beacon_core::AttributeMap;

use crate::error::AgentError;
use crate::lock;
use crate::publisher::Publisher;
use crate::resource::{LocalResource, Resource};
use crate::subscriber::Subscriber;
use crate::subscription::Subscription;
use crate::transport::{MessageHandler, Transport, TransportMessage};

// ── Transport usage ───────────────────────────────────────────────────────────

/// Reference count over transport start/stop.
pub(crate) struct TransportUsage {
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    count: Mutex<usize>,
}

impl TransportUsage {
    fn new(transport: Arc<dyn Transport>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            transport,
            handler,
            count: Mutex::new(0),
        }
    }

    /// Take one usage, starting the transport on the first.
    pub(crate) fn acquire(&self) -> Result<(), AgentError> {
        let mut count = lock(&self.count);
        if *count == 0 {
            self.transport.start(self.handler.clone())?;
            tracing::info!("transport started");
        }
        *count += 1;
        Ok(())
    }

    /// Drop one usage, stopping the transport on the last. Never underflows.
    pub(crate) fn release(&self) {
        let mut count = lock(&self.count);
        match *count {
            0 => tracing::warn!("transport usage released more often than acquired"),
            1 => {
                *count = 0;
                self.transport.stop();
                tracing::info!("transport stopped");
            }
            _ => *count -= 1,
        }
    }

    pub(crate) fn count(&self) -> usize {
        *lock(&self.count)
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// The roles, created lazily. Also the transport's message handler.
#[derive(Default)]
struct Roles {
    publisher: OnceLock<Arc<Publisher>>,
    subscriber: OnceLock<Arc<Subscriber>>,
}

impl MessageHandler for Roles {
    fn on_message(&self, message: &TransportMessage) {
        let decoded = match Message::decode(&message.contents) {
            Ok(m) => m,
            Err(e) => {
                tracing::trace!(error = %e, origin = ?message.origin, "dropping malformed message");
                return;
            }
        };
        tracing::trace!(kind = decoded.kind(), stream = %message.stream_id, "received");

        match decoded {
            Message::ClientQuery { category } => {
                if let Some(publisher) = self.publisher.get() {
                    publisher.on_query(message, &category);
                }
            }
            Message::ServerHello(announcement) | Message::ServerReply(announcement) => {
                if let Some(subscriber) = self.subscriber.get() {
                    subscriber.on_announcement(message.stream_id, announcement);
                }
            }
            Message::ServerByeBye => {
                if let Some(subscriber) = self.subscriber.get() {
                    subscriber.on_bye_bye(message.stream_id);
                }
            }
        }
    }
}

// ── Agent ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Created,
    Active,
    Disposed,
}

pub struct DiscoveryAgent {
    config: AgentConfig,
    runtime: Handle,
    transport: Arc<dyn Transport>,
    roles: Arc<Roles>,
    usage: Arc<TransportUsage>,
    lifecycle: Mutex<AgentState>,
}

impl DiscoveryAgent {
    /// Create an agent over `transport`. Must be called inside a tokio
    /// runtime; timers and the delivery loop are spawned on it.
    pub fn new(transport: Arc<dyn Transport>, config: AgentConfig) -> Result<Self, AgentError> {
        let runtime = Handle::try_current()?;
        let roles = Arc::new(Roles::default());
        let usage = Arc::new(TransportUsage::new(transport.clone(), roles.clone()));
        Ok(Self {
            config,
            runtime,
            transport,
            roles,
            usage,
            lifecycle: Mutex::new(AgentState::Created),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> AgentState {
        *lock(&self.lifecycle)
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == AgentState::Disposed
    }

    /// Watch `category`. Subscriptions to the same category share one cache.
    pub fn subscribe(&self, category: &str) -> Result<Subscription, AgentError> {
        let subscriber = {
            let mut life = lock(&self.lifecycle);
            if *life == AgentState::Disposed {
                return Err(AgentError::Disposed);
            }
            self.usage.acquire()?;
            *life = AgentState::Active;
            self.roles
                .subscriber
                .get_or_init(|| Subscriber::new(&self.runtime, self.transport.clone()))
                .clone()
        };

        match subscriber.subscribe(category) {
            Ok(shared) => Ok(Subscription::new(shared, subscriber, self.usage.clone())),
            Err(e) => {
                self.usage.release();
                Err(e)
            }
        }
    }

    /// Publish a resource under `category`, advertised with the configured
    /// expiry. Returns as soon as it is registered locally; the first
    /// announcement goes out from the publisher's timer.
    ///
    /// Dropping the future before it is polled publishes nothing. Once it
    /// has completed the resource stays published until the agent is
    /// disposed.
    pub async fn publish(
        &self,
        category: impl Into<String>,
        connection: impl Into<String>,
        attributes: Option<AttributeMap>,
    ) -> Result<Resource, AgentError> {
        let publisher = self.publisher()?;
        let resource = publisher.publish(
            category.into(),
            connection.into(),
            self.config.wire_expiry_secs(),
            attributes.unwrap_or_default(),
        )?;
        Ok(Resource::Local(resource))
    }

    fn publisher(&self) -> Result<Arc<Publisher>, AgentError> {
        let mut life = lock(&self.lifecycle);
        if *life == AgentState::Disposed {
            return Err(AgentError::Disposed);
        }
        if let Some(publisher) = self.roles.publisher.get() {
            return Ok(publisher.clone());
        }
        self.usage.acquire()?;
        *life = AgentState::Active;
        let publisher = self
            .roles
            .publisher
            .get_or_init(|| Publisher::new(&self.runtime, self.transport.clone()));
        Ok(publisher.clone())
    }

    /// Resources published by this agent and not yet withdrawn.
    pub fn local_resources(&self) -> Vec<LocalResource> {
        self.roles
            .publisher
            .get()
            .map(|publisher| publisher.resources())
            .unwrap_or_default()
    }

    /// Withdraw everything and shut down.
    ///
    /// Sends a bye-bye for each published resource, stops the subscriber
    /// (disposing any subscription still open, which then reads empty),
    /// waits `shutdown_flush` so the bye-byes can leave, then releases the
    /// publisher's transport usage. Only the first call does anything.
    pub async fn dispose(&self) {
        let Some(had_publisher) = self.begin_dispose() else {
            return;
        };
        if had_publisher {
            tokio::time::sleep(self.config.shutdown_flush()).await;
            self.usage.release();
        }
        tracing::info!(transport_users = self.usage.count(), "discovery agent disposed");
    }

    /// Flip to Disposed and stop both roles. Returns whether a publisher
    /// existed, or `None` if someone else already disposed.
    fn begin_dispose(&self) -> Option<bool> {
        let (publisher, subscriber) = {
            let mut life = lock(&self.lifecycle);
            if *life == AgentState::Disposed {
                return None;
            }
            *life = AgentState::Disposed;
            (
                self.roles.publisher.get().cloned(),
                self.roles.subscriber.get().cloned(),
            )
        };
        if let Some(publisher) = &publisher {
            publisher.stop();
        }
        if let Some(subscriber) = &subscriber {
            // The publisher's usage, if any, keeps the transport up for the flush.
            for _ in 0..subscriber.stop() {
                self.usage.release();
            }
        }
        Some(publisher.is_some())
    }
}

impl Drop for DiscoveryAgent {
    fn drop(&mut self) {
        // No flush wait here; callers who care use `dispose().await`.
        if let Some(true) = self.begin_dispose() {
            self.usage.release();
        }
    }
}
