//! In-process transport.
//!
//! A [`MemoryNetwork`] connects any number of [`MemoryTransport`] endpoints.
//! Each started endpoint owns an unbounded queue drained by one pump task,
//! so delivery to an endpoint is FIFO and never reenters the sender. A
//! broadcast reaches every other started endpoint, never the sender itself.
//!
//! Loss and duplication can be switched on to exercise the protocol's
//! recovery paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::Rng;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use beacon_core::StreamId;

use crate::lock;
use crate::transport::{MessageHandler, Origin, Transport, TransportError, TransportMessage};

#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    loss_rate: f64,
    duplicate: bool,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<u64, mpsc::UnboundedSender<TransportMessage>>>,
    faults: Mutex<Faults>,
    next_endpoint: AtomicU64,
}

impl NetworkInner {
    /// Queue `message` for `to`, subject to the configured faults.
    /// Returns how many copies were queued.
    fn deliver(&self, to: u64, message: TransportMessage) -> usize {
        let faults = *lock(&self.faults);
        if faults.loss_rate > 0.0 && rand::thread_rng().gen::<f64>() < faults.loss_rate {
            tracing::trace!(to, stream = %message.stream_id, "dropped by loss simulation");
            return 0;
        }
        let endpoints = lock(&self.endpoints);
        let Some(queue) = endpoints.get(&to) else {
            return 0;
        };
        let copies = if faults.duplicate { 2 } else { 1 };
        let mut queued = 0;
        for _ in 0..copies {
            if queue.send(message.clone()).is_ok() {
                queued += 1;
            }
        }
        queued
    }

    fn peers_of(&self, id: u64) -> Vec<u64> {
        lock(&self.endpoints)
            .keys()
            .copied()
            .filter(|peer| *peer != id)
            .collect()
    }
}

/// A simulated broadcast domain. Cloning shares the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh endpoint on this network. It receives nothing until started.
    pub fn endpoint(&self) -> Arc<MemoryTransport> {
        let id = self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(MemoryTransport {
            id,
            network: self.inner.clone(),
            running: Mutex::new(None),
        })
    }

    /// Probability in `[0, 1]` that any single delivery is dropped.
    pub fn set_loss_rate(&self, rate: f64) {
        lock(&self.inner.faults).loss_rate = rate.clamp(0.0, 1.0);
    }

    /// Deliver every message twice.
    pub fn set_duplicate(&self, duplicate: bool) {
        lock(&self.inner.faults).duplicate = duplicate;
    }

    /// Number of endpoints currently started.
    pub fn active_endpoints(&self) -> usize {
        lock(&self.inner.endpoints).len()
    }
}

pub struct MemoryTransport {
    id: u64,
    network: Arc<NetworkInner>,
    /// Set while started; flipping it silences the pump.
    running: Mutex<Option<Arc<AtomicBool>>>,
}

impl MemoryTransport {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_started(&self) -> bool {
        lock(&self.running).is_some()
    }

    fn envelope(&self, stream_id: StreamId, contents: Bytes) -> TransportMessage {
        TransportMessage {
            stream_id,
            contents,
            origin: Origin::Endpoint(self.id),
        }
    }
}

impl Transport for MemoryTransport {
    fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let runtime = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<TransportMessage>();
        let stopped = Arc::new(AtomicBool::new(false));
        let pump_stopped = stopped.clone();
        let id = self.id;
        runtime.spawn(async move {
            while let Some(message) = rx.recv().await {
                if pump_stopped.load(Ordering::Acquire) {
                    break;
                }
                handler.on_message(&message);
            }
            tracing::trace!(endpoint = id, "memory pump exited");
        });

        lock(&self.network.endpoints).insert(self.id, tx);
        *running = Some(stopped);
        tracing::debug!(endpoint = self.id, "memory transport started");
        Ok(())
    }

    fn stop(&self) {
        let Some(stopped) = lock(&self.running).take() else {
            return;
        };
        stopped.store(true, Ordering::Release);
        // Dropping the sender ends the pump once it wakes.
        lock(&self.network.endpoints).remove(&self.id);
        tracing::debug!(endpoint = self.id, "memory transport stopped");
    }

    fn broadcast(&self, stream_id: StreamId, payload: Bytes) {
        let message = self.envelope(stream_id, payload);
        for peer in self.network.peers_of(self.id) {
            self.network.deliver(peer, message.clone());
        }
    }

    fn reply(&self, original: &TransportMessage, stream_id: StreamId, payload: Bytes) {
        match original.origin {
            Origin::Endpoint(to) if to != self.id => {
                self.network.deliver(to, self.envelope(stream_id, payload));
            }
            other => tracing::trace!(origin = ?other, "reply target not on this network"),
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
