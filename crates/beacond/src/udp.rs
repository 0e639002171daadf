//! IPv6 multicast transport.
//!
//! Every participant binds the same UDP port and joins one link-local
//! multicast group. Broadcasts go to the group; replies go unicast to the
//! source address of the datagram being answered.
//!
//! Each datagram starts with a [`FrameHeader`]. The sender nonce lets a
//! node recognise its own looped-back broadcasts, and the per-stream
//! sequence number lets the receiver drop stale or replayed datagrams so
//! delivery within a non-nil stream stays in order. Streams silent for
//! [`SEQUENCE_HORIZON`] are forgotten.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use static_assertions::assert_eq_size;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use beacon_agent::{MessageHandler, Origin, Transport, TransportError, TransportMessage};
use beacon_core::config::NetworkConfig;
use beacon_core::wire::MAX_STRING_LEN;
use beacon_core::StreamId;

// ── Framing ───────────────────────────────────────────────────────────────────

pub const FRAME_MAGIC: [u8; 4] = *b"BCN0";
pub const FRAME_VERSION: u8 = 1;

/// Set on unicast replies.
pub const FLAG_REPLY: u8 = 0x01;

/// Fixed prefix of every datagram. Multi-byte fields are little-endian.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    pub magic: [u8; 4],
    pub version: u8,
    pub flags: u8,
    pub reserved: [u8; 2],
    pub stream_id: [u8; 16],
    /// Random per transport instance, nonzero.
    pub sender: u32,
    /// Per (sender, stream), starting at 1.
    pub sequence: u32,
}

assert_eq_size!(FrameHeader, [u8; 32]);

pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

/// Largest datagram we expect to receive.
const RECV_BUF_LEN: usize = HEADER_LEN + 4 * MAX_STRING_LEN as usize;

impl FrameHeader {
    fn new(stream_id: StreamId, sender: u32, sequence: u32, flags: u8) -> Self {
        Self {
            magic: FRAME_MAGIC,
            version: FRAME_VERSION,
            flags,
            reserved: [0; 2],
            stream_id: *stream_id.as_bytes(),
            sender: sender.to_le(),
            sequence: sequence.to_le(),
        }
    }

    /// Parse and validate the header at the start of `datagram`.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let header = Self::read_from_prefix(datagram)?;
        if header.magic != FRAME_MAGIC || header.version != FRAME_VERSION {
            return None;
        }
        Some(header)
    }

    pub fn stream(&self) -> StreamId {
        StreamId::from_bytes(self.stream_id)
    }

    pub fn sender(&self) -> u32 {
        u32::from_le(self.sender)
    }

    pub fn sequence(&self) -> u32 {
        u32::from_le(self.sequence)
    }
}

// ── Sequencing ────────────────────────────────────────────────────────────────

/// How long a (sender, stream) may stay silent before its sequence is
/// forgotten. Far longer than any re-announce period.
pub const SEQUENCE_HORIZON: Duration = Duration::from_secs(600);

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct LastSeen {
    sequence: u32,
    at: Instant,
}

/// Highest sequence seen per (sender, stream).
#[derive(Debug, Default)]
pub struct SequenceFilter {
    last: DashMap<(u32, StreamId), LastSeen>,
}

impl SequenceFilter {
    /// Whether a datagram should be delivered. The nil stream is unordered
    /// and always accepted.
    pub fn accept(&self, sender: u32, stream: StreamId, sequence: u32) -> bool {
        if stream.is_nil() {
            return true;
        }
        let mut last = self.last.entry((sender, stream)).or_insert(LastSeen {
            sequence: 0,
            at: Instant::now(),
        });
        if sequence <= last.sequence {
            return false;
        }
        last.sequence = sequence;
        last.at = Instant::now();
        true
    }

    /// Forget streams with nothing accepted since `cutoff`. Returns how
    /// many were dropped.
    pub fn prune_idle_since(&self, cutoff: Instant) -> usize {
        let before = self.last.len();
        self.last.retain(|_, seen| seen.at >= cutoff);
        before.saturating_sub(self.last.len())
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UdpSettings {
    /// OS interface index, 0 for the system default.
    pub interface_index: u32,
    pub port: u16,
    pub group: Ipv6Addr,
}

impl UdpSettings {
    pub fn from_config(network: &NetworkConfig) -> Result<Self> {
        let interface_index = if network.interface.is_empty() {
            0
        } else {
            if_index(&network.interface)?
        };
        let group: Ipv6Addr = network
            .multicast_addr
            .parse()
            .with_context(|| format!("invalid multicast address '{}'", network.multicast_addr))?;
        if !group.is_multicast() {
            anyhow::bail!("'{}' is not a multicast address", group);
        }
        Ok(Self {
            interface_index,
            port: network.port,
            group,
        })
    }

    fn group_addr(&self) -> SocketAddr {
        SocketAddrV6::new(self.group, self.port, 0, self.interface_index).into()
    }
}

/// Get the OS interface index for a named network interface.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}

// ── Transport ─────────────────────────────────────────────────────────────────

struct Running {
    socket: Arc<UdpSocket>,
    receiver: JoinHandle<()>,
}

pub struct UdpTransport {
    settings: UdpSettings,
    nonce: u32,
    outgoing: DashMap<StreamId, u32>,
    incoming: Arc<SequenceFilter>,
    running: Mutex<Option<Running>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UdpTransport {
    pub fn new(settings: UdpSettings) -> Self {
        Self {
            settings,
            nonce: rand::thread_rng().gen_range(1..=u32::MAX),
            outgoing: DashMap::new(),
            incoming: Arc::new(SequenceFilter::default()),
            running: Mutex::new(None),
        }
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    fn next_sequence(&self, stream_id: StreamId) -> u32 {
        if stream_id.is_nil() {
            return 0;
        }
        let mut seq = self.outgoing.entry(stream_id).or_insert(0);
        *seq = seq.wrapping_add(1);
        *seq
    }

    fn send(&self, target: SocketAddr, stream_id: StreamId, flags: u8, payload: &[u8]) {
        let Some(socket) = lock(&self.running).as_ref().map(|r| r.socket.clone()) else {
            tracing::trace!(stream = %stream_id, "transport not started, dropping send");
            return;
        };
        let header = FrameHeader::new(stream_id, self.nonce, self.next_sequence(stream_id), flags);
        let mut datagram = Vec::with_capacity(HEADER_LEN + payload.len());
        datagram.extend_from_slice(header.as_bytes());
        datagram.extend_from_slice(payload);

        match socket.try_send_to(&datagram, target) {
            Ok(n) => tracing::trace!(bytes = n, %target, stream = %stream_id, "datagram sent"),
            Err(e) => tracing::warn!(error = %e, %target, "datagram send failed"),
        }
    }
}

impl Transport for UdpTransport {
    fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let runtime = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let std_socket = make_socket(&self.settings)?;
        let socket = {
            let _guard = runtime.enter();
            Arc::new(UdpSocket::from_std(std_socket)?)
        };

        let receiver = runtime.spawn(receive_loop(
            socket.clone(),
            handler,
            self.nonce,
            self.incoming.clone(),
        ));
        *running = Some(Running { socket, receiver });

        tracing::info!(
            group = %self.settings.group,
            port = self.settings.port,
            interface_index = self.settings.interface_index,
            "udp transport started"
        );
        Ok(())
    }

    fn stop(&self) {
        if let Some(running) = lock(&self.running).take() {
            running.receiver.abort();
            tracing::info!("udp transport stopped");
        }
    }

    fn broadcast(&self, stream_id: StreamId, payload: Bytes) {
        self.send(self.settings.group_addr(), stream_id, 0, &payload);
    }

    fn reply(&self, original: &TransportMessage, stream_id: StreamId, payload: Bytes) {
        match original.origin {
            Origin::Socket(addr) => self.send(addr, stream_id, FLAG_REPLY, &payload),
            other => tracing::trace!(origin = ?other, "reply target is not a socket"),
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    handler: Arc<dyn MessageHandler>,
    own_nonce: u32,
    incoming: Arc<SequenceFilter>,
) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    let mut prune = tokio::time::interval(PRUNE_INTERVAL);
    prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = prune.tick() => {
                if let Some(cutoff) = Instant::now().checked_sub(SEQUENCE_HORIZON) {
                    let dropped = incoming.prune_idle_since(cutoff);
                    if dropped > 0 {
                        tracing::debug!(dropped, remaining = incoming.len(), "pruned idle streams");
                    }
                }
                continue;
            }
        };
        let (len, peer_addr) = match received {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "recv_from failed");
                continue;
            }
        };

        let Some(header) = FrameHeader::parse(&buf[..len]) else {
            tracing::trace!(addr = %peer_addr, len, "ignoring datagram without beacon header");
            continue;
        };
        if header.sender() == own_nonce {
            continue;
        }
        let stream_id = header.stream();
        if !incoming.accept(header.sender(), stream_id, header.sequence()) {
            tracing::trace!(
                stream = %stream_id,
                sequence = header.sequence(),
                "dropping stale datagram"
            );
            continue;
        }

        handler.on_message(&TransportMessage {
            stream_id,
            contents: Bytes::copy_from_slice(&buf[HEADER_LEN..len]),
            origin: Origin::Socket(peer_addr),
        });
    }
}

/// One socket for both directions: bound to the shared port, joined to the
/// group, multicast hops 1 so nothing leaves the link.
fn make_socket(settings: &UdpSettings) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_only_v6(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, settings.port, 0, 0);
    socket.bind(&bind_addr.into())?;

    socket.join_multicast_v6(&settings.group, settings.interface_index)?;
    if settings.interface_index != 0 {
        socket.set_multicast_if_v6(settings.interface_index)?;
    }
    socket.set_multicast_hops_v6(1)?;
    // Other processes on this host must hear us; our own copies are
    // filtered by nonce.
    socket.set_multicast_loop_v6(true)?;

    Ok(socket.into())
}
