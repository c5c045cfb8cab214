//! Gateway sessions.
//!
//! One session per discovered gateway peer. A session owns the outbound
//! packet ring, the gateway's 64 tag slots with their refcounts, the set of
//! bulbs behind it, and the timestamps driving latency-adaptive refresh.
//!
//! # Panic-Free Guarantees
//!
//! Tag slots are accessed through `TagId::index`, which is always below
//! `MAX_TAGS`, and still go through `get`/`get_mut`.

use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tracing::{debug, warn};

use lifx_core::{DeviceAddr, Label, Millis, SiteId, TagId, TagMask, MAX_TAGS};
use lifx_protocol::{OutboundPacket, PacketType, Payload, Target, WireError};

mod ring;

pub use ring::{PacketRing, RingEntry, RING_CAPACITY};

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by a gateway session.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The outbound ring is full; the packet was dropped.
    #[error("packet ring of gateway {peer} is full, dropping {packet_type}")]
    QueueFull {
        peer: SocketAddr,
        packet_type: PacketType,
    },

    /// The packet could not be built.
    #[error("cannot build packet: {0}")]
    Wire(#[from] WireError),

    /// Writing to the gateway failed; the session must be closed.
    #[error("cannot write to gateway {peer}: {source}")]
    Io {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },
}

// ============================================================================
// Datagram Sink
// ============================================================================

/// Where flushed packets go.
///
/// Implemented over the engine's UDP socket with non-blocking sends, and by
/// recording sinks in tests.
pub trait DatagramSink {
    /// Sends one datagram, returning how many bytes were written.
    ///
    /// `WouldBlock` means "try again when writable".
    fn send_to(&mut self, buf: &[u8], peer: SocketAddr) -> io::Result<usize>;
}

impl<T: DatagramSink + ?Sized> DatagramSink for &mut T {
    fn send_to(&mut self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        (**self).send_to(buf, peer)
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Session state for one gateway peer.
#[derive(Debug)]
pub struct Gateway {
    peer: SocketAddr,
    site: SiteId,
    /// Client id stamped into every outbound header.
    source: u32,
    ring: PacketRing,
    /// Allocated tag slots.
    pub(crate) tag_ids: TagMask,
    tag_labels: [Label; MAX_TAGS],
    /// Number of bulbs carrying each tag id.
    tag_refcounts: [u8; MAX_TAGS],
    /// Bulbs behind this gateway.
    pub(crate) bulbs: BTreeSet<DeviceAddr>,
    pub(crate) last_req_at: Millis,
    pub(crate) next_req_at: Millis,
    pub(crate) last_pkt_at: Millis,
    pub(crate) pending_refresh_req: bool,
    /// Armed refresh deadline.
    pub(crate) refresh_at: Option<Millis>,
}

impl Gateway {
    /// Opens a session discovered at `now`. The first refresh is armed
    /// `min_refresh_interval` later.
    pub fn new(
        peer: SocketAddr,
        site: SiteId,
        source: u32,
        now: Millis,
        min_refresh_interval: Millis,
    ) -> Self {
        Self {
            peer,
            site,
            source,
            ring: PacketRing::new(),
            tag_ids: TagMask::EMPTY,
            tag_labels: [Label::EMPTY; MAX_TAGS],
            tag_refcounts: [0; MAX_TAGS],
            bulbs: BTreeSet::new(),
            last_req_at: now,
            next_req_at: now,
            last_pkt_at: now,
            pending_refresh_req: false,
            refresh_at: Some(now.saturating_add(min_refresh_interval)),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    pub fn tag_ids(&self) -> TagMask {
        self.tag_ids
    }

    pub fn bulbs(&self) -> &BTreeSet<DeviceAddr> {
        &self.bulbs
    }

    pub fn last_pkt_at(&self) -> Millis {
        self.last_pkt_at
    }

    pub fn pending_refresh(&self) -> bool {
        self.pending_refresh_req
    }

    pub fn refresh_deadline(&self) -> Option<Millis> {
        self.refresh_at
    }

    /// Observed round trip: time between the last request written and the
    /// last packet received, or zero if nothing came back yet.
    pub fn latency(&self) -> Millis {
        self.last_pkt_at.saturating_sub(self.last_req_at)
    }

    // ------------------------------------------------------------------------
    // Outbound queue
    // ------------------------------------------------------------------------

    /// Queues a built packet.
    pub fn enqueue(&mut self, packet: &OutboundPacket) -> Result<(), GatewayError> {
        let packet_type = packet
            .packet_type()
            .ok_or(WireError::UnknownPacketType(packet.header.packet_type))?;
        let entry = RingEntry::new(packet_type, packet.encode());
        if self.ring.try_push(entry).is_err() {
            warn!(
                peer = %self.peer,
                packet = %packet_type,
                "dropping packet: gateway queue is full"
            );
            return Err(GatewayError::QueueFull {
                peer: self.peer,
                packet_type,
            });
        }
        debug!(peer = %self.peer, packet = %packet_type, "queued packet");
        Ok(())
    }

    /// Builds a packet for this gateway's site and queues it.
    pub fn send(
        &mut self,
        packet_type: PacketType,
        target: Target,
        payload: Payload,
    ) -> Result<(), GatewayError> {
        let packet =
            OutboundPacket::new(packet_type, target, Some(self.site), self.source, payload)?;
        self.enqueue(&packet)
    }

    /// Asks every bulb on the site for its light state.
    pub fn send_get_all_light_state(&mut self) -> Result<(), GatewayError> {
        self.send(PacketType::GetLightState, Target::Site, Payload::Empty)?;
        self.pending_refresh_req = true;
        Ok(())
    }

    pub fn queued(&self) -> usize {
        self.ring.len()
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.ring.is_empty()
    }

    /// Front of the queue, for inspection.
    pub fn front(&self) -> Option<&RingEntry> {
        self.ring.front()
    }

    /// Writes as much of the queue as the sink accepts.
    ///
    /// Each datagram is sent whole when possible; a short write keeps the
    /// rest at the front of the queue. `WouldBlock` stops and leaves the
    /// queue for the next writable event, `Interrupted` retries, any other
    /// error is returned and the session must be closed.
    pub fn flush<S: DatagramSink + ?Sized>(
        &mut self,
        sink: &mut S,
        now: Millis,
    ) -> Result<(), GatewayError> {
        loop {
            let Some(entry) = self.ring.front_mut() else {
                return Ok(());
            };
            let written = match sink.send_to(entry.remaining(), self.peer) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(GatewayError::Io {
                        peer: self.peer,
                        source,
                    })
                }
            };
            entry.advance(written);
            let done = entry.is_done();

            self.last_req_at = self.next_req_at;
            self.next_req_at = now;

            if done {
                if let Some(sent) = self.ring.pop() {
                    debug!(peer = %self.peer, packet = %sent.packet_type, "sent packet");
                    if sent.packet_type == PacketType::GetLightState {
                        self.pending_refresh_req = false;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Tag slots
    // ------------------------------------------------------------------------

    /// Label stored in a tag slot.
    pub fn tag_label(&self, id: TagId) -> Option<&Label> {
        self.tag_labels.get(id.index())
    }

    pub(crate) fn set_tag_label(&mut self, id: TagId, label: Label) {
        if let Some(slot) = self.tag_labels.get_mut(id.index()) {
            *slot = label;
        }
    }

    /// Id this gateway uses for `label`, if allocated.
    pub fn tag_id_of(&self, label: &Label) -> Option<TagId> {
        self.tag_ids
            .iter()
            .find(|id| self.tag_label(*id) == Some(label))
    }

    pub fn tag_refcount(&self, id: TagId) -> u8 {
        self.tag_refcounts.get(id.index()).copied().unwrap_or(0)
    }

    pub(crate) fn tag_refcount_mut(&mut self, id: TagId) -> Option<&mut u8> {
        self.tag_refcounts.get_mut(id.index())
    }

    /// Labels of every allocated tag in `mask`.
    pub fn tag_labels_of(&self, mask: TagMask) -> Vec<String> {
        (mask & self.tag_ids)
            .iter()
            .filter_map(|id| self.tag_label(id))
            .map(Label::to_string_lossy)
            .collect()
    }
}
