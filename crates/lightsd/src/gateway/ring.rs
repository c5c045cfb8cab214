//! Bounded outbound packet queue.
//!
//! Fixed capacity, head/tail bookkeeping with an explicit full flag so that a
//! full ring and an empty ring can be told apart. Pushing onto a full ring
//! leaves the queued entries untouched and hands the rejected entry back.

use lifx_protocol::PacketType;

/// Number of packets a gateway can have in flight.
pub const RING_CAPACITY: usize = 16;

/// One queued packet and how much of it was already written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingEntry {
    pub packet_type: PacketType,
    bytes: Vec<u8>,
    written: usize,
}

impl RingEntry {
    pub fn new(packet_type: PacketType, bytes: Vec<u8>) -> Self {
        Self {
            packet_type,
            bytes,
            written: 0,
        }
    }

    /// Bytes still to be written.
    pub fn remaining(&self) -> &[u8] {
        self.bytes.get(self.written..).unwrap_or(&[])
    }

    /// Records a (possibly partial) write.
    pub fn advance(&mut self, n: usize) {
        self.written = self.written.saturating_add(n).min(self.bytes.len());
    }

    pub fn is_done(&self) -> bool {
        self.written >= self.bytes.len()
    }

    /// Size of what is left to send.
    pub fn size(&self) -> usize {
        self.bytes.len() - self.written
    }
}

/// Fixed-capacity FIFO of outbound packets.
#[derive(Debug)]
pub struct PacketRing {
    slots: [Option<RingEntry>; RING_CAPACITY],
    /// Next slot to write.
    head: usize,
    /// Next slot to send.
    tail: usize,
    full: bool,
}

impl Default for PacketRing {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketRing {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            head: 0,
            tail: 0,
            full: false,
        }
    }

    /// Appends an entry, or returns it if the ring is full.
    pub fn try_push(&mut self, entry: RingEntry) -> Result<(), RingEntry> {
        if self.full {
            return Err(entry);
        }
        let Some(slot) = self.slots.get_mut(self.head) else {
            return Err(entry);
        };
        *slot = Some(entry);
        self.head = (self.head + 1) % RING_CAPACITY;
        self.full = self.head == self.tail;
        Ok(())
    }

    /// Oldest entry, the next one to send.
    pub fn front(&self) -> Option<&RingEntry> {
        self.slots.get(self.tail).and_then(Option::as_ref)
    }

    pub fn front_mut(&mut self) -> Option<&mut RingEntry> {
        self.slots.get_mut(self.tail).and_then(Option::as_mut)
    }

    /// Removes and returns the oldest entry.
    pub fn pop(&mut self) -> Option<RingEntry> {
        let entry = self.slots.get_mut(self.tail).and_then(Option::take)?;
        self.tail = (self.tail + 1) % RING_CAPACITY;
        self.full = false;
        Some(entry)
    }

    pub fn len(&self) -> usize {
        if self.full {
            RING_CAPACITY
        } else {
            (self.head + RING_CAPACITY - self.tail) % RING_CAPACITY
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.full && self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.full
    }
}
