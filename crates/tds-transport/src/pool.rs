//! Bounded cache of reusable packet buffers.

use std::collections::VecDeque;

use crate::error::Result;
use crate::packet::Packet;

/// Free-list of packet buffers shared by every session on a connection.
///
/// The list never holds more than `cap` buffers; anything released past
/// that is dropped.
#[derive(Debug)]
pub struct PacketPool {
    free: VecDeque<Packet>,
    cap: usize,
}

impl PacketPool {
    /// Create an empty pool that caches at most `cap` buffers.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            free: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Take a buffer of at least `min_capacity` bytes.
    ///
    /// Cached buffers that are too small are discarded on the way; a fresh
    /// buffer of exactly `min_capacity` is allocated if none fits.
    pub fn acquire(&mut self, min_capacity: usize) -> Result<Packet> {
        while let Some(mut packet) = self.free.pop_front() {
            if packet.capacity() >= min_capacity {
                packet.reset();
                return Ok(packet);
            }
        }
        Packet::allocate(min_capacity)
    }

    /// Return one buffer to the pool.
    pub fn release(&mut self, packet: Packet) {
        self.release_all(std::iter::once(packet));
    }

    /// Return a chain of buffers, keeping their order at the front of the
    /// free-list.
    pub fn release_all(&mut self, chain: impl IntoIterator<Item = Packet>) {
        let room = self.cap.saturating_sub(self.free.len());
        let kept: Vec<Packet> = chain.into_iter().take(room).collect();
        for mut packet in kept.into_iter().rev() {
            packet.reset();
            self.free.push_front(packet);
        }
    }

    /// Grow `packet` to `capacity` bytes, preserving its contents.
    pub fn grow(&mut self, packet: &mut Packet, capacity: usize) -> Result<()> {
        packet.grow(capacity)
    }

    /// Number of cached buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.free.len()
    }

    /// Whether no buffers are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Maximum number of cached buffers.
    #[must_use]
    pub fn cap(&self) -> usize {
        self.cap
    }
}
