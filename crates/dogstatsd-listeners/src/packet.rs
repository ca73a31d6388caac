// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Received datagrams and the pool their receive buffers come from.
//!
//! A [`Packet`] owns its buffer. Ownership moves by value from the pool to the listener, from
//! the listener to the packet buffer, then to the downstream consumer, which hands it back with
//! [`PacketPool::release`]. Since `release` consumes the packet, a buffer cannot be returned
//! while it is still borrowed, nor returned twice.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A single received datagram.
pub struct Packet {
    buffer: Vec<u8>,
    len: usize,
}

/// An ordered batch of packets, flushed together downstream.
pub type Packets = Vec<Packet>;

impl Packet {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity],
            len: 0,
        }
    }

    /// The bytes received for this datagram.
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Maximum datagram size this packet can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Whole backing buffer, handed to the socket for the next receive.
    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Marks the first `len` bytes of the buffer as this datagram's contents.
    pub(crate) fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buffer.len());
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("capacity", &self.buffer.len())
            .finish()
    }
}

/// Point-in-time view of a [`PacketPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers currently sitting idle in the pool
    pub available: usize,
    /// Buffers ever allocated by the pool, pre-allocated ones included
    pub allocated: u64,
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_retained: usize,
    allocated: AtomicU64,
}

/// Thread-safe pool of fixed-size receive buffers.
///
/// `acquire` never waits on other holders: when the pool is empty a fresh buffer is allocated
/// so the read loop keeps draining the socket. At most `max_retained` idle buffers are kept,
/// extra buffers released past that point are dropped. Reuse order is LIFO.
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

impl PacketPool {
    /// Creates a pool with `initial_buffers` pre-allocated buffers of `buffer_size` bytes that
    /// retains up to twice that many idle buffers.
    #[must_use]
    pub fn new(initial_buffers: usize, buffer_size: usize) -> Self {
        Self::with_max_retained(
            initial_buffers,
            buffer_size,
            initial_buffers.saturating_mul(2),
        )
    }

    /// Creates a pool with `initial_buffers` pre-allocated buffers that keeps at most
    /// `max_retained` idle buffers (never fewer than `initial_buffers`).
    ///
    /// Buffers allocated during a burst are freed when they are released into a pool that
    /// already holds `max_retained` idle buffers, so the pool shrinks back after the burst
    /// instead of keeping its peak size for the lifetime of the listener.
    #[must_use]
    pub fn with_max_retained(
        initial_buffers: usize,
        buffer_size: usize,
        max_retained: usize,
    ) -> Self {
        let max_retained = max_retained.max(initial_buffers);
        let free: Vec<Vec<u8>> = (0..initial_buffers)
            .map(|_| vec![0; buffer_size])
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                buffer_size,
                max_retained,
                allocated: AtomicU64::new(initial_buffers as u64),
            }),
        }
    }

    /// Takes an idle buffer, or allocates one when none is left.
    #[must_use]
    pub fn acquire(&self) -> Packet {
        let reused = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        match reused {
            Some(buffer) => Packet { buffer, len: 0 },
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                Packet::with_capacity(self.inner.buffer_size)
            }
        }
    }

    /// Gives a packet's buffer back for reuse. Callers must be done reading its contents.
    pub fn release(&self, packet: Packet) {
        let Packet { buffer, .. } = packet;
        if buffer.len() != self.inner.buffer_size {
            return;
        }

        let mut free = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.inner.max_retained {
            free.push(buffer);
        }
    }

    /// Releases every packet of a consumed batch.
    pub fn release_all(&self, packets: Packets) {
        for packet in packets {
            self.release(packet);
        }
    }

    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let available = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        PoolStats {
            available,
            allocated: self.inner.allocated.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("max_retained", &self.inner.max_retained)
            .field("stats", &self.stats())
            .finish()
    }
}
