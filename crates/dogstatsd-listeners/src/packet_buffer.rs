// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching of received packets before they reach the DogStatsD intake channel.
//!
//! Packets are appended in receive order and flushed as one batch when either:
//! 1. the batch holds `buffer_size` packets (flushed inside the `append` that filled it), or
//! 2. `flush_timeout` has elapsed since the batch received its first packet.
//!
//! Both paths, and `close`, go through a single async mutex so a batch is never flushed while a
//! packet is being added to it, and never flushed twice. The flush awaits the bounded output
//! channel while holding that mutex: a slow consumer slows down `append` instead of losing data.

use crate::packet::{Packet, Packets};
use std::mem;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

// Upper bound on the capacity reserved up front for a batch
const MAX_PREALLOCATED_PACKETS: usize = 4096;

struct BufferState {
    packets: Packets,
    // Set when the current batch received its first packet, cleared by every flush.
    started_at: Option<Instant>,
    closed: bool,
}

struct Inner {
    state: Mutex<BufferState>,
    batch_started: Notify,
    output: mpsc::Sender<Packets>,
    buffer_size: usize,
    flush_timeout: Duration,
}

impl Inner {
    fn new_batch(&self) -> Packets {
        Vec::with_capacity(self.buffer_size.min(MAX_PREALLOCATED_PACKETS))
    }

    async fn flush_locked(&self, state: &mut BufferState) {
        state.started_at = None;
        if state.packets.is_empty() {
            return;
        }

        let batch = mem::replace(&mut state.packets, self.new_batch());
        let count = batch.len();
        if let Err(e) = self.output.send(batch).await {
            error!(
                "dogstatsd-udp: packet output channel closed, dropping {} packets",
                e.0.len()
            );
            return;
        }
        trace!("dogstatsd-udp: flushed {} packets", count);
    }
}

/// Accumulates packets into bounded batches and forwards them on an output channel.
pub struct PacketBuffer {
    inner: Arc<Inner>,
    cancel_token: CancellationToken,
}

impl PacketBuffer {
    /// Creates the buffer and starts its flush timer task.
    ///
    /// Must be called from within a Tokio runtime. `buffer_size` is clamped to at least 1.
    #[must_use]
    pub fn new(
        buffer_size: usize,
        flush_timeout: Duration,
        output: mpsc::Sender<Packets>,
    ) -> Self {
        let buffer_size = buffer_size.max(1);
        let inner = Arc::new(Inner {
            state: Mutex::new(BufferState {
                packets: Vec::with_capacity(buffer_size.min(MAX_PREALLOCATED_PACKETS)),
                started_at: None,
                closed: false,
            }),
            batch_started: Notify::new(),
            output,
            buffer_size,
            flush_timeout,
        });
        let cancel_token = CancellationToken::new();

        tokio::spawn(run_flush_timer(Arc::clone(&inner), cancel_token.clone()));

        Self {
            inner,
            cancel_token,
        }
    }

    /// Adds a packet to the current batch, flushing it if this packet fills it.
    ///
    /// Packets appended after [`PacketBuffer::close`] are dropped.
    pub async fn append(&self, packet: Packet) {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            trace!("dogstatsd-udp: packet buffer closed, dropping packet");
            return;
        }

        if state.packets.is_empty() {
            state.started_at = Some(Instant::now());
            self.inner.batch_started.notify_one();
        }
        state.packets.push(packet);

        if state.packets.len() >= self.inner.buffer_size {
            self.inner.flush_locked(&mut state).await;
        }
    }

    /// Flushes the pending batch, if any, and stops accepting packets. Later calls are no-ops.
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return;
        }
        self.inner.flush_locked(&mut state).await;
        state.closed = true;
        drop(state);

        self.cancel_token.cancel();
        debug!("dogstatsd-udp: packet buffer closed");
    }

    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    #[must_use]
    pub fn flush_timeout(&self) -> Duration {
        self.inner.flush_timeout
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Flushes batches that have waited `flush_timeout` since their first packet.
///
/// Idle until `append` starts a batch. The batch start time is re-read under the lock after
/// every sleep: a batch already flushed for being full leaves the timer idle again, and a
/// younger batch gets its own full interval.
async fn run_flush_timer(inner: Arc<Inner>, cancel_token: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            () = inner.batch_started.notified() => {}
        }

        loop {
            let deadline = {
                let mut state = inner.state.lock().await;
                let Some(started_at) = state.started_at else {
                    break;
                };
                let deadline = started_at + inner.flush_timeout;
                if Instant::now() >= deadline {
                    inner.flush_locked(&mut state).await;
                    break;
                }
                deadline
            };

            tokio::select! {
                () = cancel_token.cancelled() => return,
                () = sleep_until(deadline) => {}
            }
        }
    }
    trace!("dogstatsd-udp: packet buffer flush timer stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::packet::PacketPool;
    use proptest::prelude::*;
    use tokio::time::{advance, timeout};
    use tracing_test::traced_test;

    fn packet(pool: &PacketPool, contents: &[u8]) -> Packet {
        let mut packet = pool.acquire();
        packet.buffer_mut()[..contents.len()].copy_from_slice(contents);
        packet.set_len(contents.len());
        packet
    }

    fn contents(batch: &Packets) -> Vec<Vec<u8>> {
        batch.iter().map(|p| p.contents().to_vec()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_is_flushed_by_append() {
        let pool = PacketPool::new(4, 64);
        let (tx, mut rx) = mpsc::channel(4);
        let buffer = PacketBuffer::new(3, Duration::from_secs(10), tx);

        buffer.append(packet(&pool, b"a:1|c")).await;
        buffer.append(packet(&pool, b"b:1|c")).await;
        assert!(rx.try_recv().is_err());

        buffer.append(packet(&pool, b"c:1|c")).await;
        let batch = rx.try_recv().unwrap();
        assert_eq!(
            contents(&batch),
            vec![b"a:1|c".to_vec(), b"b:1|c".to_vec(), b"c:1|c".to_vec()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_is_flushed_after_timeout() {
        let pool = PacketPool::new(4, 64);
        let (tx, mut rx) = mpsc::channel(4);
        let buffer = PacketBuffer::new(10, Duration::from_millis(100), tx);
        let start = Instant::now();

        for name in [b"m1:1|c", b"m2:1|c", b"m3:1|c"] {
            buffer.append(packet(&pool, name)).await;
        }

        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());

        let batch = timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("partial batch was not flushed")
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_is_inert_between_batches() {
        let pool = PacketPool::new(4, 64);
        let (tx, mut rx) = mpsc::channel(4);
        let buffer = PacketBuffer::new(10, Duration::from_millis(100), tx);

        buffer.append(packet(&pool, b"a:1|c")).await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.len(), 1);

        // nothing pending: no empty batches are produced
        assert!(timeout(Duration::from_secs(5), rx.recv()).await.is_err());

        buffer.append(packet(&pool, b"b:1|c")).await;
        let start = Instant::now();
        let second = rx.recv().await.unwrap();
        assert_eq!(contents(&second), vec![b"b:1|c".to_vec()]);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_younger_batch_gets_full_interval() {
        let pool = PacketPool::new(4, 64);
        let (tx, mut rx) = mpsc::channel(4);
        let buffer = PacketBuffer::new(2, Duration::from_millis(100), tx);
        let start = Instant::now();

        buffer.append(packet(&pool, b"a:1|c")).await;
        advance(Duration::from_millis(60)).await;
        buffer.append(packet(&pool, b"b:1|c")).await;
        assert_eq!(rx.try_recv().unwrap().len(), 2);

        advance(Duration::from_millis(20)).await;
        buffer.append(packet(&pool, b"c:1|c")).await;

        let batch = rx.recv().await.unwrap();
        assert_eq!(contents(&batch), vec![b"c:1|c".to_vec()]);
        assert!(start.elapsed() >= Duration::from_millis(180));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_output_channel_blocks_append_without_dropping() {
        let pool = PacketPool::new(4, 64);
        let (tx, mut rx) = mpsc::channel(1);
        let buffer = Arc::new(PacketBuffer::new(1, Duration::from_secs(10), tx));

        buffer.append(packet(&pool, b"first:1|c")).await;

        let blocked = tokio::spawn({
            let buffer = Arc::clone(&buffer);
            let packet = packet(&pool, b"second:1|c");
            async move { buffer.append(packet).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!blocked.is_finished());

        let first = rx.recv().await.unwrap();
        timeout(Duration::from_secs(1), blocked)
            .await
            .expect("append stayed blocked after the channel drained")
            .unwrap();
        let second = rx.recv().await.unwrap();

        assert_eq!(contents(&first), vec![b"first:1|c".to_vec()]);
        assert_eq!(contents(&second), vec![b"second:1|c".to_vec()]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_huge_batch_size_does_not_preallocate() {
        let (tx, _rx) = mpsc::channel(1);
        let buffer = PacketBuffer::new(usize::MAX, Duration::from_secs(1), tx);
        assert_eq!(buffer.buffer_size(), usize::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_pending_and_drops_later_packets() {
        let pool = PacketPool::new(4, 64);
        let (tx, mut rx) = mpsc::channel(4);
        let buffer = PacketBuffer::new(10, Duration::from_secs(60), tx);

        buffer.append(packet(&pool, b"a:1|c")).await;
        buffer.append(packet(&pool, b"b:1|c")).await;
        buffer.close().await;

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 2);

        buffer.append(packet(&pool, b"late:1|c")).await;
        buffer.close().await;
        assert!(timeout(Duration::from_secs(120), rx.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_with_empty_batch_sends_nothing() {
        let (tx, mut rx) = mpsc::channel(4);
        let buffer = PacketBuffer::new(10, Duration::from_millis(10), tx);
        buffer.close().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_closed_consumer_is_logged() {
        let pool = PacketPool::new(1, 64);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let buffer = PacketBuffer::new(1, Duration::from_secs(10), tx);

        buffer.append(packet(&pool, b"a:1|c")).await;
        assert!(logs_contain("packet output channel closed, dropping 1 packets"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_appends_and_timer_flushes_keep_order() {
        let pool = PacketPool::new(16, 16);
        let (tx, mut rx) = mpsc::channel(1024);
        let buffer = Arc::new(PacketBuffer::new(7, Duration::from_millis(1), tx));

        let producer = {
            let buffer = Arc::clone(&buffer);
            let pool = pool.clone();
            tokio::spawn(async move {
                for i in 0u32..500 {
                    buffer.append(packet(&pool, &i.to_be_bytes())).await;
                    if i % 50 == 0 {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                }
                buffer.close().await;
            })
        };
        producer.await.unwrap();
        drop(buffer);

        let mut received = Vec::new();
        while let Some(batch) = rx.recv().await {
            assert!(!batch.is_empty());
            assert!(batch.len() <= 7);
            for p in &batch {
                received.push(u32::from_be_bytes(p.contents().try_into().unwrap()));
            }
            pool.release_all(batch);
        }
        assert_eq!(received, (0u32..500).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn prop_batches_are_capped_and_ordered(count in 0usize..200, buffer_size in 1usize..20) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let (received, batch_lens) = runtime.block_on(async move {
                let pool = PacketPool::new(buffer_size, 8);
                let (tx, mut rx) = mpsc::channel(count + 1);
                let buffer = PacketBuffer::new(buffer_size, Duration::from_secs(3600), tx);

                for i in 0..count {
                    buffer.append(packet(&pool, &(i as u64).to_be_bytes())).await;
                }
                buffer.close().await;
                drop(buffer);

                let mut received = Vec::new();
                let mut batch_lens = Vec::new();
                while let Some(batch) = rx.recv().await {
                    batch_lens.push(batch.len());
                    for p in &batch {
                        received.push(u64::from_be_bytes(p.contents().try_into().unwrap()) as usize);
                    }
                }
                (received, batch_lens)
            });

            prop_assert_eq!(received, (0..count).collect::<Vec<_>>());
            prop_assert!(batch_lens.iter().all(|len| *len >= 1 && *len <= buffer_size));
            let full = batch_lens.iter().filter(|len| **len == buffer_size).count();
            prop_assert_eq!(full, count / buffer_size);
        }
    }
}
