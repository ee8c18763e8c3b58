use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use tokio::sync::Notify;
use write_lib::DataChunk;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(DataChunk),
    Flush,
    EndOfStream,
}

impl Packet {
    /// Bytes this packet counts against the flow-control budget.
    pub fn buffered_len(&self) -> u64 {
        match self {
            Packet::Data(chunk) => chunk.len(),
            Packet::Flush | Packet::EndOfStream => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub high: u64,
    pub low: u64,
}

impl Watermarks {
    pub fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }
}

#[derive(Default)]
struct QueueInner {
    items: VecDeque<Packet>,
    closed: bool,
    interrupted: bool,
}

/// Ordered hand-off between the decode path (single producer) and one packet
/// writer (single consumer).
///
/// Buffered bytes cover every data packet from `push` until the consumer calls
/// `release` after the bytes reached storage, so a packet being appended still
/// counts against the budget. Reads pause once the count exceeds the high
/// watermark and resume only when it has drained to the low watermark.
pub struct PacketQueue {
    inner: Mutex<QueueInner>,
    buffered: AtomicU64,
    reads_paused: AtomicBool,
    watermarks: Watermarks,
    data_ready: Notify,
    reads_resumed: Notify,
}

impl PacketQueue {
    pub fn new(watermarks: Watermarks) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            buffered: AtomicU64::new(0),
            reads_paused: AtomicBool::new(false),
            watermarks,
            data_ready: Notify::new(),
            reads_resumed: Notify::new(),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn watermarks(&self) -> Watermarks {
        self.watermarks
    }

    /// Returns false when the queue is already closed; the packet is dropped.
    pub fn push(&self, packet: Packet) -> bool {
        let len = packet.buffered_len();
        {
            let mut inner = self.lock_inner();
            if inner.closed {
                return false;
            }
            inner.items.push_back(packet);
            let buffered = self.buffered.fetch_add(len, Ordering::SeqCst) + len;
            if buffered > self.watermarks.high && !self.reads_paused.swap(true, Ordering::SeqCst)
            {
                debug!(
                    "PacketQueue: pause reads, buffered {} > high watermark {}",
                    buffered, self.watermarks.high
                );
            }
        }
        self.data_ready.notify_one();
        true
    }

    /// Waits for the next packet. Returns `None` when woken by `interrupt` or
    /// `close` with nothing queued; the caller re-checks its terminal signal.
    pub async fn next(&self) -> Option<Packet> {
        loop {
            {
                let mut inner = self.lock_inner();
                if let Some(packet) = inner.items.pop_front() {
                    return Some(packet);
                }
                if inner.interrupted || inner.closed {
                    inner.interrupted = false;
                    return None;
                }
            }
            self.data_ready.notified().await;
        }
    }

    /// Wakes the consumer so it observes a terminal signal at the next packet
    /// boundary.
    pub fn interrupt(&self) {
        self.lock_inner().interrupted = true;
        self.data_ready.notify_one();
    }

    /// Called by the consumer once `len` bytes of a popped packet are settled.
    pub fn release(&self, len: u64) {
        if len == 0 {
            return;
        }
        let buffered = self.sub_buffered(len);
        if buffered <= self.watermarks.low && self.reads_paused.swap(false, Ordering::SeqCst) {
            debug!(
                "PacketQueue: resume reads, buffered {} <= low watermark {}",
                buffered, self.watermarks.low
            );
            self.reads_resumed.notify_waiters();
        }
    }

    /// Rejects further pushes and discards whatever is still queued.
    /// Returns the number of discarded packets.
    pub fn close(&self) -> usize {
        let discarded: Vec<Packet> = {
            let mut inner = self.lock_inner();
            inner.closed = true;
            inner.items.drain(..).collect()
        };
        let bytes: u64 = discarded.iter().map(Packet::buffered_len).sum();
        self.sub_buffered(bytes);
        self.reads_paused.store(false, Ordering::SeqCst);
        self.reads_resumed.notify_waiters();
        self.data_ready.notify_one();
        discarded.len()
    }

    fn sub_buffered(&self, len: u64) -> u64 {
        let prev = self
            .buffered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(len))
            })
            .unwrap_or_else(|v| v);
        prev.saturating_sub(len)
    }

    pub fn is_closed(&self) -> bool {
        self.lock_inner().closed
    }

    pub fn len(&self) -> usize {
        self.lock_inner().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }

    pub fn is_reads_paused(&self) -> bool {
        self.reads_paused.load(Ordering::SeqCst)
    }

    /// Resolves once reads are no longer paused.
    pub async fn wait_reads_resumed(&self) {
        loop {
            let notified = self.reads_resumed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_reads_paused() {
                return;
            }
            notified.await;
        }
    }
}
