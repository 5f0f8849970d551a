//! # Outbound Queue
//!
//! Strict FIFO of framed messages awaiting transmission.
//!
//! The message currently being written lives in a dedicated in-flight slot,
//! separate from the backlog. It leaves the slot only when its write has
//! completed, so at most one write per connection can ever be outstanding
//! and its buffer outlives the asynchronous write that references it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

/// A framed message plus its enqueue / issue / completion timestamps.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    bytes: Bytes,
    enqueued: Instant,
    issued: Option<Instant>,
}

impl PendingMessage {
    pub fn new(bytes: Bytes, enqueued: Instant) -> Self {
        Self {
            bytes,
            enqueued,
            issued: None,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Latencies of one completed write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTiming {
    pub enqueued: Instant,
    pub issued: Instant,
    pub completed: Instant,
}

impl WriteTiming {
    /// Time spent waiting in the queue (issue - enqueue)
    pub fn queue_delay(&self) -> Duration {
        self.issued.saturating_duration_since(self.enqueued)
    }

    /// Time spent in the asynchronous write (complete - issue)
    pub fn write_delay(&self) -> Duration {
        self.completed.saturating_duration_since(self.issued)
    }
}

#[derive(Debug, Default)]
pub struct OutboundQueue {
    in_flight: Option<PendingMessage>,
    backlog: VecDeque<PendingMessage>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a framed message to the tail
    pub fn push(&mut self, bytes: Bytes, now: Instant) {
        self.backlog.push_back(PendingMessage::new(bytes, now));
    }

    /// Move the head of the backlog into the in-flight slot and return the
    /// bytes to write.
    ///
    /// Returns `None` when the backlog is empty or a write is already in flight.
    pub fn begin_next(&mut self, now: Instant) -> Option<Bytes> {
        if self.in_flight.is_some() {
            return None;
        }
        let mut next = self.backlog.pop_front()?;
        next.issued = Some(now);
        let bytes = next.bytes.clone();
        self.in_flight = Some(next);
        Some(bytes)
    }

    /// Release the in-flight message once its write has completed.
    pub fn complete(&mut self, now: Instant) -> Option<WriteTiming> {
        let done = self.in_flight.take()?;
        let issued = done.issued.unwrap_or(done.enqueued);
        Some(WriteTiming {
            enqueued: done.enqueued,
            issued,
            completed: now,
        })
    }

    pub fn in_flight(&self) -> Option<&PendingMessage> {
        self.in_flight.as_ref()
    }

    /// Messages not yet handed to the writer
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Messages queued or in flight
    pub fn len(&self) -> usize {
        self.backlog.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_none() && self.backlog.is_empty()
    }

    /// Drop every message that has not been issued yet
    pub fn discard_backlog(&mut self) -> usize {
        let n = self.backlog.len();
        self.backlog.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_with_single_in_flight_slot() {
        let t0 = Instant::now();
        let mut queue = OutboundQueue::new();
        queue.push(Bytes::from_static(b"alpha"), t0);
        queue.push(Bytes::from_static(b"beta"), t0);
        queue.push(Bytes::from_static(b"gamma"), t0);
        assert_eq!(queue.len(), 3);

        let first = queue.begin_next(t0).unwrap();
        assert_eq!(&first[..], b"alpha");
        // B cannot start while A is still being written
        assert!(queue.begin_next(t0).is_none());
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.backlog_len(), 2);

        queue.complete(t0).unwrap();
        assert_eq!(&queue.begin_next(t0).unwrap()[..], b"beta");
        queue.complete(t0).unwrap();
        assert_eq!(&queue.begin_next(t0).unwrap()[..], b"gamma");
        queue.complete(t0).unwrap();

        assert!(queue.is_empty());
        assert!(queue.begin_next(t0).is_none());
        assert!(queue.complete(t0).is_none());
    }

    #[test]
    fn test_write_timing_delays() {
        let t0 = Instant::now();
        let mut queue = OutboundQueue::new();
        queue.push(Bytes::from_static(b"a"), t0);
        queue.push(Bytes::from_static(b"b"), t0 + Duration::from_millis(1));

        queue.begin_next(t0 + Duration::from_millis(2));
        let a = queue.complete(t0 + Duration::from_millis(5)).unwrap();
        assert_eq!(a.queue_delay(), Duration::from_millis(2));
        assert_eq!(a.write_delay(), Duration::from_millis(3));

        queue.begin_next(t0 + Duration::from_millis(5));
        let b = queue.complete(t0 + Duration::from_millis(6)).unwrap();
        assert_eq!(b.queue_delay(), Duration::from_millis(4));
        assert!(b.issued >= a.completed);
    }

    #[test]
    fn test_discard_keeps_in_flight() {
        let t0 = Instant::now();
        let mut queue = OutboundQueue::new();
        queue.push(Bytes::from_static(b"a"), t0);
        queue.push(Bytes::from_static(b"b"), t0);
        queue.begin_next(t0);

        assert_eq!(queue.discard_backlog(), 1);
        assert_eq!(queue.in_flight().map(PendingMessage::len), Some(1));
        assert_eq!(queue.len(), 1);
    }
}
