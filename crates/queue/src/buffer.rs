//! Enqueue buffer (spec §4.2, C5): an optional coalescing layer in front of
//! the engine's enqueue path. Mirrors the shape of a classic micro-batch
//! accumulator — flush on size OR time, whichever comes first — retargeted
//! from wire messages onto [`NewMessage`] so a flush becomes a single
//! `enqueue_batch` call.

use std::time::{Duration, Instant};

use duramq_storage::NewMessage;

pub struct EnqueueBuffer {
    buffer: Vec<NewMessage>,
    max_size: usize,
    max_wait: Duration,
    batch_started: Option<Instant>,
}

impl EnqueueBuffer {
    pub fn new(max_size: usize, max_wait: Duration) -> Self {
        Self { buffer: Vec::with_capacity(max_size), max_size, max_wait, batch_started: None }
    }

    /// Accept one message into the buffer. The caller has already minted
    /// its id; this does not write anything to storage.
    pub fn push(&mut self, message: NewMessage) {
        if self.batch_started.is_none() {
            self.batch_started = Some(Instant::now());
        }
        self.buffer.push(message);
    }

    pub fn should_flush(&self) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        if self.buffer.len() >= self.max_size {
            return true;
        }
        self.batch_started.is_some_and(|started| started.elapsed() >= self.max_wait)
    }

    /// Drain the buffer unconditionally, in insertion order (the order
    /// `enqueue_batch` must preserve per the flush contract).
    pub fn flush(&mut self) -> Vec<NewMessage> {
        self.batch_started = None;
        std::mem::take(&mut self.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn msg() -> NewMessage {
        NewMessage {
            id: Uuid::new_v4(),
            queue: "orders".into(),
            message_type: None,
            priority: 0,
            payload: b"{}".to_vec(),
            custom_max_attempts: None,
            custom_ack_timeout_seconds: None,
        }
    }

    #[test]
    fn flushes_on_size_threshold() {
        let mut buf = EnqueueBuffer::new(2, Duration::from_secs(60));
        buf.push(msg());
        assert!(!buf.should_flush());
        buf.push(msg());
        assert!(buf.should_flush());
        assert_eq!(buf.flush().len(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn flushes_on_time_threshold() {
        let mut buf = EnqueueBuffer::new(100, Duration::from_millis(5));
        buf.push(msg());
        std::thread::sleep(Duration::from_millis(10));
        assert!(buf.should_flush());
    }

    #[test]
    fn never_reports_partial_batches_as_ready_below_both_thresholds() {
        let mut buf = EnqueueBuffer::new(10, Duration::from_secs(60));
        buf.push(msg());
        buf.push(msg());
        assert!(!buf.should_flush());
        assert_eq!(buf.len(), 2);
    }
}
