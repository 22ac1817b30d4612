//! Bounded, thread-safe FIFO of readings with lossy eviction.
//!
//! The buffer sits between the device-side reader task (single writer) and
//! any number of concurrent readers (UI snapshots, the recorder's drain).
//! When full, the oldest reading is dropped before the append so the
//! device-side reader never blocks on downstream consumers. Eviction is
//! deliberate: consumers that need zero loss must size the capacity against
//! the peak sample rate and their own drain interval.
//!
//! All operations are lock-protected; critical sections are O(1) except
//! `snapshot`, which copies the current contents.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::model::Reading;

/// Default capacity used by the controller.
pub const DEFAULT_CAPACITY: usize = 10_000;

struct Inner {
    buf: VecDeque<Reading>,
    evicted: u64,
}

/// Bounded lossy FIFO of [`Reading`]s.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl RingBuffer {
    /// Create a buffer holding at most `capacity` readings.
    ///
    /// A zero capacity is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                evicted: 0,
            }),
            capacity,
        }
    }

    /// Append a reading, evicting the oldest first if full. Never blocks
    /// beyond the internal lock.
    pub fn append(&self, reading: Reading) {
        let mut inner = self.inner.lock();
        if inner.buf.len() == self.capacity {
            inner.buf.pop_front();
            inner.evicted += 1;
        }
        inner.buf.push_back(reading);
    }

    /// Copy of the current contents in insertion order.
    pub fn snapshot(&self) -> Vec<Reading> {
        let inner = self.inner.lock();
        inner.buf.iter().cloned().collect()
    }

    /// The most recent reading, if any.
    pub fn latest(&self) -> Option<Reading> {
        let inner = self.inner.lock();
        inner.buf.back().cloned()
    }

    /// Remove all readings.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.buf.len();
        inner.buf.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "ring buffer cleared");
        }
    }

    /// Number of readings currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    /// True when no readings are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed capacity set at construction.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total readings evicted since construction. Diagnostic only; eviction
    /// itself is silent.
    pub fn evicted_count(&self) -> u64 {
        self.inner.lock().evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SensorMode;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::thread;

    fn reading(n: i64) -> Reading {
        Reading {
            timestamp: Utc.timestamp_opt(1_700_000_000 + n, 0).unwrap(),
            sensor_id: "Q1".into(),
            mode: SensorMode::Freerun,
            value: n as f64,
            temp_c: None,
            vin: None,
        }
    }

    #[test]
    fn append_and_snapshot_preserve_order() {
        let rb = RingBuffer::new(8);
        for n in 0..5 {
            rb.append(reading(n));
        }
        let snap = rb.snapshot();
        assert_eq!(snap.len(), 5);
        assert_eq!(snap[0].value, 0.0);
        assert_eq!(snap[4].value, 4.0);
        assert_eq!(rb.latest().unwrap().value, 4.0);
    }

    #[test]
    fn full_buffer_evicts_oldest() {
        let rb = RingBuffer::new(3);
        for n in 0..5 {
            rb.append(reading(n));
        }
        let snap = rb.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].value, 2.0);
        assert_eq!(snap[2].value, 4.0);
        assert_eq!(rb.evicted_count(), 2);
    }

    #[test]
    fn clear_empties_but_keeps_capacity() {
        let rb = RingBuffer::new(4);
        rb.append(reading(1));
        rb.clear();
        assert!(rb.is_empty());
        assert_eq!(rb.capacity(), 4);
        assert!(rb.latest().is_none());
    }

    #[test]
    fn concurrent_snapshots_while_writing() {
        let rb = Arc::new(RingBuffer::new(256));

        let writer = {
            let rb = Arc::clone(&rb);
            thread::spawn(move || {
                for n in 0..1000 {
                    rb.append(reading(n));
                }
            })
        };
        let reader = {
            let rb = Arc::clone(&rb);
            thread::spawn(move || {
                for _ in 0..200 {
                    let snap = rb.snapshot();
                    // Snapshots always observe readings in insertion order.
                    for pair in snap.windows(2) {
                        assert!(pair[0].value < pair[1].value);
                    }
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(rb.len(), 256);
    }
}
