use std::collections::VecDeque;
use std::sync::Mutex;

use crate::log::LogEntry;

/// Fixed-capacity FIFO of log entries. Appending at capacity evicts the
/// oldest entry; sequence numbers keep climbing across evictions and clears
/// so `since` stays meaningful for pollers.
pub struct LogBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: VecDeque<LogEntry>,
    next_seq: u64,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                next_seq: 1,
            }),
        }
    }

    /// Assigns the next sequence number and appends. Never fails.
    pub fn append(&self, mut entry: LogEntry) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        entry.seq = inner.next_seq;
        inner.next_seq += 1;
        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
        }
        let seq = entry.seq;
        inner.entries.push_back(entry);
        seq
    }

    /// Stable copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        inner.entries.iter().cloned().collect()
    }

    /// Entries strictly newer than `seq`, oldest first.
    pub fn since(&self, seq: u64) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .filter(|entry| entry.seq > seq)
            .cloned()
            .collect()
    }

    /// Empties the buffer. Sequence numbers do not reset.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogKind;
    use serde_json::json;

    fn entry(n: usize) -> LogEntry {
        LogEntry::new("sess-t", LogKind::CustomLog, json!({ "n": n }), None, 1024)
    }

    #[test_timeout::timeout]
    fn capacity_bound_keeps_last_n_in_order() {
        let buffer = LogBuffer::new(1000);
        for n in 1..=1500 {
            buffer.append(entry(n));
        }
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 1000);
        assert_eq!(snapshot.first().unwrap().payload, json!({ "n": 501 }));
        assert_eq!(snapshot.last().unwrap().payload, json!({ "n": 1500 }));
    }

    #[test_timeout::timeout]
    fn sequence_numbers_are_strictly_increasing() {
        let buffer = LogBuffer::new(4);
        let mut last = 0;
        for n in 0..32 {
            let seq = buffer.append(entry(n));
            assert!(seq > last);
            last = seq;
        }
    }

    #[test_timeout::timeout]
    fn clear_does_not_reset_sequences() {
        let buffer = LogBuffer::new(8);
        for n in 0..5 {
            buffer.append(entry(n));
        }
        buffer.clear();
        assert!(buffer.is_empty());
        let seq = buffer.append(entry(99));
        assert_eq!(seq, 6);
    }

    #[test_timeout::timeout]
    fn since_returns_only_newer_entries_across_clears() {
        let buffer = LogBuffer::new(8);
        for n in 0..4 {
            buffer.append(entry(n));
        }
        buffer.clear();
        buffer.append(entry(100));
        let newer = buffer.since(4);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].seq, 5);
        assert!(buffer.since(5).is_empty());
    }
}
