use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// An upstream message as kept in the history buffer.
///
/// Serialises as `{"timestamp": <ms>, "data": <payload>}`, the element shape
/// of the `history` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedMessage {
    /// Arrival time, Unix epoch milliseconds
    pub timestamp: i64,
    pub data: Value,
}

/// Bounded FIFO of recent upstream messages, replayed to joining viewers.
#[derive(Debug)]
pub struct HistoryBuffer {
    entries: VecDeque<BufferedMessage>,
    capacity: usize,
}

impl HistoryBuffer {
    /// A capacity of zero is clamped to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append with the current wall-clock timestamp, evicting the oldest
    /// entry once over capacity. Returns the stored entry.
    pub fn append(&mut self, data: Value) -> &BufferedMessage {
        self.append_at(chrono::Utc::now().timestamp_millis(), data)
    }

    pub(crate) fn append_at(&mut self, timestamp: i64, data: Value) -> &BufferedMessage {
        self.entries.push_back(BufferedMessage { timestamp, data });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        // Non-empty: we just pushed and capacity >= 1
        &self.entries[self.entries.len() - 1]
    }

    /// Buffered entries, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BufferedMessage> {
        self.entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payloads(buffer: &HistoryBuffer) -> Vec<Value> {
        buffer.snapshot().into_iter().map(|m| m.data).collect()
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut buffer = HistoryBuffer::new(3);
        for name in ["A", "B", "C", "D"] {
            buffer.append(json!(name));
        }
        assert_eq!(payloads(&buffer), vec![json!("B"), json!("C"), json!("D")]);
    }

    #[test]
    fn test_snapshot_does_not_mutate() {
        let mut buffer = HistoryBuffer::new(5);
        buffer.append(json!(1));
        buffer.append(json!(2));

        let first = buffer.snapshot();
        let second = buffer.snapshot();
        assert_eq!(first, second);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_keeps_most_recent_window_for_any_length() {
        for capacity in 1..=6 {
            for n in 0..=15_i64 {
                let mut buffer = HistoryBuffer::new(capacity);
                for i in 0..n {
                    buffer.append_at(i, json!(i));
                }

                let snapshot = buffer.snapshot();
                assert!(snapshot.len() <= capacity);

                let expected_len = usize::try_from(n).unwrap().min(capacity);
                assert_eq!(snapshot.len(), expected_len);

                let expected: Vec<i64> = (n - expected_len as i64..n).collect();
                let actual: Vec<i64> = snapshot.iter().map(|m| m.timestamp).collect();
                assert_eq!(actual, expected, "capacity={capacity} n={n}");
            }
        }
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut buffer = HistoryBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        buffer.append(json!("x"));
        buffer.append(json!("y"));
        assert_eq!(payloads(&buffer), vec![json!("y")]);
    }

    #[test]
    fn test_append_stamps_current_time() {
        let before = chrono::Utc::now().timestamp_millis();
        let mut buffer = HistoryBuffer::new(2);
        let stored = buffer.append(json!({"v": 1})).clone();
        let after = chrono::Utc::now().timestamp_millis();

        assert!(stored.timestamp >= before && stored.timestamp <= after);
        assert_eq!(stored.data, json!({"v": 1}));
    }
}
