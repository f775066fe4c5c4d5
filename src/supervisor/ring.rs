//! Bounded buffer of recent child output.

use std::collections::VecDeque;

/// Keeps the most recent `capacity` lines, oldest first.
#[derive(Debug, Clone)]
pub struct LogRingBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogRingBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a line, evicting the oldest once full.
    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    /// Copy of the buffered lines in arrival order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_most_recent_lines_in_order() {
        let mut buffer = LogRingBuffer::new(3);
        for line in ["a", "b", "c", "d", "e"] {
            buffer.push(line);
        }
        assert_eq!(buffer.snapshot(), ["c", "d", "e"]);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn partial_buffer_keeps_everything() {
        let mut buffer = LogRingBuffer::new(20);
        buffer.push("Bot is ready");
        buffer.push("Bot disconnected: notEmpty");
        assert_eq!(
            buffer.snapshot(),
            ["Bot is ready", "Bot disconnected: notEmpty"]
        );
    }

    #[test]
    fn clear_empties_the_buffer() {
        let mut buffer = LogRingBuffer::new(2);
        buffer.push("x");
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 2);
    }

    #[test]
    fn zero_capacity_retains_nothing() {
        let mut buffer = LogRingBuffer::new(0);
        buffer.push("dropped");
        assert!(buffer.snapshot().is_empty());
    }
}
