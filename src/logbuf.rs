//! Bounded, line-oriented capture of a process's combined output.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default number of lines retained per app
pub const DEFAULT_MAX_LINES: usize = 1000;

/// Ring buffer of log lines with oldest-first eviction.
///
/// Written by a single draining task and read by any number of request
/// handlers; one lock covers both paths.
#[derive(Debug)]
pub struct LineBuffer {
    lines: Mutex<VecDeque<String>>,
    max_lines: usize,
}

impl LineBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(max_lines.min(DEFAULT_MAX_LINES))),
            max_lines,
        }
    }

    /// Append text, one buffered unit per line.
    ///
    /// A single trailing newline terminates the last line rather than
    /// starting an empty one.
    pub fn append(&self, text: &str) {
        if self.max_lines == 0 {
            return;
        }
        let text = text.strip_suffix('\n').unwrap_or(text);
        let mut lines = self.lines.lock();
        for line in text.split('\n') {
            if lines.len() >= self.max_lines {
                lines.pop_front();
            }
            lines.push_back(line.trim_end_matches('\r').to_string());
        }
    }

    /// Full ordered contents, every line newline-terminated
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock();
        let mut out = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines.iter() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_lines
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_buffer() {
        let buf = LineBuffer::default();
        assert!(buf.is_empty());
        assert_eq!(buf.snapshot(), "");
        assert_eq!(buf.capacity(), 1000);
    }

    #[test]
    fn test_append_single_lines() {
        let buf = LineBuffer::new(10);
        buf.append("first");
        buf.append("second");
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.snapshot(), "first\nsecond\n");
    }

    #[test]
    fn test_multiline_append_splits_units() {
        let buf = LineBuffer::new(10);
        buf.append("a\nb\nc");
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.snapshot(), "a\nb\nc\n");
    }

    #[test]
    fn test_trailing_newline_does_not_add_empty_line() {
        let buf = LineBuffer::new(10);
        buf.append("line\n");
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.snapshot(), "line\n");
    }

    #[test]
    fn test_evicts_oldest_first() {
        let buf = LineBuffer::new(3);
        for i in 0..5 {
            buf.append(&format!("line {}", i));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.snapshot(), "line 2\nline 3\nline 4\n");
    }

    #[test]
    fn test_multiline_append_evicts_per_line() {
        let buf = LineBuffer::new(3);
        buf.append("old 1\nold 2\nold 3");
        buf.append("new 1\nnew 2");
        assert_eq!(buf.snapshot(), "old 3\nnew 1\nnew 2\n");
    }

    #[test]
    fn test_retains_most_recent_n_over_many_appends() {
        let cap = 7;
        let buf = LineBuffer::new(cap);
        let mut appended = Vec::new();
        for batch in 0..20 {
            let lines: Vec<String> = (0..(batch % 4) + 1).map(|i| format!("{}-{}", batch, i)).collect();
            buf.append(&lines.join("\n"));
            appended.extend(lines);

            assert!(buf.len() <= cap);
            let start = appended.len().saturating_sub(cap);
            let expected: String = appended[start..].iter().map(|l| format!("{}\n", l)).collect();
            assert_eq!(buf.snapshot(), expected);
        }
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let buf = LineBuffer::new(0);
        buf.append("ignored");
        assert!(buf.is_empty());
    }
}
