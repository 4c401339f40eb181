//! Output collector — captures the script's console output with layered
//! truncation so a chatty or adversarial script cannot blow up the envelope.

use chrono::Utc;

use super::envelope::{LogEntry, LogLevel};

/// Suffix appended to entries shortened by the per-entry cap.
const TRUNCATION_SUFFIX: &str = "… [truncated]";

/// One ordered log list spanning the four severity channels.
///
/// Truncation is applied in this order:
/// 1. entry-count cap — once reached, further entries are dropped;
/// 2. per-entry character cap — overlong text is shortened with a suffix;
/// 3. cumulative character budget — once exceeded, further entries are dropped.
///
/// Any of the three sets the `truncated` flag, surfaced as
/// `meta.truncatedLogs`.
pub struct OutputCollector {
    entries: Vec<LogEntry>,
    total_chars: usize,
    truncated: bool,
    max_entries: usize,
    max_entry_chars: usize,
    max_total_chars: usize,
}

impl OutputCollector {
    pub fn new(max_entries: usize, max_entry_chars: usize, max_total_chars: usize) -> Self {
        Self {
            entries: Vec::new(),
            total_chars: 0,
            truncated: false,
            max_entries,
            max_entry_chars,
            max_total_chars,
        }
    }

    /// Captures one entry, timestamped now. The message is already
    /// formatted (strings pass through, other values go through the safe
    /// serializer on the JS side).
    pub fn push(&mut self, level: LogLevel, message: &str) {
        if self.entries.len() >= self.max_entries {
            self.truncated = true;
            return;
        }

        let mut text = message.to_string();
        let char_count = text.chars().count();
        if char_count > self.max_entry_chars {
            let cut = text
                .char_indices()
                .nth(self.max_entry_chars)
                .map(|(i, _)| i)
                .unwrap_or(text.len());
            text.truncate(cut);
            text.push_str(TRUNCATION_SUFFIX);
            self.truncated = true;
        }

        let entry_chars = text.chars().count();
        if self.total_chars + entry_chars > self.max_total_chars {
            self.truncated = true;
            return;
        }

        self.total_chars += entry_chars;
        self.entries.push(LogEntry {
            level,
            message: text,
            timestamp: Utc::now(),
        });
    }

    /// Consumes the collector, returning the entries and whether any
    /// truncation occurred.
    pub fn finish(self) -> (Vec<LogEntry>, bool) {
        (self.entries, self.truncated)
    }
}
