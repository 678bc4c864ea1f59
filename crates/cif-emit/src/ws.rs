//! The whitespace queue.
//!
//! Inter-token whitespace and comments captured during parsing are held here
//! until the emitter writes the next semantic token. The queue is a sequence
//! of *runs* (whitespace between two tokens); each run is a sequence of
//! *pieces* (one per parser callback). A zero-length callback closes the
//! current run without starting a new one, distinguishing an intentional
//! absence of whitespace from the continuation of the prior run.

use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct WsQueue {
    runs: VecDeque<Vec<String>>,
    in_run: bool,
}

impl WsQueue {
    pub fn new() -> WsQueue {
        WsQueue::default()
    }

    /// Record one captured piece. A zero-length piece closes the current run
    /// — or, when no run is open, records an *empty* run: positional proof
    /// that no whitespace stood between two tokens, so run consumption stays
    /// aligned with the token stream.
    pub fn record(&mut self, ws: &str) {
        if self.in_run {
            if let Some(last) = self.runs.back_mut() {
                last.push(ws.to_string());
                self.in_run = !ws.is_empty();
                return;
            }
        }
        self.runs.push_back(vec![ws.to_string()]);
        self.in_run = !ws.is_empty();
    }

    /// Close the current run; the next piece starts a new one.
    pub fn end_run(&mut self) {
        self.in_run = false;
    }

    /// Remove and return the oldest run.
    pub fn pop_run(&mut self) -> Option<Vec<String>> {
        self.runs.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.runs.clear();
        self.in_run = false;
    }

    /// Adjustment applied when an item is suppressed (no data name, or data
    /// outside any container): keep only the first run — merging in the
    /// second when outside a loop — and splice subsequent captures onto it,
    /// so the whitespace reads as one unbroken gap.
    pub fn merge_for_suppressed(&mut self, in_loop: bool) {
        if self.runs.is_empty() {
            return;
        }
        if !in_loop && self.runs.len() >= 2 {
            let second = self.runs.remove(1).unwrap_or_default();
            if let Some(first) = self.runs.front_mut() {
                first.extend(second);
            }
        }
        self.runs.truncate(1);
        self.in_run = true;
    }

    /// Remove a leading `#\#CIF_...` version comment from the first run, if
    /// present, so a freshly written format header is not duplicated. The
    /// comment may span several pieces of the run.
    pub fn consume_version_comment(&mut self) {
        let Some(first) = self.runs.front() else {
            return;
        };
        let joined: String = first.concat();
        if !joined.starts_with("#\\#CIF_") {
            return;
        }
        match joined.find('\n') {
            Some(i) => {
                let rest = joined[i + 1..].to_string();
                if rest.is_empty() {
                    self.runs.pop_front();
                } else if let Some(front) = self.runs.front_mut() {
                    *front = vec![rest];
                }
            }
            None => {
                self.runs.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pieces_group_into_runs() {
        let mut q = WsQueue::new();
        q.record(" ");
        q.record("# note");
        q.record("\n");
        q.end_run();
        q.record("\n\n");
        assert_eq!(q.pop_run().unwrap(), [" ", "# note", "\n"]);
        assert_eq!(q.pop_run().unwrap(), ["\n\n"]);
        assert!(q.pop_run().is_none());
    }

    #[test]
    fn zero_length_piece_closes_a_run() {
        let mut q = WsQueue::new();
        q.record(" ");
        q.record("");
        q.record(" ");
        assert_eq!(q.pop_run().unwrap(), [" ", ""]);
        assert_eq!(q.pop_run().unwrap(), [" "]);
    }

    #[test]
    fn zero_length_piece_between_tokens_records_an_empty_run() {
        let mut q = WsQueue::new();
        q.record(" ");
        q.record(""); // first token
        q.record(""); // adjacent token, no whitespace between
        q.record("\n");
        assert_eq!(q.pop_run().unwrap(), [" ", ""]);
        assert_eq!(q.pop_run().unwrap(), [""]);
        assert_eq!(q.pop_run().unwrap(), ["\n"]);
    }

    #[test]
    fn pieces_append_to_last_run_even_after_pops() {
        let mut q = WsQueue::new();
        q.record("a");
        q.end_run();
        q.record("b");
        assert_eq!(q.pop_run().unwrap(), ["a"]);
        // still inside run "b": the next piece continues it
        q.record("c");
        assert_eq!(q.pop_run().unwrap(), ["b", "c"]);
    }

    #[test]
    fn merge_outside_loop_joins_first_two_runs() {
        let mut q = WsQueue::new();
        q.record("A");
        q.end_run();
        q.record("B");
        q.end_run();
        q.record("C");
        q.merge_for_suppressed(false);
        assert_eq!(q.pop_run().unwrap(), ["A", "B"]);
        assert!(q.is_empty());
    }

    #[test]
    fn merge_inside_loop_keeps_only_first_run() {
        let mut q = WsQueue::new();
        q.record("A");
        q.end_run();
        q.record("B");
        q.merge_for_suppressed(true);
        assert_eq!(q.pop_run().unwrap(), ["A"]);
        assert!(q.is_empty());
    }

    #[test]
    fn merge_reopens_the_run() {
        let mut q = WsQueue::new();
        q.record("A");
        q.end_run();
        q.merge_for_suppressed(false);
        q.record("B");
        assert_eq!(q.pop_run().unwrap(), ["A", "B"]);
    }

    #[test]
    fn version_comment_is_consumed() {
        let mut q = WsQueue::new();
        q.record("#\\#CIF_1.1");
        q.record("\n");
        q.end_run();
        q.record("# keep me\n");
        q.consume_version_comment();
        assert_eq!(q.pop_run().unwrap(), ["# keep me\n"]);
    }

    #[test]
    fn version_comment_keeps_trailing_whitespace_of_run() {
        let mut q = WsQueue::new();
        q.record("#\\#CIF_2.0\n\n# next");
        q.consume_version_comment();
        assert_eq!(q.pop_run().unwrap(), ["\n# next"]);
    }

    #[test]
    fn non_version_comment_is_untouched() {
        let mut q = WsQueue::new();
        q.record("# ordinary\n");
        q.consume_version_comment();
        assert_eq!(q.pop_run().unwrap(), ["# ordinary\n"]);
    }

    #[test]
    fn headerless_run_without_newline_is_dropped_entirely() {
        let mut q = WsQueue::new();
        q.record("#\\#CIF_2.0");
        q.consume_version_comment();
        assert!(q.is_empty());
    }
}
