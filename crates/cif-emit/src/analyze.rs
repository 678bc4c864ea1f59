//! String analysis for emission.
//!
//! [`analyze`] is a pure, deterministic classification of a text value: which
//! delimiter kinds can legally enclose it, its logical-line metrics, and the
//! features (reserved starts, trailing whitespace, embedded `\n;`, semicolon
//! runs) that drive the emitter's folding and prefixing decisions. The
//! emitter makes no character-level decisions of its own.

/// Result of analyzing a text value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    /// Smallest viable delimiter class: 0 = bare, 1 = single quote,
    /// 2 = semicolon text field, 3 = triple quote (CIF 2.0 only).
    pub delim_length: u8,
    /// The delimiter string itself (empty for classes 0 and 2).
    pub delim: &'static str,
    pub num_lines: usize,
    pub length_first: usize,
    pub length_last: usize,
    pub length_max: usize,
    /// The text begins with `data_`, `save_`, `loop_`, `global_`, `stop_`
    /// (case-insensitive), or a semicolon in column one.
    pub has_reserved_start: bool,
    /// The last logical line ends with a space or tab.
    pub has_trailing_ws: bool,
    /// The text embeds the closing `\n;` sequence of a text field.
    pub contains_text_delim: bool,
    /// Longest run of leading semicolons on any logical line.
    pub max_semi_run: usize,
}

const RESERVED: [&str; 5] = ["data_", "save_", "loop_", "global_", "stop_"];

fn reserved_start(text: &str) -> bool {
    if text.starts_with(';') {
        return true;
    }
    let head: String = text.chars().take(7).flat_map(char::to_lowercase).collect();
    RESERVED.iter().any(|kw| head.starts_with(kw))
}

/// Characters that must not open a bare value.
fn bare_forbidden_start(c: char) -> bool {
    matches!(c, '\'' | '"' | ';' | '#' | '$' | '_' | '[' | ']' | '{' | '}')
}

/// Classify `text` for emission. `allow_unquoted` is false for values that
/// were originally delimited; `allow_triple` is true only for CIF 2.0
/// output; `max_line_length` bounds any physical output line.
pub fn analyze(
    text: &str,
    allow_unquoted: bool,
    allow_triple: bool,
    max_line_length: usize,
) -> Analysis {
    let lines: Vec<&str> = text.split('\n').collect();
    let lengths: Vec<usize> = lines.iter().map(|l| l.chars().count()).collect();
    let num_lines = lines.len();
    let length_first = lengths[0];
    let length_last = *lengths.last().unwrap_or(&0);
    let length_max = lengths.iter().copied().max().unwrap_or(0);

    let has_reserved_start = reserved_start(text);
    let has_trailing_ws = lines
        .last()
        .is_some_and(|l| l.ends_with(' ') || l.ends_with('\t'));
    let contains_text_delim = text.contains("\n;");
    let max_semi_run = lines
        .iter()
        .map(|l| l.chars().take_while(|&c| c == ';').count())
        .max()
        .unwrap_or(0);

    let single = num_lines == 1;

    let bare_ok = allow_unquoted
        && single
        && !text.is_empty()
        && length_first <= max_line_length
        && !text.contains([' ', '\t'])
        && !text.chars().next().is_some_and(bare_forbidden_start)
        && !(allow_triple && text.contains(['[', ']', '{', '}']))
        && text != "?"
        && text != "."
        && !has_reserved_start;

    let quote_ok = single && length_first + 2 <= max_line_length;
    let quote: Option<&'static str> = if quote_ok && !text.contains('\'') {
        Some("'")
    } else if quote_ok && !text.contains('"') {
        Some("\"")
    } else {
        None
    };

    let triple: Option<&'static str> = if allow_triple && length_max + 3 <= max_line_length {
        if !text.contains("'''") && !text.ends_with('\'') {
            Some("'''")
        } else if !text.contains("\"\"\"") && !text.ends_with('"') {
            Some("\"\"\"")
        } else {
            None
        }
    } else {
        None
    };

    let (delim_length, delim) = if bare_ok {
        (0, "")
    } else if let Some(q) = quote {
        (1, q)
    } else if let Some(t) = triple {
        (3, t)
    } else {
        (2, "")
    };

    Analysis {
        delim_length,
        delim,
        num_lines,
        length_first,
        length_last,
        length_max,
        has_reserved_start,
        has_trailing_ws,
        contains_text_delim,
        max_semi_run,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 2048;

    #[test]
    fn bare_word_when_permitted() {
        let a = analyze("1.54", true, true, MAX);
        assert_eq!((a.delim_length, a.delim), (0, ""));
        assert_eq!(a.num_lines, 1);
        assert_eq!(a.length_first, 4);
        // the same text from a quoted original must stay delimited
        let a = analyze("1.54", false, true, MAX);
        assert_eq!(a.delim_length, 1);
    }

    #[test]
    fn special_starts_force_quoting() {
        for text in ["_name", "#cmt", "$frame", "[x", "'q", "?", "."] {
            let a = analyze(text, true, true, MAX);
            assert_ne!(a.delim_length, 0, "{text:?} must not be bare");
        }
    }

    #[test]
    fn reserved_keywords_detected_case_insensitively() {
        assert!(analyze("DATA_x", true, true, MAX).has_reserved_start);
        assert!(analyze("loop_", true, true, MAX).has_reserved_start);
        assert!(analyze(";x", true, true, MAX).has_reserved_start);
        assert!(!analyze("dat", true, true, MAX).has_reserved_start);
        assert_ne!(analyze("Stop_1", true, true, MAX).delim_length, 0);
    }

    #[test]
    fn quote_choice_avoids_content() {
        assert_eq!(analyze("a b", true, true, MAX).delim, "'");
        assert_eq!(analyze("it's", true, true, MAX).delim, "\"");
        // both quote kinds present: CIF 2.0 escalates to triple quotes
        let a = analyze("'\"", true, true, MAX);
        assert_eq!((a.delim_length, a.delim), (3, "'''"));
        // CIF 1.1 has no triple quotes: text field
        let a = analyze("'\"", true, false, MAX);
        assert_eq!(a.delim_length, 2);
    }

    #[test]
    fn multiline_prefers_triple_in_cif2_else_text_field() {
        let a = analyze("a\nb", true, true, MAX);
        assert_eq!((a.delim_length, a.delim), (3, "'''"));
        assert_eq!(a.num_lines, 2);
        let a = analyze("a\nb", true, false, MAX);
        assert_eq!(a.delim_length, 2);
    }

    #[test]
    fn triple_quote_avoids_conflicts() {
        let a = analyze("x'''y\nz", true, true, MAX);
        assert_eq!(a.delim, "\"\"\"");
        // both triples embedded: only a text field remains
        let a = analyze("a'''b\nc\"\"\"d", true, true, MAX);
        assert_eq!(a.delim_length, 2);
        // text ending in an apostrophe cannot take the apostrophe triple
        let a = analyze("ab\ncd'", true, true, MAX);
        assert_eq!(a.delim, "\"\"\"");
    }

    #[test]
    fn long_single_line_needs_text_field() {
        let long = "x".repeat(3000);
        let a = analyze(&long, true, true, MAX);
        assert_eq!(a.delim_length, 2);
        assert_eq!(a.length_max, 3000);
    }

    #[test]
    fn line_metrics() {
        let a = analyze("ab\nc\n\nwxyz", true, false, MAX);
        assert_eq!(a.num_lines, 4);
        assert_eq!(a.length_first, 2);
        assert_eq!(a.length_last, 4);
        assert_eq!(a.length_max, 4);
    }

    #[test]
    fn trailing_ws_and_text_delim_flags() {
        assert!(analyze("ab \nc ", true, false, MAX).has_trailing_ws);
        assert!(!analyze("ab \nc", true, false, MAX).has_trailing_ws);
        assert!(analyze("a\n;b", true, false, MAX).contains_text_delim);
        assert!(!analyze("a;b", true, false, MAX).contains_text_delim);
    }

    #[test]
    fn semicolon_runs_counted_per_line() {
        let a = analyze("a\n;;;b\n;;c", true, false, MAX);
        assert_eq!(a.max_semi_run, 3);
        assert_eq!(analyze("abc", true, false, MAX).max_semi_run, 0);
    }

    #[test]
    fn empty_text_is_quoted() {
        let a = analyze("", true, true, MAX);
        assert_eq!((a.delim_length, a.delim), (1, "'"));
    }

    #[test]
    fn deterministic() {
        let a = analyze("some value\nwith lines", true, true, MAX);
        let b = analyze("some value\nwith lines", true, true, MAX);
        assert_eq!(a, b);
    }
}
