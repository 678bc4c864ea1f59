//! Text-field protocol decoding.
//!
//! Inside a semicolon-delimited text field two in-band conventions may be
//! active, signalled on the field's first physical line:
//!
//! - *line folding*: the first line is a lone `\`; content lines ending in
//!   `\` are joined with their successor.
//! - *text prefixing*: the first line is `<prefix>\` (or `<prefix>\\` when
//!   folding too); every content line starts with the prefix, which is
//!   stripped.

/// Decode the raw content of a text field (first physical line included,
/// closing delimiter excluded). `fold` / `prefix` switch recognition of the
/// respective protocol.
pub(crate) fn decode_text_field(raw: &str, fold: bool, prefix: bool) -> String {
    let (first, body) = match raw.split_once('\n') {
        Some((f, b)) => (f, Some(b)),
        None => (raw, None),
    };

    let trailing_bs = first.len() - first.trim_end_matches('\\').len();
    let mut prefix_str: Option<&str> = None;
    let mut folded = false;
    if prefix && (1..=2).contains(&trailing_bs) && first.len() > trailing_bs {
        prefix_str = Some(&first[..first.len() - trailing_bs]);
        folded = fold && trailing_bs == 2;
    } else if fold && first.trim_end() == "\\" {
        folded = true;
    }

    if prefix_str.is_none() && !folded {
        return raw.to_string();
    }

    let mut out = String::new();
    let mut carry = true; // suppress the newline after the marker line
    for line in body.unwrap_or("").split('\n') {
        let mut l = line;
        if let Some(p) = prefix_str {
            l = l.strip_prefix(p).unwrap_or(l);
        }
        let mut fold_here = false;
        if folded {
            if let Some(stripped) = l.strip_suffix('\\') {
                fold_here = true;
                l = stripped;
            }
        }
        if !carry {
            out.push('\n');
        }
        out.push_str(l);
        carry = fold_here;
    }
    out
}
