//! The CIF serializer.
//!
//! [`Emitter`] acts as the handler on the walker/parser event stream and
//! writes a CIF document in the selected dialect, reproducing the author's
//! whitespace and comments from the [`WsQueue`] wherever the dialect allows,
//! and synthesizing minimal whitespace where none was captured. No physical
//! output line exceeds [`MAX_LINE_LENGTH`] unless the caller disables
//! folding, in which case the attempt fails with `OverlengthLine`.

use std::io::Write;

use cif_model::{CharValue, CifError, NumberValue, Packet, Result, Table, Value};
use cif_parse::{ParseSink, SyntaxCode, SyntaxError};
use cif_store::{Cif, Container, Loop};
use cif_walk::{CifHandler, Directive, Step};
use tracing::debug;

use crate::analyze::analyze;
use crate::ws::WsQueue;

/// Hard ceiling on the length of any emitted physical line.
pub const MAX_LINE_LENGTH: usize = 2048;
/// Maximum data content of a physical line inside a folded text field; the
/// fold separator occupies the final column.
const MAX_FOLD_LENGTH: usize = MAX_LINE_LENGTH - 1;
/// Halfwidth of the window scanned for a good fold point.
const FOLD_WINDOW: usize = 8;
/// The text prefix applied when prefixing is in use.
const PREFIX: &str = "> ";

/// Output dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutFormat {
    Cif11,
    #[default]
    Cif20,
}

impl OutFormat {
    fn header(self) -> &'static str {
        match self {
            OutFormat::Cif11 => "#\\#CIF_1.1\n",
            OutFormat::Cif20 => "#\\#CIF_2.0\n",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OutFormat::Cif11 => "CIF 1.1",
            OutFormat::Cif20 => "CIF 2.0",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmitOptions {
    pub format: OutFormat,
    /// Permit the line-folding protocol in emitted text fields.
    pub allow_folding: bool,
    /// Permit the text-prefixing protocol in emitted text fields.
    pub allow_prefixing: bool,
    /// Suppress diagnostic messages.
    pub quiet: bool,
    /// Abort on the first reported error instead of recovering.
    pub halt_on_error: bool,
    /// Characters translated to plain spaces in preserved whitespace
    /// (CIF 1.0 input).
    pub extra_ws: Vec<char>,
    /// Characters translated to newlines in preserved whitespace (CIF 1.0
    /// input).
    pub extra_eol: Vec<char>,
}

impl Default for EmitOptions {
    fn default() -> EmitOptions {
        EmitOptions {
            format: OutFormat::Cif20,
            allow_folding: true,
            allow_prefixing: true,
            quiet: false,
            halt_on_error: false,
            extra_ws: Vec::new(),
            extra_eol: Vec::new(),
        }
    }
}

/// Whitespace requirement ahead of a literal token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    /// No whitespace may be inserted (and a forced newline is an error).
    Forbidden,
    /// Whitespace is welcome but not required.
    Allowed,
    /// One space is required if none was emitted already.
    Required,
}

/// Serializing handler. `W` is the output sink; diagnostics go to a separate
/// stream (standard error by default).
pub struct Emitter<W: Write> {
    out: W,
    diag: Box<dyn Write>,
    opts: EmitOptions,
    ws: WsQueue,
    column: usize,
    last_space: bool,
    depth: u32,
    in_loop: bool,
    at_start: bool,
    synthesize_packet: bool,
    error_count: u32,
}

impl<W: Write> Emitter<W> {
    pub fn new(out: W, opts: EmitOptions) -> Emitter<W> {
        Emitter {
            out,
            diag: Box::new(std::io::stderr()),
            opts,
            ws: WsQueue::new(),
            column: 0,
            last_space: false,
            depth: 0,
            in_loop: false,
            at_start: false,
            synthesize_packet: false,
            error_count: 0,
        }
    }

    /// Redirect diagnostic messages (parse errors, recovery notices).
    pub fn with_diagnostics(mut self, diag: Box<dyn Write>) -> Emitter<W> {
        self.diag = diag;
        self
    }

    /// Number of errors reported so far (parse errors plus recovered
    /// emission errors).
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    // --- low-level output -----------------------------------------------

    /// Write `s` and keep `column` equal to the characters since the last
    /// newline.
    fn put(&mut self, s: &str) -> Result<()> {
        self.out.write_all(s.as_bytes())?;
        match s.rfind('\n') {
            Some(i) => self.column = s[i + 1..].chars().count(),
            None => self.column += s.chars().count(),
        }
        if let Some(c) = s.chars().last() {
            self.last_space = matches!(c, ' ' | '\t' | '\n');
        }
        Ok(())
    }

    /// Print and release the oldest whitespace run. Returns the number of
    /// characters written (zero when no run was queued).
    fn print_ws_run(&mut self) -> Result<usize> {
        let Some(run) = self.ws.pop_run() else {
            return Ok(0);
        };
        let mut printed = 0;
        for piece in run {
            printed += piece.chars().count();
            self.put(&piece)?;
        }
        Ok(printed)
    }

    /// Print and release every queued whitespace run.
    fn print_all_ws(&mut self) -> Result<usize> {
        let mut printed = 0;
        while !self.ws.is_empty() {
            printed += self.print_ws_run()?;
        }
        Ok(printed)
    }

    /// Guarantee room for `data_len` more characters: break the line when it
    /// would overflow, else emit `minimum` spaces.
    fn ensure_space(&mut self, minimum: usize, data_len: usize) -> Result<()> {
        if self.column > 0 {
            if minimum + data_len + self.column > MAX_LINE_LENGTH {
                self.put("\n")?;
            } else if minimum > 0 {
                self.put(" ")?;
            }
        }
        Ok(())
    }

    /// Write a literal token, preceded by a space or newline as the `space`
    /// policy and remaining room dictate.
    fn literal(&mut self, space: Space, s: &str) -> Result<()> {
        if self.column > 0 {
            let line1: usize = s.split('\n').next().unwrap_or("").chars().count();
            let nspace = usize::from(space == Space::Required);
            if line1 + self.column + nspace > MAX_LINE_LENGTH {
                if space == Space::Forbidden {
                    return Err(CifError::OverlengthLine);
                }
                self.put("\n")?;
            } else if nspace > 0 {
                self.put(" ")?;
            }
        }
        self.put(s)
    }

    /// Emit a `data_`/`save_` header with its code, drawing cached
    /// whitespace first.
    fn print_code(&mut self, keyword: &str, code: &str) -> Result<()> {
        if self.print_all_ws()? > 0 {
            self.ensure_space(0, keyword.len() + code.chars().count())?;
        } else {
            self.put("\n")?;
        }
        self.put(keyword)?;
        self.put(code)
    }

    // --- values ---------------------------------------------------------

    /// Emit a value with appropriate leading whitespace. `ws_needed_max` as
    /// in the original serializer: 0 = optional, at most one cached run;
    /// 1 = required, at most one cached run; 2 = required, all cached runs.
    fn print_value(&mut self, value: &Value, ws_needed_max: u8) -> Result<()> {
        match value {
            Value::Unknown | Value::NotApplicable => {
                let n = if ws_needed_max > 1 {
                    self.print_all_ws()?
                } else {
                    self.print_ws_run()?
                };
                let token = if matches!(value, Value::Unknown) { "?" } else { "." };
                let space = if ws_needed_max > 0 && n == 0 {
                    Space::Required
                } else {
                    Space::Allowed
                };
                self.literal(space, token)
            }
            Value::Char(CharValue { text, quoted }) => {
                self.print_value_text(text, *quoted, ws_needed_max)
            }
            Value::Number(NumberValue { text, .. }) => {
                self.print_value_text(text, false, ws_needed_max)
            }
            Value::List(elements) => {
                let n = self.print_ws_run()?;
                if ws_needed_max > 0 && n == 0 {
                    self.ensure_space(1, 1)?;
                }
                self.print_list(elements)
            }
            Value::Table(entries) => {
                let n = self.print_ws_run()?;
                if ws_needed_max > 0 && n == 0 {
                    self.ensure_space(1, 1)?;
                }
                self.print_table(entries)
            }
        }
    }

    fn print_value_text(&mut self, text: &str, quoted: bool, ws_needed: u8) -> Result<()> {
        let n = if ws_needed > 1 {
            self.print_all_ws()?
        } else {
            self.print_ws_run()?
        };
        let analysis = analyze(
            text,
            !quoted,
            self.opts.format != OutFormat::Cif11,
            MAX_LINE_LENGTH,
        );
        let minimum = usize::from(n == 0 && ws_needed > 0);

        match analysis.delim_length {
            3 if analysis.num_lines > 1 => {
                self.ensure_space(minimum, analysis.length_first + 3)?;
                self.put(analysis.delim)?;
                self.put(text)?;
                self.put(analysis.delim)
            }
            0 | 1 | 3 => {
                let dl = analysis.delim_length as usize;
                self.ensure_space(minimum, analysis.length_first + 2 * dl)?;
                self.put(analysis.delim)?;
                self.put(text)?;
                self.put(analysis.delim)
            }
            2 => {
                let needs_fold_for_length = analysis.length_max > MAX_LINE_LENGTH
                    || analysis.length_first >= MAX_LINE_LENGTH;
                let giant_semi_run = analysis.max_semi_run >= MAX_FOLD_LENGTH - 1;
                let mut fold = needs_fold_for_length
                    || analysis.has_reserved_start
                    || analysis.has_trailing_ws
                    || giant_semi_run;
                let mut prefix = analysis.contains_text_delim || giant_semi_run;

                if !self.opts.allow_prefixing {
                    if analysis.contains_text_delim {
                        // no unprefixed rendering can carry an embedded "\n;"
                        return Err(CifError::DisallowedValue("an unprefixed text field"));
                    }
                    prefix = false;
                }
                if !self.opts.allow_folding {
                    if needs_fold_for_length {
                        return Err(CifError::OverlengthLine);
                    }
                    // reserved starts and trailing whitespace can still be
                    // protected by the prefix protocol
                    if fold && self.opts.allow_prefixing {
                        prefix = true;
                    }
                    fold = false;
                }
                self.print_text_field(text, fold, prefix)
            }
            other => Err(CifError::Internal(format!("delimiter class {other}"))),
        }
    }

    /// Write `text` as a semicolon-delimited field, folding and/or prefixing
    /// as directed.
    fn print_text_field(&mut self, text: &str, fold: bool, prefix: bool) -> Result<()> {
        if !fold && !prefix {
            self.put("\n;")?;
            self.put(text)?;
            self.put("\n;")?;
            return Ok(());
        }

        // protocol-opening line
        self.put("\n;")?;
        if prefix {
            self.put(PREFIX)?;
            self.put("\\")?;
        }
        if fold {
            self.put("\\")?;
        }
        self.put("\n")?;

        let prefix_len = if prefix { PREFIX.chars().count() } else { 0 };
        for line in text.split('\n') {
            if !fold {
                self.put(PREFIX)?;
                self.put(line)?;
                self.put("\n")?;
                continue;
            }
            let chars: Vec<char> = line.chars().collect();
            let mut start = 0;
            loop {
                let limit = chars.len() - start;
                let target = MAX_FOLD_LENGTH - FOLD_WINDOW - prefix_len;
                let seg = fold_length(&chars[start..], target, FOLD_WINDOW, prefix);
                let segment: String = chars[start..start + seg].iter().collect();
                if prefix {
                    self.put(PREFIX)?;
                }
                self.put(&segment)?;
                if seg == limit {
                    // a terminal space, tab, or backslash would be mangled on
                    // re-parse; an empty protected continuation shields it
                    let protect =
                        seg > 0 && matches!(chars[start + seg - 1], ' ' | '\t' | '\\');
                    if protect {
                        self.put("\\\n\n")?;
                    } else {
                        self.put("\n")?;
                    }
                } else {
                    self.put("\\\n")?;
                }
                start += seg;
                if start >= chars.len() {
                    break;
                }
            }
        }
        self.put(";")
    }

    fn print_list(&mut self, elements: &[Value]) -> Result<()> {
        if self.opts.format == OutFormat::Cif11 {
            self.ws.clear();
            return Err(CifError::DisallowedValue(OutFormat::Cif11.name()));
        }
        self.literal(Space::Allowed, "[")?;
        for (i, element) in elements.iter().enumerate() {
            self.print_value(element, u8::from(i > 0))?;
        }
        self.print_ws_run()?;
        self.literal(Space::Allowed, "]")
    }

    fn print_table(&mut self, entries: &Table) -> Result<()> {
        if self.opts.format == OutFormat::Cif11 {
            self.ws.clear();
            return Err(CifError::DisallowedValue(OutFormat::Cif11.name()));
        }
        self.literal(Space::Allowed, "{")?;
        let mut first = true;
        for entry in entries.values() {
            // the key goes through the value machinery as a quoted string
            self.print_value_text(&entry.key_orig, true, u8::from(!first))?;
            self.literal(Space::Forbidden, ":")?;
            self.print_value(&entry.value, 0)?;
            first = false;
        }
        self.print_ws_run()?;
        self.literal(Space::Allowed, "}")
    }

    // --- recovery -------------------------------------------------------

    /// A value the selected dialect cannot carry: report, count, and unless
    /// halting substitute `?` so the output stays well-formed.
    fn recover_value(&mut self, error: CifError) -> Step {
        self.error_count += 1;
        if !self.opts.quiet {
            let _ = writeln!(self.diag, "linguist: {error}; substituting '?'");
        }
        if self.opts.halt_on_error {
            return Err(error);
        }
        if self.last_space {
            self.put("?")?;
        } else {
            self.literal(Space::Required, "?")?;
        }
        Ok(Directive::Continue)
    }

    fn translate_ws(&self, ws: &str) -> String {
        if self.opts.extra_ws.is_empty() && self.opts.extra_eol.is_empty() {
            return ws.to_string();
        }
        ws.chars()
            .map(|c| {
                if self.opts.extra_eol.contains(&c) {
                    '\n'
                } else if self.opts.extra_ws.contains(&c) {
                    ' '
                } else {
                    c
                }
            })
            .collect()
    }

    /// Destroy a finished container's contents so the store stays bounded on
    /// streaming input.
    fn flush_container(&mut self, cif: &Cif, container: &Container) -> Result<()> {
        for frame in cif.frames(container)? {
            cif.destroy(frame)?;
        }
        for lp in cif.loops(container)? {
            cif.destroy_loop(lp)?;
        }
        Ok(())
    }
}

impl<W: Write> CifHandler for Emitter<W> {
    fn cif_start(&mut self, _cif: &Cif) -> Step {
        let header = self.opts.format.header();
        self.put(header)?;
        self.at_start = true;
        Ok(Directive::Continue)
    }

    fn cif_end(&mut self, _cif: &Cif) -> Step {
        // an empty CIF still holds a possible version comment
        if self.at_start {
            self.ws.consume_version_comment();
            self.at_start = false;
        }
        if self.print_all_ws()? == 0 {
            self.put("\n")?;
        }
        self.out.flush().map_err(CifError::from)?;
        Ok(Directive::Continue)
    }

    fn block_start(&mut self, _cif: &Cif, block: &Container) -> Step {
        if self.at_start {
            self.ws.consume_version_comment();
            self.at_start = false;
        }
        self.ws.end_run();
        self.depth += 1;
        self.print_code("data_", &block.code_orig)?;
        Ok(Directive::Continue)
    }

    fn block_end(&mut self, cif: &Cif, block: &Container) -> Step {
        self.flush_container(cif, block)?;
        self.depth = self.depth.saturating_sub(1);
        Ok(Directive::Continue)
    }

    fn frame_start(&mut self, _cif: &Cif, frame: &Container) -> Step {
        self.ws.end_run();
        if self.depth > 0 {
            self.depth += 1;
            self.print_code("save_", &frame.code_orig)?;
        }
        Ok(Directive::Continue)
    }

    fn frame_end(&mut self, cif: &Cif, frame: &Container) -> Step {
        let printed = self.print_all_ws()?;
        self.ws.end_run();
        if self.depth > 0 {
            if printed > 0 {
                self.literal(Space::Allowed, "save_")?;
            } else {
                self.put("\nsave_\n")?;
            }
            self.flush_container(cif, frame)?;
            self.depth = self.depth.saturating_sub(1);
        }
        Ok(Directive::Continue)
    }

    fn loop_start(&mut self, cif: &Cif, lp: &Loop) -> Step {
        self.ws.end_run();
        if self.depth == 0 {
            self.print_all_ws()?;
            return Ok(Directive::Continue);
        }
        self.in_loop = true;

        if self.print_ws_run()? > 0 {
            self.literal(Space::Allowed, "loop_")?;
        } else {
            self.put("\nloop_")?;
        }
        let names = cif.loop_names(lp)?;
        for name in &names {
            if self.print_ws_run()? == 0 {
                self.put("\n")?;
            }
            self.literal(Space::Allowed, &name.orig)?;
        }

        if self.synthesize_packet {
            self.synthesize_packet = false;
            debug!(target: "emit", names = names.len(), "synthesizing dummy packet");
            self.put("\n")?;
            for _ in &names {
                self.put(" ?")?;
            }
            self.put("\n")?;
        }
        Ok(Directive::Continue)
    }

    fn loop_end(&mut self, _cif: &Cif, _lp: &Loop) -> Step {
        if self.depth > 0 {
            self.in_loop = false;
            if self.column > 0 && self.ws.is_empty() {
                // inject synthetic end-of-line ahead of whatever follows
                self.ws.record("\n");
            }
        }
        Ok(Directive::Continue)
    }

    fn packet_start(&mut self, _cif: &Cif, _packet: &Packet) -> Step {
        if self.depth > 0 && self.column > 0 && self.ws.is_empty() {
            self.ws.record("\n");
        }
        Ok(Directive::Continue)
    }

    fn packet_end(&mut self, _cif: &Cif, _packet: &Packet) -> Step {
        // looped data has been written; keep it out of the store
        Ok(Directive::SkipCurrent)
    }

    fn item(&mut self, _cif: &Cif, name: Option<&str>, value: &Value) -> Step {
        let Some(name) = name.filter(|_| self.depth > 0) else {
            // Neither the item nor its internal whitespace is printed; fold
            // the captured gaps together so surrounding whitespace reads as
            // one run.
            self.ws.merge_for_suppressed(self.in_loop);
            return Ok(Directive::Continue);
        };
        self.ws.end_run();

        if !self.in_loop {
            if self.print_ws_run()? > 0 {
                self.literal(Space::Allowed, name)?;
            } else {
                self.put("\n")?;
                self.put(name)?;
            }
        }

        match self.print_value(value, 2) {
            Ok(()) => Ok(Directive::Continue),
            Err(e @ (CifError::DisallowedValue(_) | CifError::OverlengthLine)) => {
                self.recover_value(e)
            }
            Err(e) => Err(e),
        }
    }
}

impl<W: Write> ParseSink for Emitter<W> {
    fn whitespace(&mut self, _line: u32, _column: u32, ws: &str) {
        if ws.is_empty() {
            self.ws.record("");
        } else {
            let translated = self.translate_ws(ws);
            self.ws.record(&translated);
        }
    }

    fn syntax_error(&mut self, error: &SyntaxError) -> Result<()> {
        self.error_count += 1;
        if !self.opts.quiet {
            let _ = writeln!(self.diag, "{error}");
        }
        if self.opts.halt_on_error {
            return Err(CifError::Halted(error.to_string()));
        }
        // One structural correction: a loop the parser reported empty gets a
        // synthetic dummy packet at the next loop-start.
        if error.code == SyntaxCode::EmptyLoop {
            self.synthesize_packet = true;
        }
        Ok(())
    }
}

/// Choose how much of a logical line goes into the next folded segment.
/// Prefers a space→non-space boundary as close to `target` as possible
/// within `window`; when prefixing is off, never folds just before a
/// semicolon (the escape scan walks left for the nearest safe spot).
fn fold_length(chars: &[char], target: usize, window: usize, allow_before_semi: bool) -> usize {
    debug_assert!(target > window);
    if chars.len() <= target + window {
        return chars.len();
    }

    let t = target as i64;
    let w = window as i64;
    let mut best_category: i64 = 0;
    let mut best_diff: i64 = -(w + 1);
    let mut is_space = matches!(chars[(t - w - 1) as usize], ' ' | '\t');

    let category_at = |c: char, was_space: bool, now_space: bool| -> i64 {
        if allow_before_semi || c != ';' {
            i64::from(was_space) * 2 + i64::from(!now_space)
        } else {
            0
        }
    };

    // bottom half of the window: later equal-quality spots win
    for diff in -w..0 {
        let c = chars[(t + diff) as usize];
        let was_space = is_space;
        is_space = matches!(c, ' ' | '\t');
        let category = category_at(c, was_space, is_space);
        if category >= best_category {
            best_diff = diff;
            best_category = category;
        }
    }
    // top half: a perfect boundary wins outright; ties break toward the
    // position closer to (and not beyond) the target
    for diff in 0..=w {
        let c = chars[(t + diff) as usize];
        let was_space = is_space;
        is_space = matches!(c, ' ' | '\t');
        let category = category_at(c, was_space, is_space);
        if category == 3 {
            best_diff = diff;
            best_category = category;
            break;
        } else if category > best_category {
            best_diff = diff;
            best_category = category;
        } else if category == best_category && diff <= -best_diff {
            best_diff = diff;
        }
    }

    if best_category > 0 {
        (t + best_diff) as usize
    } else {
        // the whole window is semicolons: scan left for a safe fold point
        let mut n = (t - w - 1) as usize;
        while n > 0 && chars[n] == ';' {
            n -= 1;
        }
        n.max(1)
    }
}
