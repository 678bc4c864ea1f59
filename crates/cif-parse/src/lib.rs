//! Streaming CIF parser.
//!
//! The parser reads CIF 1.0 / 1.1 / 2.0 text and drives a [`ParseSink`]
//! through the same event sequence the store walker produces: cif-start,
//! block/frame/loop/packet boundaries, items, plus two parse-only channels —
//! whitespace capture and error reporting. Parsed content is built into a
//! [`Cif`] store incrementally, so callbacks receive live handles; a sink
//! that returns [`Directive::SkipCurrent`] from `packet_end` keeps that
//! packet out of the store (that is how the transformer bounds its memory).
//!
//! Errors are reported through [`ParseSink::syntax_error`]; when the sink
//! returns `Ok(())` the parser recovers and continues, so a best-effort
//! transformation can consume arbitrarily broken input.

use cif_model::{CifError, ItemName, NormName, Packet, Result, Table, TableEntry, Value};
use cif_store::{Cif, Container, Loop};
use cif_walk::{CifHandler, Directive};
use tracing::debug;

mod scanner;
mod text;

use scanner::Cursor;

/// Input dialect selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Use the `#\#CIF_` magic comment when present, CIF 1.1 otherwise.
    #[default]
    Auto,
    Cif10,
    Cif11,
    Cif20,
}

#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub format: Format,
    /// Recognize the line-folding protocol in text fields.
    pub decode_folding: bool,
    /// Recognize the text-prefixing protocol in text fields.
    pub decode_prefixing: bool,
    /// Additional characters treated as inline whitespace (CIF 1.0: vertical
    /// tab).
    pub extra_ws: Vec<char>,
    /// Additional characters treated as line terminators (CIF 1.0: form
    /// feed).
    pub extra_eol: Vec<char>,
}

impl Default for ParseOptions {
    fn default() -> ParseOptions {
        ParseOptions {
            format: Format::Auto,
            decode_folding: true,
            decode_prefixing: true,
            extra_ws: Vec::new(),
            extra_eol: Vec::new(),
        }
    }
}

impl ParseOptions {
    /// Options for a named dialect, including the CIF 1.0 extra whitespace
    /// characters.
    pub fn for_format(format: Format) -> ParseOptions {
        let mut opts = ParseOptions {
            format,
            ..ParseOptions::default()
        };
        if format == Format::Cif10 {
            opts.extra_ws.push('\u{b}');
            opts.extra_eol.push('\u{c}');
        }
        opts
    }
}

/// Recoverable syntax-error codes. The numeric codes are stable and appear
/// in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxCode {
    EmptyLoop,
    MissingValue,
    PartialPacket,
    MisplacedValue,
    DuplicateBlockCode,
    DuplicateFrameCode,
    DuplicateItemName,
    InvalidName,
    UnterminatedString,
    UnterminatedTextField,
    UnterminatedFrame,
    UnterminatedList,
    UnterminatedTable,
    DisallowedSyntax,
    UnexpectedToken,
}

/// code → message, one row per [`SyntaxCode`] in declaration order.
static MESSAGES: &[(u32, &str)] = &[
    (1, "loop has no packets"),
    (2, "data name is not followed by a value"),
    (3, "final loop packet is short"),
    (4, "value appears without a data name"),
    (5, "duplicate data block code"),
    (6, "duplicate save frame code"),
    (7, "duplicate data name"),
    (8, "malformed block code or data name"),
    (9, "unterminated quoted string"),
    (10, "unterminated text field"),
    (11, "save frame is not terminated"),
    (12, "unterminated list value"),
    (13, "unterminated table value"),
    (14, "syntax not allowed in this CIF dialect"),
    (15, "unexpected token"),
];

impl SyntaxCode {
    pub fn code(self) -> u32 {
        MESSAGES[self as usize].0
    }

    pub fn message(self) -> &'static str {
        MESSAGES[self as usize].1
    }
}

/// A reported parse error: stable code plus source location and a short
/// sample of the offending input.
#[derive(Debug, Clone)]
pub struct SyntaxError {
    pub code: SyntaxCode,
    pub line: u32,
    pub column: u32,
    pub sample: String,
}

impl std::fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CIF error {} at line {}, column {}, (near '{}'): {}",
            self.code.code(),
            self.line,
            self.column,
            self.sample,
            self.code.message()
        )
    }
}

/// Receiver of the parse event stream: the eleven structural callbacks plus
/// whitespace capture and error interception.
pub trait ParseSink: CifHandler {
    /// A whitespace piece (spaces, newlines, or one comment). Consecutive
    /// pieces belong to one run until a zero-length piece or a semantic
    /// token closes it; a zero-length piece marks a run boundary where no
    /// whitespace was present.
    fn whitespace(&mut self, line: u32, column: u32, ws: &str) {
        let _ = (line, column, ws);
    }

    /// A recoverable error. Returning `Ok(())` resumes parsing; returning an
    /// error aborts the parse with it.
    fn syntax_error(&mut self, error: &SyntaxError) -> Result<()> {
        let _ = error;
        Ok(())
    }
}

/// Parse `input`, building content into `cif` and streaming events to
/// `sink`. Returns `Err` only when the sink aborts (handler error or strict
/// error interception) or the store fails; recoverable syntax problems go
/// through [`ParseSink::syntax_error`].
pub fn parse_into<S: ParseSink>(
    cif: &Cif,
    input: &str,
    opts: &ParseOptions,
    sink: &mut S,
) -> Result<()> {
    let cif2 = match opts.format {
        Format::Cif20 => true,
        Format::Auto => detect_cif2(input),
        Format::Cif10 | Format::Cif11 => false,
    };
    debug!(target: "parse", cif2, len = input.len(), "parse begin");
    Parser {
        cur: Cursor::new(input),
        cif,
        opts,
        sink,
        cif2,
        block: None,
        frame: None,
    }
    .run()
}

fn detect_cif2(input: &str) -> bool {
    input
        .lines()
        .next()
        .is_some_and(|l| l.trim_end().starts_with("#\\#CIF_2.0"))
}

/// Outcome of delivering one event: keep parsing, or unwind because the sink
/// returned `End`.
#[derive(PartialEq)]
enum Flow {
    Go,
    Halt,
}

struct Parser<'a, S: ParseSink> {
    cur: Cursor<'a>,
    cif: &'a Cif,
    opts: &'a ParseOptions,
    sink: &'a mut S,
    cif2: bool,
    block: Option<Container>,
    frame: Option<Container>,
}

impl<'a, S: ParseSink> Parser<'a, S> {
    fn run(&mut self) -> Result<()> {
        match self.sink.cif_start(self.cif)? {
            Directive::Continue => {}
            _ => {
                self.sink.cif_end(self.cif)?;
                return Ok(());
            }
        }

        loop {
            self.skip_ws();
            let Some(c) = self.cur.peek() else { break };
            let at = self.cur;
            self.token_boundary();

            if self.at_value() {
                let v = self.lex_value()?;
                self.report(SyntaxCode::MisplacedValue, at)?;
                if self.item_event(None, &v)? == Flow::Halt {
                    return Ok(());
                }
                continue;
            }

            if matches!(c, ']' | '}') {
                self.cur.bump();
                self.report(SyntaxCode::UnexpectedToken, at)?;
                continue;
            }

            let word = self.read_word();
            if word.is_empty() {
                // a character neither whitespace nor word-forming
                self.cur.bump();
                self.report(SyntaxCode::UnexpectedToken, at)?;
                continue;
            }
            let lower = word.to_lowercase();

            let flow = if lower.starts_with("data_") {
                self.open_block(&word[5..], at)?
            } else if lower == "save_" {
                self.close_frame(false)?
            } else if lower.starts_with("save_") {
                self.open_frame(&word[5..], at)?
            } else if lower == "loop_" {
                self.parse_loop(at)?
            } else if lower == "global_" || lower == "stop_" {
                self.report(SyntaxCode::UnexpectedToken, at)?;
                Flow::Go
            } else {
                // a data name (at_value() returned false for everything else)
                self.parse_item(word, at)?
            };
            if flow == Flow::Halt {
                return Ok(());
            }
        }

        // end of input: close whatever is still open
        if let Some(frame) = self.frame.take() {
            self.report(SyntaxCode::UnterminatedFrame, self.cur)?;
            if self.dir(|p| p.sink.frame_end(p.cif, &frame))? == Flow::Halt {
                return Ok(());
            }
        }
        if let Some(block) = self.block.take() {
            if self.dir(|p| p.sink.block_end(p.cif, &block))? == Flow::Halt {
                return Ok(());
            }
        }
        self.sink.cif_end(self.cif)?;
        Ok(())
    }

    // --- events and errors ----------------------------------------------

    fn dir<F>(&mut self, f: F) -> Result<Flow>
    where
        F: FnOnce(&mut Self) -> Result<Directive>,
    {
        match f(self)? {
            Directive::End => Ok(Flow::Halt),
            _ => Ok(Flow::Go),
        }
    }

    fn item_event(&mut self, name: Option<&str>, value: &Value) -> Result<Flow> {
        match self.sink.item(self.cif, name, value)? {
            Directive::End => Ok(Flow::Halt),
            _ => Ok(Flow::Go),
        }
    }

    fn report(&mut self, code: SyntaxCode, at: Cursor) -> Result<()> {
        let error = SyntaxError {
            code,
            line: at.line,
            column: at.col,
            sample: at.sample(12),
        };
        self.sink.syntax_error(&error)
    }

    // --- whitespace -----------------------------------------------------

    fn is_ws(&self, c: char) -> bool {
        matches!(c, ' ' | '\t' | '\n' | '\r')
            || self.opts.extra_ws.contains(&c)
            || self.opts.extra_eol.contains(&c)
    }

    /// Report every whitespace stretch and comment ahead of the next token,
    /// one piece per callback. Standard line terminators are normalized to
    /// `\n` here; extra (CIF 1.0) characters are passed through for the
    /// consumer to translate. The newline immediately ahead of a text-field
    /// semicolon is part of that token's delimiter, not whitespace.
    fn skip_ws(&mut self) {
        loop {
            let start = self.cur;
            let mut piece = String::new();
            let mut took_ws = false;
            while let Some(c) = self.cur.peek() {
                if !self.is_ws(c) {
                    break;
                }
                self.cur.bump();
                took_ws = true;
                if c == '\r' {
                    if self.cur.peek() == Some('\n') {
                        self.cur.bump();
                    }
                    piece.push('\n');
                } else {
                    piece.push(c);
                }
            }
            if took_ws {
                if piece.ends_with('\n')
                    && self.cur.peek() == Some(';')
                    && self.cur.at_line_start()
                {
                    piece.pop();
                }
                if !piece.is_empty() {
                    self.sink.whitespace(start.line, start.col, &piece);
                }
                continue;
            }
            if self.cur.peek() == Some('#') {
                let from = self.cur.pos();
                while let Some(c) = self.cur.peek() {
                    if c == '\n' || c == '\r' || self.opts.extra_eol.contains(&c) {
                        break;
                    }
                    self.cur.bump();
                }
                let comment = self.cur.slice_from(from).to_string();
                self.sink.whitespace(start.line, start.col, &comment);
                continue;
            }
            break;
        }
    }

    /// Signal a token boundary: a zero-length whitespace report fired as
    /// each semantic token arrives. It closes the pending run — or records
    /// that no whitespace stood here at all — keeping the consumer's run
    /// sequence aligned with the token sequence.
    fn token_boundary(&mut self) {
        self.sink.whitespace(self.cur.line, self.cur.col, "");
    }

    // --- token shapes ---------------------------------------------------

    fn read_word(&mut self) -> &'a str {
        let from = self.cur.pos();
        while let Some(c) = self.cur.peek() {
            if self.is_ws(c) || (self.cif2 && matches!(c, '[' | ']' | '{' | '}')) {
                break;
            }
            self.cur.bump();
        }
        self.cur.slice_from(from)
    }

    fn peek_word(&self) -> &'a str {
        let mut probe = self.cur;
        let from = probe.pos();
        while let Some(c) = probe.peek() {
            if self.is_ws(c) || (self.cif2 && matches!(c, '[' | ']' | '{' | '}')) {
                break;
            }
            probe.bump();
        }
        probe.slice_from(from)
    }

    fn is_keyword(word: &str) -> bool {
        let lower = word.to_lowercase();
        lower.starts_with("data_")
            || lower.starts_with("save_")
            || lower == "loop_"
            || lower == "global_"
            || lower == "stop_"
    }

    /// Whether the next token opens a value.
    fn at_value(&self) -> bool {
        match self.cur.peek() {
            None => false,
            Some(';') => self.cur.at_line_start(),
            Some('\'' | '"') => true,
            Some('[' | '{') => true,
            Some(']' | '}') => false,
            Some(_) => {
                let word = self.peek_word();
                !word.is_empty() && !word.starts_with('_') && !Self::is_keyword(word)
            }
        }
    }

    // --- structural productions -----------------------------------------

    fn open_block(&mut self, code: &str, at: Cursor) -> Result<Flow> {
        if self.close_frame_if_open()? == Flow::Halt {
            return Ok(Flow::Halt);
        }
        if let Some(block) = self.block.take() {
            if self.dir(|p| p.sink.block_end(p.cif, &block))? == Flow::Halt {
                return Ok(Flow::Halt);
            }
        }

        let block = match self.cif.create_block(code) {
            Ok(b) => Some(b),
            Err(CifError::DuplicateCode(_)) => {
                self.report(SyntaxCode::DuplicateBlockCode, at)?;
                Some(self.cif.block(code)?)
            }
            Err(CifError::InvalidBlockCode(_)) => {
                self.report(SyntaxCode::InvalidName, at)?;
                None
            }
            Err(e) => return Err(e),
        };
        self.block = block;
        if let Some(b) = self.block.clone() {
            return self.dir(|p| p.sink.block_start(p.cif, &b));
        }
        Ok(Flow::Go)
    }

    fn close_frame_if_open(&mut self) -> Result<Flow> {
        if self.frame.is_some() {
            self.report(SyntaxCode::UnterminatedFrame, self.cur)?;
            return self.close_frame(true);
        }
        Ok(Flow::Go)
    }

    fn close_frame(&mut self, implicit: bool) -> Result<Flow> {
        match self.frame.take() {
            Some(frame) => self.dir(|p| p.sink.frame_end(p.cif, &frame)),
            None => {
                if !implicit {
                    self.report(SyntaxCode::UnexpectedToken, self.cur)?;
                }
                Ok(Flow::Go)
            }
        }
    }

    fn open_frame(&mut self, code: &str, at: Cursor) -> Result<Flow> {
        if self.close_frame_if_open()? == Flow::Halt {
            return Ok(Flow::Halt);
        }
        let Some(block) = self.block.clone() else {
            self.report(SyntaxCode::UnexpectedToken, at)?;
            return Ok(Flow::Go);
        };
        let frame = match self.cif.create_frame(&block, code) {
            Ok(f) => Some(f),
            Err(CifError::DuplicateCode(_)) => {
                self.report(SyntaxCode::DuplicateFrameCode, at)?;
                Some(self.cif.frame(&block, code)?)
            }
            Err(CifError::InvalidFrameCode(_)) => {
                self.report(SyntaxCode::InvalidName, at)?;
                None
            }
            Err(e) => return Err(e),
        };
        self.frame = frame;
        if let Some(f) = self.frame.clone() {
            return self.dir(|p| p.sink.frame_start(p.cif, &f));
        }
        Ok(Flow::Go)
    }

    fn container(&self) -> Option<Container> {
        self.frame.clone().or_else(|| self.block.clone())
    }

    fn parse_item(&mut self, name: &'a str, at: Cursor) -> Result<Flow> {
        self.skip_ws();
        let value = if self.at_value() {
            self.token_boundary();
            self.lex_value()?
        } else {
            self.report(SyntaxCode::MissingValue, at)?;
            Value::Unknown
        };

        if let Some(container) = self.container() {
            if self.cif.loop_for_item(&container, name).is_ok() {
                self.report(SyntaxCode::DuplicateItemName, at)?;
            } else {
                match self.cif.set_value(&container, name, &value) {
                    Ok(()) => {}
                    Err(CifError::InvalidItemName(_)) => {
                        self.report(SyntaxCode::InvalidName, at)?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.item_event(Some(name), &value)
    }

    fn parse_loop(&mut self, at: Cursor) -> Result<Flow> {
        // header: the declared data names
        let mut names: Vec<ItemName> = Vec::new();
        let mut stored: Vec<bool> = Vec::new();
        loop {
            self.skip_ws();
            let word = self.peek_word();
            if !word.starts_with('_') {
                break;
            }
            let name_at = self.cur;
            self.token_boundary();
            let word = self.read_word();
            match ItemName::checked(word) {
                Ok(item) => {
                    let container_has = self
                        .container()
                        .is_some_and(|c| self.cif.loop_for_item(&c, word).is_ok());
                    let header_has = names.iter().any(|n| n.norm == item.norm);
                    if container_has || header_has {
                        self.report(SyntaxCode::DuplicateItemName, name_at)?;
                        names.push(item);
                        stored.push(false);
                    } else {
                        names.push(item);
                        stored.push(true);
                    }
                }
                Err(_) => {
                    self.report(SyntaxCode::InvalidName, name_at)?;
                    names.push(ItemName {
                        norm: NormName::of(word),
                        orig: word.to_string(),
                    });
                    stored.push(false);
                }
            }
        }
        if names.is_empty() {
            self.report(SyntaxCode::UnexpectedToken, at)?;
            return Ok(Flow::Go);
        }

        let container = self.container();
        let lp: Option<Loop> = match &container {
            Some(c) => {
                let good: Vec<&str> = names
                    .iter()
                    .zip(&stored)
                    .filter(|(_, keep)| **keep)
                    .map(|(n, _)| n.orig.as_str())
                    .collect();
                if good.is_empty() {
                    None
                } else {
                    Some(self.cif.create_loop(c, None, &good)?)
                }
            }
            None => None,
        };

        self.skip_ws();
        let empty = !self.at_value();

        let Some(lp) = lp else {
            // no usable loop: values, if any, are stray
            while self.at_value() {
                let v_at = self.cur;
                self.token_boundary();
                let v = self.lex_value()?;
                self.report(SyntaxCode::MisplacedValue, v_at)?;
                if self.item_event(None, &v)? == Flow::Halt {
                    return Ok(Flow::Halt);
                }
                self.skip_ws();
            }
            return Ok(Flow::Go);
        };

        // a packetless loop is flagged before the loop-start event so the
        // interceptor can arrange the synthetic packet
        if empty {
            self.report(SyntaxCode::EmptyLoop, at)?;
        }

        if self.dir(|p| p.sink.loop_start(p.cif, &lp))? == Flow::Halt {
            return Ok(Flow::Halt);
        }

        while self.at_value() {
            let shell = Packet::new();
            match self.sink.packet_start(self.cif, &shell)? {
                Directive::End => return Ok(Flow::Halt),
                _ => {}
            }

            let mut packet = Packet::new();
            let mut short = false;
            for (i, name) in names.iter().enumerate() {
                if i > 0 {
                    self.skip_ws();
                }
                if !short && !self.at_value() {
                    self.report(SyntaxCode::PartialPacket, self.cur)?;
                    short = true;
                }
                let value = if short {
                    Value::Unknown
                } else {
                    self.token_boundary();
                    self.lex_value()?
                };
                if self.item_event(Some(&name.orig), &value)? == Flow::Halt {
                    return Ok(Flow::Halt);
                }
                if stored[i] {
                    packet.insert(&name.orig, value);
                }
            }

            match self.sink.packet_end(self.cif, &packet)? {
                Directive::End => return Ok(Flow::Halt),
                Directive::SkipCurrent => {}
                _ => self.cif.add_packet(&lp, &packet)?,
            }
            self.skip_ws();
        }

        self.dir(|p| p.sink.loop_end(p.cif, &lp))
    }

    // --- value lexing ---------------------------------------------------

    fn lex_value(&mut self) -> Result<Value> {
        let at = self.cur;
        let c = self
            .cur
            .peek()
            .ok_or_else(|| CifError::Internal("lex_value at end of input".to_string()))?;

        let value = if c == ';' && self.cur.at_line_start() {
            self.lex_text_field(at)?
        } else if c == '\'' || c == '"' {
            let triple = [c, c, c].iter().collect::<String>();
            if self.cif2 && self.cur.rest().starts_with(&triple) {
                self.lex_triple(c, at)?
            } else {
                self.lex_quoted(c, at)?
            }
        } else if c == '[' || c == '{' {
            if self.cif2 {
                if c == '[' {
                    self.lex_list(at)?
                } else {
                    self.lex_table(at)?
                }
            } else {
                self.report(SyntaxCode::DisallowedSyntax, at)?;
                self.lex_bare()
            }
        } else {
            self.lex_bare()
        };
        Ok(value)
    }

    fn lex_bare(&mut self) -> Value {
        let from = self.cur.pos();
        while let Some(c) = self.cur.peek() {
            if self.is_ws(c) || (self.cif2 && matches!(c, '[' | ']' | '{' | '}')) {
                break;
            }
            self.cur.bump();
        }
        let word = self.cur.slice_from(from);
        match word {
            "?" => Value::Unknown,
            "." => Value::NotApplicable,
            _ => Value::number(word).unwrap_or_else(|| Value::bare(word)),
        }
    }

    fn lex_quoted(&mut self, quote: char, at: Cursor) -> Result<Value> {
        self.cur.bump();
        let mut out = String::new();
        loop {
            match self.cur.peek() {
                None | Some('\n') | Some('\r') => {
                    self.report(SyntaxCode::UnterminatedString, at)?;
                    break;
                }
                Some(c) if c == quote => {
                    self.cur.bump();
                    if self.cif2 {
                        break;
                    }
                    // CIF 1.1: a quote not followed by whitespace is content
                    match self.cur.peek() {
                        None => break,
                        Some(next) if self.is_ws(next) => break,
                        Some(_) => out.push(quote),
                    }
                }
                Some(c) => {
                    self.cur.bump();
                    out.push(c);
                }
            }
        }
        Ok(Value::quoted(out))
    }

    fn lex_triple(&mut self, quote: char, at: Cursor) -> Result<Value> {
        for _ in 0..3 {
            self.cur.bump();
        }
        let mut out = String::new();
        let mut run = 0;
        loop {
            match self.cur.peek() {
                None => {
                    self.report(SyntaxCode::UnterminatedString, at)?;
                    break;
                }
                Some(c) if c == quote => {
                    self.cur.bump();
                    run += 1;
                    if run == 3 {
                        break;
                    }
                }
                Some(c) => {
                    for _ in 0..run {
                        out.push(quote);
                    }
                    run = 0;
                    self.cur.bump();
                    if c == '\r' {
                        if self.cur.peek() == Some('\n') {
                            self.cur.bump();
                        }
                        out.push('\n');
                    } else {
                        out.push(c);
                    }
                }
            }
        }
        Ok(Value::quoted(out))
    }

    fn lex_text_field(&mut self, at: Cursor) -> Result<Value> {
        self.cur.bump(); // the opening semicolon
        let mut raw = String::new();
        loop {
            match self.cur.bump() {
                None => {
                    self.report(SyntaxCode::UnterminatedTextField, at)?;
                    break;
                }
                Some('\n') => {
                    if self.cur.peek() == Some(';') {
                        self.cur.bump();
                        break;
                    }
                    raw.push('\n');
                }
                Some('\r') => {
                    if self.cur.peek() == Some('\n') {
                        self.cur.bump();
                    }
                    if self.cur.peek() == Some(';') {
                        self.cur.bump();
                        break;
                    }
                    raw.push('\n');
                }
                Some(c) => raw.push(c),
            }
        }
        let decoded =
            text::decode_text_field(&raw, self.opts.decode_folding, self.opts.decode_prefixing);
        Ok(Value::quoted(decoded))
    }

    fn lex_list(&mut self, at: Cursor) -> Result<Value> {
        self.cur.bump();
        let mut elements = Vec::new();
        loop {
            self.skip_ws();
            match self.cur.peek() {
                None => {
                    self.report(SyntaxCode::UnterminatedList, at)?;
                    break;
                }
                Some(']') => {
                    self.token_boundary();
                    self.cur.bump();
                    break;
                }
                _ => {
                    if !self.at_value() {
                        self.report(SyntaxCode::UnexpectedToken, self.cur)?;
                        break;
                    }
                    self.token_boundary();
                    elements.push(self.lex_value()?);
                }
            }
        }
        Ok(Value::List(elements))
    }

    fn lex_table(&mut self, at: Cursor) -> Result<Value> {
        self.cur.bump();
        let mut entries = Table::default();
        loop {
            self.skip_ws();
            match self.cur.peek() {
                None => {
                    self.report(SyntaxCode::UnterminatedTable, at)?;
                    break;
                }
                Some('}') => {
                    self.token_boundary();
                    self.cur.bump();
                    break;
                }
                Some('\'' | '"') => {
                    self.token_boundary();
                    let key = match self.lex_value()? {
                        Value::Char(c) => c.text,
                        _ => String::new(),
                    };
                    self.skip_ws();
                    if self.cur.peek() == Some(':') {
                        self.token_boundary();
                        self.cur.bump();
                    } else {
                        self.report(SyntaxCode::UnexpectedToken, self.cur)?;
                    }
                    self.skip_ws();
                    let value = if self.at_value() {
                        self.token_boundary();
                        self.lex_value()?
                    } else {
                        self.report(SyntaxCode::MissingValue, self.cur)?;
                        Value::Unknown
                    };
                    let norm = NormName::of(&key);
                    if entries.contains_key(&norm) {
                        self.report(SyntaxCode::DuplicateItemName, self.cur)?;
                    } else {
                        entries.insert(
                            norm,
                            TableEntry {
                                key_orig: key,
                                value,
                            },
                        );
                    }
                }
                _ => {
                    self.report(SyntaxCode::UnexpectedToken, self.cur)?;
                    if self.at_value() {
                        self.token_boundary();
                        let _ = self.lex_value()?;
                    } else {
                        break;
                    }
                }
            }
        }
        Ok(Value::Table(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink recording events, whitespace pieces, and reported errors.
    #[derive(Default)]
    struct Log {
        events: Vec<String>,
        errors: Vec<SyntaxCode>,
        strict: bool,
        skip_packets: bool,
    }

    impl CifHandler for Log {
        fn cif_start(&mut self, _cif: &Cif) -> cif_walk::Step {
            self.events.push("cif_start".into());
            Ok(Directive::Continue)
        }
        fn cif_end(&mut self, _cif: &Cif) -> cif_walk::Step {
            self.events.push("cif_end".into());
            Ok(Directive::Continue)
        }
        fn block_start(&mut self, _cif: &Cif, block: &Container) -> cif_walk::Step {
            self.events.push(format!("block {}", block.code_orig));
            Ok(Directive::Continue)
        }
        fn block_end(&mut self, _cif: &Cif, _block: &Container) -> cif_walk::Step {
            self.events.push("block_end".into());
            Ok(Directive::Continue)
        }
        fn frame_start(&mut self, _cif: &Cif, frame: &Container) -> cif_walk::Step {
            self.events.push(format!("frame {}", frame.code_orig));
            Ok(Directive::Continue)
        }
        fn frame_end(&mut self, _cif: &Cif, _frame: &Container) -> cif_walk::Step {
            self.events.push("frame_end".into());
            Ok(Directive::Continue)
        }
        fn loop_start(&mut self, _cif: &Cif, _lp: &Loop) -> cif_walk::Step {
            self.events.push("loop_start".into());
            Ok(Directive::Continue)
        }
        fn loop_end(&mut self, _cif: &Cif, _lp: &Loop) -> cif_walk::Step {
            self.events.push("loop_end".into());
            Ok(Directive::Continue)
        }
        fn packet_start(&mut self, _cif: &Cif, _packet: &Packet) -> cif_walk::Step {
            self.events.push("packet_start".into());
            Ok(Directive::Continue)
        }
        fn packet_end(&mut self, _cif: &Cif, _packet: &Packet) -> cif_walk::Step {
            self.events.push("packet_end".into());
            Ok(if self.skip_packets {
                Directive::SkipCurrent
            } else {
                Directive::Continue
            })
        }
        fn item(&mut self, _cif: &Cif, name: Option<&str>, value: &Value) -> cif_walk::Step {
            let text = match value {
                Value::Unknown => "?".to_string(),
                Value::NotApplicable => ".".to_string(),
                Value::Char(c) => format!("'{}'", c.text),
                Value::Number(n) => n.text.clone(),
                Value::List(l) => format!("list[{}]", l.len()),
                Value::Table(t) => format!("table[{}]", t.len()),
            };
            self.events
                .push(format!("item {} {}", name.unwrap_or("-"), text));
            Ok(Directive::Continue)
        }
    }

    impl ParseSink for Log {
        fn whitespace(&mut self, _line: u32, _column: u32, ws: &str) {
            self.events.push(format!("ws {ws:?}"));
        }
        fn syntax_error(&mut self, error: &SyntaxError) -> Result<()> {
            self.errors.push(error.code);
            if self.strict {
                Err(CifError::Halted(error.to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn parse(input: &str) -> (Cif, Log) {
        let cif = Cif::create().unwrap();
        let mut log = Log::default();
        parse_into(&cif, input, &ParseOptions::default(), &mut log).unwrap();
        (cif, log)
    }

    #[test]
    fn scalar_items_events_and_store() {
        let (cif, log) = parse("data_a\n_x 1\n_y 'two words'\n");
        let b = cif.block("a").unwrap();
        assert_eq!(cif.value(&b, "_x").unwrap(), Value::number("1").unwrap());
        assert_eq!(cif.value(&b, "_y").unwrap(), Value::quoted("two words"));
        let semantic: Vec<_> = log
            .events
            .iter()
            .filter(|e| !e.starts_with("ws "))
            .cloned()
            .collect();
        assert_eq!(
            semantic,
            [
                "cif_start",
                "block a",
                "item _x 1",
                "item _y 'two words'",
                "block_end",
                "cif_end"
            ]
        );
        assert!(log.errors.is_empty());
    }

    #[test]
    fn whitespace_pieces_and_comments_are_reported() {
        let (_cif, log) = parse("data_a # note\n_x 1\n");
        // the gap between `data_a` and `_x` is one run of three pieces:
        // a space, the comment, and the newline
        let ws: Vec<_> = log
            .events
            .iter()
            .filter(|e| e.starts_with("ws "))
            .cloned()
            .collect();
        assert!(ws.contains(&"ws \" \"".to_string()));
        assert!(ws.contains(&"ws \"# note\"".to_string()));
        assert!(ws.contains(&"ws \"\\n\"".to_string()));
    }

    #[test]
    fn loop_events_in_order() {
        let (cif, log) = parse("data_a\nloop_\n_p\n_q\n1 2\n3 4\n");
        let b = cif.block("a").unwrap();
        let lp = cif.loop_for_item(&b, "_p").unwrap();
        assert_eq!(cif.packet_count(&lp).unwrap(), 2);
        let semantic: Vec<_> = log
            .events
            .iter()
            .filter(|e| !e.starts_with("ws "))
            .cloned()
            .collect();
        assert_eq!(
            semantic,
            [
                "cif_start",
                "block a",
                "loop_start",
                "packet_start",
                "item _p 1",
                "item _q 2",
                "packet_end",
                "packet_start",
                "item _p 3",
                "item _q 4",
                "packet_end",
                "loop_end",
                "block_end",
                "cif_end"
            ]
        );
    }

    #[test]
    fn skip_current_from_packet_end_suppresses_storage() {
        let cif = Cif::create().unwrap();
        let mut log = Log {
            skip_packets: true,
            ..Log::default()
        };
        parse_into(
            &cif,
            "data_a\nloop_\n_p\n1\n2\n",
            &ParseOptions::default(),
            &mut log,
        )
        .unwrap();
        let b = cif.block("a").unwrap();
        let lp = cif.loop_for_item(&b, "_p").unwrap();
        assert_eq!(cif.packet_count(&lp).unwrap(), 0);
    }

    #[test]
    fn empty_loop_is_reported_before_loop_start() {
        let (_cif, log) = parse("data_a\nloop_\n_p\n_q\ndata_b\n");
        assert_eq!(log.errors, [SyntaxCode::EmptyLoop]);
        let semantic: Vec<_> = log
            .events
            .iter()
            .filter(|e| !e.starts_with("ws "))
            .cloned()
            .collect();
        assert_eq!(
            semantic,
            [
                "cif_start",
                "block a",
                "loop_start",
                "loop_end",
                "block_end",
                "block b",
                "block_end",
                "cif_end"
            ]
        );
    }

    #[test]
    fn frames_open_and_close() {
        let (cif, log) = parse("data_a\nsave_f\n_x 1\nsave_\n_y 2\n");
        let b = cif.block("a").unwrap();
        let f = cif.frame(&b, "f").unwrap();
        assert_eq!(cif.value(&f, "_x").unwrap(), Value::number("1").unwrap());
        assert_eq!(cif.value(&b, "_y").unwrap(), Value::number("2").unwrap());
        assert!(log.events.contains(&"frame f".to_string()));
        assert!(log.events.contains(&"frame_end".to_string()));
        assert!(log.errors.is_empty());
    }

    #[test]
    fn unterminated_frame_is_reported_and_closed() {
        let (_cif, log) = parse("data_a\nsave_f\n_x 1\n");
        assert_eq!(log.errors, [SyntaxCode::UnterminatedFrame]);
        assert!(log.events.contains(&"frame_end".to_string()));
    }

    #[test]
    fn text_field_with_fold_decoding() {
        let (cif, _log) = parse("data_a\n_t\n;\\\nabcd\\\nefgh\n;\n");
        let b = cif.block("a").unwrap();
        assert_eq!(cif.value(&b, "_t").unwrap(), Value::quoted("abcdefgh"));
    }

    #[test]
    fn text_field_fold_decoding_can_be_disabled() {
        let cif = Cif::create().unwrap();
        let mut log = Log::default();
        let mut opts = ParseOptions::default();
        opts.decode_folding = false;
        opts.decode_prefixing = false;
        parse_into(&cif, "data_a\n_t\n;\\\nab\\\ncd\n;\n", &opts, &mut log).unwrap();
        let b = cif.block("a").unwrap();
        assert_eq!(cif.value(&b, "_t").unwrap(), Value::quoted("\\\nab\\\ncd"));
    }

    #[test]
    fn cif2_list_and_table_values() {
        let cif = Cif::create().unwrap();
        let mut log = Log::default();
        let input = "#\\#CIF_2.0\ndata_a\n_l [1 2 3]\n_t {'k':v}\n";
        parse_into(&cif, input, &ParseOptions::default(), &mut log).unwrap();
        let b = cif.block("a").unwrap();
        let Value::List(l) = cif.value(&b, "_l").unwrap() else {
            panic!("expected a list");
        };
        assert_eq!(l.len(), 3);
        assert_eq!(l[0], Value::number("1").unwrap());
        let Value::Table(t) = cif.value(&b, "_t").unwrap() else {
            panic!("expected a table");
        };
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(&NormName::of("k")).unwrap().value, Value::bare("v"));
        assert!(log.errors.is_empty());
    }

    #[test]
    fn brackets_are_plain_text_in_cif11() {
        let (cif, log) = parse("data_a\n_l [1]\n");
        let b = cif.block("a").unwrap();
        assert_eq!(cif.value(&b, "_l").unwrap(), Value::bare("[1]"));
        assert_eq!(log.errors, [SyntaxCode::DisallowedSyntax]);
    }

    #[test]
    fn missing_value_becomes_unknown() {
        let (cif, log) = parse("data_a\n_x\ndata_b\n");
        let a = cif.block("a").unwrap();
        assert_eq!(cif.value(&a, "_x").unwrap(), Value::Unknown);
        assert_eq!(log.errors, [SyntaxCode::MissingValue]);
    }

    #[test]
    fn duplicate_block_is_reused() {
        let (cif, log) = parse("data_a\n_x 1\ndata_A\n_y 2\n");
        assert_eq!(log.errors, [SyntaxCode::DuplicateBlockCode]);
        let a = cif.block("a").unwrap();
        assert_eq!(cif.value(&a, "_y").unwrap(), Value::number("2").unwrap());
    }

    #[test]
    fn short_final_packet_is_padded() {
        let (cif, log) = parse("data_a\nloop_\n_p\n_q\n1 2 3\n");
        assert_eq!(log.errors, [SyntaxCode::PartialPacket]);
        let b = cif.block("a").unwrap();
        let lp = cif.loop_for_item(&b, "_p").unwrap();
        assert_eq!(cif.packet_count(&lp).unwrap(), 2);
        let rows: Vec<_> = cif.packets(&lp).collect::<Result<_>>().unwrap();
        assert_eq!(rows[1].get("_q"), Some(&Value::Unknown));
    }

    #[test]
    fn strict_sink_aborts_the_parse() {
        let cif = Cif::create().unwrap();
        let mut log = Log {
            strict: true,
            ..Log::default()
        };
        let err = parse_into(
            &cif,
            "data_a\n_x\ndata_b\n",
            &ParseOptions::default(),
            &mut log,
        )
        .unwrap_err();
        assert!(matches!(err, CifError::Halted(_)));
        // the block after the error was never opened
        assert!(matches!(cif.block("b"), Err(CifError::NoSuchBlock(_))));
    }

    #[test]
    fn quoted_string_cif11_embedded_quote() {
        let (cif, _log) = parse("data_a\n_x 'it's fine'\n");
        let b = cif.block("a").unwrap();
        assert_eq!(cif.value(&b, "_x").unwrap(), Value::quoted("it's fine"));
    }

    #[test]
    fn triple_quoted_string_in_cif2() {
        let cif = Cif::create().unwrap();
        let mut log = Log::default();
        let input = "#\\#CIF_2.0\ndata_a\n_x '''a 'b' c'''\n";
        parse_into(&cif, input, &ParseOptions::default(), &mut log).unwrap();
        let b = cif.block("a").unwrap();
        assert_eq!(cif.value(&b, "_x").unwrap(), Value::quoted("a 'b' c"));
    }

    #[test]
    fn magic_comment_is_reported_as_whitespace() {
        let (_cif, log) = parse("#\\#CIF_1.1\ndata_a\n_x 1\n");
        assert!(
            log.events
                .iter()
                .any(|e| e.starts_with("ws ") && e.contains("CIF_1.1"))
        );
    }

    #[test]
    fn stray_value_reported_with_no_name() {
        let (_cif, log) = parse("data_a\n_x 1\nstray\n");
        assert_eq!(log.errors, [SyntaxCode::MisplacedValue]);
        assert!(log.events.contains(&"item - 'stray'".to_string()));
    }

    #[test]
    fn syntax_error_display_format() {
        let e = SyntaxError {
            code: SyntaxCode::EmptyLoop,
            line: 3,
            column: 7,
            sample: "loop_".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "CIF error 1 at line 3, column 7, (near 'loop_'): loop has no packets"
        );
    }
}
