//! In-memory CIF value model.
//!
//! A CIF document is a sequence of *data blocks*, each holding *save frames*,
//! *loops* (tabular data), and scalar data items. Every item maps a data name
//! to a [`Value`]. Values preserve exactly what the author wrote: numbers keep
//! their literal text, character values remember whether they were delimited,
//! and composite values (CIF 2.0 lists and tables) keep insertion order.

use indexmap::IndexMap;

pub mod error;
pub mod name;

pub use error::{CifError, Result};
pub use name::{ItemName, NormName};

/// The kind of a [`Value`], used where only the shape matters (storage rows,
/// dialect checks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Unknown,
    NotApplicable,
    Char,
    Number,
    List,
    Table,
}

/// A character-typed value. `quoted` records whether the original was
/// delimited; an originally delimited value must not be re-emitted as a bare
/// word even when its text would allow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharValue {
    pub text: String,
    pub quoted: bool,
}

/// A numeric value. The literal text is authoritative (emission reproduces it
/// character for character); the parsed magnitude and the standard-uncertainty
/// digits are carried as metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberValue {
    pub text: String,
    pub value: f64,
    pub su_digits: Option<String>,
}

/// One entry of a table value: the key's original spelling plus the value.
/// Keys are unique by normalized form; the map preserves insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct TableEntry {
    pub key_orig: String,
    pub value: Value,
}

pub type Table = IndexMap<NormName, TableEntry>;

/// A CIF data value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The `?` absence token: value not known.
    Unknown,
    /// The `.` absence token: value not applicable.
    NotApplicable,
    Char(CharValue),
    Number(NumberValue),
    /// Ordered sequence (CIF 2.0 only on output).
    List(Vec<Value>),
    /// Insertion-ordered mapping (CIF 2.0 only on output).
    Table(Table),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Unknown => Kind::Unknown,
            Value::NotApplicable => Kind::NotApplicable,
            Value::Char(_) => Kind::Char,
            Value::Number(_) => Kind::Number,
            Value::List(_) => Kind::List,
            Value::Table(_) => Kind::Table,
        }
    }

    /// Construct a character value from a bare (undelimited) word.
    pub fn bare(text: impl Into<String>) -> Value {
        Value::Char(CharValue {
            text: text.into(),
            quoted: false,
        })
    }

    /// Construct a character value from delimited text.
    pub fn quoted(text: impl Into<String>) -> Value {
        Value::Char(CharValue {
            text: text.into(),
            quoted: true,
        })
    }

    /// Parse a CIF numeric literal (`123`, `-4.5e2`, `1.54(3)`). Returns
    /// `None` when the text is not a well-formed number.
    pub fn number(text: &str) -> Option<Value> {
        parse_number(text).map(Value::Number)
    }

    /// The literal text of a char or number value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Char(c) => Some(&c.text),
            Value::Number(n) => Some(&n.text),
            _ => None,
        }
    }

    /// Whether the value was originally delimited. Numbers and absence tokens
    /// are never quoted.
    pub fn is_quoted(&self) -> bool {
        matches!(self, Value::Char(CharValue { quoted: true, .. }))
    }
}

/// Parse a CIF numeric literal: optional sign, integer and/or fraction
/// digits, optional exponent, optional parenthesized standard uncertainty.
/// The whole input must be consumed.
fn parse_number(text: &str) -> Option<NumberValue> {
    let mut rest = text;
    let mut mantissa = String::new();

    if let Some(r) = rest.strip_prefix(['+', '-']) {
        mantissa.push_str(&text[..1]);
        rest = r;
    }

    let int_digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    mantissa.push_str(&rest[..int_digits]);
    rest = &rest[int_digits..];

    let mut frac_digits = 0;
    if let Some(r) = rest.strip_prefix('.') {
        frac_digits = r.len() - r.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        mantissa.push('.');
        mantissa.push_str(&r[..frac_digits]);
        rest = &r[frac_digits..];
    }
    if int_digits == 0 && frac_digits == 0 {
        return None;
    }

    if let Some(r) = rest.strip_prefix(['e', 'E']) {
        let mut exp = String::from("e");
        let r = match r.strip_prefix(['+', '-']) {
            Some(stripped) => {
                exp.push_str(&r[..1]);
                stripped
            }
            None => r,
        };
        let exp_digits = r.len() - r.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if exp_digits == 0 {
            return None;
        }
        exp.push_str(&r[..exp_digits]);
        mantissa.push_str(&exp);
        rest = &r[exp_digits..];
    }

    let su_digits = if let Some(r) = rest.strip_prefix('(') {
        let su_len = r.len() - r.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        let r2 = r[su_len..].strip_prefix(')')?;
        if su_len == 0 || !r2.is_empty() {
            return None;
        }
        rest = r2;
        Some(r[..su_len].to_string())
    } else {
        None
    };

    if !rest.is_empty() {
        return None;
    }

    let value = mantissa.parse::<f64>().ok()?;
    Some(NumberValue {
        text: text.to_string(),
        value,
        su_digits,
    })
}

/// One entry of a loop packet: the data name's original spelling plus the
/// value bound to it in this row.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketEntry {
    pub name_orig: String,
    pub value: Value,
}

/// One row of a loop: an insertion-ordered mapping from normalized data name
/// to value. A packet's key set always equals the owning loop's name set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    entries: IndexMap<NormName, PacketEntry>,
}

impl Packet {
    pub fn new() -> Packet {
        Packet::default()
    }

    /// Bind `name` to `value`, replacing any previous binding. The original
    /// spelling is retained for emission.
    pub fn insert(&mut self, name: &str, value: Value) {
        self.entries.insert(
            NormName::of(name),
            PacketEntry {
                name_orig: name.to_string(),
                value,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(&NormName::of(name)).map(|e| &e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &NormName> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NormName, &PacketEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_plain_integer() {
        let Some(Value::Number(n)) = Value::number("42") else {
            panic!("expected a number");
        };
        assert_eq!(n.text, "42");
        assert_eq!(n.value, 42.0);
        assert_eq!(n.su_digits, None);
    }

    #[test]
    fn number_with_uncertainty_and_exponent() {
        let Some(Value::Number(n)) = Value::number("-1.54(3)") else {
            panic!("expected a number");
        };
        assert_eq!(n.value, -1.54);
        assert_eq!(n.su_digits.as_deref(), Some("3"));

        let Some(Value::Number(n)) = Value::number("2.5e-4") else {
            panic!("expected a number");
        };
        assert!((n.value - 2.5e-4).abs() < 1e-12);
    }

    #[test]
    fn number_rejects_malformed() {
        assert_eq!(Value::number("abc"), None);
        assert_eq!(Value::number(""), None);
        assert_eq!(Value::number("."), None);
        assert_eq!(Value::number("1.2(3"), None);
        assert_eq!(Value::number("1e"), None);
        assert_eq!(Value::number("1 2"), None);
    }

    #[test]
    fn bare_and_quoted_distinguished() {
        assert!(!Value::bare("x").is_quoted());
        assert!(Value::quoted("x").is_quoted());
        assert_eq!(Value::bare("x").as_text(), Some("x"));
    }

    #[test]
    fn packet_preserves_insertion_order_and_spelling() {
        let mut p = Packet::new();
        p.insert("_B", Value::bare("1"));
        p.insert("_a", Value::bare("2"));
        let names: Vec<_> = p.names().map(|n| n.as_str().to_string()).collect();
        assert_eq!(names, ["_b", "_a"]);
        let origs: Vec<_> = p.iter().map(|(_, e)| e.name_orig.as_str()).collect();
        assert_eq!(origs, ["_B", "_a"]);
        assert_eq!(p.get("_b"), Some(&Value::bare("1")));
    }

    #[test]
    fn table_keeps_insertion_order() {
        let mut t = Table::default();
        t.insert(
            NormName::of("Z"),
            TableEntry {
                key_orig: "Z".into(),
                value: Value::bare("1"),
            },
        );
        t.insert(
            NormName::of("a"),
            TableEntry {
                key_orig: "a".into(),
                value: Value::bare("2"),
            },
        );
        let keys: Vec<_> = t.keys().map(|k| k.as_str().to_string()).collect();
        assert_eq!(keys, ["z", "a"]);
    }
}
