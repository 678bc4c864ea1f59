//! Name normalization.
//!
//! Two identifiers denote the same block, frame, or data item exactly when
//! their normalized forms are equal. Normalization is NFC followed by simple
//! case folding; the original spelling is kept separately wherever it must be
//! reproduced on output.

use unicode_normalization::UnicodeNormalization;

use crate::error::{CifError, Result};

/// A case-folded, NFC-normalized identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormName(String);

impl NormName {
    /// Normalize without validating. Use the checked constructors when the
    /// identifier comes from outside.
    pub fn of(raw: &str) -> NormName {
        NormName(raw.nfc().flat_map(char::to_lowercase).collect())
    }

    /// Validate and normalize a data block code.
    pub fn block_code(raw: &str) -> Result<NormName> {
        if valid_code(raw) {
            Ok(NormName::of(raw))
        } else {
            Err(CifError::InvalidBlockCode(raw.to_string()))
        }
    }

    /// Validate and normalize a save frame code.
    pub fn frame_code(raw: &str) -> Result<NormName> {
        if valid_code(raw) {
            Ok(NormName::of(raw))
        } else {
            Err(CifError::InvalidFrameCode(raw.to_string()))
        }
    }

    /// Validate and normalize a data name. Data names begin with an
    /// underscore and carry at least one further character.
    pub fn item_name(raw: &str) -> Result<NormName> {
        let ok = raw.starts_with('_') && raw.len() > 1 && raw.chars().all(plain);
        if ok {
            Ok(NormName::of(raw))
        } else {
            Err(CifError::InvalidItemName(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for NormName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NormName {
    fn from(already_normalized: String) -> NormName {
        NormName(already_normalized)
    }
}

fn valid_code(raw: &str) -> bool {
    !raw.is_empty() && raw.chars().all(plain)
}

/// Printable, non-whitespace: the only characters permitted in identifiers.
fn plain(c: char) -> bool {
    !c.is_whitespace() && !c.is_control()
}

/// A data name in both forms: the normalized key and the author's spelling.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemName {
    pub norm: NormName,
    pub orig: String,
}

impl ItemName {
    pub fn checked(raw: &str) -> Result<ItemName> {
        Ok(ItemName {
            norm: NormName::item_name(raw)?,
            orig: raw.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_fold_equates_spellings() {
        assert_eq!(NormName::of("_Atom_Site_Label"), NormName::of("_atom_site_label"));
        assert_ne!(NormName::of("_a"), NormName::of("_b"));
    }

    #[test]
    fn nfc_equates_composed_and_decomposed() {
        // U+00E9 vs 'e' + U+0301
        assert_eq!(NormName::of("caf\u{e9}"), NormName::of("cafe\u{301}"));
    }

    #[test]
    fn block_code_rejects_empty_and_whitespace() {
        assert!(NormName::block_code("ok").is_ok());
        assert!(matches!(
            NormName::block_code(""),
            Err(CifError::InvalidBlockCode(_))
        ));
        assert!(matches!(
            NormName::block_code("a b"),
            Err(CifError::InvalidBlockCode(_))
        ));
        assert!(matches!(
            NormName::frame_code("a\tb"),
            Err(CifError::InvalidFrameCode(_))
        ));
    }

    #[test]
    fn item_name_requires_leading_underscore() {
        assert!(NormName::item_name("_x").is_ok());
        assert!(matches!(
            NormName::item_name("x"),
            Err(CifError::InvalidItemName(_))
        ));
        assert!(matches!(
            NormName::item_name("_"),
            Err(CifError::InvalidItemName(_))
        ));
        assert!(matches!(
            NormName::item_name("_a b"),
            Err(CifError::InvalidItemName(_))
        ));
    }
}
