//! Label normalization for concept matching.
//!
//! Matching is exact on the normalized key only. Synonyms and singular/plural
//! variants produce different keys and are therefore different classes.

use crate::model::{Category, ConceptKey};

/// Canonical form of a label: lowercased, apostrophes dropped, every run of
/// other non-alphanumeric characters collapsed into a single space, trimmed.
pub fn normalize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_space = false;

    for ch in label.chars() {
        if matches!(ch, '\'' | '\u{2019}' | '\u{2018}') {
            continue;
        }
        let lowered: String = if ch.is_alphanumeric() {
            // Some lowercase mappings expand into combining marks; keep only
            // the alphanumeric part so the result is a fixed point.
            ch.to_lowercase().filter(|c| c.is_alphanumeric()).collect()
        } else {
            String::new()
        };
        if lowered.is_empty() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push_str(&lowered);
    }

    out
}

/// Lookup key for a raw label in a category.
pub fn concept_key(category: Category, label: &str) -> ConceptKey {
    ConceptKey::new(category, normalize_label(label))
}

/// URI-safe slug for an already-normalized label.
pub fn slug(normalized_label: &str) -> String {
    normalized_label.replace(' ', "-")
}
