//! Language fallback for labels and descriptions.

use std::collections::HashMap;

/// Picks the most appropriate text for a target language: the language
/// itself, then `en`, then anything available.
pub fn language_fallback<'a>(
    terms: &'a HashMap<String, String>,
    target_language: &str,
) -> Option<&'a str> {
    let target = if target_language.is_empty() {
        "en"
    } else {
        target_language
    };
    if let Some(text) = terms.get(target) {
        return Some(text);
    }
    if target != "en" {
        if let Some(text) = terms.get("en") {
            return Some(text);
        }
    }
    // Deterministic "anything": smallest language code wins.
    terms
        .iter()
        .min_by(|a, b| a.0.cmp(b.0))
        .map(|(_, text)| text.as_str())
}
