//! String and number matching primitives used by the scorer.

use crate::config::ServiceConfig;
use unicode_normalization::UnicodeNormalization;

/// Matching score of two strings in [0, 100].
///
/// Entity ids short-circuit to exact comparison, as do pure integers;
/// everything else goes through a symmetric token-sort similarity over
/// case- and diacritic-folded text.
pub fn fuzzy_match_strings(config: &ServiceConfig, reference: &str, value: &str) -> f64 {
    if reference.is_empty() || value.is_empty() {
        return 0.0;
    }
    let ref_id = config.item_id(reference);
    let val_id = config.item_id(value);
    if ref_id.is_some() || val_id.is_some() {
        return if ref_id == val_id { 100.0 } else { 0.0 };
    }
    if let (Ok(a), Ok(b)) = (reference.trim().parse::<i64>(), value.trim().parse::<i64>()) {
        return if a == b { 100.0 } else { 0.0 };
    }
    let a = token_sort_key(reference);
    let b = token_sort_key(value);
    (strsim::normalized_levenshtein(&a, &b) * 100.0).round()
}

/// Case-folds, strips diacritics and sorts whitespace tokens, so that
/// "Émile Zola" and "zola, emile" compare well.
fn token_sort_key(s: &str) -> String {
    let folded = fold(s);
    let mut tokens: Vec<&str> = folded
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// NFKD-decomposes, drops combining marks and lowercases.
fn fold(s: &str) -> String {
    s.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

fn is_combining_mark(c: char) -> bool {
    matches!(c, '\u{0300}'..='\u{036f}' | '\u{1ab0}'..='\u{1aff}' | '\u{20d0}'..='\u{20ff}')
}

/// Score of two floats: 100 on exact match, otherwise a curve that decays
/// with the order of magnitude of the difference.
pub fn match_floats(reference: f64, value: f64) -> f64 {
    let diff = (reference - value).abs();
    if diff == 0.0 {
        return 100.0;
    }
    let logdiff = diff.ln();
    100.0 * ((-logdiff).atan() / std::f64::consts::PI + 0.5)
}
