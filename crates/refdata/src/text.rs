use unicode_normalization::UnicodeNormalization;

/// Fold diacritics: normalisation form D followed by stripping combining
/// marks in U+0300..=U+036F. Applied to names at build time and to queries
/// at search time, so that `café` and `cafe` compare equal.
pub fn fold(s: &str) -> String {
    s.nfd()
        .filter(|c| !('\u{0300}'..='\u{036f}').contains(c))
        .collect()
}

/// Build an FTS5 prefix query from raw user input: fold, split into tokens,
/// and quote each token with a trailing `*`. Returns None when no tokens
/// survive (e.g. a bare `*`), which callers treat as match-all.
pub fn fts_prefix_query(q: &str) -> Option<String> {
    let folded = fold(q);
    let tokens: Vec<String> = folded
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t.replace('"', "\"\"")))
        .collect();

    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

#[cfg(test)]
mod test {
    use super::{fold, fts_prefix_query};

    #[test]
    fn latin_diacritics_fold() {
        assert_eq!(fold("café"), "cafe");
        assert_eq!(fold("Solanum lycopersicum"), "Solanum lycopersicum");
        assert_eq!(fold("Crème brûlée"), "Creme brulee");
    }

    #[test]
    fn greek_tonos_folds() {
        assert_eq!(fold("λεμόνι"), "λεμονι");
    }

    #[test]
    fn folding_is_idempotent() {
        for s in ["café", "λεμόνι", "already plain"] {
            assert_eq!(fold(&fold(s)), fold(s));
        }
    }

    #[test]
    fn prefix_queries_quote_each_token() {
        assert_eq!(fts_prefix_query("tom"), Some(r#""tom"*"#.to_string()));
        assert_eq!(
            fts_prefix_query("café au lait"),
            Some(r#""cafe"* "au"* "lait"*"#.to_string())
        );
    }

    #[test]
    fn bare_punctuation_yields_match_all() {
        assert_eq!(fts_prefix_query("*"), None);
        assert_eq!(fts_prefix_query("  "), None);
    }
}
