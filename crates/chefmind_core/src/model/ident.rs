//! Identifier validation shared by SQL generation and savepoint handling.

use once_cell::sync::Lazy;
use regex::Regex;

static IDENTIFIER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").ok());

/// Returns `true` when `value` is safe to splice into SQL as an identifier.
pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER
        .as_ref()
        .map(|pattern| pattern.is_match(value))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::is_valid_identifier;

    #[test]
    fn accepts_plain_identifiers() {
        assert!(is_valid_identifier("recipes"));
        assert!(is_valid_identifier("_sp1"));
        assert!(is_valid_identifier("cooking_time"));
    }

    #[test]
    fn rejects_injection_and_empty_names() {
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1st"));
        assert!(!is_valid_identifier("sp; DROP TABLE users"));
        assert!(!is_valid_identifier("name\"quoted"));
        assert!(!is_valid_identifier("dash-name"));
    }
}
