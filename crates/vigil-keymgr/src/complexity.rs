//! Secret complexity policy
//!
//! Two acceptable forms: a full passphrase (>= 12 chars spanning upper,
//! lower, digit and symbol, no whitespace) or a 4-8 digit PIN. Violations
//! are usage errors and never touch the lockout counters.

use vigil_core::{VigilError, VigilResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Passphrase,
    Pin,
}

/// Check a candidate secret against the policy.
pub fn classify_secret(secret: &str) -> VigilResult<SecretKind> {
    if is_valid_pin(secret) {
        Ok(SecretKind::Pin)
    } else if is_valid_passphrase(secret) {
        Ok(SecretKind::Passphrase)
    } else {
        Err(VigilError::Complexity)
    }
}

fn is_valid_pin(s: &str) -> bool {
    (4..=8).contains(&s.chars().count()) && s.chars().all(|c| c.is_ascii_digit())
}

fn is_valid_passphrase(s: &str) -> bool {
    s.chars().count() >= 12
        && s.chars().any(|c| c.is_uppercase())
        && s.chars().any(|c| c.is_lowercase())
        && s.chars().any(|c| c.is_ascii_digit())
        && s.chars().any(|c| !c.is_alphanumeric() && !c.is_whitespace())
        && !s.chars().any(|c| c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_passphrase() {
        assert_eq!(
            classify_secret("Tr0ub4dor&3!xx").unwrap(),
            SecretKind::Passphrase
        );
        assert_eq!(
            classify_secret("Aa1!aaaaaaaa").unwrap(),
            SecretKind::Passphrase
        );
    }

    #[test]
    fn test_valid_pin() {
        assert_eq!(classify_secret("1234").unwrap(), SecretKind::Pin);
        assert_eq!(classify_secret("12345678").unwrap(), SecretKind::Pin);
    }

    #[test]
    fn test_rejects_short_passphrase() {
        assert!(classify_secret("Aa1!short").is_err());
    }

    #[test]
    fn test_rejects_missing_classes() {
        assert!(classify_secret("alllowercase1!aa").is_err()); // no upper
        assert!(classify_secret("ALLUPPERCASE1!AA").is_err()); // no lower
        assert!(classify_secret("NoDigitsHere!!aa").is_err()); // no digit
        assert!(classify_secret("NoSymbolsHere1aa").is_err()); // no symbol
    }

    #[test]
    fn test_rejects_whitespace() {
        assert!(classify_secret("Aa1! aaaaaaaaaa").is_err());
    }

    #[test]
    fn test_rejects_bad_pins() {
        assert!(classify_secret("123").is_err()); // too short
        assert!(classify_secret("123456789").is_err()); // too long
        assert!(classify_secret("12a4").is_err()); // non-digit
    }

    #[test]
    fn test_rejects_empty() {
        assert!(classify_secret("").is_err());
    }
}
