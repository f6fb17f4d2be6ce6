//! Address validation and canonicalisation.
//!
//! The stripped form is what the global result cache is keyed by: lowercase,
//! with any `+suffix` removed from the local part. Dots are deliberately kept;
//! mail providers are not uniform about dot equivalence.

use once_cell::sync::Lazy;
use regex::Regex;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$")
        .expect("email regex is valid")
});

/// Check whether a raw address looks like an email at all.
pub fn is_valid(raw: &str) -> bool {
    EMAIL_RE.is_match(raw.trim())
}

/// Produce the canonical stripped form of an address, or `None` when the
/// input fails validation. Idempotent: `normalise(normalise(x)) == normalise(x)`.
pub fn normalise(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if !EMAIL_RE.is_match(trimmed) {
        return None;
    }
    let lowered = trimmed.to_lowercase();
    let (local, domain) = lowered.split_once('@')?;
    let local = match local.split_once('+') {
        Some((base, _tag)) => base,
        None => local,
    };
    if local.is_empty() {
        return None;
    }
    Some(format!("{local}@{domain}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Alice@Example.COM", "alice@example.com")]
    #[case("bob+tag@example.com", "bob@example.com")]
    #[case("bob+tag+more@example.com", "bob@example.com")]
    #[case("first.last@example.com", "first.last@example.com")]
    #[case("  padded@example.com  ", "padded@example.com")]
    fn strips_case_and_suffix(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalise(raw).as_deref(), Some(expected));
    }

    #[rstest]
    #[case("not-an-email")]
    #[case("@example.com")]
    #[case("a@b")]
    #[case("spaces in@example.com")]
    #[case("")]
    fn rejects_invalid(#[case] raw: &str) {
        assert_eq!(normalise(raw), None);
    }

    #[test]
    fn normalise_is_idempotent() {
        for raw in ["Alice+x@Example.com", "b.c@d.org", "z@sub.domain.co.uk"] {
            let once = normalise(raw).unwrap();
            let twice = normalise(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn dots_are_preserved() {
        assert_eq!(
            normalise("j.doe@gmail.com").as_deref(),
            Some("j.doe@gmail.com")
        );
    }
}
