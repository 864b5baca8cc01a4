//! Version range matching
//!
//! Clients address runtimes and packages with loose range strings such as
//! `3.10.0`, `3.x`, `>=3.8 <3.11`, `>= 3.8`, `3.8.0 - 3.10.0`, `*` or
//! `1.x || 2.x`. A bare version is an exact (or partial) match, never a caret
//! range, and a leading `v` is ignored.

use semver::{Version, VersionReq};

/// Parsed range; satisfied when any alternative matches
#[derive(Debug, Clone)]
pub struct VersionRange {
    alternatives: Vec<VersionReq>,
}

impl VersionRange {
    /// Parse a range string. Returns `None` when it is not a valid range.
    pub fn parse(raw: &str) -> Option<Self> {
        let alternatives = raw
            .split("||")
            .map(parse_comparators)
            .collect::<Option<Vec<_>>>()?;
        Some(Self { alternatives })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }
}

const OPERATORS: [&str; 7] = [">=", "<=", ">", "<", "=", "~", "^"];

fn parse_comparators(raw: &str) -> Option<VersionReq> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "*" || raw == "latest" {
        return Some(VersionReq::STAR);
    }

    let tokens: Vec<&str> = raw
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .collect();

    let mut comparators = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        // hyphen range `a - b` is inclusive on both ends
        if tokens.get(i + 1) == Some(&"-") {
            let upper = tokens.get(i + 2)?;
            comparators.push(format!(">={}", strip_v(token)));
            comparators.push(format!("<={}", strip_v(upper)));
            i += 3;
            continue;
        }
        // operator written apart from its version: `>= 3.8`
        if OPERATORS.contains(&token) {
            let version = tokens.get(i + 1)?;
            comparators.push(format!("{}{}", token, strip_v(version)));
            i += 2;
            continue;
        }
        comparators.push(normalize(token));
        i += 1;
    }

    VersionReq::parse(&comparators.join(", ")).ok()
}

/// Bare versions become exact matches; a `v` prefix is dropped
fn normalize(token: &str) -> String {
    let split = token
        .find(|c: char| !matches!(c, '<' | '>' | '=' | '~' | '^'))
        .unwrap_or(token.len());
    let (op, version) = token.split_at(split);
    let version = strip_v(version);

    if op.is_empty() && version.chars().all(|c| c.is_ascii_digit() || c == '.') {
        format!("={}", version)
    } else {
        format!("{}{}", op, version)
    }
}

fn strip_v(version: &str) -> &str {
    version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version)
}

/// Pick the highest version satisfying `range`. Among equal versions the first
/// candidate wins.
pub fn pick_latest<'a, T, I, F>(candidates: I, range: &VersionRange, version_of: F) -> Option<&'a T>
where
    I: IntoIterator<Item = &'a T>,
    F: Fn(&T) -> &Version,
{
    let mut matching: Vec<&'a T> = candidates
        .into_iter()
        .filter(|item| range.matches(version_of(*item)))
        .collect();
    // stable sort keeps load order for duplicates
    matching.sort_by(|a, b| version_of(*b).cmp(version_of(*a)));
    matching.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_plain_version_is_exact() {
        let range = VersionRange::parse("3.10.0").unwrap();
        assert!(range.matches(&v("3.10.0")));
        assert!(!range.matches(&v("3.11.0")));
    }

    #[test]
    fn test_partial_and_wildcard() {
        let partial = VersionRange::parse("3.10").unwrap();
        assert!(partial.matches(&v("3.10.4")));
        assert!(!partial.matches(&v("3.11.0")));

        let wildcard = VersionRange::parse("3.x").unwrap();
        assert!(wildcard.matches(&v("3.12.1")));
        assert!(!wildcard.matches(&v("2.7.18")));

        let star = VersionRange::parse("*").unwrap();
        assert!(star.matches(&v("0.1.0")));
    }

    #[test]
    fn test_comparator_sets_and_alternatives() {
        let range = VersionRange::parse(">=3.8 <3.11").unwrap();
        assert!(range.matches(&v("3.9.0")));
        assert!(!range.matches(&v("3.11.0")));

        let alt = VersionRange::parse("1.x || 3.x").unwrap();
        assert!(alt.matches(&v("1.2.0")));
        assert!(!alt.matches(&v("2.0.0")));

        let spaced = VersionRange::parse(">= 3.8 < 3.11").unwrap();
        assert!(spaced.matches(&v("3.8.0")));
        assert!(!spaced.matches(&v("3.7.9")));
        assert!(!spaced.matches(&v("3.11.0")));

        let hyphen = VersionRange::parse("3.8.0 - 3.10.0").unwrap();
        assert!(hyphen.matches(&v("3.8.0")));
        assert!(hyphen.matches(&v("3.10.0")));
        assert!(!hyphen.matches(&v("3.10.1")));
        assert!(!hyphen.matches(&v("3.7.0")));

        let prefixed = VersionRange::parse("v3.10.0").unwrap();
        assert!(prefixed.matches(&v("3.10.0")));
        assert!(!prefixed.matches(&v("3.10.1")));
        assert!(VersionRange::parse("=v3.10.0").unwrap().matches(&v("3.10.0")));
        assert!(VersionRange::parse(">=v3.9").unwrap().matches(&v("3.10.0")));

        let caret = VersionRange::parse("^3.9").unwrap();
        assert!(caret.matches(&v("3.12.0")));
    }

    #[test]
    fn test_invalid_range() {
        assert!(VersionRange::parse("not-a-version").is_none());
        assert!(VersionRange::parse(">=").is_none());
        assert!(VersionRange::parse("3.8.0 -").is_none());
    }

    #[test]
    fn test_pick_latest_prefers_first_duplicate() {
        let items = vec![
            ("a", v("3.9.0")),
            ("b", v("3.10.0")),
            ("c", v("3.10.0")),
            ("d", v("2.7.0")),
        ];
        let range = VersionRange::parse("3.x").unwrap();
        let picked = pick_latest(&items, &range, |item| &item.1).unwrap();
        assert_eq!(picked.0, "b");

        let none = VersionRange::parse("4.x").unwrap();
        assert!(pick_latest(&items, &none, |item| &item.1).is_none());
    }
}
