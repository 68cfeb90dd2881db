// SPDX-FileCopyrightText: 2025 cfgpush contributors
// SPDX-License-Identifier: MIT

//! General utilities.
//!
//! Small helpers shared across the codebase: glob matching for host and file
//! override expressions, CSV splitting for the comma-separated settings keys,
//! and common path lookups.

use crate::{Error, Result};

use std::path::PathBuf;
use tracing::warn;

/// Get absolute path to user's home directory.
///
/// # Errors
///
/// - Return [`Error::NoWayHome`] if path to home directory cannot be
///   determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(Error::NoWayHome)
}

/// Get absolute path to cfgpush's standard configuration directory.
///
/// # Errors
///
/// - Return [`Error::NoWayHome`] if path to configuration directory cannot be
///   determined.
pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir().map(|path| path.join("cfgpush")).ok_or(Error::NoWayHome)
}

/// Expand `~/` and environment variables inside a configured path.
///
/// # Errors
///
/// - Return [`Error::BadPathExpansion`] if expansion references an undefined
///   variable or the home directory cannot be determined.
pub fn expand_path(path: impl AsRef<str>) -> Result<PathBuf> {
    let expanded =
        shellexpand::full(path.as_ref()).map_err(|error| Error::BadPathExpansion {
            path: path.as_ref().into(),
            reason: error.to_string(),
        })?;

    Ok(PathBuf::from(expanded.into_owned()))
}

/// Split comma-separated settings value into trimmed entries.
///
/// Empty entries are dropped, so `""` yields an empty vector and trailing
/// commas are harmless.
pub fn split_csv(value: impl AsRef<str>) -> Vec<String> {
    value
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(Into::into)
        .collect()
}

/// Determine truthiness of a yes/no settings value.
pub fn is_yes(value: impl AsRef<str>) -> bool {
    value.as_ref().trim().eq_ignore_ascii_case("yes")
}

/// Single-quote a string for a POSIX shell.
///
/// Embedded single quotes become `'\''` so the quoted form survives any
/// content, including whitespace and shell metacharacters.
pub(crate) fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Select candidates matching a set of glob patterns.
///
/// Host and file override expressions are lists of glob patterns; this
/// resolves them against the known host names or planned repository paths.
/// Each selected candidate appears once, in its original order, no matter how
/// many patterns hit it. Patterns that fail to compile are dropped with a
/// warning, and a pattern that selects nothing is reported so a typo in an
/// override cannot silently shrink a run.
pub fn glob_match(
    patterns: impl IntoIterator<Item = impl Into<String>>,
    candidates: impl IntoIterator<Item = impl Into<String>>,
) -> Vec<String> {
    let mut compiled = Vec::new();
    for pattern in patterns.into_iter().map(Into::into) {
        match glob::Pattern::new(&pattern) {
            Ok(pattern) => compiled.push(pattern),
            Err(error) => warn!("Dropping unparseable glob {pattern:?}: {error}"),
        }
    }

    let selected: Vec<String> = candidates
        .into_iter()
        .map(Into::into)
        .filter(|candidate| compiled.iter().any(|pattern| pattern.matches(candidate)))
        .collect();

    for pattern in &compiled {
        if !selected.iter().any(|candidate| pattern.matches(candidate)) {
            warn!("Glob {:?} selected nothing", pattern.as_str());
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq as pretty_assert_eq;
    use simple_test_case::test_case;

    #[test_case(
        vec!["*sh".into(), "[f-g]oo".into(), "d?o".into()],
        vec!["sh".into(), "bash".into(), "foo".into(), "goo".into(), "doo".into()],
        vec!["sh".into(), "bash".into(), "foo".into(), "goo".into(), "doo".into()];
        "match all"
    )]
    #[test_case(
        vec!["web*".into()],
        vec!["web01".into(), "web02".into(), "db01".into()],
        vec!["web01".into(), "web02".into()];
        "prefix match"
    )]
    #[test_case(
        vec!["web*".into(), "*01".into()],
        vec!["web01".into(), "db01".into()],
        vec!["web01".into(), "db01".into()];
        "overlapping patterns select once"
    )]
    #[test_case(
        vec!["foo".into(), "bar".into()],
        vec!["web01".into(), "db01".into()],
        Vec::<String>::new();
        "no match"
    )]
    #[test_case(
        vec!["[1-".into(), "[!a-d".into()],
        vec!["web01".into(), "db01".into()],
        Vec::<String>::new();
        "invalid pattern"
    )]
    #[test]
    fn smoke_glob_match(patterns: Vec<String>, entries: Vec<String>, mut expect: Vec<String>) {
        let mut result = glob_match(patterns, entries);
        expect.sort();
        result.sort();
        pretty_assert_eq!(result, expect);
    }

    #[test_case("a,b,c", vec!["a", "b", "c"]; "plain")]
    #[test_case(" a , b ", vec!["a", "b"]; "whitespace")]
    #[test_case("a,,b,", vec!["a", "b"]; "empty entries")]
    #[test_case("", Vec::<&str>::new(); "empty string")]
    #[test]
    fn smoke_split_csv(value: &str, expect: Vec<&str>) {
        pretty_assert_eq!(split_csv(value), expect);
    }

    #[test_case("yes", true; "lowercase")]
    #[test_case("Yes", true; "mixed case")]
    #[test_case(" yes ", true; "padded")]
    #[test_case("no", false; "no")]
    #[test_case("", false; "empty")]
    #[test]
    fn smoke_is_yes(value: &str, expect: bool) {
        pretty_assert_eq!(is_yes(value), expect);
    }

    #[test]
    fn smoke_sh_quote() {
        pretty_assert_eq!(sh_quote("/etc/motd"), "'/etc/motd'");
        pretty_assert_eq!(sh_quote("/opt/it's here"), r"'/opt/it'\''s here'");
    }
}
