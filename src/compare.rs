//! Output comparison under a problem's whitespace and case policy.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::{self, FromStr};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WhitespaceRule {
    #[serde(rename = "plain diff")]
    PlainDiff,
    #[serde(rename = "ignore whitespace")]
    IgnoreWhitespace,
}

impl Default for WhitespaceRule {
    fn default() -> Self {
        WhitespaceRule::PlainDiff
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ComparePolicy {
    pub whitespace: WhitespaceRule,
    pub ignore_case: bool,
}

impl ComparePolicy {
    pub const PLAIN_DIFF: ComparePolicy = ComparePolicy {
        whitespace: WhitespaceRule::PlainDiff,
        ignore_case: false,
    };
    pub const IGNORE_WHITESPACE: ComparePolicy = ComparePolicy {
        whitespace: WhitespaceRule::IgnoreWhitespace,
        ignore_case: false,
    };
    pub const IGNORE_CASE: ComparePolicy = ComparePolicy {
        whitespace: WhitespaceRule::PlainDiff,
        ignore_case: true,
    };
}

#[derive(Error, Debug, PartialEq)]
#[error("unknown comparison rule {0:?}")]
pub struct UnknownRule(String);

impl FromStr for ComparePolicy {
    type Err = UnknownRule;

    /// Parses rule names, combined with `+` or `,`: `"ignore whitespace + ignore case"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut policy = ComparePolicy::default();
        for rule in s.split(|c: char| c == '+' || c == ',') {
            match rule.trim() {
                "plain diff" => {}
                "ignore whitespace" => policy.whitespace = WhitespaceRule::IgnoreWhitespace,
                "ignore case" => policy.ignore_case = true,
                other => return Err(UnknownRule(other.into())),
            }
        }
        Ok(policy)
    }
}

impl fmt::Display for ComparePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.whitespace, self.ignore_case) {
            (WhitespaceRule::PlainDiff, false) => f.write_str("plain diff"),
            (WhitespaceRule::PlainDiff, true) => f.write_str("ignore case"),
            (WhitespaceRule::IgnoreWhitespace, false) => f.write_str("ignore whitespace"),
            (WhitespaceRule::IgnoreWhitespace, true) => {
                f.write_str("ignore whitespace + ignore case")
            }
        }
    }
}

fn strip_trailing_newline(output: &[u8]) -> &[u8] {
    output
        .strip_suffix(b"\r\n")
        .or_else(|| output.strip_suffix(b"\n"))
        .unwrap_or(output)
}

fn fold_case(text: &str, ignore_case: bool) -> Cow<'_, str> {
    if ignore_case {
        Cow::Owned(text.to_lowercase())
    } else {
        Cow::Borrowed(text)
    }
}

fn text_equal(actual: &str, expected: &str, policy: ComparePolicy) -> bool {
    let actual = fold_case(actual, policy.ignore_case);
    let expected = fold_case(expected, policy.ignore_case);

    match policy.whitespace {
        WhitespaceRule::PlainDiff => actual == expected,
        WhitespaceRule::IgnoreWhitespace => actual
            .split_whitespace()
            .eq(expected.split_whitespace()),
    }
}

/// Output that isn't valid UTF-8 only gets ASCII case and whitespace folding.
fn bytes_equal(actual: &[u8], expected: &[u8], policy: ComparePolicy) -> bool {
    let fold = |output: &[u8]| -> Vec<u8> {
        if policy.ignore_case {
            output.to_ascii_lowercase()
        } else {
            output.to_vec()
        }
    };
    let (actual, expected) = (fold(actual), fold(expected));

    match policy.whitespace {
        WhitespaceRule::PlainDiff => actual == expected,
        WhitespaceRule::IgnoreWhitespace => {
            let tokens = |output: &[u8]| -> Vec<Vec<u8>> {
                output
                    .split(u8::is_ascii_whitespace)
                    .filter(|token| !token.is_empty())
                    .map(<[u8]>::to_vec)
                    .collect()
            };
            tokens(&actual) == tokens(&expected)
        }
    }
}

/// Decides whether `actual` matches `expected` under `policy`.
///
/// Both sides are opaque bytes. A plain diff compares them as is; the other
/// policies read them as UTF-8 when both sides decode cleanly.
pub fn equal(actual: impl AsRef<[u8]>, expected: impl AsRef<[u8]>, policy: ComparePolicy) -> bool {
    let actual = strip_trailing_newline(actual.as_ref());
    let expected = strip_trailing_newline(expected.as_ref());

    // An empty answer is only matched by an empty output.
    if expected.is_empty() || actual.is_empty() {
        return expected.is_empty() && actual.is_empty();
    }

    if policy == ComparePolicy::PLAIN_DIFF {
        return actual == expected;
    }
    match (str::from_utf8(actual), str::from_utf8(expected)) {
        (Ok(actual), Ok(expected)) => text_equal(actual, expected, policy),
        _ => bytes_equal(actual, expected, policy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICIES: [ComparePolicy; 4] = [
        ComparePolicy::PLAIN_DIFF,
        ComparePolicy::IGNORE_WHITESPACE,
        ComparePolicy::IGNORE_CASE,
        ComparePolicy {
            whitespace: WhitespaceRule::IgnoreWhitespace,
            ignore_case: true,
        },
    ];

    #[test]
    fn output_equals_itself_under_every_policy() {
        for text in ["", "\n", "6\n", "  1 2\n\n", "Hello\r\nWorld", "ÀÉ ü\t"] {
            for policy in POLICIES {
                assert!(equal(text, text, policy), "{:?} under {}", text, policy);
            }
        }
    }

    #[test]
    fn case() {
        assert!(equal("A\n", "a\n", ComparePolicy::IGNORE_CASE));
        assert!(!equal("A\n", "a\n", ComparePolicy::PLAIN_DIFF));
        assert!(!equal("A\n", "a\n", ComparePolicy::IGNORE_WHITESPACE));
    }

    #[test]
    fn whitespace() {
        assert!(equal(" 1  2 ", "1 2", ComparePolicy::IGNORE_WHITESPACE));
        assert!(equal("1\n2\n\n", "1 2", ComparePolicy::IGNORE_WHITESPACE));
        assert!(!equal("12", "1 2", ComparePolicy::IGNORE_WHITESPACE));
        assert!(!equal(" 1  2 ", "1 2", ComparePolicy::PLAIN_DIFF));
    }

    #[test]
    fn plain_diff_trims_one_trailing_newline() {
        assert!(equal("6", "6\n", ComparePolicy::PLAIN_DIFF));
        assert!(equal("6\r\n", "6\n", ComparePolicy::PLAIN_DIFF));
        assert!(!equal("6\n\n", "6\n", ComparePolicy::PLAIN_DIFF));
        assert!(!equal("6 \n", "6\n", ComparePolicy::PLAIN_DIFF));
    }

    #[test]
    fn empty_expected_only_matches_empty_output() {
        for policy in POLICIES {
            assert!(equal("", "", policy));
            assert!(equal("\n", "", policy));
            assert!(!equal("  \n", "", policy));
            assert!(!equal("0", "\n", policy));
            assert!(!equal("", "0\n", policy));
        }
    }

    #[test]
    fn output_bytes_are_never_decoded_lossily() {
        // Both sides would decode to U+FFFD.
        for policy in POLICIES {
            assert!(!equal(b"\xfe\n", b"\xff\n", policy), "under {}", policy);
            assert!(equal(b"\xff\n", b"\xff", policy), "under {}", policy);
        }
        assert!(equal(b"A \xff\n", b"a \xff", ComparePolicy::IGNORE_CASE));
        assert!(equal(b" 1\t\xff ", b"1 \xff", ComparePolicy::IGNORE_WHITESPACE));
        assert!(!equal(b"1\xff", b"1 \xff", ComparePolicy::IGNORE_WHITESPACE));
    }

    #[test]
    fn combined_policy() {
        let policy: ComparePolicy = "ignore whitespace + ignore case".parse().unwrap();
        assert!(equal("YES  no\n", "yes no", policy));
        assert_eq!(policy.to_string(), "ignore whitespace + ignore case");
    }

    #[test]
    fn policy_names() {
        assert_eq!("plain diff".parse::<ComparePolicy>(), Ok(ComparePolicy::PLAIN_DIFF));
        assert_eq!("ignore case".parse::<ComparePolicy>(), Ok(ComparePolicy::IGNORE_CASE));
        assert_eq!(
            "ignore whitespace".parse::<ComparePolicy>(),
            Ok(ComparePolicy::IGNORE_WHITESPACE)
        );
        assert_eq!(
            "exact".parse::<ComparePolicy>(),
            Err(UnknownRule("exact".into()))
        );
    }
}
