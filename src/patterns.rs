//! Rule pattern helpers shared by the aggregator and the assembler
//!
//! Binary rules and blacklist rules are stored in delimited form
//! (`/pattern/flags`), the convention used by the public rule collections
//! indexers exchange. Plain undelimited patterns are accepted as well.

use regex::{Regex, RegexBuilder};

/// Compiled-program size limit for operator-supplied patterns
const PATTERN_SIZE_LIMIT: usize = 1024 * 1024;

/// Characters that may open and close a delimited pattern
const PATTERN_DELIMITERS: &str = "/#~%@!|";

/// Flags accepted after a closing delimiter
const PATTERN_FLAGS: &str = "imsxU";

/// Split a delimited pattern into its body and trailing flags
///
/// The delimiter is the first character when it is one of `/#~%@!|`; the
/// body ends at the last occurrence of the same delimiter and only known
/// flags may follow it. Patterns led by regex syntax, such as
/// `(?P<name>.+) yEnc` or `[abc]def`, are plain regexes and are returned
/// unchanged with no flags.
pub fn split_delimited(pattern: &str) -> (&str, &str) {
    let trimmed = pattern.trim();
    let Some(delimiter) = trimmed.chars().next() else {
        return (trimmed, "");
    };
    if !PATTERN_DELIMITERS.contains(delimiter) {
        return (trimmed, "");
    }

    let body_start = delimiter.len_utf8();
    match trimmed.rfind(delimiter) {
        Some(end) if end >= body_start => {
            let flags = &trimmed[end + delimiter.len_utf8()..];
            if flags.chars().all(|c| PATTERN_FLAGS.contains(c)) {
                (&trimmed[body_start..end], flags)
            } else {
                (trimmed, "")
            }
        }
        _ => (trimmed, ""),
    }
}

/// Compile a delimited or plain pattern
///
/// Supported flags: `i` (case-insensitive), `s` (dot matches newline),
/// `m` (multi-line), `x` (ignore whitespace), `U` (swap greed).
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let (body, flags) = split_delimited(pattern);
    let mut builder = RegexBuilder::new(body);
    builder.size_limit(PATTERN_SIZE_LIMIT);
    for flag in flags.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            's' => builder.dot_matches_new_line(true),
            'm' => builder.multi_line(true),
            'x' => builder.ignore_whitespace(true),
            'U' => builder.swap_greed(true),
            _ => &mut builder,
        };
    }
    builder.build()
}

/// How specific a rule's group selector is for `group`
///
/// Returns `None` when the selector does not apply. Exact names rank before
/// wildcards so callers can order rules "exact first".
pub fn group_selector_rank(selector: &str, group: &str) -> Option<u8> {
    if selector == group {
        return Some(0);
    }
    if selector == "*" {
        return Some(2);
    }
    if let Some(prefix) = selector.strip_suffix('*') {
        if group.starts_with(prefix) {
            return Some(1);
        }
    }
    None
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_slash_delimited_pattern_with_flags() {
        assert_eq!(
            split_delimited(r"/^(?P<name>.+?) \[\d+\/\d+\]/i"),
            (r"^(?P<name>.+?) \[\d+\/\d+\]", "i")
        );
    }

    #[test]
    fn plain_pattern_is_returned_unchanged() {
        assert_eq!(split_delimited(r"^foo\d+$"), (r"^foo\d+$", ""));
        assert_eq!(split_delimited(r"\(\d+\)"), (r"\(\d+\)", ""));
    }

    #[test]
    fn bracket_led_patterns_are_plain_regexes() {
        let named = r"(?P<name>.+) yEnc (?P<parts>\d+/\d+)";
        assert_eq!(split_delimited(named), (named, ""));
        assert_eq!(split_delimited("(foo)bar"), ("(foo)bar", ""));
        assert_eq!(split_delimited("[abc]def"), ("[abc]def", ""));
        assert_eq!(split_delimited(r".+\.mix"), (r".+\.mix", ""));

        let re = compile_pattern(named).unwrap();
        let caps = re.captures("Some.Show yEnc 3/12").unwrap();
        assert_eq!(&caps["name"], "Some.Show");
        assert_eq!(&caps["parts"], "3/12");
        assert!(compile_pattern("(foo)bar").unwrap().is_match("foobar"));
        assert!(compile_pattern("[abc]def").unwrap().is_match("bdef"));
    }

    #[test]
    fn only_known_flags_follow_the_delimiter() {
        assert_eq!(split_delimited("/abc/imsxU"), ("abc", "imsxU"));
        assert_eq!(split_delimited("/abc/gi"), ("/abc/gi", ""));
        assert_eq!(split_delimited("~abc~"), ("abc", ""));
    }

    #[test]
    fn hash_delimiter_and_trailing_garbage() {
        assert_eq!(split_delimited("#abc#"), ("abc", ""));
        // Trailing text after the delimiter that is not flags: treat as plain
        assert_eq!(split_delimited("/abc/ 12"), ("/abc/ 12", ""));
    }

    #[test]
    fn case_insensitive_flag_is_applied() {
        let re = compile_pattern("/^foo/i").unwrap();
        assert!(re.is_match("FOO bar"));

        let re = compile_pattern("/^foo/").unwrap();
        assert!(!re.is_match("FOO bar"));
    }

    #[test]
    fn unsupported_syntax_fails_to_compile() {
        // Look-around is not supported by the regex engine
        assert!(compile_pattern(r"/foo(?!bar)/i").is_err());
    }

    #[test]
    fn group_selector_ranking() {
        let group = "alt.binaries.teevee";
        assert_eq!(group_selector_rank("alt.binaries.teevee", group), Some(0));
        assert_eq!(group_selector_rank("alt.binaries.*", group), Some(1));
        assert_eq!(group_selector_rank("*", group), Some(2));
        assert_eq!(group_selector_rank("alt.binaries.movies", group), None);
        assert_eq!(group_selector_rank("alt.binaries.tv*", group), None);
    }
}
