//! Name-filter construction and path helpers for filtered re-runs

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Escaped `${...}` interpolation placeholder.
static ESCAPED_INTERPOLATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\\$\\\{[^}]+\}").expect("static interpolation pattern")
});

/// Escaped printf-style specifier (`%s`, `%i`, `%f`, `%d`).
static ESCAPED_FORMAT_SPEC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\%[isfd]").expect("static format specifier pattern"));

const WILDCARD: &str = ".*?";

/// Escape every character that is not a word character or a space.
///
/// Non-ASCII characters are left alone; they are never metacharacters.
pub fn escape_test_name(source: &str) -> String {
    let mut escaped = String::with_capacity(source.len());
    for ch in source.chars() {
        if !(ch.is_ascii_alphanumeric() || ch == '_' || ch == ' ' || !ch.is_ascii()) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Build one filter expression matching every breadcrumb path.
///
/// Each path yields an anchored and an unanchored variant; all variants are
/// joined by alternation. Returns `None` when there is nothing to match, which
/// means "run everything".
pub fn build_test_name_pattern<S: AsRef<str>>(paths: &[Vec<S>]) -> Option<String> {
    let mut variants = Vec::new();

    for segments in paths {
        let literal = segments
            .iter()
            .map(AsRef::as_ref)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if literal.is_empty() {
            continue;
        }

        let escaped = escape_test_name(&literal);
        let escaped = ESCAPED_INTERPOLATION.replace_all(&escaped, WILDCARD);
        let escaped = ESCAPED_FORMAT_SPEC.replace_all(&escaped, WILDCARD);

        variants.push(format!("^{}$", escaped));
        variants.push(escaped.into_owned());
    }

    if variants.is_empty() {
        return None;
    }

    Some(
        variants
            .iter()
            .map(|v| format!("({})", v))
            .collect::<Vec<_>>()
            .join("|"),
    )
}

/// Normalise a reported file location to a plain forward-slash path.
///
/// `file://` URLs are decoded; `/C:/x` becomes `C:/x`. Input that cannot be
/// parsed is returned unchanged.
pub fn normalize_file_path(url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }

    let mut path = url.to_string();
    if url.starts_with("file://") {
        let Ok(parsed) = url::Url::parse(url) else {
            return Some(url.to_string());
        };
        let Ok(decoded) = urlencoding::decode(parsed.path()) else {
            return Some(url.to_string());
        };
        path = decoded.into_owned();

        let bytes = path.as_bytes();
        if bytes.len() > 2 && bytes[0] == b'/' && bytes[2] == b':' {
            path.remove(0);
        }
    }

    Some(path.replace('\\', "/"))
}

/// Same as [`normalize_file_path`] for optional input.
pub fn normalize_optional(url: Option<&str>) -> Option<String> {
    url.and_then(normalize_file_path)
}

/// Read a reported `elapsed` value as a finite number.
pub fn coerce_elapsed(elapsed: &Value) -> Option<f64> {
    let value = match elapsed {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_paths_mean_no_filter() {
        let none: Vec<Vec<String>> = vec![];
        assert_eq!(build_test_name_pattern(&none), None);
        assert_eq!(build_test_name_pattern(&[path(&["", ""])]), None);
    }

    #[test]
    fn test_single_path() {
        let pattern = build_test_name_pattern(&[path(&["A", "B"])]).unwrap();
        assert!(pattern.contains("^A B$"));
        assert!(pattern.contains("A B"));
        assert_eq!(pattern, "(^A B$)|(A B)");
    }

    #[test]
    fn test_two_paths_give_four_variants() {
        let pattern =
            build_test_name_pattern(&[path(&["math", "adds"]), path(&["strings"])]).unwrap();
        assert_eq!(pattern, "(^math adds$)|(math adds)|(^strings$)|(strings)");
        assert_eq!(pattern.split('|').count(), 4);
    }

    #[test]
    fn test_metacharacters_are_escaped() {
        assert_eq!(escape_test_name("a.b (c)"), r"a\.b \(c\)");
        assert_eq!(escape_test_name("1+1=2?"), r"1\+1\=2\?");
        assert_eq!(escape_test_name("héllo"), "héllo");
    }

    #[test]
    fn test_placeholders_become_wildcards() {
        let pattern = build_test_name_pattern(&[path(&["adds ${a} and %d"])]).unwrap();
        assert_eq!(pattern, "(^adds .*? and .*?$)|(adds .*? and .*?)");

        let re = Regex::new(&pattern).unwrap();
        assert!(re.is_match("adds 1 and 2"));
        assert!(!re.is_match("subtracts 1 and 2"));
    }

    #[test]
    fn test_pattern_matches_literal_name() {
        let pattern = build_test_name_pattern(&[path(&["suite (slow)", "works?"])]).unwrap();
        let re = Regex::new(&pattern).unwrap();
        assert!(re.is_match("suite (slow) works?"));
        assert!(!re.is_match("suite slow works"));
    }

    #[test]
    fn test_normalize_file_url_with_space() {
        assert_eq!(
            normalize_file_path("file:///home/me/my%20tests/a.test.ts").as_deref(),
            Some("/home/me/my tests/a.test.ts")
        );
    }

    #[test]
    fn test_normalize_windows_drive() {
        assert_eq!(normalize_file_path("file:///C:/x").as_deref(), Some("C:/x"));
        assert_eq!(
            normalize_file_path(r"C:\src\a.test.ts").as_deref(),
            Some("C:/src/a.test.ts")
        );
    }

    #[test]
    fn test_normalize_plain_and_empty() {
        assert_eq!(
            normalize_file_path("/src/a.test.ts").as_deref(),
            Some("/src/a.test.ts")
        );
        assert_eq!(normalize_file_path(""), None);
        assert_eq!(normalize_optional(None), None);
    }

    #[test]
    fn test_coerce_elapsed() {
        assert_eq!(coerce_elapsed(&json!(5)), Some(5.0));
        assert_eq!(coerce_elapsed(&json!(1.5)), Some(1.5));
        assert_eq!(coerce_elapsed(&json!("12")), Some(12.0));
        assert_eq!(coerce_elapsed(&json!("soon")), None);
        assert_eq!(coerce_elapsed(&json!(null)), None);
        assert_eq!(coerce_elapsed(&json!({"ms": 3})), None);
    }
}
