//! Domain-specific assertions for nodesync tests

use predicates::prelude::*;

/// Assert that stderr does NOT contain any of the given strings
///
/// ```rust
/// use nodesync_test_helpers::assertions::stderr_not_contains;
/// use predicates::prelude::*;
///
/// assert!(stderr_not_contains(&["ERROR", "WARN"]).eval("all good"));
/// ```
pub fn stderr_not_contains(values: &[&str]) -> impl Predicate<str> {
    let owned_values: Vec<String> = values.iter().map(|&s| s.to_string()).collect();
    predicate::function(move |s: &str| !owned_values.iter().any(|v| s.contains(v.as_str())))
}

/// Output parses as JSON
pub fn valid_json() -> impl Predicate<str> {
    predicate::function(|s: &str| serde_json::from_str::<serde_json::Value>(s).is_ok())
}

/// Output is a JSON array of exactly `len` elements
pub fn json_array_len(len: usize) -> impl Predicate<str> {
    predicate::function(move |s: &str| {
        serde_json::from_str::<serde_json::Value>(s)
            .ok()
            .and_then(|value| value.as_array().map(|items| items.len() == len))
            .unwrap_or(false)
    })
}

/// Output is a JSON object whose `key` equals `expected`
pub fn json_field_eq(key: &'static str, expected: serde_json::Value) -> impl Predicate<str> {
    predicate::function(move |s: &str| {
        serde_json::from_str::<serde_json::Value>(s)
            .ok()
            .and_then(|value| value.get(key).cloned())
            .map(|value| value == expected)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stderr_not_contains() {
        assert!(stderr_not_contains(&["ERROR", "WARN"]).eval("Some output without errors"));
        assert!(!stderr_not_contains(&["ERROR"]).eval("ERROR: something went wrong"));
    }

    #[test]
    fn test_json_predicates() {
        assert!(valid_json().eval(r#"{"a":1}"#));
        assert!(!valid_json().eval("not json"));

        assert!(json_array_len(2).eval("[1, 2]"));
        assert!(!json_array_len(2).eval("[1]"));
        assert!(!json_array_len(0).eval("{}"));

        assert!(json_field_eq("pending", json!(3)).eval(r#"{"pending":3}"#));
        assert!(!json_field_eq("pending", json!(3)).eval(r#"{"pending":4}"#));
    }
}
