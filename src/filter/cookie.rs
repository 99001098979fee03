//! Cookie header lookup.
//!
//! A `cookie` header is a single string of `name=value` pairs separated by
//! `;`, each optionally preceded by whitespace. Lookup is a single forward
//! scan with no allocation; anything that does not parse as a pair is
//! skipped rather than reported.

/// Find the value of the cookie called `name` in a `cookie` header value.
///
/// Names are compared exactly (cookie names are case-sensitive). The value
/// runs from the first `=` to the next `;` or the end of the string, with
/// surrounding whitespace removed. Empty values are reported as no match.
pub fn find<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    cookie_header
        .split(';')
        .filter_map(|entry| entry.trim_start().split_once('='))
        .find(|(key, _)| key.trim_end() == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}
