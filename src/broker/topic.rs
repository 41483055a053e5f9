//! Topic-exchange routing key matching.
//!
//! # Pattern Syntax
//!
//! ```text
//! Pattern             | Matches
//! --------------------|------------------------------------------------
//! model.category.*    | model.category.created, model.category.deleted
//! model.*.created     | model.genre.created, model.cast_member.created
//! model.#             | model, model.genre, model.genre_categories.attached
//! #                   | everything
//! ```
//!
//! `*` matches exactly one dot-separated segment, `#` matches zero or more.

/// Check if a pattern contains a wildcard segment.
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.split('.').any(|s| s == "*" || s == "#")
}

/// Check if a routing key matches a binding pattern.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    if pattern == routing_key {
        return true;
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // Collapse runs of "#" before trying every split point
            if rest.first() == Some(&"#") {
                return match_segments(rest, key);
            }
            (0..=key.len()).any(|skip| match_segments(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && match_segments(rest, &key[1..]),
        Some((segment, rest)) => key.first() == Some(segment) && match_segments(rest, &key[1..]),
    }
}
