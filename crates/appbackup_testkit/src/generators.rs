//! Proptest strategies.

use appbackup_codec::Entity;
use proptest::prelude::*;

/// Package names such as `com.example.app`.
pub fn package_name_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z][a-z0-9]{0,7}", 2..4).prop_map(|parts| parts.join("."))
}

/// Domains whose records are always restored.
pub fn restorable_domain_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["f", "db", "sp", "r", "ef", "d_f", "d_db"])
}

/// Relative paths without `..` or empty segments.
pub fn relative_path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[A-Za-z0-9_][A-Za-z0-9_.-]{0,15}", 1..4)
        .prop_map(|parts| parts.join("/"))
        .prop_filter("no parent segments", |p| !p.split('/').any(|s| s == ".."))
}

/// File content, sometimes crossing block boundaries.
pub fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..16),
        prop::collection::vec(any::<u8>(), 500..1100),
    ]
}

/// A set of `(domain, path, content)` files with distinct paths.
pub fn file_set_strategy() -> impl Strategy<Value = Vec<(&'static str, String, Vec<u8>)>> {
    prop::collection::vec(
        (restorable_domain_strategy(), relative_path_strategy(), content_strategy()),
        0..6,
    )
    .prop_map(|mut files| {
        let mut seen = std::collections::HashSet::new();
        files.retain(|(domain, path, _)| seen.insert(format!("{domain}/{path}")));
        files
    })
}

/// Key-value records with unprotected keys.
pub fn entity_strategy() -> impl Strategy<Value = Entity> {
    (
        "[a-z][a-z0-9_]{0,11}",
        prop::option::of(prop::collection::vec(any::<u8>(), 0..64)),
    )
        .prop_map(|(key, value)| match value {
            Some(value) => Entity::put(key, value),
            None => Entity::delete(key),
        })
}
