//! Navigation path arithmetic
//!
//! Paths are prefixes scoped to the provider root: `""` is the root itself and a
//! non-empty path always ends with the separator.

use crate::providers::{normalize_dir, PATH_SEPARATOR};

/// Parent of a directory path, or `None` when `path` is already the top.
///
/// `"a/b/"` gives `"a/"`, `"a/"` gives `""`, `"/home/"` gives `"/"`.
pub fn parent_path(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches(PATH_SEPARATOR);
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind(PATH_SEPARATOR) {
        None => Some(String::new()),
        Some(0) => Some(PATH_SEPARATOR.to_string()),
        Some(i) => Some(format!("{}{}", &trimmed[..i], PATH_SEPARATOR)),
    }
}

/// Full path or key of `name` inside the directory `path`
pub fn child_path(path: &str, name: &str) -> String {
    format!("{}{}", normalize_dir(path), name)
}

/// Split a key into its directory path and final name
pub fn split_key(key: &str) -> (&str, &str) {
    match key.rfind(PATH_SEPARATOR) {
        Some(i) => (&key[..=i], &key[i + 1..]),
        None => ("", key),
    }
}
