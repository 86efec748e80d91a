//! Path helpers shared by the normalizer and the response allowlist.

/// Lowercase, trim and use backslash separators
pub fn normalize_path(value: &str) -> String {
    value.trim().replace('/', "\\").to_ascii_lowercase()
}

/// Final path component of an image path
pub fn image_basename(path: &str) -> &str {
    let path = path.trim_end_matches('\\').trim_end_matches('/');
    let separator = path.rfind('\\').or_else(|| path.rfind('/'));
    match separator {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

pub fn has_path_separator(value: &str) -> bool {
    value.contains('\\') || value.contains('/')
}
