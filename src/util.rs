//! Shared utility functions for the appforge crate.

use std::sync::LazyLock;

use regex::Regex;

/// Longest message we ever send to a client.
const MAX_CLIENT_MESSAGE_LEN: usize = 500;

static ABSOLUTE_PATH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:[A-Za-z]:\\|/)(?:[^\s/\\:'"`]+[/\\])+[^\s/\\:'"`]*"#).unwrap()
});

static STACK_FRAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:at\s+\S|\d+:\s+0x[0-9a-f]+|stack backtrace:)").unwrap());

/// Make an error message safe to show to a client: absolute filesystem
/// paths become `<path>`, stack-trace lines are dropped, and the result is
/// bounded in length.
pub fn sanitize_client_message(message: &str) -> String {
    let kept: Vec<&str> = message
        .lines()
        .filter(|line| !STACK_FRAME_REGEX.is_match(line))
        .collect();
    let joined = kept.join("\n");
    let replaced = ABSOLUTE_PATH_REGEX.replace_all(&joined, "<path>");
    let trimmed = replaced.trim();
    if trimmed.is_empty() {
        return "An internal error occurred".to_string();
    }
    truncate_str(trimmed, MAX_CLIENT_MESSAGE_LEN)
}

/// Truncate a string with ellipsis, respecting char boundaries.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

/// Shorten a file path to just the last 2 components.
pub fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() <= 2 {
        parts.join("/")
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_unix_paths() {
        let msg = "ENOENT: no such file, open '/home/alice/data/sandboxes/abc/src/App.tsx'";
        let clean = sanitize_client_message(msg);
        assert!(!clean.contains("/home/alice"));
        assert!(clean.contains("<path>"));
        assert!(clean.starts_with("ENOENT"));
    }

    #[test]
    fn test_sanitize_replaces_windows_paths() {
        let clean = sanitize_client_message(r"failed at C:\Users\bob\proj\index.ts");
        assert!(!clean.contains("Users"));
        assert!(clean.contains("<path>"));
    }

    #[test]
    fn test_sanitize_drops_stack_frames() {
        let msg = "TypeError: x is undefined\n    at foo (file.js:1:2)\n    at bar (file.js:3:4)";
        assert_eq!(sanitize_client_message(msg), "TypeError: x is undefined");
    }

    #[test]
    fn test_sanitize_bounds_length() {
        let long = "e".repeat(2000);
        let clean = sanitize_client_message(&long);
        assert_eq!(clean.chars().count(), MAX_CLIENT_MESSAGE_LEN);
        assert!(clean.ends_with("..."));
    }

    #[test]
    fn test_sanitize_empty_falls_back() {
        assert_eq!(sanitize_client_message("   "), "An internal error occurred");
    }

    #[test]
    fn test_sanitize_keeps_relative_paths() {
        assert_eq!(
            sanitize_client_message("Cannot find module 'src/App'"),
            "Cannot find module 'src/App'"
        );
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 8), "hello...");
    }

    #[test]
    fn test_shorten_path() {
        assert_eq!(shorten_path("src/components/TodoList.tsx"), "components/TodoList.tsx");
        assert_eq!(shorten_path("package.json"), "package.json");
    }
}
