//! Helper utility functions for CLI commands

/// Truncate to at most `max_chars` characters, never splitting a UTF-8 char
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{truncated}...")
    } else {
        s.to_string()
    }
}

/// Show only the first characters of a secret
pub fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return "(unset)".to_string();
    }
    format!("{}***", secret.chars().take(4).collect::<String>())
}
