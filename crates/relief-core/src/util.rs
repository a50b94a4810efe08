//! Shared utility functions used across multiple modules.

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Truncate text to at most 180 characters for error summaries.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Current Unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Format a Unix millisecond timestamp as RFC 3339, or `-` when unset.
pub fn format_millis(value: i64) -> String {
    if value <= 0 {
        return "-".to_string();
    }
    chrono::DateTime::from_timestamp_millis(value)
        .map_or_else(|| value.to_string(), |time| time.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ".to_string())), None);
    }

    #[test]
    fn normalize_text_option_trims_value() {
        assert_eq!(
            normalize_text_option(Some(" tree removal ".to_string())),
            Some("tree removal".to_string())
        );
    }

    #[test]
    fn compact_text_truncates() {
        let long = "x".repeat(400);
        assert_eq!(compact_text(&long).len(), 180);
    }

    #[test]
    fn format_millis_handles_unset() {
        assert_eq!(format_millis(0), "-");
        assert!(format_millis(1_700_000_000_000).starts_with("2023-11-14"));
    }
}
