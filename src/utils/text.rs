//! Length-capping for object representations

/// Marker appended to a representation that was cut short
pub const ELLIPSIS: &str = "...";

/// Cap `s` to at most `limit` characters, ending in [`ELLIPSIS`] when shortened.
///
/// Counts characters, not bytes, so multi-byte text is never split inside a code
/// point. A limit too small to hold the ellipsis returns a bare prefix.
pub fn cap_chars(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        return s.to_string();
    }

    let ellipsis_len = ELLIPSIS.chars().count();
    if limit <= ellipsis_len {
        return s.chars().take(limit).collect();
    }

    let mut capped: String = s.chars().take(limit - ellipsis_len).collect();
    capped.push_str(ELLIPSIS);
    capped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_untouched() {
        assert_eq!(cap_chars("[1, 2]", 10), "[1, 2]");
        assert_eq!(cap_chars("exact", 5), "exact");
    }

    #[test]
    fn test_long_text_capped_to_limit() {
        let capped = cap_chars("abcdefghijklmnop", 10);
        assert_eq!(capped, "abcdefg...");
        assert_eq!(capped.chars().count(), 10);
    }

    #[test]
    fn test_multibyte_boundaries() {
        let capped = cap_chars("ééééééééé", 5);
        assert_eq!(capped, "éé...");
    }

    #[test]
    fn test_tiny_limit() {
        assert_eq!(cap_chars("abcdef", 2), "ab");
        assert_eq!(cap_chars("abcdef", 0), "");
    }
}
