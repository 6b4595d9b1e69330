//! Utility functions shared by the session core and the CLI.

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Works on character boundaries, so multi-byte input is never split.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Sanitize a string for safe logging (redact sensitive patterns).
///
/// Upstream error bodies relayed by the proxy can echo request headers.
pub fn sanitize_for_log(s: &str) -> String {
    let patterns: &[(&str, &str)] = &[
        (r"(?i)(api[_-]?key|apikey)[=:]\s*\S{20,}", "$1=***REDACTED***"),
        (r"(?i)(token|secret|bearer)\s*[=:]?\s*[A-Za-z0-9._\-]{10,}", "$1 ***REDACTED***"),
        (r"sk-[a-zA-Z0-9\-]{20,}", "***REDACTED_API_KEY***"),
    ];

    let mut result = s.to_string();
    for (pattern, replacement) in patterns {
        if let Ok(re) = regex::Regex::new(pattern) {
            result = re.replace_all(&result, *replacement).to_string();
        }
    }
    result
}

/// Parse a duration string like "5m", "6h", "30s" into seconds.
pub fn parse_duration_secs(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    let (num_str, unit) = s.split_at(s.len() - 1);
    let num: u64 = num_str.parse().map_err(|_| format!("Invalid number: {num_str}"))?;

    match unit {
        "s" => Ok(num),
        "m" => Ok(num * 60),
        "h" => Ok(num * 3600),
        "d" => Ok(num * 86400),
        _ => Err(format!("Unknown unit: {unit}")),
    }
}

/// Format a remaining duration as a short countdown label ("4h 52m", "21m", "<1m").
pub fn format_countdown(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;

    match (hours, minutes) {
        (0, 0) => "<1m".to_string(),
        (0, m) => format!("{m}m"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h {m}m"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
        assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
        assert_eq!(truncate_with_ellipsis("😀😀😀😀", 2), "😀😀...");
        assert_eq!(truncate_with_ellipsis("", 10), "");
    }

    #[test]
    fn test_sanitize_for_log() {
        let input = "upstream said: invalid key sk-or-v1-12345678901234567890abcd";
        let output = sanitize_for_log(input);
        assert!(!output.contains("12345678901234567890abcd"));
        assert!(output.contains("REDACTED"));
    }

    #[test_case("30s", 30)]
    #[test_case("5m", 300)]
    #[test_case("6h", 21_600)]
    #[test_case("2d", 172_800)]
    fn test_parse_duration_secs(input: &str, expected: u64) {
        assert_eq!(parse_duration_secs(input).unwrap(), expected);
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration_secs("abc").is_err());
        assert!(parse_duration_secs("").is_err());
        assert!(parse_duration_secs("10w").is_err());
    }

    #[test_case(17_520, "4h 52m")]
    #[test_case(4_620, "1h 17m")]
    #[test_case(1_260, "21m")]
    #[test_case(7_200, "2h")]
    #[test_case(30, "<1m")]
    fn test_format_countdown(secs: u64, expected: &str) {
        assert_eq!(format_countdown(secs), expected);
    }
}
