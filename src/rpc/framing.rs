//! Line framing and classification
//!
//! The daemon's stdout carries both protocol messages and incidental output
//! (startup banners, diagnostics). A trimmed line is a candidate protocol
//! message only when it looks like a JSON object or an array of objects;
//! everything else is routed to logging as unhandled output, never to the
//! dispatcher.

use std::borrow::Cow;

/// Decide whether a raw stdout line is a protocol message
///
/// Mirrors the daemon's framing contract exactly: an object (`{...}`) or an
/// array of objects (`[{...}]`) after trimming. Partial JSON, banners and
/// any other noise fail the check.
pub fn is_protocol_message(line: &str) -> bool {
    let message = line.trim();
    (message.starts_with('{') && message.ends_with('}'))
        || (message.starts_with("[{") && message.ends_with("}]"))
}

/// Truncate a raw wire line for logging
///
/// Bounds log volume for huge payloads (whole-file format results). `None`
/// logs the full line.
pub fn truncate_for_log(line: &str, max_length: Option<usize>) -> Cow<'_, str> {
    match max_length {
        Some(max) if line.len() > max => {
            // Respect char boundaries; the wire is UTF-8 JSON
            let mut end = max;
            while end > 0 && !line.is_char_boundary(end) {
                end -= 1;
            }
            Cow::Owned(format!("{}…", &line[..end]))
        }
        _ => Cow::Borrowed(line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_classification() {
        // Exactly the 2nd and 3rd lines are protocol messages
        let lines = [
            "noise",
            "{\"id\":\"1\",\"result\":{}}",
            "[{\"event\":\"x\"}]",
            "{not json",
        ];

        let accepted: Vec<&str> = lines
            .iter()
            .copied()
            .filter(|line| is_protocol_message(line))
            .collect();

        assert_eq!(
            accepted,
            vec!["{\"id\":\"1\",\"result\":{}}", "[{\"event\":\"x\"}]"]
        );
    }

    #[test]
    fn test_framing_trims_whitespace() {
        assert!(is_protocol_message("  {\"event\":\"server.connected\"}\n"));
        assert!(is_protocol_message("\t[{\"id\":\"1\",\"result\":{}}]\r\n"));
        assert!(!is_protocol_message("   \n"));
        assert!(!is_protocol_message("Listening on stdin..."));
    }

    #[test]
    fn test_bare_array_is_not_protocol() {
        // Only arrays of objects count; an empty array is daemon noise
        assert!(!is_protocol_message("[]"));
        assert!(!is_protocol_message("[1,2,3]"));
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("short", Some(100)), "short");
        assert_eq!(truncate_for_log("abcdef", Some(3)), "abc…");
        assert_eq!(truncate_for_log("abcdef", None), "abcdef");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let line = "aé中文";
        // Cutting inside a multi-byte char must back off, not panic
        for max in 0..line.len() {
            let truncated = truncate_for_log(line, Some(max));
            assert!(truncated.len() <= max + '…'.len_utf8());
        }
    }
}
