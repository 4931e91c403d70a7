//! Transient-failure classification for outbound sends.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::TransportError;

static TRANSIENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)429|502|503|504|ETIMEDOUT|ECONNRESET|EAI_AGAIN|timed out|connection (reset|closed)")
        .expect("transient pattern is valid")
});

static RETRY_AFTER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry after\s+(\d+)").expect("retry-after pattern is valid")
});

/// Server-provided retry hint, from the structured field or the message text.
pub fn retry_after(err: &TransportError) -> Option<Duration> {
    if let TransportError::Http {
        retry_after: Some(secs),
        ..
    } = err
        && *secs > 0
    {
        return Some(Duration::from_secs(*secs));
    }
    let message = err.to_string();
    RETRY_AFTER_PATTERN
        .captures(&message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

/// Whether the failure is worth retrying.
pub fn is_transient(err: &TransportError) -> bool {
    match err {
        TransportError::Http { status, .. } if matches!(status, 429 | 502 | 503 | 504) => true,
        TransportError::InvalidInput(_) | TransportError::Io(_) => false,
        other => TRANSIENT_PATTERN.is_match(&other.to_string()),
    }
}

/// Delay before the next attempt, or `None` if the send should stop.
///
/// `attempt` is the 1-based attempt that just failed.
pub fn next_delay(
    err: &TransportError,
    attempt: u32,
    max_attempts: u32,
    base: Duration,
) -> Option<Duration> {
    if attempt >= max_attempts {
        return None;
    }
    match retry_after(err) {
        Some(hint) => Some(hint),
        None if is_transient(err) => Some(base * attempt),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16, description: &str, retry_after: Option<u64>) -> TransportError {
        TransportError::Http {
            status,
            description: description.to_string(),
            retry_after,
        }
    }

    #[test]
    fn classifies_transient_failures() {
        assert!(is_transient(&http(429, "Too Many Requests", None)));
        assert!(is_transient(&http(502, "Bad Gateway", None)));
        assert!(is_transient(&TransportError::Network("read ECONNRESET".into())));
        assert!(is_transient(&TransportError::Network("getaddrinfo EAI_AGAIN api.telegram.org".into())));
        assert!(!is_transient(&http(400, "Bad Request: chat not found", None)));
        assert!(!is_transient(&TransportError::InvalidInput("empty text".into())));
    }

    #[test]
    fn parses_retry_after_hints() {
        assert_eq!(
            retry_after(&http(429, "Too Many Requests", Some(7))),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            retry_after(&http(429, "Too Many Requests: retry after 3", None)),
            Some(Duration::from_secs(3))
        );
        assert_eq!(retry_after(&http(429, "Too Many Requests", None)), None);
    }

    #[test]
    fn delay_is_linear_in_attempt() {
        let base = Duration::from_millis(1500);
        let err = http(503, "Service Unavailable", None);
        assert_eq!(next_delay(&err, 1, 4, base), Some(Duration::from_millis(1500)));
        assert_eq!(next_delay(&err, 3, 4, base), Some(Duration::from_millis(4500)));
        assert_eq!(next_delay(&err, 4, 4, base), None);

        let hinted = http(429, "retry after 2", None);
        assert_eq!(next_delay(&hinted, 1, 4, base), Some(Duration::from_secs(2)));

        let fatal = http(403, "Forbidden: bot was blocked by the user", None);
        assert_eq!(next_delay(&fatal, 1, 4, base), None);
    }
}
