//! Internal error helpers for mapping HTTP/reqwest errors to
//! [`ProviderError`].

use std::time::Duration;

use maestro_types::ProviderError;

/// Map an HTTP status code to a [`ProviderError`].
pub(crate) fn map_http_status(status: reqwest::StatusCode, body: &str) -> ProviderError {
    match status.as_u16() {
        401 | 403 => ProviderError::Authentication(body.to_string()),
        400 => {
            // Content refusals arrive as 400s with a distinctive error
            // type; keep them out of the invalid-request bucket so the
            // dispatcher never retries or falls back on them.
            if body.contains("content_policy") || body.contains("refusal") {
                ProviderError::ContentPolicy(body.to_string())
            } else {
                ProviderError::InvalidRequest(body.to_string())
            }
        }
        404 => ProviderError::ModelNotFound(body.to_string()),
        429 => ProviderError::RateLimit {
            retry_after: parse_retry_after(body),
        },
        500..=599 => ProviderError::ServiceUnavailable(body.to_string()),
        _ => ProviderError::InvalidRequest(format!("HTTP {status}: {body}")),
    }
}

/// Best-effort parse of a retry delay in seconds from an error body.
fn parse_retry_after(body: &str) -> Option<Duration> {
    let lower = body.to_lowercase();
    let idx = lower.find("retry after ")?;
    let after = &lower[idx + 12..];
    let digits: String = after.chars().take_while(char::is_ascii_digit).collect();
    digits.parse::<u64>().ok().map(Duration::from_secs)
}

/// Map a [`reqwest::Error`] to a [`ProviderError`].
pub(crate) fn map_reqwest_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(Duration::from_secs(60))
    } else {
        ProviderError::Network(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_the_taxonomy() {
        let status = |code: u16| reqwest::StatusCode::from_u16(code).unwrap();
        assert!(matches!(
            map_http_status(status(401), "bad key"),
            ProviderError::Authentication(_)
        ));
        assert!(matches!(
            map_http_status(status(400), "malformed"),
            ProviderError::InvalidRequest(_)
        ));
        assert!(matches!(
            map_http_status(status(400), r#"{"type":"content_policy"}"#),
            ProviderError::ContentPolicy(_)
        ));
        assert!(matches!(
            map_http_status(status(404), "no such model"),
            ProviderError::ModelNotFound(_)
        ));
        assert!(matches!(
            map_http_status(status(429), "slow down"),
            ProviderError::RateLimit { .. }
        ));
        assert!(matches!(
            map_http_status(status(529), "overloaded"),
            ProviderError::ServiceUnavailable(_)
        ));
    }

    #[test]
    fn retry_after_is_parsed_from_the_body() {
        match map_http_status(
            reqwest::StatusCode::from_u16(429).unwrap(),
            "Rate limited. Retry after 7 seconds.",
        ) {
            ProviderError::RateLimit { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected rate limit, got {other}"),
        }
    }

    #[test]
    fn transient_statuses_are_retryable() {
        let status = |code: u16| reqwest::StatusCode::from_u16(code).unwrap();
        assert!(map_http_status(status(500), "x").is_retryable());
        assert!(map_http_status(status(429), "x").is_retryable());
        assert!(!map_http_status(status(401), "x").is_retryable());
    }
}
