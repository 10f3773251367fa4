//! Maps a transport outcome onto exactly one outcome category.

use std::time::Duration;

use chrono::{DateTime, Utc};
use feedsync_core::error::ErrorCategory;
use serde_json::Value;

use crate::transport::{TransportError, TransportResponse};

const EXCERPT_LEN: usize = 160;
const SECRET_RUN_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T = Value> {
    /// The `data` member of a successful GraphQL response, or the body of a
    /// fetched document.
    Success(T),
    Failure(Failure),
}

/// A classified, non-secret description of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub category: ErrorCategory,
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
    pub detail: String,
}

impl Failure {
    fn new(category: ErrorCategory, status: Option<u16>, detail: impl Into<String>) -> Self {
        Self {
            category,
            status,
            retry_after: None,
            detail: detail.into(),
        }
    }

    pub fn from_transport(err: &TransportError) -> Self {
        Self::new(err.category(), None, err.to_string())
    }
}

/// Classify an HTTP response using its status and GraphQL `errors` codes.
pub fn classify(response: &TransportResponse, now: DateTime<Utc>) -> Outcome {
    let status = response.status;
    let payload: Option<Value> = serde_json::from_slice(&response.body).ok();
    let codes = payload.as_ref().map(error_codes).unwrap_or_default();

    if let Some(failure) = status_failure(response, &codes, now) {
        return Outcome::Failure(failure);
    }
    let retry_after = response
        .retry_after
        .as_deref()
        .and_then(|v| parse_retry_after(v, now));

    let Some(Value::Object(mut object)) = payload else {
        return Outcome::Failure(Failure::new(
            ErrorCategory::Malformed,
            Some(status),
            format!("response is not a JSON object: {}", redacted_excerpt(&response.body)),
        ));
    };

    let has_errors = object
        .get("errors")
        .and_then(Value::as_array)
        .is_some_and(|errors| !errors.is_empty());
    if has_errors {
        let category = category_for_codes(&codes).unwrap_or(ErrorCategory::Fatal);
        let mut failure = Failure::new(category, Some(status), describe(status, &codes));
        failure.retry_after = retry_after;
        return Outcome::Failure(failure);
    }

    match object.remove("data") {
        Some(data) if !data.is_null() => Outcome::Success(data),
        _ => Outcome::Failure(Failure::new(
            ErrorCategory::Malformed,
            Some(status),
            format!("response has no data: {}", redacted_excerpt(&response.body)),
        )),
    }
}

/// Classify a plain document fetch: any 2xx body is the content, decoded
/// lossily as UTF-8.
pub fn classify_document(response: &TransportResponse, now: DateTime<Utc>) -> Outcome<String> {
    match status_failure(response, &[], now) {
        Some(failure) => Outcome::Failure(failure),
        None => Outcome::Success(String::from_utf8_lossy(&response.body).into_owned()),
    }
}

/// Failure implied by the HTTP status alone, refined by GraphQL `codes` on
/// 4xx. `None` for 2xx.
fn status_failure(
    response: &TransportResponse,
    codes: &[String],
    now: DateTime<Utc>,
) -> Option<Failure> {
    let status = response.status;
    let mut failure = match status {
        200..=299 => return None,
        429 => Failure::new(ErrorCategory::RateLimited, Some(status), "HTTP 429"),
        401 | 403 => Failure::new(
            ErrorCategory::AuthExpired,
            Some(status),
            format!("HTTP {status}"),
        ),
        408 | 500..=599 => {
            Failure::new(ErrorCategory::Transient, Some(status), format!("HTTP {status}"))
        }
        400..=499 => {
            // GraphQL servers report auth and throttling failures on 400 too.
            let category = category_for_codes(codes).unwrap_or(ErrorCategory::Fatal);
            Failure::new(category, Some(status), describe(status, codes))
        }
        _ => Failure::new(
            ErrorCategory::Malformed,
            Some(status),
            format!("unexpected HTTP {status}: {}", redacted_excerpt(&response.body)),
        ),
    };
    failure.retry_after = response
        .retry_after
        .as_deref()
        .and_then(|v| parse_retry_after(v, now));
    Some(failure)
}

/// `errors[].extensions.code` values, in order.
fn error_codes(payload: &Value) -> Vec<String> {
    payload
        .get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .map(|e| {
                    e.pointer("/extensions/code")
                        .and_then(Value::as_str)
                        .unwrap_or("UNKNOWN")
                        .to_string()
                })
                .collect()
        })
        .unwrap_or_default()
}

fn category_for_code(code: &str) -> ErrorCategory {
    match code {
        "UNAUTHENTICATED" | "FORBIDDEN" => ErrorCategory::AuthExpired,
        "RATE_LIMITED" => ErrorCategory::RateLimited,
        "INTERNAL_SERVER_ERROR" | "SERVICE_UNAVAILABLE" => ErrorCategory::Transient,
        _ => ErrorCategory::Fatal,
    }
}

/// The most actionable category among `codes`: an auth failure beats a
/// rate limit, which beats a transient error, which beats anything else.
fn category_for_codes(codes: &[String]) -> Option<ErrorCategory> {
    let rank = |c: ErrorCategory| match c {
        ErrorCategory::AuthExpired => 0,
        ErrorCategory::RateLimited => 1,
        ErrorCategory::Transient => 2,
        ErrorCategory::Malformed => 3,
        ErrorCategory::Fatal => 4,
    };
    codes
        .iter()
        .map(|c| category_for_code(c))
        .min_by_key(|c| rank(*c))
}

fn describe(status: u16, codes: &[String]) -> String {
    if codes.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}, GraphQL errors [{}]", codes.join(", "))
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Short, printable excerpt of a payload with token-like runs masked.
pub fn redacted_excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let mut out = String::new();
    let mut run = String::new();
    let flush = |run: &mut String, out: &mut String| {
        if run.chars().count() >= SECRET_RUN_LEN {
            out.push_str("[REDACTED]");
        } else {
            out.push_str(run);
        }
        run.clear();
    };
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '=' | '+' | '/') {
            run.push(ch);
        } else {
            flush(&mut run, &mut out);
            out.push(if ch.is_control() { ' ' } else { ch });
        }
    }
    flush(&mut run, &mut out);

    if out.chars().count() > EXCERPT_LEN {
        let cut: String = out.chars().take(EXCERPT_LEN).collect();
        format!("{cut}...")
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).single().expect("valid date")
    }

    fn category(outcome: Outcome) -> ErrorCategory {
        match outcome {
            Outcome::Failure(f) => f.category,
            Outcome::Success(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn success_returns_data() {
        let resp = TransportResponse::json(200, &json!({"data": {"page": {"edges": []}}}));
        assert_eq!(
            classify(&resp, now()),
            Outcome::Success(json!({"page": {"edges": []}}))
        );
    }

    #[test]
    fn statuses_map_to_categories() {
        let cases = [
            (429, ErrorCategory::RateLimited),
            (401, ErrorCategory::AuthExpired),
            (403, ErrorCategory::AuthExpired),
            (408, ErrorCategory::Transient),
            (502, ErrorCategory::Transient),
            (503, ErrorCategory::Transient),
            (404, ErrorCategory::Fatal),
            (422, ErrorCategory::Fatal),
            (302, ErrorCategory::Malformed),
        ];
        for (status, expected) in cases {
            let resp = TransportResponse::new(status, "");
            assert_eq!(category(classify(&resp, now())), expected, "status {status}");
        }
    }

    #[test]
    fn graphql_codes_refine_success_status() {
        let body = |code: &str| {
            json!({"data": null, "errors": [{"message": "x", "extensions": {"code": code}}]})
        };
        let cases = [
            ("UNAUTHENTICATED", ErrorCategory::AuthExpired),
            ("FORBIDDEN", ErrorCategory::AuthExpired),
            ("RATE_LIMITED", ErrorCategory::RateLimited),
            ("INTERNAL_SERVER_ERROR", ErrorCategory::Transient),
            ("GRAPHQL_VALIDATION_FAILED", ErrorCategory::Fatal),
            ("SOMETHING_NEW", ErrorCategory::Fatal),
        ];
        for (code, expected) in cases {
            let resp = TransportResponse::json(200, &body(code));
            assert_eq!(category(classify(&resp, now())), expected, "code {code}");
        }
    }

    #[test]
    fn auth_code_wins_over_others() {
        let resp = TransportResponse::json(
            400,
            &json!({"errors": [
                {"extensions": {"code": "BAD_USER_INPUT"}},
                {"extensions": {"code": "UNAUTHENTICATED"}}
            ]}),
        );
        assert_eq!(category(classify(&resp, now())), ErrorCategory::AuthExpired);
    }

    #[test]
    fn unparsable_or_empty_bodies_are_malformed() {
        for body in ["<html>oops</html>", "[]", "{}", r#"{"data": null}"#] {
            let resp = TransportResponse::new(200, body);
            assert_eq!(category(classify(&resp, now())), ErrorCategory::Malformed, "{body}");
        }
    }

    #[test]
    fn documents_use_status_only() {
        let page = TransportResponse::new(200, "<html><p>not json</p></html>");
        assert_eq!(
            classify_document(&page, now()),
            Outcome::Success("<html><p>not json</p></html>".to_string())
        );

        let limited = TransportResponse::new(429, "slow down").with_retry_after("7");
        match classify_document(&limited, now()) {
            Outcome::Failure(f) => {
                assert_eq!(f.category, ErrorCategory::RateLimited);
                assert_eq!(f.retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("unexpected {other:?}"),
        }

        for (status, expected) in [
            (401, ErrorCategory::AuthExpired),
            (404, ErrorCategory::Fatal),
            (503, ErrorCategory::Transient),
        ] {
            let resp = TransportResponse::new(status, "");
            match classify_document(&resp, now()) {
                Outcome::Failure(f) => assert_eq!(f.category, expected, "status {status}"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn retry_after_forms() {
        assert_eq!(parse_retry_after("2", now()), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 120 ", now()), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now()),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now()),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now()), None);
    }

    #[test]
    fn rate_limit_carries_server_delay() {
        let resp = TransportResponse::new(429, "").with_retry_after("2");
        match classify(&resp, now()) {
            Outcome::Failure(f) => assert_eq!(f.retry_after, Some(Duration::from_secs(2))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn excerpt_masks_tokens_and_truncates() {
        let body = br#"{"token":"eyJhbGciOiJIUzI1NiJ9.payload.signature"}"#;
        let excerpt = redacted_excerpt(body);
        assert!(excerpt.contains("[REDACTED]"));
        assert!(!excerpt.contains("eyJhbGci"));
        assert!(excerpt.contains("token"));

        let long = "a b ".repeat(200);
        assert!(redacted_excerpt(long.as_bytes()).ends_with("..."));
    }

    #[test]
    fn malformed_detail_is_redacted() {
        let resp = TransportResponse::new(200, "session=abcdefghijklmnopqrstuvwxyz0123456789 broken");
        match classify(&resp, now()) {
            Outcome::Failure(f) => {
                assert_eq!(f.category, ErrorCategory::Malformed);
                assert!(!f.detail.contains("abcdefghijklmnop"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
