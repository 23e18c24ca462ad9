use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to encode request: {0}")]
    Encode(String),

    /// Structured rejection returned by the data API.
    #[error("{message}")]
    Query {
        status: u16,
        message: String,
        code: Option<String>,
        details: Option<String>,
    },

    /// A guard failed before any request was sent.
    #[error("{0}")]
    Precondition(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error payload shape used by the data API.
#[derive(Debug, Deserialize)]
struct ErrorPayload {
    message: Option<String>,
    code: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    fn parse_payload(status: u16, body: &str) -> Option<ApiError> {
        let payload: ErrorPayload = serde_json::from_str(body).ok()?;
        let message = payload.message?;
        let details = match (payload.details, payload.hint) {
            (Some(d), Some(h)) => Some(format!("{} ({})", d, h)),
            (d, h) => d.or(h),
        };
        Some(ApiError::Query {
            status,
            message,
            code: payload.code,
            details,
        })
    }

    /// Map an error response. A structured payload wins over the status;
    /// 401 always means the session must be renewed.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let code = status.as_u16();
        match code {
            401 => return ApiError::Unauthorized,
            429 => return ApiError::RateLimited,
            _ => {}
        }
        if let Some(err) = Self::parse_payload(code, body) {
            return err;
        }
        match code {
            403 => ApiError::AccessDenied(Self::truncate_body(body)),
            404 => ApiError::NotFound(Self::truncate_body(body)),
            500..=599 => ApiError::ServerError(Self::truncate_body(body)),
            _ => ApiError::InvalidResponse(format!(
                "Status {}: {}",
                status,
                Self::truncate_body(body)
            )),
        }
    }

    /// Error code reported by the data API, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Whether retrying the same request may succeed.
    ///
    /// `RateLimited` is final: the client has already backed off.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::ServerError(_) => true,
            ApiError::Query { status, .. } => *status >= 500,
            ApiError::NetworkError(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status_maps_known_codes() {
        assert!(matches!(
            ApiError::from_status(StatusCode::UNAUTHORIZED, ""),
            ApiError::Unauthorized
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ApiError::RateLimited
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_GATEWAY, "upstream"),
            ApiError::ServerError(_)
        ));
    }

    #[test]
    fn test_from_status_parses_error_payload() {
        let body = r#"{"message":"duplicate key value violates unique constraint","code":"23505","details":"Key (user_id, mission_id) already exists.","hint":null}"#;
        let err = ApiError::from_status(StatusCode::CONFLICT, body);
        assert_eq!(err.code(), Some("23505"));
        assert_eq!(
            err.to_string(),
            "duplicate key value violates unique constraint"
        );
        match err {
            ApiError::Query { details, .. } => {
                assert_eq!(details.as_deref(), Some("Key (user_id, mission_id) already exists."))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_structured_payload_wins_over_status() {
        let body = r#"{"message":"new row violates row-level security policy","code":"42501","details":null,"hint":null}"#;
        let err = ApiError::from_status(StatusCode::FORBIDDEN, body);
        assert_eq!(err.code(), Some("42501"));
        assert!(matches!(err, ApiError::Query { status: 403, .. }));
        assert!(!err.is_transient());

        let body = r#"{"message":"function get_nearby_missions does not exist","code":"PGRST202"}"#;
        let err = ApiError::from_status(StatusCode::NOT_FOUND, body);
        assert_eq!(err.code(), Some("PGRST202"));

        let body = r#"{"message":"canceling statement due to statement timeout","code":"57014"}"#;
        let err = ApiError::from_status(StatusCode::SERVICE_UNAVAILABLE, body);
        assert_eq!(err.code(), Some("57014"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_plain_bodies_keep_status_variants() {
        assert!(matches!(
            ApiError::from_status(StatusCode::FORBIDDEN, "policy violation"),
            ApiError::AccessDenied(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::NOT_FOUND, ""),
            ApiError::NotFound(_)
        ));
        let body = r#"{"message":"JWT expired","code":"PGRST301"}"#;
        assert!(matches!(
            ApiError::from_status(StatusCode::UNAUTHORIZED, body),
            ApiError::Unauthorized
        ));
    }

    #[test]
    fn test_from_status_unparseable_body() {
        let err = ApiError::from_status(StatusCode::BAD_REQUEST, "<html>oops</html>");
        assert!(matches!(err, ApiError::InvalidResponse(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(600);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.starts_with(&"x".repeat(500)));
        assert!(truncated.contains("600 total bytes"));
    }

    #[test]
    fn test_is_transient() {
        assert!(!ApiError::RateLimited.is_transient());
        assert!(ApiError::ServerError("boom".into()).is_transient());
        assert!(!ApiError::Unauthorized.is_transient());
        assert!(!ApiError::Precondition("no location".into()).is_transient());
    }
}
