use reqwest::StatusCode;

/// Marker the cloud puts in the error body when a system has no webhook.
const NO_SUBSCRIPTION_MARKER: &str = "No subscription found for";

/// Errors returned by the Diagral cloud client.
#[derive(Debug, thiserror::Error)]
pub enum DiagralError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("client configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    NoSubscription(String),

    #[error("request rejected ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DiagralError {
    /// Map a non-success HTTP response into the error taxonomy.
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let message = extract_message(body);

        if message.contains(NO_SUBSCRIPTION_MARKER) {
            return Self::NoSubscription(message);
        }

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Authentication(message),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Self::Validation(message)
            }
            s if s.is_server_error() => Self::Server {
                status: s.as_u16(),
                message,
            },
            s => Self::Client {
                status: s.as_u16(),
                message,
            },
        }
    }

    /// True when the vendor reported that no webhook subscription exists.
    pub fn is_no_subscription(&self) -> bool {
        matches!(self, Self::NoSubscription(_))
    }
}

/// Pull a human readable message out of an error body.
///
/// The cloud answers with `{"detail": "..."}` or `{"message": "..."}`; anything
/// else is returned verbatim.
fn extract_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };

    ["detail", "message", "error"]
        .iter()
        .find_map(|key| value.get(key).and_then(|v| v.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subscription_detected_from_detail() {
        let err = DiagralError::from_response(
            StatusCode::NOT_FOUND,
            r#"{"detail": "No subscription found for 1234ABCD"}"#,
        );
        assert!(err.is_no_subscription());
        assert_eq!(err.to_string(), "No subscription found for 1234ABCD");
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            DiagralError::from_response(StatusCode::UNAUTHORIZED, "nope"),
            DiagralError::Authentication(_)
        ));
        assert!(matches!(
            DiagralError::from_response(StatusCode::UNPROCESSABLE_ENTITY, "{}"),
            DiagralError::Validation(_)
        ));
        assert!(matches!(
            DiagralError::from_response(StatusCode::BAD_GATEWAY, "down"),
            DiagralError::Server { status: 502, .. }
        ));
        assert!(matches!(
            DiagralError::from_response(StatusCode::NOT_FOUND, r#"{"message": "gone"}"#),
            DiagralError::Client { status: 404, .. }
        ));
    }

    #[test]
    fn test_plain_text_body_kept() {
        let err = DiagralError::from_response(StatusCode::CONFLICT, "  already exists\n");
        match err {
            DiagralError::Client { message, .. } => assert_eq!(message, "already exists"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
