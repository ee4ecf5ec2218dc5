use thiserror::Error;

/// Classified failure returned by the table client.
///
/// The refresh coordinator treats these uniformly (any error marks the key),
/// but the classification drives retry policy inside the client and shows up
/// in diagnostics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("transient fetch failure: {0}")]
    Transient(String),

    #[error("permanent fetch failure: {0}")]
    Permanent(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl FetchError {
    /// Truncate a response body to avoid logging excessive data.
    /// Cuts at a character boundary so multibyte bodies never split.
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..end],
                body.len()
            )
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => FetchError::Permanent("unauthorized - token may be expired".to_string()),
            403 => FetchError::Permanent(format!("access denied: {}", truncated)),
            404 => FetchError::Permanent(format!("not found: {}", truncated)),
            429 => FetchError::Transient("rate limited".to_string()),
            500..=599 => FetchError::Transient(format!("server error {}: {}", status, truncated)),
            _ => FetchError::Permanent(format!("status {}: {}", status, truncated)),
        }
    }

    /// Whether the client should retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::Timeout)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transient(format!("network error: {}", e))
        }
    }
}
