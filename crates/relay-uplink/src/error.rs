/// Longest response body kept in an error, in characters.
pub const BODY_SNIPPET_CHARS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{op} failed: HTTP {status} {body}")]
    Upstream {
        op: &'static str,
        status: u16,
        body: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request encode failed: {0}")]
    Encode(String),

    #[error("telemetry not ready (position incomplete)")]
    NotReady,
}

impl CoordinatorError {
    pub fn upstream(op: &'static str, status: u16, body: &str) -> Self {
        CoordinatorError::Upstream { op, status, body: truncate_body(body) }
    }

    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, CoordinatorError::Upstream { status: 401 | 403, .. })
    }
}

impl From<reqwest::Error> for CoordinatorError {
    fn from(e: reqwest::Error) -> Self {
        CoordinatorError::Transport(e.to_string())
    }
}

pub fn truncate_body(body: &str) -> String {
    body.chars().take(BODY_SNIPPET_CHARS).collect()
}
