/// Errors that can occur against the commerce GraphQL API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The source rejected the credentials (401/403). Fatal for the
    /// integration until the token is rotated.
    #[error("commerce API rejected the credentials: {0}")]
    Auth(String),

    /// The source throttled the request beyond what the cost controller
    /// could absorb.
    #[error("commerce API rate limited the request: {0}")]
    RateLimited(String),

    /// The source returned a server error (5xx).
    #[error("commerce API unavailable: HTTP {status}")]
    Unavailable { status: u16 },

    /// The response did not match the expected shape. Carries a fragment of
    /// the offending payload for the logs.
    #[error("unexpected commerce API response shape: {detail}")]
    Schema { detail: String, fragment: String },

    /// The request never produced a response.
    #[error("commerce API request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// A non-retryable error response outside the closed set above.
    #[error("commerce API error: HTTP {status}: {body}")]
    Api { status: u16, body: String },
}

impl Error {
    pub(crate) fn schema(detail: impl Into<String>, payload: &serde_json::Value) -> Self {
        let fragment: String = payload.to_string().chars().take(512).collect();
        Error::Schema {
            detail: detail.into(),
            fragment,
        }
    }
}
