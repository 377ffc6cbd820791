/// Errors that can occur against the ads insights API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The source rejected the credentials (401/403). Fatal for the
    /// integration until the token is rotated.
    #[error("ads API rejected the credentials: {0}")]
    Auth(String),

    /// Retries on 429 were exhausted.
    #[error("ads API rate limited the request after {attempts} attempts")]
    RateLimited { attempts: u32 },

    /// Retries on 5xx were exhausted.
    #[error("ads API unavailable: HTTP {status}")]
    Unavailable { status: u16 },

    /// The response did not match the expected shape. Carries a fragment of
    /// the offending payload for the logs.
    #[error("unexpected ads API response shape: {detail}")]
    Schema { detail: String, fragment: String },

    /// The request never produced a response, retries exhausted.
    #[error("ads API request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// A non-retryable error response outside the closed set above.
    #[error("ads API error: HTTP {status}: {body}")]
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
