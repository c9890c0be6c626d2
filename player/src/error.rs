use thiserror::Error;

/// Conditions that end a session. Everything else (feed gaps, rejected or
/// illegal actions, rate limits) is recovered inside the coordinator.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport retries exhausted: {0}")]
    TransportExhausted(String),
    #[error("session cannot continue: {0}")]
    Fatal(String),
    #[error("session pointer store: {0}")]
    Store(#[from] std::io::Error),
    #[error("session pointer encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl SessionError {
    /// Classify a gateway failure that could not be recovered locally.
    pub fn from_client(err: unobot_client::Error) -> Self {
        if err.is_fatal() {
            SessionError::Fatal(err.to_string())
        } else {
            SessionError::TransportExhausted(err.to_string())
        }
    }
}
