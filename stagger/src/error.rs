use std::sync::PoisonError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Quiz service call failed: {0}")]
    Service(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("Error in Tungstenite: {0}")]
    Tungstenite(#[from] tungstenite::Error),

    #[error("Error (de)serializing message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Driver state Mutex is poisoned")]
    PoisonData,
}

impl<T> From<PoisonError<T>> for DriverError {
    fn from(_value: PoisonError<T>) -> Self {
        Self::PoisonData
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Warmup failed after {joined} participants: {source}")]
    Warmup {
        joined: usize,
        #[source]
        source: DriverError,
    },
}
