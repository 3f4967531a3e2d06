use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("snapshot payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
