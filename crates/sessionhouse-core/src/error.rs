use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed message payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("empty message payload")]
    EmptyPayload,
}
