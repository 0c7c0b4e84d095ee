use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("kv store failure: {0}")]
    Kv(String),

    #[error("log client failure: {0}")]
    Log(String),

    #[error("team lookup failure: {0}")]
    Teams(String),
}
