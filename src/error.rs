use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no conversation selected")]
    NoSelectedUser,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cache error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Api(#[from] crate::api::error::ApiError),
}
