use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid session key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, RouterError>;
