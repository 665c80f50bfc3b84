//! Error taxonomy for the lolfs engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("no space: {0}")]
    NoSpace(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("too big: {0}")]
    TooBig(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("authentication failure: {0}")]
    AuthFailure(String),

    #[error("I/O error: {0}")]
    IoError(#[from] anyhow::Error),
}

impl Error {
    pub fn invalid_image(msg: impl Into<String>) -> Self {
        Error::InvalidImage(msg.into())
    }

    pub fn no_space(msg: impl Into<String>) -> Self {
        Error::NoSpace(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn exists(msg: impl Into<String>) -> Self {
        Error::Exists(msg.into())
    }

    pub fn too_big(msg: impl Into<String>) -> Self {
        Error::TooBig(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Error::PermissionDenied(msg.into())
    }

    pub fn auth_failure(msg: impl Into<String>) -> Self {
        Error::AuthFailure(msg.into())
    }
}
