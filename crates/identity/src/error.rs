use thiserror::Error;

/// Errors surfaced by account and group operations.
///
/// Storage backends report through `anyhow`; everything a caller can act on
/// gets its own variant so the API layer can map it to a status code.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    DuplicateIdentity(String),

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type IdentityResult<T> = Result<T, IdentityError>;
