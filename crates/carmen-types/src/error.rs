use thiserror::Error;

/// The error kinds surfaced at the engine boundary.
///
/// `NotFound` is mostly internal: state getters translate it into the value
/// type's zero before it reaches a caller.
#[derive(Error, Debug)]
pub enum CarmenError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CarmenError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CarmenError::NotFound(_))
    }
}

/// Maps a backend error into [CarmenError::Internal]. Intended for
/// `.map_err(internal)` at third-party call sites.
pub fn internal<E: std::fmt::Display>(err: E) -> CarmenError {
    CarmenError::Internal(err.to_string())
}

pub type Result<T> = std::result::Result<T, CarmenError>;
