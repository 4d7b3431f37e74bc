use thiserror::Error;

/// All errors produced by hark-core.
#[derive(Debug, Error)]
pub enum HarkError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no context supplied")]
    MissingContext,

    #[error("no state supplied")]
    MissingState,

    #[error("unknown language: {0:?}")]
    UnknownLanguage(String),

    #[error("unknown sampling strategy: {0:?}")]
    UnknownStrategy(String),

    #[error("compute backend error: {0}")]
    Backend(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HarkError>;

/// Integer status codes returned by the [`crate::api`] boundary.
///
/// `Ok` and `Aborted` are non-negative; every failure category is negative
/// and distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    /// Caller-requested stop. Results produced so far remain valid.
    Aborted = 1,
    InvalidArgument = -1,
    MissingContext = -2,
    MissingState = -3,
    /// Allocation or compute backend failure.
    ResourceExhausted = -4,
    /// Filesystem or configuration failure.
    Io = -5,
}

impl StatusCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl HarkError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HarkError::InvalidArgument(_)
            | HarkError::UnknownLanguage(_)
            | HarkError::UnknownStrategy(_) => StatusCode::InvalidArgument,
            HarkError::MissingContext => StatusCode::MissingContext,
            HarkError::MissingState => StatusCode::MissingState,
            HarkError::Backend(_) | HarkError::ResourceExhausted(_) => {
                StatusCode::ResourceExhausted
            }
            HarkError::ModelNotFound { .. }
            | HarkError::Io(_)
            | HarkError::Json(_)
            | HarkError::Other(_) => StatusCode::Io,
        }
    }
}
