use thiserror::Error;

/// Failures reported by the resource store and the session store.
///
/// `NotFound` is kept apart from everything else so callers can tell
/// "nothing there" from "something broke".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The store answered, but refused the request.
    #[error("store rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("store unreachable: {0}")]
    Transport(String),

    #[error("could not decode store payload: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(err.to_string())
        } else {
            StoreError::Transport(err.to_string())
        }
    }
}
