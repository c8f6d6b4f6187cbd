/// Error type returned by all provider and store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no database has been built yet")]
    NotReady { fetching: bool, building: bool },

    #[error("already fetching")]
    AlreadyFetching,

    #[error("already rebuilding")]
    AlreadyRebuilding,

    #[error("locked by another node")]
    LockedByPeer,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("build failed: {0}")]
    Build(String),

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("ZIP archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is a request-cycle sentinel: the operation was
    /// declined without doing any work, and the caller retries on its own
    /// cadence.
    pub fn is_sentinel(&self) -> bool {
        matches!(
            self,
            Error::AlreadyFetching | Error::AlreadyRebuilding | Error::LockedByPeer
        )
    }
}
