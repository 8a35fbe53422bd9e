use std::path::PathBuf;

use crate::hash::Ref;

/// error type for hoard operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("blob: not found")]
    NotFound,

    #[error("blob: invalid ref")]
    InvalidRef,

    #[error("blob: storage is read-only")]
    ReadOnly,

    #[error("blob was discarded")]
    BlobDiscarded,

    #[error("blob was completed")]
    BlobCompleted,

    #[error("ref mismatch: expected {expected}, got {got}")]
    RefMismatch { expected: Ref, got: Ref },

    #[error("size mismatch: expected {expected}, got {got}")]
    SizeMismatch { expected: u64, got: u64 },

    #[error("not a schema blob")]
    NotSchema,

    #[error("unsupported schema type: {0:?}")]
    UnsupportedType(String),

    #[error("schema object is too large")]
    SchemaTooLarge,

    #[error("not a ref")]
    NotARef,

    #[error("unsupported ref type: {0:?}")]
    UnsupportedAlgo(String),

    #[error("wrong size for {algo} ref: expected {expected}, got {got}")]
    WrongDigestSize {
        algo: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid ref encoding")]
    BadEncoding,

    #[error("invalid pin name: {0:?}")]
    InvalidPinName(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("path already exists: {0}")]
    TargetExists(PathBuf),

    #[error("copy-on-write not supported")]
    CloneUnsupported,

    #[error("file changed while writing it")]
    FileChanged,

    #[error("pipeline: {0}")]
    Pipeline(String),

    #[error("unexpected status: {0}")]
    HttpStatus(u16),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// extract a hoard error smuggled through an io error, if any
    pub fn from_io(err: std::io::Error, path: impl Into<PathBuf>) -> Error {
        if err.get_ref().map_or(false, |e| e.is::<Error>()) {
            return *err.into_inner().unwrap().downcast::<Error>().unwrap();
        }
        Error::Io {
            path: path.into(),
            source: err,
        }
    }

    /// wrap a hoard error into an io error for Read/Write impls
    pub fn into_io(self) -> std::io::Error {
        std::io::Error::other(self)
    }
}

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::from_io(source, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_roundtrip() {
        let err = Error::NotFound;
        let io = err.into_io();
        let back = Error::from_io(io, "/tmp/x");
        assert!(matches!(back, Error::NotFound));
    }

    #[test]
    fn test_io_plain_wrapped_with_path() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = Error::from_io(io, "/tmp/x");
        match err {
            Error::Io { path, .. } => assert_eq!(path, PathBuf::from("/tmp/x")),
            other => panic!("unexpected: {other}"),
        }
    }
}
