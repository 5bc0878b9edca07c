use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural error kinds carried through `anyhow` chains.
///
/// Leaves wrap the cause with a short contextual message; intermediate
/// layers pass the error upward unchanged. Tick loops log-and-continue
/// at the pipeline boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("request: {0}")]
    Request(String),
    #[error("read: {0}")]
    Read(String),
    #[error("write: {0}")]
    Write(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("connection: {0}")]
    Connection(String),
    #[error("database: {0}")]
    Database(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unknown: {0}")]
    Unknown(String),
    #[error("lost image: {0}")]
    LostImage(String),
}

impl Error {
    /// True when an anyhow chain bottoms out in a `NotFound`.
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_)))
    }

    /// True when an anyhow chain bottoms out in a `LostImage`.
    pub fn is_lost_image(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<Error>(), Some(Error::LostImage(_)))
    }
}

/// User-facing validation failure: short code plus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub error: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_not_found_downcast() {
        let err: anyhow::Error = Error::NotFound("instance".to_string()).into();
        assert!(Error::is_not_found(&err));
        assert!(!Error::is_lost_image(&err));

        let plain = anyhow!("something else");
        assert!(!Error::is_not_found(&plain));
    }

    #[test]
    fn test_not_found_survives_context() {
        use anyhow::Context;

        let err: anyhow::Error = Error::NotFound("disk".to_string()).into();
        let wrapped = Err::<(), _>(err)
            .context("loading disk")
            .unwrap_err();
        assert!(Error::is_not_found(&wrapped));
    }

    #[test]
    fn test_display() {
        let err = Error::Parse("bad port".to_string());
        assert_eq!(err.to_string(), "parse: bad port");
    }
}
