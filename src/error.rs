use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error("crypto failure: {0}")]
    CryptoError(&'static str),
    #[error("checksum computation failed")]
    HashError(#[source] std::io::Error),
    #[error("unable to parse {what}: {value:?}")]
    ParseError { what: &'static str, value: String },
    #[error(transparent)]
    StoreError(#[from] StoreError),
    #[error("malformed package: {0}")]
    ArchiveError(&'static str),
    // Checksum mismatch and decryption failure are deliberately indistinguishable
    #[error("integrity check failed")]
    IntegrityError,
    #[error("upload exceeds the maximum size of {0} bytes")]
    UploadTooLarge(u64),
    #[error("upload pipeline failed: {0}")]
    PipelineError(&'static str),
    #[error(transparent)]
    ConfigError(#[from] toml::de::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("a buffer with this name already exists")]
    DuplicateName,
    #[error("no such buffer")]
    NotFound,
    #[error("download limit reached")]
    LimitReached,
    #[error("buffer has been destroyed")]
    Destroyed,
}

impl Error {
    pub(crate) fn parse(what: &'static str, value: &str) -> Self {
        Error::ParseError {
            what,
            value: value.to_string(),
        }
    }

    /// True for errors a download handler should hide behind a single
    /// "not found" response.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::StoreError(StoreError::NotFound) | Error::StoreError(StoreError::Destroyed)
        )
    }
}
