pub mod api;
pub mod bucket;
pub mod client;
pub mod compress;
pub mod config;
pub mod logging;
pub mod meter;
pub mod metrics;
pub mod provider;
pub mod random;
pub mod server;
pub mod stream;
pub mod url;
pub mod vault;

/// Crate-wide error type. Module-specific failures are wrapped so that the
/// HTTP layer can map them onto status codes in one place.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bucket '{0}' not found")]
    BucketNotFound(String),
    #[error("invalid bind address '{0}'")]
    Bind(String),
    #[error("stream is not an upload")]
    NotAnUpload,
    #[error("stream is not a download")]
    NotADownload,
    #[error(transparent)]
    Provider(#[from] provider::ProviderError),
    #[error(transparent)]
    Vault(#[from] vault::VaultError),
    #[error(transparent)]
    Compression(#[from] compress::BadCompression),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Url(#[from] url::UrlError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that describe something the caller asked for and we
    /// could not find, as opposed to something going wrong while serving it.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::BucketNotFound(_) | Error::Provider(provider::ProviderError::NotFound(_))
        )
    }
}
