use crate::{
    compress::{self, Compression},
    metrics::Metrics,
    provider::{Downloader, Provider, Uploader},
    vault::{self, cipher::Encryption, Vault},
    Error,
};
use std::sync::Arc;

/// A configured pipeline factory: one backing store plus the compression
/// and encryption applied to everything that passes through it. Buckets are
/// built once at server start and shared, immutable, by every stream they
/// produce.
pub struct Bucket {
    pub key: String,
    pub name: String,
    pub description: String,
    pub compression: Compression,
    pub encryption: Encryption,
    provider: Box<dyn Provider>,
    vault: Arc<Vault>,
    pub metrics: Metrics,
}

impl Bucket {
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        compression: Compression,
        encryption: Encryption,
        provider: Box<dyn Provider>,
        vault: Vault,
        reservoir_size: usize,
    ) -> Bucket {
        Bucket {
            key: key.into(),
            name: name.into(),
            description: description.into(),
            compression,
            encryption,
            provider,
            vault: Arc::new(vault),
            metrics: Metrics::new(reservoir_size),
        }
    }

    /// Composes the upload pipeline for a new blob. Compression sits
    /// outermost (closest to the client), encryption inside it, the
    /// provider innermost: plaintext -> compressor -> encryptor -> backend.
    pub fn upload(&self, hint: &str) -> Result<Box<dyn Uploader>, Error> {
        let mut uploader = self.provider.upload(hint)?;

        if !self.encryption.is_none() {
            let path = uploader.path();
            uploader = vault::encrypt(&self.vault, &path, self.encryption, uploader)?;
        }

        Ok(compress::compress(uploader, self.compression))
    }

    /// Composes the inverse pipeline for reading a blob back.
    pub fn download(&self, path: &str) -> Result<Box<dyn Downloader>, Error> {
        let mut downloader = self.provider.download(path)?;

        if !self.encryption.is_none() {
            downloader = vault::decrypt(&self.vault, path, self.encryption, downloader)?;
        }

        Ok(compress::decompress(downloader, self.compression))
    }

    /// Deletes a blob and its cipher record. The vault record goes first:
    /// if we fail in between, what's left is ciphertext without a key
    /// (inert garbage) rather than a blob whose key still exists.
    pub fn expunge(&self, path: &str) -> Result<(), Error> {
        if !self.encryption.is_none() {
            self.vault.delete(path)?;
        }
        self.provider.expunge(path)?;
        self.metrics.expunge();
        Ok(())
    }
}
