pub mod fs;
pub mod gcs;
pub mod mem;
pub mod s3;
pub mod webdav;

use crate::meter;
use std::io::{self, Read, Write};

pub use fs::FsProvider;
pub use gcs::GcsProvider;
pub use mem::MemProvider;
pub use s3::S3Provider;
pub use webdav::WebdavProvider;

/// Errors that can arise while moving blobs in and out of a backend.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{0}: not found")]
    NotFound(String),
    #[error("{0}: already exists")]
    AlreadyExists(String),
    #[error("{0}: invalid blob path")]
    BadPath(String),
    #[error(transparent)]
    Local(#[from] fs::FsError),
    #[error(transparent)]
    S3(#[from] s3::S3Error),
    #[error(transparent)]
    Gcs(#[from] gcs::GcsError),
    #[error(transparent)]
    Webdav(#[from] webdav::WebdavError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("encountered an error and failed to clean up afterwards: {original} (cleanup: {cancellation})")]
    Cancellation {
        original: Box<ProviderError>,
        cancellation: Box<ProviderError>,
    },
}

impl ProviderError {
    /// Flattens a failed operation and the outcome of the cleanup it
    /// triggered into a single error.
    pub fn with_cancellation(original: ProviderError, cleanup: Result<(), ProviderError>) -> Self {
        match cleanup {
            Ok(()) => original,
            Err(cancellation) => ProviderError::Cancellation {
                original: Box::new(original),
                cancellation: Box::new(cancellation),
            },
        }
    }
}

/// A Provider moves blobs in and out of one backing store: local files, an
/// S3-compatible object store, Google Cloud Storage, a WebDAV server, or
/// memory. Paths are relative, `/`-separated, and chosen by the caller,
/// except that an empty upload hint asks the provider to assign a random
/// path.
pub trait Provider: Send + Sync {
    fn upload(&self, hint: &str) -> Result<Box<dyn Uploader>, ProviderError>;
    fn download(&self, path: &str) -> Result<Box<dyn Downloader>, ProviderError>;
    fn expunge(&self, path: &str) -> Result<(), ProviderError>;
}

impl std::fmt::Debug for dyn Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Uploader({})", self.path())
    }
}

impl std::fmt::Debug for dyn Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Downloader")
    }
}

/// An in-flight blob write. The blob must not become visible to downloads
/// until `close` succeeds, and `cancel` must remove any partial state.
/// Callers must call exactly one of `close` or `cancel` when they are done;
/// both are idempotent.
pub trait Uploader: Write + Send {
    /// The final relative path of the blob, which may have been randomized.
    fn path(&self) -> String;

    /// Finalize the blob: flush buffered writes, complete multipart state,
    /// and release resources.
    fn close(&mut self) -> Result<(), ProviderError>;

    /// Abort the upload and remove any partially written data.
    fn cancel(&mut self) -> Result<(), ProviderError>;

    /// Monotonic count of bytes accepted at this layer, i.e. as the client
    /// sees them.
    fn wrote_uncompressed(&self) -> u64;

    /// Monotonic count of bytes as they appear on the backend wire.
    fn wrote_compressed(&self) -> u64;
}

/// An in-flight blob read. Read to EOF, then `close` to release resources.
pub trait Downloader: Read + Send {
    fn close(&mut self) -> Result<(), ProviderError>;

    /// Monotonic count of bytes as the client sees them.
    fn read_uncompressed(&self) -> u64;

    /// Monotonic count of bytes as they appear on the backend wire.
    fn read_compressed(&self) -> u64;
}

/// Adapts any raw reader into a Downloader. At the provider layer there is
/// no compression boundary, so both counters report the same raw total.
pub struct MeteredDownloader {
    rd: meter::Reader<Box<dyn Read + Send>>,
}

impl MeteredDownloader {
    pub fn new(inner: Box<dyn Read + Send>) -> MeteredDownloader {
        MeteredDownloader {
            rd: meter::Reader::new(inner),
        }
    }
}

impl Read for MeteredDownloader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.rd.read(buf)
    }
}

impl Downloader for MeteredDownloader {
    fn close(&mut self) -> Result<(), ProviderError> {
        // Dropping the inner reader releases whatever it holds.
        Ok(())
    }

    fn read_uncompressed(&self) -> u64 {
        self.rd.meter().total()
    }

    fn read_compressed(&self) -> u64 {
        self.rd.meter().total()
    }
}

/// Splits a client-supplied blob path into clean relative components,
/// rejecting traversal and absolute segments. Backends that map paths onto a
/// shared namespace (filesystems, WebDAV collections) route keys through
/// this before use.
pub fn clean_components(path: &str) -> Result<Vec<&str>, ProviderError> {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.is_empty() || parts.iter().any(|p| *p == "..") {
        return Err(ProviderError::BadPath(path.to_owned()));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn metered_downloader_counts_raw_bytes_on_both_sides() {
        let mut dl = MeteredDownloader::new(Box::new(&b"some bytes"[..]));
        let mut out = Vec::new();
        dl.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"some bytes");
        assert_eq!(dl.read_uncompressed(), 10);
        assert_eq!(dl.read_compressed(), 10);
        dl.close().unwrap();
    }

    #[test]
    fn clean_components_normalizes_paths() {
        assert_eq!(clean_components("a/b/c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(clean_components("/a//b/").unwrap(), vec!["a", "b"]);
        assert_eq!(clean_components("./a/./b").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn clean_components_rejects_traversal() {
        assert_matches!(clean_components("../x"), Err(ProviderError::BadPath(_)));
        assert_matches!(clean_components("a/../x"), Err(ProviderError::BadPath(_)));
        assert_matches!(clean_components(""), Err(ProviderError::BadPath(_)));
        assert_matches!(clean_components("/"), Err(ProviderError::BadPath(_)));
    }
}
