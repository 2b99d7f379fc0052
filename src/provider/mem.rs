use crate::{
    meter,
    provider::{Downloader, MeteredDownloader, Provider, ProviderError, Uploader},
    random,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io::{self, Cursor, Write},
    sync::Arc,
};

enum Entry {
    // Reserved by an in-flight upload; invisible to downloads.
    Pending,
    Complete(Vec<u8>),
}

/// An in-memory blob backend for tests and development. A path is reserved
/// when the upload starts, but its bytes only become visible to downloads
/// once the upload closes.
#[derive(Clone, Default)]
pub struct MemProvider {
    files: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemProvider {
    pub fn new() -> MemProvider {
        MemProvider::default()
    }

    /// The committed bytes at `path`, if any. Test hook.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.files.lock().get(path) {
            Some(Entry::Complete(b)) => Some(b.clone()),
            _ => None,
        }
    }

    /// True if `path` is reserved or committed. Test hook.
    pub fn exists(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }
}

impl Provider for MemProvider {
    fn upload(&self, hint: &str) -> Result<Box<dyn Uploader>, ProviderError> {
        let path = if hint.is_empty() {
            random::path()
        } else {
            hint.to_owned()
        };

        let mut files = self.files.lock();
        if files.contains_key(&path) {
            return Err(ProviderError::AlreadyExists(path));
        }
        files.insert(path.clone(), Entry::Pending);

        Ok(Box::new(MemUploader {
            files: self.files.clone(),
            path,
            buf: Vec::new(),
            meter: meter::Meter::new(),
            done: false,
        }))
    }

    fn download(&self, path: &str) -> Result<Box<dyn Downloader>, ProviderError> {
        if path.is_empty() {
            return Err(ProviderError::NotFound(path.to_owned()));
        }
        match self.files.lock().get(path) {
            Some(Entry::Complete(b)) => Ok(Box::new(MeteredDownloader::new(Box::new(
                Cursor::new(b.clone()),
            )))),
            _ => Err(ProviderError::NotFound(path.to_owned())),
        }
    }

    fn expunge(&self, path: &str) -> Result<(), ProviderError> {
        self.files.lock().remove(path);
        Ok(())
    }
}

struct MemUploader {
    files: Arc<Mutex<HashMap<String, Entry>>>,
    path: String,
    buf: Vec<u8>,
    meter: meter::Meter,
    done: bool,
}

impl Write for MemUploader {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.done {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "upload already finished",
            ));
        }
        self.buf.extend_from_slice(buf);
        self.meter.add(buf.len() as u64);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Uploader for MemUploader {
    fn path(&self) -> String {
        self.path.clone()
    }

    fn close(&mut self) -> Result<(), ProviderError> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        self.files
            .lock()
            .insert(self.path.clone(), Entry::Complete(std::mem::take(&mut self.buf)));
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), ProviderError> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        self.buf.clear();
        let mut files = self.files.lock();
        if let Some(Entry::Pending) = files.get(&self.path) {
            files.remove(&self.path);
        }
        Ok(())
    }

    fn wrote_uncompressed(&self) -> u64 {
        self.meter.total()
    }

    fn wrote_compressed(&self) -> u64 {
        self.meter.total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Read;

    #[test]
    fn roundtrip() {
        let p = MemProvider::new();

        let mut up = p.upload("a/blob").unwrap();
        up.write_all(b"in memory").unwrap();
        up.close().unwrap();

        let mut down = p.download("a/blob").unwrap();
        let mut out = Vec::new();
        down.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"in memory");
        assert_eq!(down.read_uncompressed(), 9);
    }

    #[test]
    fn pending_uploads_are_invisible_until_closed() {
        let p = MemProvider::new();

        let mut up = p.upload("pending").unwrap();
        up.write_all(b"half").unwrap();
        assert_matches!(p.download("pending"), Err(ProviderError::NotFound(_)));
        assert!(p.exists("pending"));

        up.close().unwrap();
        assert!(p.download("pending").is_ok());
    }

    #[test]
    fn duplicate_paths_are_rejected() {
        let p = MemProvider::new();
        let _up = p.upload("dup").unwrap();
        assert_matches!(p.upload("dup"), Err(ProviderError::AlreadyExists(_)));
    }

    #[test]
    fn cancel_releases_the_reservation() {
        let p = MemProvider::new();

        let mut up = p.upload("doomed").unwrap();
        up.write_all(b"partial").unwrap();
        up.cancel().unwrap();
        up.cancel().unwrap();

        assert!(!p.exists("doomed"));
        assert!(p.upload("doomed").is_ok());
    }

    #[test]
    fn empty_hint_assigns_a_random_path() {
        let p = MemProvider::new();
        let up = p.upload("").unwrap();
        assert_eq!(up.path().split('/').count(), 4);
    }

    #[test]
    fn expunge_is_idempotent() {
        let p = MemProvider::new();
        let mut up = p.upload("x").unwrap();
        up.close().unwrap();

        p.expunge("x").unwrap();
        p.expunge("x").unwrap();
        assert!(!p.exists("x"));
    }
}
