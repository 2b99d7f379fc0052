use crate::{
    meter,
    provider::{
        clean_components, Downloader, MeteredDownloader, Provider, ProviderError, Uploader,
    },
    random,
};
use std::{
    fs::{create_dir_all, remove_file, File, OpenOptions},
    io::{self, ErrorKind, Write},
    path::PathBuf,
};

/// Errors that can arise when using the local filesystem as a blob backend.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("{0}: {1}")]
    Stat(String, #[source] io::Error),
    #[error("{0}: not a directory")]
    NotADirectory(String),
    #[error("{0}: not a regular file")]
    NotAFile(String),
    #[error("creating parent directories {0}: {1}")]
    Mkdirp(String, #[source] io::Error),
    #[error("creating {0}: {1}")]
    Create(String, #[source] io::Error),
    #[error("opening {0}: {1}")]
    Open(String, #[source] io::Error),
    #[error("removing {0}: {1}")]
    Remove(String, #[source] io::Error),
}

/// A blob backend rooted at a local directory. Blobs are regular files under
/// the root; parent directories are created on demand.
pub struct FsProvider {
    root: PathBuf,
}

impl FsProvider {
    /// Validates that `root` exists and is a directory.
    pub fn configure(root: impl Into<PathBuf>) -> Result<FsProvider, ProviderError> {
        let root = root.into();
        let display = root.display().to_string();
        let md = std::fs::metadata(&root).map_err(|e| FsError::Stat(display.clone(), e))?;
        if !md.is_dir() {
            return Err(FsError::NotADirectory(display).into());
        }
        Ok(FsProvider { root })
    }

    fn abspath(&self, relpath: &str) -> Result<PathBuf, ProviderError> {
        let mut p = self.root.clone();
        for part in clean_components(relpath)? {
            p.push(part);
        }
        Ok(p)
    }
}

impl Provider for FsProvider {
    fn upload(&self, hint: &str) -> Result<Box<dyn Uploader>, ProviderError> {
        let mut relpath = hint.to_owned();
        if relpath.is_empty() {
            relpath = random::path();
            while self.abspath(&relpath)?.exists() {
                relpath = random::path();
            }
        }

        let abspath = self.abspath(&relpath)?;
        if let Some(parent) = abspath.parent() {
            create_dir_all(parent)
                .map_err(|e| FsError::Mkdirp(parent.display().to_string(), e))?;
        }

        // Exclusive create: an upload to an occupied path must fail rather
        // than clobber the blob already there.
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&abspath)
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    ProviderError::AlreadyExists(relpath.clone())
                } else {
                    FsError::Create(abspath.display().to_string(), e).into()
                }
            })?;

        Ok(Box::new(FsUploader {
            file: Some(meter::Writer::new(file)),
            meter: meter::Meter::new(),
            relpath,
            abspath,
            canceled: false,
        }))
    }

    fn download(&self, path: &str) -> Result<Box<dyn Downloader>, ProviderError> {
        if path.is_empty() {
            return Err(ProviderError::NotFound(path.to_owned()));
        }

        let abspath = self.abspath(path)?;
        let file = File::open(&abspath).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ProviderError::NotFound(path.to_owned())
            } else {
                FsError::Open(abspath.display().to_string(), e).into()
            }
        })?;
        let md = file
            .metadata()
            .map_err(|e| FsError::Stat(abspath.display().to_string(), e))?;
        if !md.is_file() {
            return Err(FsError::NotAFile(path.to_owned()).into());
        }

        Ok(Box::new(MeteredDownloader::new(Box::new(file))))
    }

    fn expunge(&self, path: &str) -> Result<(), ProviderError> {
        let abspath = self.abspath(path)?;
        remove_file(&abspath).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ProviderError::NotFound(path.to_owned())
            } else {
                FsError::Remove(abspath.display().to_string(), e).into()
            }
        })
    }
}

struct FsUploader {
    file: Option<meter::Writer<File>>,
    meter: meter::Meter,
    relpath: String,
    abspath: PathBuf,
    canceled: bool,
}

impl Write for FsUploader {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::Other, "upload already finished"))?;
        let n = file.write(buf)?;
        self.meter.add(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl Uploader for FsUploader {
    fn path(&self) -> String {
        self.relpath.clone()
    }

    fn close(&mut self) -> Result<(), ProviderError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), ProviderError> {
        self.file.take();
        if self.canceled {
            return Ok(());
        }
        self.canceled = true;
        match remove_file(&self.abspath) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::Remove(self.abspath.display().to_string(), e).into()),
        }
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
    fn configure_rejects_missing_and_non_directory_roots() {
        assert!(FsProvider::configure("/definitely/not/here").is_err());

        let tempdir = tempfile::TempDir::new().unwrap();
        let file = tempdir.path().join("regular");
        std::fs::write(&file, b"x").unwrap();
        assert!(FsProvider::configure(file).is_err());
    }

    #[test]
    fn roundtrip_through_a_named_path() {
        let tempdir = tempfile::TempDir::new().unwrap();
        let p = FsProvider::configure(tempdir.path()).unwrap();

        let mut up = p.upload("nested/dirs/blob").unwrap();
        assert_eq!(up.path(), "nested/dirs/blob");
        up.write_all(b"the blob bytes").unwrap();
        up.close().unwrap();
        assert_eq!(up.wrote_uncompressed(), 14);
        assert_eq!(up.wrote_compressed(), 14);

        let mut down = p.download("nested/dirs/blob").unwrap();
        let mut out = Vec::new();
        down.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"the blob bytes");
        assert_eq!(down.read_compressed(), 14);
        down.close().unwrap();
    }

    #[test]
    fn upload_assigns_a_random_path_when_the_hint_is_empty() {
        let tempdir = tempfile::TempDir::new().unwrap();
        let p = FsProvider::configure(tempdir.path()).unwrap();

        let mut up = p.upload("").unwrap();
        let path = up.path();
        assert_eq!(path.split('/').count(), 4);
        up.write_all(b"x").unwrap();
        up.close().unwrap();

        assert!(p.download(&path).is_ok());
    }

    #[test]
    fn upload_refuses_an_occupied_path() {
        let tempdir = tempfile::TempDir::new().unwrap();
        let p = FsProvider::configure(tempdir.path()).unwrap();

        let mut up = p.upload("taken").unwrap();
        up.write_all(b"first").unwrap();
        up.close().unwrap();

        assert_matches!(p.upload("taken"), Err(ProviderError::AlreadyExists(_)));
    }

    #[test]
    fn cancel_removes_the_partial_file_and_is_idempotent() {
        let tempdir = tempfile::TempDir::new().unwrap();
        let p = FsProvider::configure(tempdir.path()).unwrap();

        let mut up = p.upload("doomed").unwrap();
        up.write_all(b"partial").unwrap();
        up.cancel().unwrap();
        up.cancel().unwrap();

        assert_matches!(p.download("doomed"), Err(ProviderError::NotFound(_)));
    }

    #[test]
    fn download_rejects_missing_and_irregular_paths() {
        let tempdir = tempfile::TempDir::new().unwrap();
        let p = FsProvider::configure(tempdir.path()).unwrap();

        assert_matches!(p.download("no/such"), Err(ProviderError::NotFound(_)));
        assert_matches!(p.download(""), Err(ProviderError::NotFound(_)));

        std::fs::create_dir(tempdir.path().join("adir")).unwrap();
        assert!(p.download("adir").is_err());
    }

    #[test]
    fn expunge_removes_the_blob_and_reports_missing_blobs() {
        let tempdir = tempfile::TempDir::new().unwrap();
        let p = FsProvider::configure(tempdir.path()).unwrap();

        let mut up = p.upload("gone-soon").unwrap();
        up.write_all(b"bye").unwrap();
        up.close().unwrap();

        p.expunge("gone-soon").unwrap();
        assert_matches!(p.expunge("gone-soon"), Err(ProviderError::NotFound(_)));
    }

    #[test]
    fn traversal_is_rejected() {
        let tempdir = tempfile::TempDir::new().unwrap();
        let p = FsProvider::configure(tempdir.path()).unwrap();
        assert_matches!(p.upload("../escape"), Err(ProviderError::BadPath(_)));
        assert_matches!(p.download("../escape"), Err(ProviderError::BadPath(_)));
    }
}
