use crate::{
    meter,
    provider::{
        clean_components, Downloader, MeteredDownloader, Provider, ProviderError, Uploader,
    },
    random,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use slog::{debug, info, o, warn, Logger};
use std::{
    io::{self, Read, Write},
    sync::mpsc::{sync_channel, Receiver, SyncSender},
    thread,
    time::Duration,
};
use ureq::Agent;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Errors encountered when using a WebDAV server as a blob backend.
#[derive(Debug, thiserror::Error)]
pub enum WebdavError {
    #[error("MKCOL {0}: HTTP {1}")]
    Mkcol(String, u16),
    #[error("PUT {0}: HTTP {1}")]
    Put(String, u16),
    #[error("{0}: HTTP {1}")]
    Unexpected(String, u16),
    #[error("webdav request failed: {0}")]
    Http(#[source] Box<ureq::Error>),
    #[error("the upload request ended before the body was finished")]
    RequestGone,
}

/// Connection parameters for one WebDAV-backed bucket.
#[derive(Clone, Debug, Default)]
pub struct Endpoint {
    pub url: String,
    pub username: String,
    pub password: String,
    /// Request timeout in seconds; 0 means the default.
    pub timeout: u64,
}

/// A blob backend over RFC 4918 WebDAV. Parent collections are created with
/// MKCOL as needed; blob bytes stream through a PUT whose body is fed from
/// the uploader as segments arrive.
pub struct WebdavProvider {
    base: String,
    auth: Option<String>,
    agent: Agent,
    logger: Logger,
}

impl WebdavProvider {
    pub fn configure(endpoint: Endpoint, parent_logger: &Logger) -> WebdavProvider {
        let auth = if endpoint.username.is_empty() {
            None
        } else {
            Some(format!(
                "Basic {}",
                BASE64.encode(format!("{}:{}", endpoint.username, endpoint.password))
            ))
        };
        let timeout = if endpoint.timeout == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            endpoint.timeout
        };

        WebdavProvider {
            base: endpoint.url.trim_end_matches('/').to_owned(),
            auth,
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(timeout))
                .build(),
            logger: parent_logger.new(o!("provider" => "webdav")),
        }
    }

    fn url_for(&self, relpath: &str) -> String {
        format!("{}/{}", self.base, relpath.trim_start_matches('/'))
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let mut req = self.agent.request(method, url);
        if let Some(auth) = &self.auth {
            req = req.set("Authorization", auth);
        }
        req
    }

    /// Creates every ancestor collection of `relpath`, bottom-up. An
    /// existing collection answers MKCOL with 405, which is as good as a
    /// 201 here.
    fn ensure_collections(&self, relpath: &str) -> Result<(), ProviderError> {
        let parts = clean_components(relpath)?;
        for depth in 1..parts.len() {
            let prefix = parts[..depth].join("/");
            let url = format!("{}/", self.url_for(&prefix));
            match self.request("MKCOL", &url).call() {
                Ok(_) => {}
                Err(ureq::Error::Status(405, _)) => {}
                Err(ureq::Error::Status(code, _)) => {
                    return Err(WebdavError::Mkcol(prefix, code).into());
                }
                Err(e) => return Err(WebdavError::Http(Box::new(e)).into()),
            }
        }
        Ok(())
    }
}

impl Provider for WebdavProvider {
    fn upload(&self, hint: &str) -> Result<Box<dyn Uploader>, ProviderError> {
        let relpath = if hint.is_empty() {
            random::path()
        } else {
            hint.trim_start_matches('/').to_owned()
        };
        self.ensure_collections(&relpath)?;

        let url = self.url_for(&relpath);
        let logger = self.logger.new(o!("key" => relpath.clone()));
        info!(logger, "opening streamed PUT");

        // The PUT runs on its own thread, reading its body from a channel
        // the uploader writes into. Closing the channel ends the body; the
        // thread's result tells us how the server felt about it.
        let (tx, rx) = sync_channel::<Vec<u8>>(16);
        let request = self.request("PUT", &url);
        let thread_url = url.clone();
        let handle = thread::spawn(move || -> Result<(), WebdavError> {
            match request.send(PipeReader::new(rx)) {
                Ok(_) => Ok(()),
                Err(ureq::Error::Status(code, _)) => Err(WebdavError::Put(thread_url, code)),
                Err(e) => Err(WebdavError::Http(Box::new(e))),
            }
        });

        Ok(Box::new(WebdavUploader {
            relpath,
            url,
            tx: Some(tx),
            handle: Some(handle),
            meter: meter::Meter::new(),
            provider_auth: self.auth.clone(),
            agent: self.agent.clone(),
            canceled: false,
            logger,
        }))
    }

    fn download(&self, path: &str) -> Result<Box<dyn Downloader>, ProviderError> {
        if path.is_empty() {
            return Err(ProviderError::NotFound(path.to_owned()));
        }
        let url = self.url_for(path);
        info!(self.logger, "get"; "key" => path);

        let response = self.request("GET", &url).call().map_err(|e| match e {
            ureq::Error::Status(404, _) => ProviderError::NotFound(path.to_owned()),
            ureq::Error::Status(code, _) => WebdavError::Unexpected(url.clone(), code).into(),
            other => WebdavError::Http(Box::new(other)).into(),
        })?;

        Ok(Box::new(MeteredDownloader::new(Box::new(
            response.into_reader(),
        ))))
    }

    fn expunge(&self, path: &str) -> Result<(), ProviderError> {
        let url = self.url_for(path);
        info!(self.logger, "delete"; "key" => path);

        match self.request("DELETE", &url).call() {
            Ok(_) => Ok(()),
            // 410 Gone is a fine answer to "make it gone".
            Err(ureq::Error::Status(410, _)) => Ok(()),
            Err(ureq::Error::Status(404, _)) => Err(ProviderError::NotFound(path.to_owned())),
            Err(ureq::Error::Status(code, _)) => Err(WebdavError::Unexpected(url, code).into()),
            Err(e) => Err(WebdavError::Http(Box::new(e)).into()),
        }
    }
}

/// The read side of the in-process pipe feeding a PUT body.
struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl PipeReader {
    fn new(rx: Receiver<Vec<u8>>) -> PipeReader {
        PipeReader {
            rx,
            pending: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                // Senders gone: the body is complete.
                Err(_) => return Ok(0),
            }
        }
        let n = (self.pending.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct WebdavUploader {
    relpath: String,
    url: String,
    tx: Option<SyncSender<Vec<u8>>>,
    handle: Option<thread::JoinHandle<Result<(), WebdavError>>>,
    meter: meter::Meter,
    provider_auth: Option<String>,
    agent: Agent,
    canceled: bool,
    logger: Logger,
}

impl WebdavUploader {
    /// Ends the request body and collects the PUT's verdict.
    fn finish_request(&mut self) -> Result<(), ProviderError> {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| WebdavError::RequestGone)?
                .map_err(ProviderError::from)?;
        }
        Ok(())
    }
}

impl Write for WebdavUploader {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "upload already finished"))?;
        tx.send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "upload request ended early"))?;
        self.meter.add(buf.len() as u64);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Uploader for WebdavUploader {
    fn path(&self) -> String {
        self.relpath.clone()
    }

    fn close(&mut self) -> Result<(), ProviderError> {
        self.finish_request()
    }

    fn cancel(&mut self) -> Result<(), ProviderError> {
        if self.canceled {
            return Ok(());
        }
        self.canceled = true;

        // End the body (committing whatever the server already has), then
        // remove the path so no partial blob stays visible.
        if let Err(err) = self.finish_request() {
            debug!(self.logger, "canceled upload's PUT failed: {}", err);
        }

        let mut req = self.agent.request("DELETE", &self.url);
        if let Some(auth) = &self.provider_auth {
            req = req.set("Authorization", auth);
        }
        match req.call() {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) | Err(ureq::Error::Status(410, _)) => Ok(()),
            Err(ureq::Error::Status(code, _)) => {
                warn!(self.logger, "couldn't remove canceled upload";
                      "status" => code);
                Err(WebdavError::Unexpected(self.url.clone(), code).into())
            }
            Err(e) => Err(WebdavError::Http(Box::new(e)).into()),
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
    use crate::logging::setup_test_logging;
    use assert_matches::assert_matches;
    use mockito::mock;

    fn test_provider() -> WebdavProvider {
        WebdavProvider::configure(
            Endpoint {
                url: mockito::server_url(),
                username: "user".to_owned(),
                password: "pass".to_owned(),
                timeout: 5,
            },
            &setup_test_logging(),
        )
    }

    fn basic_auth() -> String {
        format!("Basic {}", BASE64.encode("user:pass"))
    }

    #[test]
    fn upload_creates_collections_then_streams_a_put() {
        let col1 = mock("MKCOL", "/a/")
            .match_header("Authorization", basic_auth().as_str())
            .with_status(201)
            .create();
        // Already-existing collections answer 405.
        let col2 = mock("MKCOL", "/a/b/").with_status(405).create();
        let put = mock("PUT", "/a/b/blob")
            .match_header("Authorization", basic_auth().as_str())
            .match_body("streamed body")
            .with_status(201)
            .create();

        let p = test_provider();
        let mut up = p.upload("a/b/blob").unwrap();
        up.write_all(b"streamed ").unwrap();
        up.write_all(b"body").unwrap();
        up.close().unwrap();
        assert_eq!(up.wrote_uncompressed(), 13);

        col1.assert();
        col2.assert();
        put.assert();
    }

    #[test]
    fn a_failed_collection_fails_the_upload() {
        let _col = mock("MKCOL", "/a/").with_status(507).create();

        let p = test_provider();
        assert_matches!(
            p.upload("a/blob"),
            Err(ProviderError::Webdav(WebdavError::Mkcol(_, 507)))
        );
    }

    #[test]
    fn a_rejected_put_surfaces_at_close() {
        let _put = mock("PUT", "/blob").with_status(507).create();

        let p = test_provider();
        let mut up = p.upload("blob").unwrap();
        up.write_all(b"x").unwrap();
        assert_matches!(
            up.close(),
            Err(ProviderError::Webdav(WebdavError::Put(_, 507)))
        );
    }

    #[test]
    fn cancel_removes_the_partial_blob() {
        let _put = mock("PUT", "/doomed").with_status(201).create();
        let del = mock("DELETE", "/doomed").with_status(204).create();

        let p = test_provider();
        let mut up = p.upload("doomed").unwrap();
        up.write_all(b"partial").unwrap();
        up.cancel().unwrap();
        up.cancel().unwrap();

        del.assert();
    }

    #[test]
    fn download_reads_the_body() {
        let m = mock("GET", "/a/blob")
            .match_header("Authorization", basic_auth().as_str())
            .with_body("blob bytes")
            .create();

        let p = test_provider();
        let mut down = p.download("a/blob").unwrap();
        let mut out = Vec::new();
        down.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"blob bytes");
        assert_eq!(down.read_uncompressed(), 10);

        m.assert();
    }

    #[test]
    fn missing_blobs_are_not_found() {
        let _m = mock("GET", "/no/such").with_status(404).create();
        let p = test_provider();
        assert_matches!(p.download("no/such"), Err(ProviderError::NotFound(_)));
    }

    #[test]
    fn expunge_accepts_gone_and_reports_missing() {
        let m = mock("DELETE", "/a/blob").with_status(204).create();
        let p = test_provider();
        p.expunge("a/blob").unwrap();
        m.assert();

        let _gone = mock("DELETE", "/b/blob").with_status(410).create();
        p.expunge("b/blob").unwrap();

        let _missing = mock("DELETE", "/c/blob").with_status(404).create();
        assert_matches!(p.expunge("c/blob"), Err(ProviderError::NotFound(_)));
    }
}
