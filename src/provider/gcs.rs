use crate::{
    meter,
    provider::{Downloader, MeteredDownloader, Provider, ProviderError, Uploader},
    random,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use slog::{debug, info, o, warn, Logger};
use std::{
    io::{self, Write},
    time::Duration,
};
use ureq::Agent;

const STORAGE_API_BASE_URL: &str = "https://storage.googleapis.com";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal:80/computeMetadata/v1/instance/service-accounts/default/token";
// GCP recommends 8 MiB chunks for resumable uploads; chunks must be at
// least 256 KiB.
const UPLOAD_CHUNK_SIZE: usize = 8_388_608;

/// Errors encountered when using Google Cloud Storage as a blob backend.
#[derive(Debug, thiserror::Error)]
pub enum GcsError {
    #[error("unable to obtain an oauth token: {0}")]
    Token(String),
    #[error("gcs request failed: {0}")]
    Http(#[source] Box<ureq::Error>),
    #[error("unable to decode gcs response: {0}")]
    BadResponse(String),
    #[error("no Location header in the resumable upload initiation response")]
    MissingSessionUri,
    #[error("unexpected Range header '{0}' in resumable upload response")]
    BadRangeHeader(String),
    #[error("gcs rejected an upload chunk with HTTP {0}")]
    ChunkRejected(u16),
}

/// Connection parameters for one GCS-backed bucket.
#[derive(Clone, Debug, Default)]
pub struct Endpoint {
    pub bucket: String,
    pub prefix: String,
    /// Service account email to impersonate; None uses the instance's
    /// default service account as-is.
    pub impersonate: Option<String>,
}

#[derive(Debug)]
struct OauthToken {
    token: String,
    expiration: DateTime<Utc>,
}

impl OauthToken {
    fn expired(&self) -> bool {
        Utc::now() >= self.expiration
    }
}

#[derive(Debug, Deserialize)]
struct MetadataServiceTokenResponse {
    access_token: String,
    expires_in: i64,
    token_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    access_token: String,
    expire_time: DateTime<Utc>,
}

/// Maintains the OAuth token used against the storage API: the default
/// service account token from the metadata service, optionally exchanged
/// for an impersonated service account's token via the IAM credentials API.
struct OauthTokenProvider {
    impersonate: Option<String>,
    default_token: Option<OauthToken>,
    impersonated_token: Option<OauthToken>,
}

impl OauthTokenProvider {
    fn new(impersonate: Option<String>) -> OauthTokenProvider {
        OauthTokenProvider {
            impersonate,
            default_token: None,
            impersonated_token: None,
        }
    }

    fn ensure_storage_token(&mut self, agent: &Agent) -> Result<String, GcsError> {
        match self.impersonate.clone() {
            Some(account) => self.ensure_impersonated_token(agent, &account),
            None => self.ensure_default_token(agent),
        }
    }

    fn ensure_default_token(&mut self, agent: &Agent) -> Result<String, GcsError> {
        if let Some(token) = &self.default_token {
            if !token.expired() {
                return Ok(token.token.clone());
            }
        }

        let response: MetadataServiceTokenResponse = agent
            .get(METADATA_TOKEN_URL)
            .set("Metadata-Flavor", "Google")
            .call()
            .map_err(|e| GcsError::Token(format!("metadata service: {}", e)))?
            .into_json()
            .map_err(|e| GcsError::BadResponse(e.to_string()))?;

        if response.token_type != "Bearer" {
            return Err(GcsError::Token(format!(
                "unexpected token type {}",
                response.token_type
            )));
        }

        self.default_token = Some(OauthToken {
            token: response.access_token.clone(),
            expiration: Utc::now() + ChronoDuration::seconds(response.expires_in),
        });
        Ok(response.access_token)
    }

    fn ensure_impersonated_token(
        &mut self,
        agent: &Agent,
        account: &str,
    ) -> Result<String, GcsError> {
        if let Some(token) = &self.impersonated_token {
            if !token.expired() {
                return Ok(token.token.clone());
            }
        }

        let auth = format!("Bearer {}", self.ensure_default_token(agent)?);
        let url = format!(
            "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{}:generateAccessToken",
            account
        );
        let response: GenerateAccessTokenResponse = agent
            .post(&url)
            .set("Authorization", &auth)
            .send_json(ureq::json!({
                "scope": ["https://www.googleapis.com/auth/devstorage.read_write"]
            }))
            .map_err(|e| GcsError::Token(format!("impersonating {}: {}", account, e)))?
            .into_json()
            .map_err(|e| GcsError::BadResponse(e.to_string()))?;

        self.impersonated_token = Some(OauthToken {
            token: response.access_token.clone(),
            expiration: response.expire_time,
        });
        Ok(response.access_token)
    }
}

/// A blob backend over the GCS JSON API. Uploads use resumable upload
/// sessions so blobs stream through a bounded chunk buffer.
pub struct GcsProvider {
    bucket: String,
    prefix: String,
    api_base: String,
    tokens: Mutex<OauthTokenProvider>,
    agent: Agent,
    logger: Logger,
}

impl GcsProvider {
    pub fn configure(endpoint: Endpoint, parent_logger: &Logger) -> GcsProvider {
        GcsProvider::configure_with_api_base(endpoint, STORAGE_API_BASE_URL, parent_logger)
    }

    /// Test rigs point the provider at a mock storage API.
    pub fn configure_with_api_base(
        endpoint: Endpoint,
        api_base: &str,
        parent_logger: &Logger,
    ) -> GcsProvider {
        let logger = parent_logger.new(o!(
            "provider" => "gcs",
            "bucket" => endpoint.bucket.clone(),
        ));
        GcsProvider {
            bucket: endpoint.bucket,
            prefix: endpoint.prefix,
            api_base: api_base.trim_end_matches('/').to_owned(),
            tokens: Mutex::new(OauthTokenProvider::new(endpoint.impersonate)),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(10))
                // 308 Resume Incomplete must reach us, not the redirect
                // follower.
                .redirects(0)
                .build(),
            logger,
        }
    }

    fn token(&self) -> Result<String, GcsError> {
        self.tokens.lock().ensure_storage_token(&self.agent)
    }

    fn object_name(&self, relpath: &str) -> String {
        format!("{}{}", self.prefix, relpath.trim_start_matches('/'))
    }

    fn object_url(&self, object: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.api_base,
            self.bucket,
            urlencoding::encode(object)
        )
    }
}

impl Provider for GcsProvider {
    fn upload(&self, hint: &str) -> Result<Box<dyn Uploader>, ProviderError> {
        let relpath = if hint.is_empty() {
            random::path()
        } else {
            hint.trim_start_matches('/').to_owned()
        };
        let object = self.object_name(&relpath);
        let logger = self.logger.new(o!("key" => object.clone()));
        info!(logger, "initiating resumable upload");

        // https://cloud.google.com/storage/docs/performing-resumable-uploads#initiate-session
        let upload_url = format!(
            "{}/upload/storage/v1/b/{}/o/",
            self.api_base, self.bucket
        );
        let token = self.token()?;
        let response = self
            .agent
            .post(&upload_url)
            .set("Authorization", &format!("Bearer {}", token))
            .query("uploadType", "resumable")
            .query("name", &object)
            .send_bytes(&[])
            .map_err(|e| GcsError::Http(Box::new(e)))?;

        let session_uri = response
            .header("Location")
            .ok_or(GcsError::MissingSessionUri)?
            .to_owned();

        Ok(Box::new(GcsUploader {
            agent: self.agent.clone(),
            session_uri,
            relpath,
            chunk_size: UPLOAD_CHUNK_SIZE,
            position: 0,
            buffer: Vec::new(),
            meter: meter::Meter::new(),
            finished: false,
            logger,
        }))
    }

    fn download(&self, path: &str) -> Result<Box<dyn Downloader>, ProviderError> {
        if path.is_empty() {
            return Err(ProviderError::NotFound(path.to_owned()));
        }
        let object = self.object_name(path);
        info!(self.logger, "get object"; "key" => &object);

        let token = self.token()?;
        let response = self
            .agent
            .get(&self.object_url(&object))
            .set("Authorization", &format!("Bearer {}", token))
            // alt=media returns the object bytes instead of its metadata.
            .query("alt", "media")
            .call()
            .map_err(|e| match e {
                ureq::Error::Status(404, _) => ProviderError::NotFound(path.to_owned()),
                other => GcsError::Http(Box::new(other)).into(),
            })?;

        Ok(Box::new(MeteredDownloader::new(Box::new(
            response.into_reader(),
        ))))
    }

    fn expunge(&self, path: &str) -> Result<(), ProviderError> {
        let object = self.object_name(path);
        info!(self.logger, "delete object"; "key" => &object);

        let token = self.token()?;
        match self
            .agent
            .delete(&self.object_url(&object))
            .set("Authorization", &format!("Bearer {}", token))
            .call()
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) => Err(ProviderError::NotFound(path.to_owned())),
            Err(e) => Err(GcsError::Http(Box::new(e)).into()),
        }
    }
}

/// Streams a blob into a GCS resumable upload session. Chunks of at least
/// `chunk_size` ship with `Content-Range: bytes x-y/*`; the final chunk
/// carries the total size instead of the asterisk. GCS may accept only part
/// of a chunk (reported in the `Range` response header), in which case the
/// unacknowledged tail stays buffered for the next attempt.
struct GcsUploader {
    agent: Agent,
    session_uri: String,
    relpath: String,
    chunk_size: usize,
    position: usize,
    buffer: Vec<u8>,
    meter: meter::Meter,
    finished: bool,
    logger: Logger,
}

impl GcsUploader {
    fn upload_chunk(&mut self, last_chunk: bool) -> Result<(), GcsError> {
        if self.buffer.is_empty() && !last_chunk {
            return Ok(());
        }

        let sized_final = last_chunk && self.buffer.len() < self.chunk_size;
        let body_len = if sized_final {
            self.buffer.len()
        } else {
            self.chunk_size
        };
        let total = self.position + self.buffer.len();

        let content_range = if self.buffer.is_empty() {
            // Finalizing a session whose bytes (possibly zero) have all
            // been shipped in unsized chunks already.
            format!("bytes */{}", total)
        } else {
            format!(
                "bytes {}-{}/{}",
                self.position,
                self.position + body_len - 1,
                if sized_final {
                    total.to_string()
                } else {
                    "*".to_owned()
                }
            )
        };
        debug!(self.logger, "uploading chunk"; "content-range" => &content_range);

        let response = match self
            .agent
            .put(&self.session_uri)
            .set("Content-Range", &content_range)
            .send_bytes(&self.buffer[..body_len])
        {
            Ok(rsp) => rsp,
            Err(ureq::Error::Status(code, _)) => return Err(GcsError::ChunkRejected(code)),
            Err(e) => return Err(GcsError::Http(Box::new(e))),
        };

        match response.status() {
            200 | 201 if last_chunk => {
                self.buffer.clear();
                Ok(())
            }
            200 | 201 => Err(GcsError::ChunkRejected(response.status())),
            308 => {
                let range = response
                    .header("Range")
                    .ok_or_else(|| GcsError::BadRangeHeader("<missing>".to_owned()))?
                    .to_owned();
                // "bytes=0-N" acknowledges the first N+1 bytes of the whole
                // object.
                let end: usize = range
                    .strip_prefix("bytes=0-")
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| GcsError::BadRangeHeader(range.clone()))?;
                if end >= total {
                    return Err(GcsError::BadRangeHeader(range));
                }
                let acknowledged = end + 1 - self.position;
                self.buffer.drain(..acknowledged);
                self.position = end + 1;
                Ok(())
            }
            other => Err(GcsError::ChunkRejected(other)),
        }
    }
}

impl Write for GcsUploader {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "upload already finished",
            ));
        }
        self.buffer.extend_from_slice(buf);
        self.meter.add(buf.len() as u64);
        while self.buffer.len() >= self.chunk_size {
            self.upload_chunk(false)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Chunks below the 256 KiB floor cannot be pushed early; close is
        // the real flush point.
        Ok(())
    }
}

impl Uploader for GcsUploader {
    fn path(&self) -> String {
        self.relpath.clone()
    }

    fn close(&mut self) -> Result<(), ProviderError> {
        if self.finished {
            return Ok(());
        }
        loop {
            // Only a chunk shorter than the chunk size carries the total
            // and finalizes the session; keep going until one of those has
            // gone out and been fully acknowledged.
            let finalizing = self.buffer.len() < self.chunk_size;
            self.upload_chunk(true)?;
            if finalizing && self.buffer.is_empty() {
                break;
            }
        }
        self.finished = true;
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), ProviderError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.buffer.clear();
        debug!(self.logger, "canceling resumable upload");

        // https://cloud.google.com/storage/docs/performing-resumable-uploads#cancel-upload
        match self
            .agent
            .delete(&self.session_uri)
            .set("Content-Length", "0")
            .call()
        {
            // 499 is the documented "session canceled" status.
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(499, _)) => Ok(()),
            Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(GcsError::Http(Box::new(e)).into()),
        }
    }

    fn wrote_uncompressed(&self) -> u64 {
        self.meter.total()
    }

    fn wrote_compressed(&self) -> u64 {
        self.meter.total()
    }
}

impl Drop for GcsUploader {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.cancel() {
                warn!(self.logger, "couldn't cancel dropped upload: {}", err);
            }
        }
    }
}
