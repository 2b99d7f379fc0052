use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::{
    io::{Read, Write},
    time::Duration,
};
use ureq::Agent;

/// One segment per POST; sized so base64 expansion stays comfortably under
/// typical proxy body limits.
pub const SEGMENT_SIZE: usize = 1024 * 1024;

/// Errors from the client side of the HTTP API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[source] Box<ureq::Error>),
    #[error("the gateway said: {message} (HTTP {status})")]
    Remote { status: u16, message: String },
    #[error("unable to decode response: {0}")]
    BadResponse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ureq::Error> for ClientError {
    fn from(e: ureq::Error) -> ClientError {
        match e {
            ureq::Error::Status(status, rsp) => {
                #[derive(Deserialize)]
                struct Envelope {
                    error: String,
                }
                let message = rsp
                    .into_json::<Envelope>()
                    .map(|e| e.error)
                    .unwrap_or_else(|_| "unknown error".to_owned());
                ClientError::Remote { status, message }
            }
            other => ClientError::Http(Box::new(other)),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ControlResponse {
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub token: String,
    pub canon: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct SegmentResponse {
    pub segments: u64,
    pub compressed: u64,
    pub uncompressed: u64,
    pub sent: usize,
}

#[derive(Debug, Deserialize)]
pub struct BucketInfo {
    pub key: String,
    pub name: String,
    pub description: String,
    pub compression: String,
    pub encryption: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamInfo {
    pub kind: String,
    pub id: String,
    pub canon: String,
    pub expires: DateTime<Utc>,
    pub received: u64,
}

/// A blocking client for the gateway API, shared by all of the CLI's
/// client subcommands. The configured token rides every request as a
/// bearer header; stream operations override it with the per-stream
/// secret.
pub struct Client {
    base: String,
    token: Option<String>,
    agent: Agent,
}

impl Client {
    pub fn new(base: &str, token: Option<String>) -> Client {
        Client {
            base: base.trim_end_matches('/').to_owned(),
            token,
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(30))
                .build(),
        }
    }

    fn request(&self, method: &str, path: &str, token: Option<&str>) -> ureq::Request {
        let mut req = self.agent.request(method, &format!("{}{}", self.base, path));
        if let Some(tok) = token.or(self.token.as_deref()) {
            req = req.set("Authorization", &format!("Bearer {}", tok));
        }
        req
    }

    /// GET /, returning the gateway's greeting.
    pub fn ping(&self) -> Result<String, ClientError> {
        #[derive(Deserialize)]
        struct Greeting {
            ok: String,
        }
        let g: Greeting = self
            .request("GET", "/", None)
            .call()?
            .into_json()
            .map_err(|e| ClientError::BadResponse(e.to_string()))?;
        Ok(g.ok)
    }

    pub fn buckets(&self) -> Result<Vec<BucketInfo>, ClientError> {
        self.request("GET", "/buckets", None)
            .call()?
            .into_json()
            .map_err(|e| ClientError::BadResponse(e.to_string()))
    }

    pub fn streams(&self) -> Result<Vec<StreamInfo>, ClientError> {
        self.request("GET", "/streams", None)
            .call()?
            .into_json()
            .map_err(|e| ClientError::BadResponse(e.to_string()))
    }

    /// POST /control: starts an upload or download stream, or expunges a
    /// blob.
    pub fn control(&self, kind: &str, target: &str) -> Result<ControlResponse, ClientError> {
        self.request("POST", "/control", None)
            .send_json(ureq::json!({ "kind": kind, "target": target }))?
            .into_json()
            .map_err(|e| ClientError::BadResponse(e.to_string()))
    }

    /// POST /blob/{id}: submits one segment, optionally marking EOF.
    pub fn put_segment(
        &self,
        id: &str,
        token: &str,
        data: &[u8],
        eof: bool,
    ) -> Result<SegmentResponse, ClientError> {
        self.request("POST", &format!("/blob/{}", id), Some(token))
            .send_json(ureq::json!({
                "data": BASE64.encode(data),
                "eof": eof,
            }))?
            .into_json()
            .map_err(|e| ClientError::BadResponse(e.to_string()))
    }

    /// GET /blob/{id}: streams the blob into `out`, returning the byte
    /// count.
    pub fn get_blob(
        &self,
        id: &str,
        token: &str,
        out: &mut dyn Write,
    ) -> Result<u64, ClientError> {
        let response = self
            .request("GET", &format!("/blob/{}", id), Some(token))
            .call()?;
        let mut reader = response.into_reader();
        Ok(std::io::copy(&mut reader, out)?)
    }

    /// Drives an existing upload stream from a reader: segments until EOF,
    /// then the EOF marker.
    pub fn put_stream(
        &self,
        id: &str,
        token: &str,
        input: &mut dyn Read,
    ) -> Result<SegmentResponse, ClientError> {
        let mut buf = vec![0u8; SEGMENT_SIZE];
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                return self.put_segment(id, token, &[], true);
            }
            self.put_segment(id, token, &buf[..n], false)?;
        }
    }

    /// Control + data plane in one motion: starts an upload to `target`
    /// and streams `input` into it.
    pub fn upload(
        &self,
        target: &str,
        input: &mut dyn Read,
    ) -> Result<(ControlResponse, SegmentResponse), ClientError> {
        let ticket = self.control("upload", target)?;
        let outcome = self.put_stream(&ticket.id, &ticket.token, input)?;
        Ok((ticket, outcome))
    }

    /// Starts a download from `target` and copies the blob into `out`.
    pub fn download(&self, target: &str, out: &mut dyn Write) -> Result<u64, ClientError> {
        let ticket = self.control("download", target)?;
        self.get_blob(&ticket.id, &ticket.token, out)
    }
}
