use crate::{
    meter,
    provider::{Downloader, MeteredDownloader, Provider, ProviderError, Uploader},
    random,
};
use hyper_rustls::HttpsConnectorBuilder;
use rusoto_core::{
    credential::{CredentialsError, DefaultCredentialsProvider, StaticProvider},
    region::ParseRegionError,
    ByteStream, Region, RusotoError,
};
use rusoto_s3::{
    AbortMultipartUploadError, AbortMultipartUploadRequest, CompleteMultipartUploadError,
    CompleteMultipartUploadRequest, CompletedMultipartUpload, CompletedPart,
    CreateMultipartUploadError, CreateMultipartUploadRequest, DeleteObjectError,
    DeleteObjectRequest, GetObjectError, GetObjectRequest, S3Client, UploadPartError,
    UploadPartRequest, S3,
};
use slog::{debug, info, o, warn, Logger};
use std::{
    io::{self, Read, Write},
    mem,
    pin::Pin,
    str::FromStr,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    runtime::Handle,
};

const MIB: usize = 1024 * 1024;

/// Errors encountered when using S3 (or an S3-compatible store) as a blob
/// backend.
#[derive(Debug, thiserror::Error)]
pub enum S3Error {
    #[error("invalid s3 region: {0}")]
    Region(#[from] ParseRegionError),
    #[error("unable to acquire s3 credentials: {0}")]
    Credentials(#[from] CredentialsError),
    #[error("error getting s3 object: {0}")]
    GetObject(RusotoError<GetObjectError>),
    #[error("no body in GetObject response")]
    GetObjectNoBody,
    #[error("error creating multipart upload to s3://{1}: {0}")]
    CreateMultipartUpload(RusotoError<CreateMultipartUploadError>, String),
    #[error("no upload ID in CreateMultipartUpload response")]
    MissingUploadId,
    #[error("failed to upload part: {0}")]
    UploadPart(RusotoError<UploadPartError>),
    #[error("no ETag in UploadPart response")]
    MissingETag,
    #[error("error completing upload: {0}")]
    CompleteMultipartUpload(RusotoError<CompleteMultipartUploadError>),
    #[error("CompleteMultipartUpload returned 200 with an empty result")]
    CompleteSilentFailure,
    #[error(transparent)]
    AbortMultipartUpload(RusotoError<AbortMultipartUploadError>),
    #[error("error deleting s3 object: {0}")]
    DeleteObject(RusotoError<DeleteObjectError>),
}

/// Connection parameters for one S3-backed bucket.
#[derive(Clone, Debug, Default)]
pub struct Endpoint {
    /// Endpoint override for S3 work-alikes; None means AWS proper.
    pub url: Option<String>,
    pub region: String,
    pub bucket: String,
    pub prefix: String,
    /// Upload part size in bytes. Amazon requires at least 5 MiB.
    pub part_size: usize,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub instance_metadata: bool,
}

/// A blob backend over the S3 API. Uploads stream through multipart uploads
/// so a blob of any size moves through a bounded buffer; downloads adapt
/// the async response body into a blocking reader.
pub struct S3Provider {
    endpoint: Endpoint,
    region: Region,
    runtime_handle: Handle,
    logger: Logger,
}

impl S3Provider {
    pub fn configure(
        endpoint: Endpoint,
        runtime_handle: &Handle,
        parent_logger: &Logger,
    ) -> Result<S3Provider, ProviderError> {
        let region = match &endpoint.url {
            Some(url) => Region::Custom {
                name: if endpoint.region.is_empty() {
                    "custom".to_owned()
                } else {
                    endpoint.region.clone()
                },
                endpoint: url.trim_end_matches('/').to_owned(),
            },
            None => Region::from_str(&endpoint.region).map_err(S3Error::Region)?,
        };

        let logger = parent_logger.new(o!(
            "provider" => "s3",
            "bucket" => endpoint.bucket.clone(),
        ));

        Ok(S3Provider {
            endpoint,
            region,
            runtime_handle: runtime_handle.clone(),
            logger,
        })
    }

    /// Constructs a fresh S3 client. Amazon closes idle connections after
    /// 20 seconds while hyper's pool keeps them for 90 by default, so the
    /// pool is told to drop idle connections well before that mismatch can
    /// bite.
    fn client(&self) -> Result<S3Client, S3Error> {
        let mut builder = hyper::Client::builder();
        builder.pool_idle_timeout(Duration::from_secs(10));
        let connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            // Work-alike endpoints in test and dev rigs are often plain
            // HTTP.
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let http_client = rusoto_core::HttpClient::from_builder(builder, connector);

        if self.endpoint.instance_metadata || self.endpoint.access_key_id.is_empty() {
            let creds = DefaultCredentialsProvider::new()?;
            Ok(S3Client::new_with(http_client, creds, self.region.clone()))
        } else {
            let creds = StaticProvider::new_minimal(
                self.endpoint.access_key_id.clone(),
                self.endpoint.secret_access_key.clone(),
            );
            Ok(S3Client::new_with(http_client, creds, self.region.clone()))
        }
    }

    fn full_key(&self, relpath: &str) -> String {
        format!("{}{}", self.endpoint.prefix, relpath)
    }

    fn part_size(&self) -> usize {
        if self.endpoint.part_size == 0 {
            5 * MIB
        } else {
            self.endpoint.part_size
        }
    }
}

impl Provider for S3Provider {
    fn upload(&self, hint: &str) -> Result<Box<dyn Uploader>, ProviderError> {
        let relpath = if hint.is_empty() {
            random::path()
        } else {
            hint.trim_start_matches('/').to_owned()
        };
        let key = self.full_key(&relpath);
        let logger = self.logger.new(o!("key" => key.clone()));
        info!(logger, "starting multipart upload");

        let uploader = S3Uploader::new(
            self.client()?,
            self.endpoint.bucket.clone(),
            key,
            relpath,
            self.part_size(),
            &self.runtime_handle,
            &logger,
        )?;
        Ok(Box::new(uploader))
    }

    fn download(&self, path: &str) -> Result<Box<dyn Downloader>, ProviderError> {
        if path.is_empty() {
            return Err(ProviderError::NotFound(path.to_owned()));
        }
        let key = self.full_key(path.trim_start_matches('/'));
        let logger = self.logger.new(o!("key" => key.clone()));
        info!(logger, "get object");

        let client = self.client()?;
        let output = self
            .runtime_handle
            .block_on(client.get_object(GetObjectRequest {
                bucket: self.endpoint.bucket.clone(),
                key,
                ..Default::default()
            }))
            .map_err(|err| {
                if matches!(err, RusotoError::Service(GetObjectError::NoSuchKey(_))) {
                    return ProviderError::NotFound(path.to_owned());
                }
                if matches!(&err, RusotoError::Unknown(rsp) if rsp.status.as_u16() == 404) {
                    return ProviderError::NotFound(path.to_owned());
                }
                S3Error::GetObject(err).into()
            })?;

        let body = output.body.ok_or(S3Error::GetObjectNoBody)?;
        Ok(Box::new(MeteredDownloader::new(Box::new(
            StreamingBodyReader::new(body, &self.runtime_handle),
        ))))
    }

    fn expunge(&self, path: &str) -> Result<(), ProviderError> {
        let key = self.full_key(path.trim_start_matches('/'));
        info!(self.logger, "delete object"; "key" => &key);

        let client = self.client()?;
        self.runtime_handle
            .block_on(client.delete_object(DeleteObjectRequest {
                bucket: self.endpoint.bucket.clone(),
                key,
                ..Default::default()
            }))
            .map_err(S3Error::DeleteObject)?;
        Ok(())
    }
}

/// Bridges the async `ByteStream` of a GetObject response into the blocking
/// world the download pipeline lives in.
struct StreamingBodyReader {
    body_reader: Pin<Box<dyn AsyncRead + Send>>,
    runtime_handle: Handle,
}

impl StreamingBodyReader {
    fn new(body: ByteStream, runtime_handle: &Handle) -> StreamingBodyReader {
        StreamingBodyReader {
            body_reader: Box::pin(body.into_async_read()),
            runtime_handle: runtime_handle.clone(),
        }
    }
}

impl Read for StreamingBodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.runtime_handle.block_on(self.body_reader.read(buf))
    }
}

/// Streams a blob into S3 as a multipart upload. Writes accumulate in a
/// buffer that flushes as an UploadPart whenever it crosses the part size;
/// `close` uploads the final short part and completes the upload. Any part
/// failure aborts the whole multipart upload so half-written parts don't
/// accrue storage charges.
struct S3Uploader {
    client: S3Client,
    runtime_handle: Handle,
    bucket: String,
    key: String,
    relpath: String,
    upload_id: String,
    completed_parts: Vec<CompletedPart>,
    part_size: usize,
    buffer: Vec<u8>,
    meter: meter::Meter,
    logger: Logger,
    finished: bool,
}

impl S3Uploader {
    fn new(
        client: S3Client,
        bucket: String,
        key: String,
        relpath: String,
        part_size: usize,
        runtime_handle: &Handle,
        logger: &Logger,
    ) -> Result<S3Uploader, S3Error> {
        let create_output = runtime_handle
            .block_on(client.create_multipart_upload(CreateMultipartUploadRequest {
                bucket: bucket.clone(),
                key: key.clone(),
                ..Default::default()
            }))
            .map_err(|e| S3Error::CreateMultipartUpload(e, bucket.clone()))?;

        Ok(S3Uploader {
            client,
            runtime_handle: runtime_handle.clone(),
            bucket,
            key,
            relpath,
            upload_id: create_output.upload_id.ok_or(S3Error::MissingUploadId)?,
            completed_parts: Vec::new(),
            part_size,
            buffer: Vec::with_capacity(part_size * 2),
            meter: meter::Meter::new(),
            logger: logger.clone(),
            finished: false,
        })
    }

    /// Ships the buffered content as one part. A part failure aborts the
    /// upload before surfacing, so subsequent writes fail fast.
    fn upload_part(&mut self) -> Result<(), ProviderError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let part_number = (self.completed_parts.len() + 1) as i64;
        debug!(self.logger, "uploading part"; "part" => part_number);
        let body = mem::replace(&mut self.buffer, Vec::with_capacity(self.part_size * 2));

        let result = self
            .runtime_handle
            .block_on(self.client.upload_part(UploadPartRequest {
                bucket: self.bucket.clone(),
                key: self.key.clone(),
                upload_id: self.upload_id.clone(),
                part_number,
                body: Some(body.into()),
                ..Default::default()
            }));
        let upload_output = match result {
            Ok(output) => output,
            Err(e) => {
                return Err(ProviderError::with_cancellation(
                    S3Error::UploadPart(e).into(),
                    self.abort(),
                ))
            }
        };

        let e_tag = match upload_output.e_tag {
            Some(t) => t,
            None => {
                return Err(ProviderError::with_cancellation(
                    S3Error::MissingETag.into(),
                    self.abort(),
                ))
            }
        };

        self.completed_parts.push(CompletedPart {
            e_tag: Some(e_tag),
            part_number: Some(part_number),
        });
        Ok(())
    }

    fn abort(&mut self) -> Result<(), ProviderError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        debug!(self.logger, "aborting multipart upload");
        self.runtime_handle
            .block_on(
                self.client
                    .abort_multipart_upload(AbortMultipartUploadRequest {
                        bucket: self.bucket.clone(),
                        key: self.key.clone(),
                        upload_id: self.upload_id.clone(),
                        ..Default::default()
                    }),
            )
            .map_err(S3Error::AbortMultipartUpload)?;
        Ok(())
    }
}

impl Write for S3Uploader {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "upload already finished",
            ));
        }
        self.buffer.extend_from_slice(buf);
        self.meter.add(buf.len() as u64);
        if self.buffer.len() >= self.part_size {
            self.upload_part()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Parts below the minimum size cannot be pushed early; close is the
        // real flush point.
        Ok(())
    }
}

impl Uploader for S3Uploader {
    fn path(&self) -> String {
        self.relpath.clone()
    }

    fn close(&mut self) -> Result<(), ProviderError> {
        if self.finished {
            return Ok(());
        }

        self.upload_part()?;

        if self.completed_parts.is_empty() {
            // Nothing was ever written. There is no such thing as an empty
            // multipart object, so clean up the dangling upload instead.
            info!(self.logger, "canceling empty upload");
            return self.abort();
        }

        let completed_parts = mem::take(&mut self.completed_parts);
        let output = self
            .runtime_handle
            .block_on(
                self.client
                    .complete_multipart_upload(CompleteMultipartUploadRequest {
                        bucket: self.bucket.clone(),
                        key: self.key.clone(),
                        upload_id: self.upload_id.clone(),
                        multipart_upload: Some(CompletedMultipartUpload {
                            parts: Some(completed_parts),
                        }),
                        ..Default::default()
                    }),
            )
            .map_err(S3Error::CompleteMultipartUpload)?;

        // S3 can answer CompleteMultipartUpload with HTTP 200 and an error
        // document; rusoto surfaces that as an Ok with every field empty.
        if output.location.is_none()
            && output.e_tag.is_none()
            && output.bucket.is_none()
            && output.key.is_none()
        {
            return Err(S3Error::CompleteSilentFailure.into());
        }

        self.finished = true;
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), ProviderError> {
        self.buffer.clear();
        self.abort()
    }

    fn wrote_uncompressed(&self) -> u64 {
        self.meter.total()
    }

    fn wrote_compressed(&self) -> u64 {
        self.meter.total()
    }
}

impl Drop for S3Uploader {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.abort() {
                warn!(self.logger, "couldn't abort dropped upload: {}", err);
            }
        }
    }
}
