use crate::{
    bucket::Bucket,
    meter::Delta,
    provider::{Downloader, Uploader},
    random, Error,
};
use chrono::{DateTime, Duration, Utc};
use std::{
    io::{Read, Write},
    sync::Arc,
};

/// A stream is exactly one of the two: there is no such thing as a session
/// that can both read and write.
pub enum Handle {
    Upload(Box<dyn Uploader>),
    Download(Box<dyn Downloader>),
}

/// A leased session. Data-plane requests present the stream's secret; each
/// authorized access slides the expiry forward by the renewal interval.
/// Streams are owned by the server's registry and driven by one client at a
/// time.
pub struct Stream {
    id: String,
    canon: String,
    secret: String,
    leased: DateTime<Utc>,
    expires: DateTime<Utc>,
    renewal: Duration,
    segments: u64,
    handle: Handle,
    bucket: Arc<Bucket>,
    compressed: Delta,
    uncompressed: Delta,
    closed: bool,
}

impl Stream {
    pub fn upload(
        canon: String,
        uploader: Box<dyn Uploader>,
        bucket: Arc<Bucket>,
        life: Duration,
    ) -> Stream {
        Stream::new(canon, Handle::Upload(uploader), bucket, life)
    }

    pub fn download(
        canon: String,
        downloader: Box<dyn Downloader>,
        bucket: Arc<Bucket>,
        life: Duration,
    ) -> Stream {
        Stream::new(canon, Handle::Download(downloader), bucket, life)
    }

    fn new(canon: String, handle: Handle, bucket: Arc<Bucket>, life: Duration) -> Stream {
        let now = Utc::now();
        Stream {
            id: random::string(96),
            canon,
            secret: random::string(32),
            leased: now,
            expires: now + life,
            renewal: life,
            segments: 0,
            handle,
            bucket,
            compressed: Delta::default(),
            uncompressed: Delta::default(),
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn canon(&self) -> &str {
        &self.canon
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn leased(&self) -> DateTime<Utc> {
        self.leased
    }

    pub fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    pub fn kind(&self) -> &'static str {
        match self.handle {
            Handle::Upload(_) => "upload",
            Handle::Download(_) => "download",
        }
    }

    pub fn segments(&self) -> u64 {
        self.segments
    }

    pub fn compressed_total(&self) -> u64 {
        self.compressed.total()
    }

    pub fn uncompressed_total(&self) -> u64 {
        self.uncompressed.total()
    }

    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    /// True iff `token` matches the secret and the lease has not run out.
    /// Success slides the lease; failure must leave the expiry untouched.
    pub fn authorize(&mut self, token: &str) -> bool {
        if self.authorized(token) {
            self.renew();
            return true;
        }
        false
    }

    fn authorized(&self, token: &str) -> bool {
        !token.is_empty() && token == self.secret && !self.expired()
    }

    /// Strict comparison: a stream whose expiry equals the current instant
    /// is already expired.
    pub fn expired(&self) -> bool {
        self.expires <= Utc::now()
    }

    /// Forces the lease into the past. Used by tests and nothing else.
    pub fn expire(&mut self) {
        self.expires = Utc::now() - Duration::seconds(1);
    }

    fn renew(&mut self) {
        self.expires = Utc::now() + self.renewal;
    }

    /// Pushes one segment through the upload pipeline, then refreshes the
    /// per-stream counters and the owning bucket's transfer metrics.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let uploader = match &mut self.handle {
            Handle::Upload(u) => u,
            Handle::Download(_) => return Err(Error::NotAnUpload),
        };

        uploader.write_all(buf)?;
        self.segments += 1;
        self.uncompressed.set(uploader.wrote_uncompressed());
        self.compressed.set(uploader.wrote_compressed());

        let metrics = &self.bucket.metrics;
        metrics.segment(buf.len());
        metrics.in_front(self.uncompressed.delta());
        metrics.out_back(self.compressed.delta());

        Ok(buf.len())
    }

    /// Pulls bytes from the download pipeline, mirroring `write`'s
    /// accounting on the way out.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let downloader = match &mut self.handle {
            Handle::Download(d) => d,
            Handle::Upload(_) => return Err(Error::NotADownload),
        };

        let n = downloader.read(buf)?;
        self.uncompressed.set(downloader.read_uncompressed());
        self.compressed.set(downloader.read_compressed());

        let metrics = &self.bucket.metrics;
        metrics.out_front(self.uncompressed.delta());
        metrics.in_back(self.compressed.delta());

        Ok(n)
    }

    /// Finalizes the pipeline: uploads commit, downloads release.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match &mut self.handle {
            Handle::Upload(u) => u.close()?,
            Handle::Download(d) => d.close()?,
        }
        Ok(())
    }

    /// Aborts the session. An upload's backend state and vault record are
    /// removed; a download just releases its reader. A canceled upload must
    /// never leave a visible blob. A stream that already closed has nothing
    /// to abort.
    pub fn cancel(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match &mut self.handle {
            Handle::Upload(u) => u.cancel()?,
            Handle::Download(d) => d.close()?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compress::Compression,
        provider::{MemProvider, Provider},
        vault::{cipher::Encryption, Vault},
    };
    use assert_matches::assert_matches;

    fn plain_bucket(provider: &MemProvider) -> Arc<Bucket> {
        Arc::new(Bucket::new(
            "b",
            "b",
            "",
            Compression::None,
            Encryption::None,
            Box::new(provider.clone()),
            Vault::null(),
            100,
        ))
    }

    fn upload_stream(provider: &MemProvider, life: Duration) -> Stream {
        let bucket = plain_bucket(provider);
        let uploader = bucket.upload("some/blob").unwrap();
        Stream::upload("ssg://c/b/some/blob".to_owned(), uploader, bucket, life)
    }

    #[test]
    fn new_streams_carry_credentials_and_a_live_lease() {
        let provider = MemProvider::new();
        let s = upload_stream(&provider, Duration::seconds(600));
        assert_eq!(s.id().len(), 96);
        assert_eq!(s.secret().len(), 32);
        assert!(s.expires() > s.leased());
        assert!(!s.expired());
        assert_eq!(s.kind(), "upload");
    }

    #[test]
    fn authorize_accepts_only_the_secret() {
        let provider = MemProvider::new();
        let mut s = upload_stream(&provider, Duration::seconds(600));
        let token = s.secret().to_owned();

        assert!(!s.authorize("wrong"));
        assert!(!s.authorize(""));
        assert!(s.authorize(&token));
    }

    #[test]
    fn authorize_slides_the_lease_but_only_on_success() {
        let provider = MemProvider::new();
        let mut s = upload_stream(&provider, Duration::seconds(600));
        let token = s.secret().to_owned();

        let before = s.expires();
        assert!(!s.authorize("wrong"));
        assert_eq!(s.expires(), before, "a bad token must not renew");

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(s.authorize(&token));
        assert!(s.expires() > before);
    }

    #[test]
    fn expired_streams_refuse_their_own_secret() {
        let provider = MemProvider::new();
        let mut s = upload_stream(&provider, Duration::seconds(600));
        let token = s.secret().to_owned();
        s.expire();
        assert!(s.expired());
        assert!(!s.authorize(&token));
    }

    #[test]
    fn writes_count_segments_and_feed_bucket_metrics() {
        let provider = MemProvider::new();
        let mut s = upload_stream(&provider, Duration::seconds(600));

        s.write(b"hello ").unwrap();
        s.write(b"world").unwrap();
        assert_eq!(s.segments(), 2);
        assert_eq!(s.uncompressed_total(), 11);
        assert_eq!(s.compressed_total(), 11);

        let m = s.bucket().metrics.snapshot();
        assert_eq!(m.transfer.front.r#in, 11);
        assert_eq!(m.transfer.back.out, 11);
        assert_eq!(m.segments.total, 2);

        s.close().unwrap();
        assert_eq!(provider.contents("some/blob").unwrap(), b"hello world");
    }

    #[test]
    fn reads_mirror_the_accounting() {
        let provider = MemProvider::new();
        {
            let mut up = provider.upload("some/blob").unwrap();
            std::io::Write::write_all(&mut up, b"payload").unwrap();
            up.close().unwrap();
        }

        let bucket = plain_bucket(&provider);
        let downloader = bucket.download("some/blob").unwrap();
        let mut s = Stream::download(
            "ssg://c/b/some/blob".to_owned(),
            downloader,
            bucket,
            Duration::seconds(600),
        );
        assert_eq!(s.kind(), "download");

        let mut out = Vec::new();
        let mut chunk = [0u8; 4];
        loop {
            let n = s.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, b"payload");

        let m = s.bucket().metrics.snapshot();
        assert_eq!(m.transfer.front.out, 7);
        assert_eq!(m.transfer.back.r#in, 7);
        s.close().unwrap();
    }

    #[test]
    fn the_wrong_operation_for_the_variant_is_an_error() {
        let provider = MemProvider::new();
        let mut s = upload_stream(&provider, Duration::seconds(600));
        let mut buf = [0u8; 8];
        assert_matches!(s.read(&mut buf), Err(Error::NotADownload));
    }

    #[test]
    fn cancel_aborts_the_upload_and_is_idempotent() {
        let provider = MemProvider::new();
        let mut s = upload_stream(&provider, Duration::seconds(600));
        s.write(b"partial").unwrap();

        s.cancel().unwrap();
        s.cancel().unwrap();
        assert!(!provider.exists("some/blob"));
    }

    #[test]
    fn close_then_cancel_keeps_the_committed_blob() {
        let provider = MemProvider::new();
        let mut s = upload_stream(&provider, Duration::seconds(600));
        s.write(b"done").unwrap();
        s.close().unwrap();
        s.cancel().unwrap();
        assert_eq!(provider.contents("some/blob").unwrap(), b"done");
    }
}
