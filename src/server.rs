use crate::{
    bucket::Bucket,
    config::{Config, VaultConfig},
    provider::{self, Provider},
    stream::Stream,
    url::SsgUrl,
    vault::{self, FixedKeySource, LiteralKeyPaths, Vault, VaultProvider},
    Error,
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use slog::{debug, info, o, Logger};
use std::{collections::HashMap, sync::Arc};
use tokio::runtime::Handle;

/// What the control plane hands back when it starts a stream: everything an
/// agent needs to drive the data plane.
#[derive(Clone, Debug, Serialize)]
pub struct Ticket {
    pub kind: &'static str,
    pub id: String,
    pub token: String,
    pub canon: String,
    pub expires: DateTime<Utc>,
}

/// One row of the admin stream listing.
#[derive(Clone, Debug, Serialize)]
pub struct StreamEntry {
    pub kind: &'static str,
    pub id: String,
    pub canon: String,
    pub expires: DateTime<Utc>,
    pub received: u64,
}

#[derive(Default)]
struct Registry {
    uploads: HashMap<String, Arc<Mutex<Stream>>>,
    downloads: HashMap<String, Arc<Mutex<Stream>>>,
}

/// The session engine: configured buckets plus the registry of active
/// streams. One mutex guards the two id maps; each stream carries its own
/// lock so data-plane I/O never happens under the registry lock.
pub struct Server {
    pub cluster: String,
    pub bind: String,
    pub max_lease: Duration,
    pub sweep_interval: std::time::Duration,
    control_tokens: Vec<String>,
    monitor_tokens: Vec<String>,
    buckets: Vec<Arc<Bucket>>,
    registry: Mutex<Registry>,
    logger: Logger,
}

impl Server {
    /// Builds the server from a resolved configuration: one provider and
    /// one vault per bucket.
    pub fn new(config: Config, runtime: &Handle, logger: &Logger) -> Result<Server, Error> {
        let mut buckets = Vec::with_capacity(config.buckets.len());

        for b in &config.buckets {
            let provider: Box<dyn Provider> = match b.provider.kind.as_str() {
                "fs" => Box::new(provider::FsProvider::configure(
                    b.provider.fs.as_ref().map(|f| f.root.clone()).unwrap_or_default(),
                )?),
                "s3" => {
                    let s3 = b.provider.s3.clone().unwrap_or_default();
                    Box::new(provider::S3Provider::configure(
                        provider::s3::Endpoint {
                            url: s3.url,
                            region: s3.region,
                            bucket: s3.bucket,
                            prefix: s3.prefix,
                            part_size: s3.part_size.unwrap_or(5) * 1024 * 1024,
                            access_key_id: s3.access_key_id,
                            secret_access_key: s3.secret_access_key,
                            instance_metadata: s3.instance_metadata,
                        },
                        runtime,
                        logger,
                    )?)
                }
                "gcs" => {
                    let gcs = b.provider.gcs.clone().unwrap_or_default();
                    Box::new(provider::GcsProvider::configure(
                        provider::gcs::Endpoint {
                            bucket: gcs.bucket,
                            prefix: gcs.prefix,
                            impersonate: gcs.impersonate,
                        },
                        logger,
                    ))
                }
                "webdav" => {
                    let webdav = b.provider.webdav.clone().unwrap_or_default();
                    Box::new(provider::WebdavProvider::configure(
                        provider::webdav::Endpoint {
                            url: webdav.url,
                            username: webdav.basic_auth.username,
                            password: webdav.basic_auth.password,
                            timeout: webdav.timeout,
                        },
                        logger,
                    ))
                }
                "mem" => Box::new(provider::MemProvider::new()),
                other => {
                    return Err(Error::Config(
                        crate::config::ConfigError::BadProviderKind(other.to_owned()),
                    ))
                }
            };

            let vault = match &b.vault {
                None => Vault::null(),
                Some(vc) => build_vault(vc)?,
            };

            buckets.push(Arc::new(Bucket::new(
                b.key.clone(),
                b.name.clone(),
                b.description.clone(),
                b.compression(),
                b.encryption(),
                provider,
                vault,
                config.metrics.reservoir_size,
            )));
        }

        let logger = logger.new(o!("cluster" => config.cluster.clone()));
        Ok(Server {
            cluster: config.cluster,
            bind: config.bind,
            max_lease: Duration::seconds(config.max_lease as i64),
            sweep_interval: std::time::Duration::from_secs(config.sweep_interval),
            control_tokens: config.control_tokens,
            monitor_tokens: config.monitor_tokens,
            buckets,
            registry: Mutex::new(Registry::default()),
            logger,
        })
    }

    pub fn is_control_token(&self, token: &str) -> bool {
        self.control_tokens.iter().any(|t| t == token)
    }

    pub fn is_monitor_token(&self, token: &str) -> bool {
        self.monitor_tokens.iter().any(|t| t == token)
    }

    pub fn buckets(&self) -> &[Arc<Bucket>] {
        &self.buckets
    }

    pub fn bucket(&self, key: &str) -> Option<Arc<Bucket>> {
        self.buckets.iter().find(|b| b.key == key).cloned()
    }

    /// Starts an upload stream toward `target` and registers it. The
    /// ticket's canonical URL carries the final (possibly randomized) blob
    /// path.
    pub fn start_upload(&self, target: &SsgUrl) -> Result<Ticket, Error> {
        let bucket = self
            .bucket(&target.bucket)
            .ok_or_else(|| Error::BucketNotFound(target.bucket.clone()))?;

        let uploader = bucket.upload(&target.path)?;
        let canon = SsgUrl {
            cluster: self.cluster.clone(),
            bucket: bucket.key.clone(),
            path: uploader.path(),
        }
        .to_string();

        let stream = Stream::upload(canon.clone(), uploader, bucket.clone(), self.max_lease);
        bucket.metrics.start_upload();

        let ticket = Ticket {
            kind: "upload",
            id: stream.id().to_owned(),
            token: stream.secret().to_owned(),
            canon,
            expires: stream.expires(),
        };
        info!(self.logger, "upload started";
              "stream_id" => &ticket.id, "canon" => &ticket.canon);

        self.registry
            .lock()
            .uploads
            .insert(ticket.id.clone(), Arc::new(Mutex::new(stream)));
        Ok(ticket)
    }

    /// Starts a download stream from `target` and registers it.
    pub fn start_download(&self, target: &SsgUrl) -> Result<Ticket, Error> {
        let bucket = self
            .bucket(&target.bucket)
            .ok_or_else(|| Error::BucketNotFound(target.bucket.clone()))?;

        let downloader = bucket.download(&target.path)?;
        let canon = SsgUrl {
            cluster: self.cluster.clone(),
            bucket: bucket.key.clone(),
            path: target.path.clone(),
        }
        .to_string();

        let stream = Stream::download(canon.clone(), downloader, bucket.clone(), self.max_lease);
        bucket.metrics.start_download();

        let ticket = Ticket {
            kind: "download",
            id: stream.id().to_owned(),
            token: stream.secret().to_owned(),
            canon,
            expires: stream.expires(),
        };
        info!(self.logger, "download started";
              "stream_id" => &ticket.id, "canon" => &ticket.canon);

        self.registry
            .lock()
            .downloads
            .insert(ticket.id.clone(), Arc::new(Mutex::new(stream)));
        Ok(ticket)
    }

    /// Removes the blob (and its cipher record) behind `target`.
    pub fn expunge(&self, target: &SsgUrl) -> Result<(), Error> {
        let bucket = self
            .bucket(&target.bucket)
            .ok_or_else(|| Error::BucketNotFound(target.bucket.clone()))?;
        info!(self.logger, "expunge"; "canon" => target.to_string());
        bucket.expunge(&target.path)
    }

    /// Finds and authorizes an upload stream in one motion. Unknown ids
    /// and bad or expired tokens are indistinguishable from the outside. A
    /// successful authorize slides the lease.
    pub fn get_upload(&self, id: &str, token: &str) -> Option<Arc<Mutex<Stream>>> {
        let stream = self.registry.lock().uploads.get(id).cloned()?;
        if !stream.lock().authorize(token) {
            return None;
        }
        Some(stream)
    }

    /// `get_upload`, for the download map.
    pub fn get_download(&self, id: &str, token: &str) -> Option<Arc<Mutex<Stream>>> {
        let stream = self.registry.lock().downloads.get(id).cloned()?;
        if !stream.lock().authorize(token) {
            return None;
        }
        Some(stream)
    }

    /// Drops a stream from the registry. Whatever handles it still holds
    /// stay valid; the id stops resolving.
    pub fn forget(&self, id: &str) {
        let mut registry = self.registry.lock();
        registry.uploads.remove(id);
        registry.downloads.remove(id);
    }

    /// Snapshot of every active stream, for the admin listing. The
    /// registry lock is dropped before any stream lock is taken, since a
    /// stream busy with backend I/O holds its own lock for the duration.
    pub fn streams(&self) -> Vec<StreamEntry> {
        let (uploads, downloads) = {
            let registry = self.registry.lock();
            (
                registry.uploads.values().cloned().collect::<Vec<_>>(),
                registry.downloads.values().cloned().collect::<Vec<_>>(),
            )
        };

        let entry = |kind: &'static str, s: Arc<Mutex<Stream>>| {
            let s = s.lock();
            StreamEntry {
                kind,
                id: s.id().to_owned(),
                canon: s.canon().to_owned(),
                expires: s.expires(),
                received: s.uncompressed_total(),
            }
        };

        let mut l = Vec::with_capacity(uploads.len() + downloads.len());
        l.extend(uploads.into_iter().map(|s| entry("upload", s)));
        l.extend(downloads.into_iter().map(|s| entry("download", s)));
        l
    }

    /// One sweep pass: collect every expired stream under the registry
    /// lock, then cancel them outside it. Upload cancellation talks to
    /// backends and must never block other requests on the registry.
    pub fn sweep(&self) {
        // A stream whose lock can't be taken is mid-request; it renewed its
        // lease on the way in, so it can wait for the next pass. try_lock
        // keeps backend I/O from ever stalling the registry.
        let (expired_uploads, expired_downloads) = {
            let mut registry = self.registry.lock();

            let mut expired_uploads = Vec::new();
            registry.uploads.retain(|_, s| match s.try_lock() {
                Some(stream) if stream.expired() => {
                    expired_uploads.push(s.clone());
                    false
                }
                _ => true,
            });

            let mut expired_downloads = Vec::new();
            registry.downloads.retain(|_, s| match s.try_lock() {
                Some(stream) if stream.expired() => {
                    expired_downloads.push(s.clone());
                    false
                }
                _ => true,
            });

            (expired_uploads, expired_downloads)
        };

        if expired_uploads.is_empty() && expired_downloads.is_empty() {
            return;
        }
        debug!(self.logger, "sweeping expired streams";
               "uploads" => expired_uploads.len(), "downloads" => expired_downloads.len());

        for stream in expired_uploads {
            let mut stream = stream.lock();
            debug!(self.logger, "canceling expired upload stream";
                   "stream_id" => stream.id(), "expired" => stream.expires().to_rfc3339());
            stream.bucket().metrics.cancel_upload();
            if let Err(err) = stream.cancel() {
                slog::warn!(self.logger, "failed to cancel expired upload: {}", err;
                            "stream_id" => stream.id());
            }
        }

        for stream in expired_downloads {
            let mut stream = stream.lock();
            stream.bucket().metrics.cancel_download();
            if let Err(err) = stream.cancel() {
                slog::warn!(self.logger, "failed to release expired download: {}", err;
                            "stream_id" => stream.id());
            }
        }
    }

    /// The background expiry task: one `sweep` every `sweep_interval`,
    /// run on the blocking pool because cancellation does provider I/O.
    pub async fn sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let server = self.clone();
            if tokio::task::spawn_blocking(move || server.sweep())
                .await
                .is_err()
            {
                // A panicking sweep shouldn't kill the sweeper itself.
                slog::error!(self.logger, "sweep pass panicked");
            }
        }
    }
}

fn build_vault(vc: &VaultConfig) -> Result<Vault, Error> {
    let fixed = FixedKeySource {
        enabled: vc.fixed_key.enabled,
        pbkdf2: vc.fixed_key.pbkdf2.clone(),
        aes128: LiteralKeyPaths {
            key: vc.fixed_key.aes128.key.clone(),
            iv: vc.fixed_key.aes128.iv.clone(),
        },
        aes192: LiteralKeyPaths {
            key: vc.fixed_key.aes192.key.clone(),
            iv: vc.fixed_key.aes192.iv.clone(),
        },
        aes256: LiteralKeyPaths {
            key: vc.fixed_key.aes256.key.clone(),
            iv: vc.fixed_key.aes256.iv.clone(),
        },
    };

    let provider: Box<dyn VaultProvider> = match vc.kind.as_str() {
        "hashicorp" => Box::new(vault::HashicorpVault::configure(
            vault::hashicorp::Endpoint {
                url: vc.hashicorp.url.clone(),
                prefix: vc.hashicorp.prefix.clone(),
                token: vc.hashicorp.token.clone(),
                role: vc.hashicorp.role.clone(),
                secret: vc.hashicorp.secret.clone(),
                timeout: vc.hashicorp.timeout,
            },
        )?),
        "static" => Box::new(vault::StaticVault::configure()),
        "memory" => Box::new(vault::MemoryVault::new()),
        other => {
            return Err(Error::Vault(vault::VaultError::KeyMaterial(format!(
                "unrecognized vault kind '{}'",
                other
            ))))
        }
    };

    Ok(Vault::new(provider, fixed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compress::Compression,
        logging::setup_test_logging,
        provider::MemProvider,
        vault::{cipher::Encryption, MemoryVault},
    };

    fn test_server(provider: &MemProvider, vault_backend: &MemoryVault) -> Server {
        let bucket = Bucket::new(
            "files",
            "Files",
            "",
            Compression::None,
            Encryption::Aes256Ctr,
            Box::new(provider.clone()),
            Vault::new(Box::new(vault_backend.clone()), FixedKeySource::default()),
            100,
        );
        Server {
            cluster: "test1".to_owned(),
            bind: "*:8080".to_owned(),
            max_lease: Duration::seconds(600),
            sweep_interval: std::time::Duration::from_secs(1),
            control_tokens: vec!["control".to_owned()],
            monitor_tokens: vec!["monitor".to_owned()],
            buckets: vec![Arc::new(bucket)],
            registry: Mutex::new(Registry::default()),
            logger: setup_test_logging(),
        }
    }

    fn target(path: &str) -> SsgUrl {
        SsgUrl {
            cluster: "test1".to_owned(),
            bucket: "files".to_owned(),
            path: path.to_owned(),
        }
    }

    #[test]
    fn upload_then_download_round_trips() {
        let provider = MemProvider::new();
        let backend = MemoryVault::new();
        let server = test_server(&provider, &backend);

        let ticket = server.start_upload(&target("a/blob")).unwrap();
        assert_eq!(ticket.kind, "upload");
        assert_eq!(ticket.id.len(), 96);
        assert_eq!(ticket.token.len(), 32);
        assert_eq!(ticket.canon, "ssg://test1/files/a/blob");

        let stream = server.get_upload(&ticket.id, &ticket.token).unwrap();
        stream.lock().write(b"hello ").unwrap();
        stream.lock().write(b"world").unwrap();
        stream.lock().close().unwrap();
        server.forget(&ticket.id);
        assert!(server.get_upload(&ticket.id, &ticket.token).is_none());

        let ticket = server.start_download(&target("a/blob")).unwrap();
        let stream = server.get_download(&ticket.id, &ticket.token).unwrap();
        let mut out = Vec::new();
        let mut chunk = [0u8; 8];
        loop {
            let n = stream.lock().read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn unknown_ids_and_wrong_tokens_are_indistinguishable() {
        let provider = MemProvider::new();
        let backend = MemoryVault::new();
        let server = test_server(&provider, &backend);

        let ticket = server.start_upload(&target("b/blob")).unwrap();
        assert!(server.get_upload("no-such-id", &ticket.token).is_none());
        assert!(server.get_upload(&ticket.id, "wrong-token").is_none());
        assert!(server.get_upload(&ticket.id, "").is_none());
        // A download lookup never sees upload streams.
        assert!(server.get_download(&ticket.id, &ticket.token).is_none());
        // The real credentials still work after all those misses.
        assert!(server.get_upload(&ticket.id, &ticket.token).is_some());
    }

    #[test]
    fn unknown_buckets_are_not_found() {
        let provider = MemProvider::new();
        let backend = MemoryVault::new();
        let server = test_server(&provider, &backend);

        let mut t = target("x");
        t.bucket = "nope".to_owned();
        assert!(matches!(
            server.start_upload(&t),
            Err(Error::BucketNotFound(_))
        ));
        assert!(matches!(
            server.start_download(&t),
            Err(Error::BucketNotFound(_))
        ));
        assert!(matches!(server.expunge(&t), Err(Error::BucketNotFound(_))));
    }

    #[test]
    fn empty_paths_randomize_and_the_ticket_says_where() {
        let provider = MemProvider::new();
        let backend = MemoryVault::new();
        let server = test_server(&provider, &backend);

        let ticket = server.start_upload(&target("")).unwrap();
        let canon = SsgUrl::parse(&ticket.canon).unwrap();
        assert_eq!(canon.path.split('/').count(), 4);
        assert!(provider.exists(&canon.path));
    }

    #[test]
    fn streams_listing_reflects_the_registry() {
        let provider = MemProvider::new();
        let backend = MemoryVault::new();
        let server = test_server(&provider, &backend);
        assert!(server.streams().is_empty());

        let up = server.start_upload(&target("list/one")).unwrap();
        let entries = server.streams();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, "upload");
        assert_eq!(entries[0].id, up.id);
        assert_eq!(entries[0].canon, up.canon);

        server.forget(&up.id);
        assert!(server.streams().is_empty());
    }

    #[test]
    fn sweep_cancels_expired_uploads_and_their_backend_state() {
        let provider = MemProvider::new();
        let backend = MemoryVault::new();
        let server = test_server(&provider, &backend);

        let ticket = server.start_upload(&target("sweep/me")).unwrap();
        {
            let stream = server.get_upload(&ticket.id, &ticket.token).unwrap();
            let mut stream = stream.lock();
            stream.write(b"segment one").unwrap();
            stream.expire();
        }

        server.sweep();

        assert!(server.get_upload(&ticket.id, &ticket.token).is_none());
        assert!(server.streams().is_empty());
        assert!(!provider.exists("sweep/me"), "partial blob must be gone");
        assert!(!backend.has_cipher("sweep/me"), "cipher must be gone");
        assert_eq!(
            server.buckets()[0].metrics.snapshot().canceled.upload,
            1
        );
    }

    #[test]
    fn sweep_drops_expired_downloads_without_backend_side_effects() {
        let provider = MemProvider::new();
        let backend = MemoryVault::new();
        let server = test_server(&provider, &backend);

        let up = server.start_upload(&target("keep/me")).unwrap();
        let stream = server.get_upload(&up.id, &up.token).unwrap();
        stream.lock().write(b"the bytes").unwrap();
        stream.lock().close().unwrap();
        server.forget(&up.id);

        let down = server.start_download(&target("keep/me")).unwrap();
        server
            .get_download(&down.id, &down.token)
            .unwrap()
            .lock()
            .expire();

        server.sweep();

        assert!(server.get_download(&down.id, &down.token).is_none());
        assert!(provider.exists("keep/me"), "download expiry must not expunge");
        assert!(backend.has_cipher("keep/me"));
        assert_eq!(
            server.buckets()[0].metrics.snapshot().canceled.download,
            1
        );
    }

    #[test]
    fn sweep_with_nothing_to_do_is_quiet() {
        let provider = MemProvider::new();
        let backend = MemoryVault::new();
        let server = test_server(&provider, &backend);
        server.sweep();

        let t = server.start_upload(&target("live")).unwrap();
        server.sweep();
        assert!(server.get_upload(&t.id, &t.token).is_some(), "live streams survive");
    }

    #[test]
    fn token_checks() {
        let provider = MemProvider::new();
        let backend = MemoryVault::new();
        let server = test_server(&provider, &backend);
        assert!(server.is_control_token("control"));
        assert!(!server.is_control_token("monitor"));
        assert!(server.is_monitor_token("monitor"));
        assert!(!server.is_monitor_token(""));
    }
}
