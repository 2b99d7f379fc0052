use crate::{compress::Compression, vault::cipher::Encryption};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use url::Url;

/// Errors that can arise while reading or validating the YAML
/// configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Read(String, #[source] std::io::Error),
    #[error("failed to parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("no cluster identity specified")]
    NoCluster,
    #[error("no controlTokens specified")]
    NoControlTokens,
    #[error("no buckets configured")]
    NoBuckets,
    #[error("no bucket key configured for bucket #{0}")]
    NoBucketKey(usize),
    #[error("invalid default bucket compression: '{0}'")]
    BadDefaultCompression(String),
    #[error("invalid default bucket encryption: '{0}'")]
    BadDefaultEncryption(String),
    #[error("invalid compression for bucket '{0}': '{1}'")]
    BadCompression(String, String),
    #[error("invalid encryption for bucket '{0}': '{1}'")]
    BadEncryption(String, String),
    #[error("no vault configuration provided for encrypted bucket '{0}'")]
    VaultRequired(String),
    #[error("invalid vault configuration for bucket '{0}': {1}")]
    Vault(String, String),
    #[error("unrecognized bucket provider: '{0}'")]
    BadProviderKind(String),
    #[error("invalid configuration for {0}-backed bucket '{1}': {2}")]
    Provider(&'static str, String, String),
}

/// Top-level gateway configuration, deserialized from YAML after `${NAME}`
/// environment interpolation.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// The named storage cluster this node belongs to. Arbitrary and
    /// operator-defined, but it ends up in every canonical URL the gateway
    /// mints.
    #[serde(default)]
    pub cluster: String,

    /// The interface and port the API listens on, e.g. `*:8080`.
    #[serde(default)]
    pub bind: String,

    /// How many seconds an upload or download can sit idle before it is
    /// swept, canceled, and its token invalidated.
    #[serde(default)]
    pub max_lease: u64,

    /// How often, in seconds, the sweeper looks for expired leases.
    #[serde(default)]
    pub sweep_interval: u64,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Bearer tokens allowed to orchestrate uploads, downloads, and
    /// expunges.
    #[serde(default)]
    pub control_tokens: Vec<String>,

    /// Bearer tokens allowed to read and reset metrics.
    #[serde(default)]
    pub monitor_tokens: Vec<String>,

    /// Defaults inherited by every bucket that doesn't override them.
    #[serde(default)]
    pub default_bucket: DefaultBucket,

    #[serde(default)]
    pub buckets: Vec<BucketConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    /// How many segment-size samples to keep per bucket. Fixes an upper
    /// bound on the memory the metrics engine can use.
    #[serde(default)]
    pub reservoir_size: usize,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultBucket {
    #[serde(default)]
    pub compression: String,
    #[serde(default)]
    pub encryption: String,
    pub vault: Option<VaultConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
    /// Durable identifier callers use to address this bucket.
    #[serde(default)]
    pub key: String,
    /// Human-friendly name; defaults to the key.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// `none` or `zlib`; falls back to `defaultBucket.compression`.
    #[serde(default)]
    pub compression: String,
    /// `none` or `aes{128,192,256}-{ctr,cfb,ofb}`; falls back to
    /// `defaultBucket.encryption`.
    #[serde(default)]
    pub encryption: String,
    pub vault: Option<VaultConfig>,
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl BucketConfig {
    pub fn compression(&self) -> Compression {
        self.compression.parse().unwrap_or(Compression::None)
    }

    pub fn encryption(&self) -> Encryption {
        self.encryption.parse().unwrap_or(Encryption::None)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// One of `fs`, `s3`, `gcs`, `webdav`, `mem`.
    #[serde(default)]
    pub kind: String,
    pub fs: Option<FsConfig>,
    pub s3: Option<S3Config>,
    pub gcs: Option<GcsConfig>,
    pub webdav: Option<WebdavConfig>,
    pub mem: Option<MemConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsConfig {
    /// Topmost directory blobs are stored under. Must be absolute.
    #[serde(default)]
    pub root: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    /// Endpoint override for non-Amazon implementations (Minio, Linode
    /// OBJ, ...). Leave unset for AWS proper.
    pub url: Option<String>,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub bucket: String,
    /// Key prefix, for sharing one S3 bucket among several gateways.
    #[serde(default)]
    pub prefix: String,
    /// Upload part size in MiB. Amazon requires at least 5.
    pub part_size: Option<usize>,
    #[serde(rename = "accessKeyID", default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    /// Acquire credentials from the instance environment instead of static
    /// keys.
    #[serde(default)]
    pub instance_metadata: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsConfig {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    /// Service account email to impersonate via the IAM credentials API.
    /// Unset means the instance's default service account.
    pub impersonate: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebdavConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub basic_auth: BasicAuthConfig,
    /// Request timeout in seconds; 0 means the default.
    #[serde(default)]
    pub timeout: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuthConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// The in-memory provider has no knobs; its presence in the config is the
/// whole configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MemConfig {}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    /// One of `hashicorp`, `static`, `memory`.
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub fixed_key: FixedKeyConfig,
    #[serde(default)]
    pub hashicorp: HashicorpConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixedKeyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub pbkdf2: String,
    #[serde(default)]
    pub aes128: KeyIvConfig,
    #[serde(default)]
    pub aes192: KeyIvConfig,
    #[serde(default)]
    pub aes256: KeyIvConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyIvConfig {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub iv: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashicorpConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub timeout: u64,
}

impl HashicorpConfig {
    fn is_empty(&self) -> bool {
        self.url.is_empty()
    }
}

pub fn read_file(path: &str) -> Result<Config, ConfigError> {
    let raw =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
    read(&raw)
}

/// Parses, interpolates, defaults, and validates a YAML document.
pub fn read(raw: &str) -> Result<Config, ConfigError> {
    let mut value: serde_yaml::Value = serde_yaml::from_str(raw)?;
    interpolate(&mut value);
    let config: Config = serde_yaml::from_value(value)?;
    config.resolve()
}

lazy_static! {
    static ref ENV_VAR: Regex =
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("hardcoded regex");
}

/// Replaces `${NAME}` substrings in every string value with the named
/// environment variable. Unset variables interpolate as empty, which the
/// validation pass then gets a chance to complain about.
fn interpolate(value: &mut serde_yaml::Value) {
    match value {
        serde_yaml::Value::String(s) => {
            if s.contains("${") {
                *s = ENV_VAR
                    .replace_all(s, |caps: &regex::Captures| {
                        env::var(&caps[1]).unwrap_or_default()
                    })
                    .into_owned();
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for v in seq {
                interpolate(v);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                interpolate(v);
            }
        }
        _ => {}
    }
}

impl Config {
    /// Reconciles defaults with overrides and validates the result.
    pub fn resolve(mut self) -> Result<Config, ConfigError> {
        if self.bind.is_empty() {
            self.bind = "*:8080".to_owned();
        }
        if self.max_lease == 0 {
            self.max_lease = 600;
        }
        if self.sweep_interval == 0 {
            self.sweep_interval = 1;
        }
        if self.metrics.reservoir_size == 0 {
            self.metrics.reservoir_size = 100;
        }
        if self.default_bucket.compression.is_empty() {
            self.default_bucket.compression = "none".to_owned();
        }
        if self.default_bucket.encryption.is_empty() {
            // Encryption is opt-in: without a vault configured there is
            // nothing safe to default to.
            self.default_bucket.encryption = "none".to_owned();
        }

        if self.cluster.is_empty() {
            return Err(ConfigError::NoCluster);
        }
        if self.control_tokens.is_empty() {
            return Err(ConfigError::NoControlTokens);
        }

        if self
            .default_bucket
            .compression
            .parse::<Compression>()
            .is_err()
        {
            return Err(ConfigError::BadDefaultCompression(
                self.default_bucket.compression.clone(),
            ));
        }
        if self.default_bucket.encryption.parse::<Encryption>().is_err() {
            return Err(ConfigError::BadDefaultEncryption(
                self.default_bucket.encryption.clone(),
            ));
        }

        if self.buckets.is_empty() {
            return Err(ConfigError::NoBuckets);
        }

        let default_bucket = self.default_bucket.clone();
        for (i, bucket) in self.buckets.iter_mut().enumerate() {
            if bucket.compression.is_empty() {
                bucket.compression = default_bucket.compression.clone();
            }
            if bucket.encryption.is_empty() {
                bucket.encryption = default_bucket.encryption.clone();
            }
            if bucket.vault.is_none() {
                bucket.vault = default_bucket.vault.clone();
            }

            if bucket.key.is_empty() {
                return Err(ConfigError::NoBucketKey(i + 1));
            }
            if bucket.compression.parse::<Compression>().is_err() {
                return Err(ConfigError::BadCompression(
                    bucket.key.clone(),
                    bucket.compression.clone(),
                ));
            }
            let encryption = bucket
                .encryption
                .parse::<Encryption>()
                .map_err(|_| {
                    ConfigError::BadEncryption(bucket.key.clone(), bucket.encryption.clone())
                })?;

            if encryption != Encryption::None && bucket.vault.is_none() {
                return Err(ConfigError::VaultRequired(bucket.key.clone()));
            }
            if let Some(vault) = &bucket.vault {
                validate_vault(&bucket.key, vault)?;
            }

            validate_provider(&bucket.key, &bucket.provider)?;

            if bucket.name.is_empty() {
                bucket.name = bucket.key.clone();
            }
        }

        Ok(self)
    }
}

fn validate_vault(bucket: &str, vault: &VaultConfig) -> Result<(), ConfigError> {
    let fail = |reason: &str| ConfigError::Vault(bucket.to_owned(), reason.to_owned());

    match vault.kind.as_str() {
        "static" => {
            if !vault.fixed_key.enabled {
                return Err(fail(
                    "you must enable fixed keys to use the static vault backend",
                ));
            }
        }
        "hashicorp" => {
            if vault.hashicorp.is_empty() {
                return Err(fail("no vault url specified"));
            }
            if vault.hashicorp.prefix.is_empty() {
                return Err(fail("no vault prefix specified"));
            }
            let role = !vault.hashicorp.role.is_empty() && !vault.hashicorp.secret.is_empty();
            let token = !vault.hashicorp.token.is_empty();
            if token && role {
                return Err(fail(
                    "token and approle authentication are mutually exclusive",
                ));
            }
            if !token && !role {
                return Err(fail("no authentication mechanism defined"));
            }
        }
        "memory" => {}
        other => {
            return Err(fail(&format!("unrecognized vault kind '{}'", other)));
        }
    }
    Ok(())
}

fn validate_provider(bucket: &str, provider: &ProviderConfig) -> Result<(), ConfigError> {
    match provider.kind.as_str() {
        "fs" => {
            let fs = provider.fs.as_ref().ok_or_else(|| {
                ConfigError::Provider("fs", bucket.to_owned(), "no fs configuration supplied".into())
            })?;
            if fs.root.is_empty() {
                return Err(ConfigError::Provider(
                    "fs",
                    bucket.to_owned(),
                    "no root filesystem path provided".into(),
                ));
            }
            if !fs.root.starts_with('/') {
                return Err(ConfigError::Provider(
                    "fs",
                    bucket.to_owned(),
                    "root filesystem path provided as relative path (must be absolute)".into(),
                ));
            }
        }
        "s3" => {
            let s3 = provider.s3.as_ref().ok_or_else(|| {
                ConfigError::Provider("s3", bucket.to_owned(), "no s3 configuration supplied".into())
            })?;
            if s3.bucket.is_empty() {
                return Err(ConfigError::Provider(
                    "s3",
                    bucket.to_owned(),
                    "no s3 bucket provided".into(),
                ));
            }
            if s3.region.is_empty() && s3.url.is_none() {
                return Err(ConfigError::Provider(
                    "s3",
                    bucket.to_owned(),
                    "no s3 region provided".into(),
                ));
            }
            if let Some(part_size) = s3.part_size {
                if part_size < 5 {
                    return Err(ConfigError::Provider(
                        "s3",
                        bucket.to_owned(),
                        format!("part size {} MiB is below the 5 MiB minimum", part_size),
                    ));
                }
            }
            if !s3.instance_metadata
                && (s3.access_key_id.is_empty() || s3.secret_access_key.is_empty())
            {
                return Err(ConfigError::Provider(
                    "s3",
                    bucket.to_owned(),
                    "no credentials provided (set accessKeyID/secretAccessKey or instanceMetadata)"
                        .into(),
                ));
            }
        }
        "gcs" => {
            let gcs = provider.gcs.as_ref().ok_or_else(|| {
                ConfigError::Provider(
                    "gcs",
                    bucket.to_owned(),
                    "no gcs configuration supplied".into(),
                )
            })?;
            if gcs.bucket.is_empty() {
                return Err(ConfigError::Provider(
                    "gcs",
                    bucket.to_owned(),
                    "no gcs bucket provided".into(),
                ));
            }
        }
        "webdav" => {
            let webdav = provider.webdav.as_ref().ok_or_else(|| {
                ConfigError::Provider(
                    "webdav",
                    bucket.to_owned(),
                    "no webdav configuration supplied".into(),
                )
            })?;
            if webdav.url.is_empty() {
                return Err(ConfigError::Provider(
                    "webdav",
                    bucket.to_owned(),
                    "no webdav url provided".into(),
                ));
            }
            let parsed = Url::parse(&webdav.url).map_err(|e| {
                ConfigError::Provider(
                    "webdav",
                    bucket.to_owned(),
                    format!("webdav url '{}' is malformed: {}", webdav.url, e),
                )
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(ConfigError::Provider(
                    "webdav",
                    bucket.to_owned(),
                    format!("webdav url '{}' is malformed", webdav.url),
                ));
            }
        }
        "mem" => {}
        other => return Err(ConfigError::BadProviderKind(other.to_owned())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn minimal(extra: &str) -> String {
        format!(
            r#"
cluster: test1
controlTokens: [control-token]
buckets:
  - key: files
    provider:
      kind: mem
{extra}"#
        )
    }

    #[test]
    fn minimal_config_gets_the_documented_defaults() {
        let c = read(&minimal("")).unwrap();
        assert_eq!(c.bind, "*:8080");
        assert_eq!(c.max_lease, 600);
        assert_eq!(c.sweep_interval, 1);
        assert_eq!(c.metrics.reservoir_size, 100);
        assert_eq!(c.default_bucket.compression, "none");
        assert_eq!(c.default_bucket.encryption, "none");
        assert!(c.monitor_tokens.is_empty());

        let b = &c.buckets[0];
        assert_eq!(b.key, "files");
        assert_eq!(b.name, "files", "name defaults to the key");
        assert_eq!(b.compression(), Compression::None);
        assert_eq!(b.encryption(), Encryption::None);
    }

    #[test]
    fn buckets_inherit_and_override_the_default_bucket() {
        let c = read(
            r#"
cluster: test1
controlTokens: [tok]
defaultBucket:
  compression: zlib
  encryption: aes256-ctr
  vault:
    kind: memory
buckets:
  - key: inherits
    provider: { kind: mem }
  - key: overrides
    compression: none
    encryption: none
    provider: { kind: mem }
"#,
        )
        .unwrap();

        assert_eq!(c.buckets[0].compression(), Compression::Zlib);
        assert_eq!(c.buckets[0].encryption(), Encryption::Aes256Ctr);
        assert!(c.buckets[0].vault.is_some());
        assert_eq!(c.buckets[1].compression(), Compression::None);
        assert_eq!(c.buckets[1].encryption(), Encryption::None);
    }

    #[test]
    fn environment_variables_interpolate_into_string_values() {
        env::set_var("SSG_TEST_TOKEN", "sekrit");
        let c = read(
            r#"
cluster: test1
controlTokens: ["${SSG_TEST_TOKEN}"]
buckets:
  - key: files
    provider: { kind: mem }
"#,
        )
        .unwrap();
        assert_eq!(c.control_tokens, vec!["sekrit"]);
    }

    #[test]
    fn unset_environment_variables_interpolate_as_empty() {
        env::remove_var("SSG_DEFINITELY_UNSET");
        let c = read(
            r#"
cluster: test1
controlTokens: [tok]
buckets:
  - key: files
    description: "prefix-${SSG_DEFINITELY_UNSET}-suffix"
    provider: { kind: mem }
"#,
        )
        .unwrap();
        assert_eq!(c.buckets[0].description, "prefix--suffix");
    }

    #[test]
    fn missing_required_keys_are_rejected() {
        assert_matches!(
            read("controlTokens: [t]\nbuckets: [{key: b, provider: {kind: mem}}]"),
            Err(ConfigError::NoCluster)
        );
        assert_matches!(
            read("cluster: c\nbuckets: [{key: b, provider: {kind: mem}}]"),
            Err(ConfigError::NoControlTokens)
        );
        assert_matches!(
            read("cluster: c\ncontrolTokens: [t]"),
            Err(ConfigError::NoBuckets)
        );
    }

    #[test]
    fn bucket_validation_catches_bad_algorithms_and_missing_vaults() {
        assert_matches!(
            read(&minimal("    compression: lz4\n")),
            Err(ConfigError::BadCompression(_, _))
        );
        assert_matches!(
            read(&minimal("    encryption: rot13\n")),
            Err(ConfigError::BadEncryption(_, _))
        );
        assert_matches!(
            read(&minimal("    encryption: aes256-ctr\n")),
            Err(ConfigError::VaultRequired(_))
        );
    }

    #[test]
    fn provider_validation() {
        assert_matches!(
            read(
                r#"
cluster: c
controlTokens: [t]
buckets: [{key: b, provider: {kind: floppy}}]
"#
            ),
            Err(ConfigError::BadProviderKind(_))
        );
        assert_matches!(
            read(
                r#"
cluster: c
controlTokens: [t]
buckets: [{key: b, provider: {kind: fs, fs: {root: relative/path}}}]
"#
            ),
            Err(ConfigError::Provider("fs", _, _))
        );
        assert_matches!(
            read(
                r#"
cluster: c
controlTokens: [t]
buckets: [{key: b, provider: {kind: s3, s3: {region: us-east-1}}}]
"#
            ),
            Err(ConfigError::Provider("s3", _, _))
        );
        assert_matches!(
            read(
                r#"
cluster: c
controlTokens: [t]
buckets: [{key: b, provider: {kind: webdav, webdav: {url: "ftp://nope"}}}]
"#
            ),
            Err(ConfigError::Provider("webdav", _, _))
        );
    }

    #[test]
    fn hashicorp_vault_validation() {
        let base = r#"
cluster: c
controlTokens: [t]
buckets:
  - key: b
    encryption: aes256-ctr
    provider: { kind: mem }
    vault:
      kind: hashicorp
      hashicorp:
        url: http://127.0.0.1:8200
        prefix: secret/ssg
"#;
        // No auth mechanism at all.
        assert_matches!(read(base), Err(ConfigError::Vault(_, _)));

        let with_token = format!("{base}        token: root\n");
        assert!(read(&with_token).is_ok());

        let with_both = format!("{base}        token: root\n        role: r\n        secret: s\n");
        assert_matches!(read(&with_both), Err(ConfigError::Vault(_, _)));
    }

    #[test]
    fn static_vaults_require_fixed_keys() {
        let c = read(
            r#"
cluster: c
controlTokens: [t]
buckets:
  - key: b
    encryption: aes128-ctr
    provider: { kind: mem }
    vault:
      kind: static
      fixedKey:
        enabled: true
        pbkdf2: "some shared secret material, 24+ bytes"
"#,
        );
        assert!(c.is_ok());

        assert_matches!(
            read(
                r#"
cluster: c
controlTokens: [t]
buckets:
  - key: b
    encryption: aes128-ctr
    provider: { kind: mem }
    vault: { kind: static }
"#
            ),
            Err(ConfigError::Vault(_, _))
        );
    }

    #[test]
    fn s3_part_size_floor_is_enforced() {
        assert_matches!(
            read(
                r#"
cluster: c
controlTokens: [t]
buckets:
  - key: b
    provider:
      kind: s3
      s3:
        region: us-east-1
        bucket: blobs
        partSize: 4
        accessKeyID: AKIA
        secretAccessKey: shh
"#
            ),
            Err(ConfigError::Provider("s3", _, _))
        );
    }
}
