pub mod cipher;
pub mod fixed;
pub mod hashicorp;
pub mod memory;

use crate::provider::{Downloader, ProviderError, Uploader};
use cipher::{Cipher, CipherReader, CipherWriter, Encryption};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use std::{
    io::{self, Read, Write},
    sync::Arc,
};

pub use fixed::StaticVault;
pub use hashicorp::HashicorpVault;
pub use memory::MemoryVault;

const PBKDF2_ROUNDS: u32 = 4096;

/// Errors that can arise while talking to a vault or handling cipher
/// parameters.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("no vault configured")]
    NoVault,
    #[error("unrecognized encryption algorithm: '{0}'")]
    Algorithm(String),
    #[error("no cipher for '{0}' in the vault")]
    Missing(String),
    #[error("cipher id mismatch (credentials are for '{0}', not '{1}')")]
    IdMismatch(String, String),
    #[error("{0}")]
    KeyMaterial(String),
    #[error("vault request failed: {0}")]
    Http(#[source] Box<ureq::Error>),
    #[error("unable to decode vault response: {0}")]
    BadResponse(String),
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}

/// The wire contract a vault backend satisfies: persist, retrieve and delete
/// per-blob cipher parameters, plus raw secret lookup for fixed-key
/// derivation.
pub trait VaultProvider: Send + Sync {
    fn get(&self, id: &str) -> Result<Vec<u8>, VaultError>;
    fn set_cipher(&self, id: &str, c: &Cipher) -> Result<(), VaultError>;
    fn get_cipher(&self, id: &str) -> Result<Cipher, VaultError>;
    fn delete(&self, id: &str) -> Result<(), VaultError>;
}

/// Operator configuration for deriving a single fixed key + IV per
/// algorithm, instead of minting fresh parameters per blob.
///
/// Two derivation methods are supported:
///
///   - `pbkdf2`: a shared secret fetched through the vault provider is
///     split (first half as salt, last two-thirds as password) and run
///     through PBKDF2-HMAC-SHA256.
///   - literal: hex-encoded key and IV values fetched from per-algorithm
///     locations and validated for exact length.
#[derive(Clone, Debug, Default)]
pub struct FixedKeySource {
    pub enabled: bool,
    pub pbkdf2: String,
    pub aes128: LiteralKeyPaths,
    pub aes192: LiteralKeyPaths,
    pub aes256: LiteralKeyPaths,
}

#[derive(Clone, Debug, Default)]
pub struct LiteralKeyPaths {
    pub key: String,
    pub iv: String,
}

impl FixedKeySource {
    fn literal_for(&self, alg: Encryption) -> &LiteralKeyPaths {
        match alg.key_len() {
            16 => &self.aes128,
            24 => &self.aes192,
            _ => &self.aes256,
        }
    }
}

/// A vault couples a backend with the bucket's key-derivation policy.
pub struct Vault {
    fixed_key: FixedKeySource,
    provider: Box<dyn VaultProvider>,
}

impl Vault {
    pub fn new(provider: Box<dyn VaultProvider>, fixed_key: FixedKeySource) -> Vault {
        Vault {
            fixed_key,
            provider,
        }
    }

    /// The vault installed on unencrypted buckets: every operation fails.
    pub fn null() -> Vault {
        Vault {
            fixed_key: FixedKeySource::default(),
            provider: Box::new(NullVault),
        }
    }

    /// Produces the cipher for a new upload: random parameters in dynamic
    /// mode, derived parameters in fixed-key mode.
    pub fn cipher(&self, alg: Encryption) -> Result<Cipher, VaultError> {
        if alg.is_none() {
            return Err(VaultError::Algorithm("none".to_owned()));
        }
        if !self.fixed_key.enabled {
            return Cipher::random(alg);
        }

        if !self.fixed_key.pbkdf2.is_empty() {
            let material = self.provider.get(&self.fixed_key.pbkdf2)?;
            if material.len() < 24 {
                return Err(VaultError::KeyMaterial(format!(
                    "insufficient keying material provided for pbkdf2: only {} bytes found (need at least 24 bytes)",
                    material.len()
                )));
            }
            let password = &material[material.len() / 3..];
            let salt = &material[..material.len() / 2];

            let mut key = vec![0u8; alg.key_len()];
            pbkdf2_hmac::<Sha256>(password, salt, PBKDF2_ROUNDS, &mut key);
            let mut iv = vec![0u8; cipher::IV_LEN];
            pbkdf2_hmac::<Sha256>(password, salt, PBKDF2_ROUNDS, &mut iv);
            return Ok(Cipher {
                algorithm: alg,
                key,
                iv,
            });
        }

        let paths = self.fixed_key.literal_for(alg);
        if paths.key.is_empty() || paths.iv.is_empty() {
            return Err(VaultError::KeyMaterial(format!(
                "unable to derive {} fixed cipher: no methods left to try",
                alg
            )));
        }
        let key = hex::decode(self.provider.get(&paths.key)?)?;
        let iv = hex::decode(self.provider.get(&paths.iv)?)?;
        if key.len() != alg.key_len() {
            return Err(VaultError::KeyMaterial(format!(
                "bad fixed key size ({} bytes): want exactly {} bytes",
                key.len(),
                alg.key_len()
            )));
        }
        if iv.len() != cipher::IV_LEN {
            return Err(VaultError::KeyMaterial(format!(
                "bad fixed initialization vector size ({} bytes): want exactly {} bytes",
                iv.len(),
                cipher::IV_LEN
            )));
        }
        Ok(Cipher {
            algorithm: alg,
            key,
            iv,
        })
    }

    /// Persists per-blob parameters. A no-op in fixed-key mode, where the
    /// parameters are derivable and storing them would only spread copies
    /// around.
    pub fn set_cipher(&self, id: &str, c: &Cipher) -> Result<(), VaultError> {
        if self.fixed_key.enabled {
            return Ok(());
        }
        self.provider.set_cipher(id, c)
    }

    /// The cipher to decrypt `id` with. In fixed-key mode this re-derives
    /// from the bucket's algorithm; otherwise it is looked up by blob path.
    pub fn cipher_for(&self, id: &str, alg: Encryption) -> Result<Cipher, VaultError> {
        if self.fixed_key.enabled {
            return self.cipher(alg);
        }
        self.provider.get_cipher(id)
    }

    /// Removes the per-blob record. A no-op in fixed-key mode.
    pub fn delete(&self, id: &str) -> Result<(), VaultError> {
        if self.fixed_key.enabled {
            return Ok(());
        }
        self.provider.delete(id)
    }
}

struct NullVault;

impl VaultProvider for NullVault {
    fn get(&self, _id: &str) -> Result<Vec<u8>, VaultError> {
        Err(VaultError::NoVault)
    }

    fn set_cipher(&self, _id: &str, _c: &Cipher) -> Result<(), VaultError> {
        Err(VaultError::NoVault)
    }

    fn get_cipher(&self, _id: &str) -> Result<Cipher, VaultError> {
        Err(VaultError::NoVault)
    }

    fn delete(&self, _id: &str) -> Result<(), VaultError> {
        Err(VaultError::NoVault)
    }
}

/// Wraps `up` so that writes are encrypted with a cipher minted for (and
/// persisted under) the blob's final path.
pub fn encrypt(
    vault: &Arc<Vault>,
    id: &str,
    alg: Encryption,
    up: Box<dyn Uploader>,
) -> Result<Box<dyn Uploader>, VaultError> {
    let c = vault.cipher(alg)?;
    vault.set_cipher(id, &c)?;
    let writer = c.encrypt(up)?;
    Ok(Box::new(EncryptedUploader {
        id: id.to_owned(),
        vault: vault.clone(),
        writer,
    }))
}

/// Wraps `down` so that reads are decrypted with the cipher stored for (or
/// derived for) the blob at `id`.
pub fn decrypt(
    vault: &Arc<Vault>,
    id: &str,
    alg: Encryption,
    down: Box<dyn Downloader>,
) -> Result<Box<dyn Downloader>, VaultError> {
    let c = vault.cipher_for(id, alg)?;
    let reader = c.decrypt(down)?;
    Ok(Box::new(DecryptedDownloader { reader }))
}

struct EncryptedUploader {
    id: String,
    vault: Arc<Vault>,
    writer: CipherWriter<Box<dyn Uploader>>,
}

impl Write for EncryptedUploader {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl Uploader for EncryptedUploader {
    fn path(&self) -> String {
        self.writer.get_ref().path()
    }

    fn close(&mut self) -> Result<(), ProviderError> {
        // Stream ciphers have no trailer; closing is the inner layer's
        // concern alone.
        self.writer.get_mut().close()
    }

    fn cancel(&mut self) -> Result<(), ProviderError> {
        self.writer.get_mut().cancel()?;
        self.vault
            .delete(&self.id)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(())
    }

    fn wrote_uncompressed(&self) -> u64 {
        self.writer.get_ref().wrote_uncompressed()
    }

    fn wrote_compressed(&self) -> u64 {
        self.writer.get_ref().wrote_compressed()
    }
}

struct DecryptedDownloader {
    reader: CipherReader<Box<dyn Downloader>>,
}

impl Read for DecryptedDownloader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Downloader for DecryptedDownloader {
    fn close(&mut self) -> Result<(), ProviderError> {
        self.reader.get_mut().close()
    }

    fn read_uncompressed(&self) -> u64 {
        self.reader.get_ref().read_uncompressed()
    }

    fn read_compressed(&self) -> u64 {
        self.reader.get_ref().read_compressed()
    }
}
