use crate::vault::{cipher::Cipher, VaultError, VaultProvider};

/// A vault backend for buckets that derive every cipher from operator
/// configuration. There is no external service: `get` passes the configured
/// value straight through, so the `fixedKey` literal and pbkdf2 fields hold
/// the secret material itself rather than a location to fetch it from.
///
/// Per-blob cipher records never reach this backend (fixed-key derivation
/// is handled above it), so the cipher operations refuse loudly instead of
/// pretending to store anything.
pub struct StaticVault;

impl StaticVault {
    pub fn configure() -> StaticVault {
        StaticVault
    }
}

impl VaultProvider for StaticVault {
    fn get(&self, id: &str) -> Result<Vec<u8>, VaultError> {
        Ok(id.as_bytes().to_vec())
    }

    fn set_cipher(&self, _id: &str, _c: &Cipher) -> Result<(), VaultError> {
        Err(VaultError::KeyMaterial(
            "static vaults store no per-blob ciphers".to_owned(),
        ))
    }

    fn get_cipher(&self, id: &str) -> Result<Cipher, VaultError> {
        Err(VaultError::Missing(id.to_owned()))
    }

    fn delete(&self, _id: &str) -> Result<(), VaultError> {
        Err(VaultError::KeyMaterial(
            "static vaults store no per-blob ciphers".to_owned(),
        ))
    }
}
