use crate::vault::{cipher::Cipher, VaultError, VaultProvider};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

/// An in-memory vault backend for tests and development. Cipher records and
/// raw secrets live in maps shared by every clone.
#[derive(Clone, Default)]
pub struct MemoryVault {
    ciphers: Arc<Mutex<HashMap<String, Cipher>>>,
    secrets: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryVault {
    pub fn new() -> MemoryVault {
        MemoryVault::default()
    }

    /// Seeds raw secret material, as an operator would store a shared
    /// PBKDF2 secret or literal key in a real vault.
    pub fn put_secret(&self, id: &str, value: Vec<u8>) {
        self.secrets.lock().insert(id.to_owned(), value);
    }

    /// True if a cipher record exists for `id`. Test hook.
    pub fn has_cipher(&self, id: &str) -> bool {
        self.ciphers.lock().contains_key(id)
    }
}

impl VaultProvider for MemoryVault {
    fn get(&self, id: &str) -> Result<Vec<u8>, VaultError> {
        self.secrets
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| VaultError::Missing(id.to_owned()))
    }

    fn set_cipher(&self, id: &str, c: &Cipher) -> Result<(), VaultError> {
        self.ciphers.lock().insert(id.to_owned(), c.clone());
        Ok(())
    }

    fn get_cipher(&self, id: &str) -> Result<Cipher, VaultError> {
        self.ciphers
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| VaultError::Missing(id.to_owned()))
    }

    fn delete(&self, id: &str) -> Result<(), VaultError> {
        self.ciphers.lock().remove(id);
        Ok(())
    }
}
