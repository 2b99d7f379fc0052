use crate::vault::VaultError;
use aes::{
    cipher::{BlockCipher, BlockEncryptMut, KeyIvInit, StreamCipher},
    Aes128, Aes192, Aes256,
};
use cfb_mode::{BufDecryptor, BufEncryptor};
use rand::{rngs::OsRng, RngCore};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt,
    io::{self, Read, Write},
    str::FromStr,
};

/// AES block size; every supported mode uses a block-sized IV.
pub const IV_LEN: usize = 16;

/// The encryption algorithms a bucket can be configured with. All of them
/// are stream modes: no padding, no authentication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encryption {
    None,
    Aes128Ctr,
    Aes128Cfb,
    Aes128Ofb,
    Aes192Ctr,
    Aes192Cfb,
    Aes192Ofb,
    Aes256Ctr,
    Aes256Cfb,
    Aes256Ofb,
}

impl Encryption {
    pub fn is_none(self) -> bool {
        self == Encryption::None
    }

    /// Key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Encryption::None => 0,
            Encryption::Aes128Ctr | Encryption::Aes128Cfb | Encryption::Aes128Ofb => 16,
            Encryption::Aes192Ctr | Encryption::Aes192Cfb | Encryption::Aes192Ofb => 24,
            Encryption::Aes256Ctr | Encryption::Aes256Cfb | Encryption::Aes256Ofb => 32,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Encryption::None => "none",
            Encryption::Aes128Ctr => "aes128-ctr",
            Encryption::Aes128Cfb => "aes128-cfb",
            Encryption::Aes128Ofb => "aes128-ofb",
            Encryption::Aes192Ctr => "aes192-ctr",
            Encryption::Aes192Cfb => "aes192-cfb",
            Encryption::Aes192Ofb => "aes192-ofb",
            Encryption::Aes256Ctr => "aes256-ctr",
            Encryption::Aes256Cfb => "aes256-cfb",
            Encryption::Aes256Ofb => "aes256-ofb",
        }
    }
}

impl fmt::Display for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encryption {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Encryption, VaultError> {
        match s {
            "none" | "" => Ok(Encryption::None),
            "aes128-ctr" => Ok(Encryption::Aes128Ctr),
            "aes128-cfb" => Ok(Encryption::Aes128Cfb),
            "aes128-ofb" => Ok(Encryption::Aes128Ofb),
            "aes192-ctr" => Ok(Encryption::Aes192Ctr),
            "aes192-cfb" => Ok(Encryption::Aes192Cfb),
            "aes192-ofb" => Ok(Encryption::Aes192Ofb),
            "aes256-ctr" => Ok(Encryption::Aes256Ctr),
            "aes256-cfb" => Ok(Encryption::Aes256Cfb),
            "aes256-ofb" => Ok(Encryption::Aes256Ofb),
            other => Err(VaultError::Algorithm(other.to_owned())),
        }
    }
}

impl Serialize for Encryption {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Encryption {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// The symmetric parameters for one blob: algorithm tag, raw key, raw IV.
#[derive(Clone, Debug)]
pub struct Cipher {
    pub algorithm: Encryption,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl Cipher {
    /// A fresh cipher with a random key and IV of the lengths the algorithm
    /// requires.
    pub fn random(algorithm: Encryption) -> Result<Cipher, VaultError> {
        if algorithm.is_none() {
            return Err(VaultError::Algorithm("none".to_owned()));
        }
        let mut key = vec![0u8; algorithm.key_len()];
        OsRng.fill_bytes(&mut key);
        let mut iv = vec![0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        Ok(Cipher { algorithm, key, iv })
    }

    /// Wraps `w` so that everything written through it is encrypted.
    pub fn encrypt<W: Write>(&self, w: W) -> Result<CipherWriter<W>, VaultError> {
        Ok(CipherWriter {
            inner: w,
            stream: self.transform(false)?,
            scratch: Vec::new(),
        })
    }

    /// Wraps `r` so that everything read through it is decrypted.
    pub fn decrypt<R: Read>(&self, r: R) -> Result<CipherReader<R>, VaultError> {
        Ok(CipherReader {
            inner: r,
            stream: self.transform(true)?,
        })
    }

    fn transform(&self, decrypting: bool) -> Result<Box<dyn Keystream>, VaultError> {
        let bad = |_| {
            VaultError::KeyMaterial(format!(
                "bad key or iv length for {} (key {} bytes, iv {} bytes)",
                self.algorithm,
                self.key.len(),
                self.iv.len()
            ))
        };
        let (key, iv) = (self.key.as_slice(), self.iv.as_slice());

        Ok(match (self.algorithm, decrypting) {
            (Encryption::None, _) => return Err(VaultError::Algorithm("none".to_owned())),

            // CTR and OFB are symmetric: the same keystream XOR both ways.
            (Encryption::Aes128Ctr, _) => Box::new(Synchronous(
                ctr::Ctr128BE::<Aes128>::new_from_slices(key, iv).map_err(bad)?,
            )),
            (Encryption::Aes192Ctr, _) => Box::new(Synchronous(
                ctr::Ctr128BE::<Aes192>::new_from_slices(key, iv).map_err(bad)?,
            )),
            (Encryption::Aes256Ctr, _) => Box::new(Synchronous(
                ctr::Ctr128BE::<Aes256>::new_from_slices(key, iv).map_err(bad)?,
            )),
            (Encryption::Aes128Ofb, _) => Box::new(Synchronous(
                ofb::Ofb::<Aes128>::new_from_slices(key, iv).map_err(bad)?,
            )),
            (Encryption::Aes192Ofb, _) => Box::new(Synchronous(
                ofb::Ofb::<Aes192>::new_from_slices(key, iv).map_err(bad)?,
            )),
            (Encryption::Aes256Ofb, _) => Box::new(Synchronous(
                ofb::Ofb::<Aes256>::new_from_slices(key, iv).map_err(bad)?,
            )),

            // CFB feeds ciphertext back into the keystream, so the two
            // directions need distinct state machines.
            (Encryption::Aes128Cfb, false) => Box::new(CfbEnc(
                BufEncryptor::<Aes128>::new_from_slices(key, iv).map_err(bad)?,
            )),
            (Encryption::Aes192Cfb, false) => Box::new(CfbEnc(
                BufEncryptor::<Aes192>::new_from_slices(key, iv).map_err(bad)?,
            )),
            (Encryption::Aes256Cfb, false) => Box::new(CfbEnc(
                BufEncryptor::<Aes256>::new_from_slices(key, iv).map_err(bad)?,
            )),
            (Encryption::Aes128Cfb, true) => Box::new(CfbDec(
                BufDecryptor::<Aes128>::new_from_slices(key, iv).map_err(bad)?,
            )),
            (Encryption::Aes192Cfb, true) => Box::new(CfbDec(
                BufDecryptor::<Aes192>::new_from_slices(key, iv).map_err(bad)?,
            )),
            (Encryption::Aes256Cfb, true) => Box::new(CfbDec(
                BufDecryptor::<Aes256>::new_from_slices(key, iv).map_err(bad)?,
            )),
        })
    }
}

/// An incremental keystream transform applied in place.
trait Keystream: Send {
    fn apply(&mut self, buf: &mut [u8]);
}

struct Synchronous<C: StreamCipher + Send>(C);

impl<C: StreamCipher + Send> Keystream for Synchronous<C> {
    fn apply(&mut self, buf: &mut [u8]) {
        self.0.apply_keystream(buf);
    }
}

struct CfbEnc<C: BlockEncryptMut + BlockCipher>(BufEncryptor<C>);

impl<C: BlockEncryptMut + BlockCipher + Send> Keystream for CfbEnc<C> {
    fn apply(&mut self, buf: &mut [u8]) {
        self.0.encrypt(buf);
    }
}

struct CfbDec<C: BlockEncryptMut + BlockCipher>(BufDecryptor<C>);

impl<C: BlockEncryptMut + BlockCipher + Send> Keystream for CfbDec<C> {
    fn apply(&mut self, buf: &mut [u8]) {
        self.0.decrypt(buf);
    }
}

/// Encrypts on the way through to an inner writer.
pub struct CipherWriter<W: Write> {
    inner: W,
    stream: Box<dyn Keystream>,
    scratch: Vec<u8>,
}

impl<W: Write> std::fmt::Debug for CipherWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CipherWriter")
    }
}

impl<W: Write> CipherWriter<W> {
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write> Write for CipherWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.stream.apply(&mut self.scratch);
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypts on the way through from an inner reader.
pub struct CipherReader<R: Read> {
    inner: R,
    stream: Box<dyn Keystream>,
}

impl<R: Read> CipherReader<R> {
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.stream.apply(&mut buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Cursor;

    const ALL: [Encryption; 9] = [
        Encryption::Aes128Ctr,
        Encryption::Aes128Cfb,
        Encryption::Aes128Ofb,
        Encryption::Aes192Ctr,
        Encryption::Aes192Cfb,
        Encryption::Aes192Ofb,
        Encryption::Aes256Ctr,
        Encryption::Aes256Cfb,
        Encryption::Aes256Ofb,
    ];

    #[test]
    fn algorithm_names_round_trip() {
        for alg in ALL {
            assert_eq!(alg.as_str().parse::<Encryption>().unwrap(), alg);
        }
        assert_eq!("none".parse::<Encryption>().unwrap(), Encryption::None);
        assert_matches!(
            "aes512-gcm".parse::<Encryption>(),
            Err(VaultError::Algorithm(_))
        );
    }

    #[test]
    fn random_ciphers_have_the_right_lengths() {
        for alg in ALL {
            let c = Cipher::random(alg).unwrap();
            assert_eq!(c.key.len(), alg.key_len());
            assert_eq!(c.iv.len(), IV_LEN);
        }
        assert!(Cipher::random(Encryption::None).is_err());
    }

    #[test]
    fn every_mode_round_trips() {
        let plaintext = b"a message long enough to cross several AES block boundaries....";
        for alg in ALL {
            let c = Cipher::random(alg).unwrap();

            let mut wr = c.encrypt(Vec::new()).unwrap();
            // Uneven write sizes to exercise keystream continuity.
            wr.write_all(&plaintext[..7]).unwrap();
            wr.write_all(&plaintext[7..29]).unwrap();
            wr.write_all(&plaintext[29..]).unwrap();
            let ciphertext = std::mem::take(wr.get_mut());
            assert_ne!(&ciphertext, plaintext, "{} did not change the bytes", alg);
            assert_eq!(ciphertext.len(), plaintext.len());

            let mut rd = c.decrypt(Cursor::new(ciphertext)).unwrap();
            let mut recovered = Vec::new();
            rd.read_to_end(&mut recovered).unwrap();
            assert_eq!(recovered, plaintext, "{} did not round-trip", alg);
        }
    }

    #[test]
    fn decrypting_with_the_wrong_key_yields_garbage() {
        let a = Cipher::random(Encryption::Aes256Ctr).unwrap();
        let b = Cipher::random(Encryption::Aes256Ctr).unwrap();

        let mut wr = a.encrypt(Vec::new()).unwrap();
        wr.write_all(b"sensitive bytes").unwrap();
        let ciphertext = std::mem::take(wr.get_mut());

        let mut rd = b.decrypt(Cursor::new(ciphertext)).unwrap();
        let mut out = Vec::new();
        rd.read_to_end(&mut out).unwrap();
        assert_ne!(out, b"sensitive bytes");
    }

    #[test]
    fn truncated_keys_are_rejected() {
        let c = Cipher {
            algorithm: Encryption::Aes256Ctr,
            key: vec![0; 16],
            iv: vec![0; IV_LEN],
        };
        assert_matches!(c.encrypt(Vec::new()), Err(VaultError::KeyMaterial(_)));
    }
}
