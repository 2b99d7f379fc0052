use crate::vault::{cipher::Cipher, VaultError, VaultProvider};
use parking_lot::Mutex;
use serde::Deserialize;
use std::{str::FromStr, time::Duration};
use ureq::Agent;

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Connection parameters for a HashiCorp Vault KV v2 backend. The prefix
/// includes the mount point, e.g. `secret/ssg` stores records under the
/// `secret` mount at `ssg/...`.
#[derive(Clone, Debug, Default)]
pub struct Endpoint {
    pub url: String,
    pub prefix: String,
    pub token: String,
    pub role: String,
    pub secret: String,
    pub timeout: u64,
}

/// A KV v2 client. Reads and writes go through `data/`, deletes through
/// `metadata/` so that expunged key material is gone for good rather than
/// soft-deleted and recoverable.
pub struct HashicorpVault {
    base: String,
    mount: String,
    prefix: String,
    token: String,
    role: String,
    secret: String,
    session: Mutex<Option<String>>,
    agent: Agent,
}

impl HashicorpVault {
    pub fn configure(e: Endpoint) -> Result<HashicorpVault, VaultError> {
        if e.url.is_empty() {
            return Err(VaultError::KeyMaterial("no vault url supplied".to_owned()));
        }
        if e.prefix.is_empty() {
            return Err(VaultError::KeyMaterial(
                "no vault prefix supplied".to_owned(),
            ));
        }

        let trimmed = e.prefix.trim_matches('/');
        let (mount, prefix) = match trimmed.split_once('/') {
            Some((m, rest)) => (m.to_owned(), rest.to_owned()),
            None => (trimmed.to_owned(), String::new()),
        };

        let timeout = if e.timeout == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            e.timeout
        };

        Ok(HashicorpVault {
            base: e.url.trim_end_matches('/').to_owned(),
            mount,
            prefix,
            token: e.token,
            role: e.role,
            secret: e.secret,
            session: Mutex::new(None),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(timeout))
                .build(),
        })
    }

    fn record_path(&self, id: &str) -> String {
        if self.prefix.is_empty() {
            id.trim_matches('/').to_owned()
        } else {
            format!("{}/{}", self.prefix, id.trim_matches('/'))
        }
    }

    fn data_url(&self, id: &str) -> String {
        format!("{}/v1/{}/data/{}", self.base, self.mount, self.record_path(id))
    }

    fn metadata_url(&self, id: &str) -> String {
        format!(
            "{}/v1/{}/metadata/{}",
            self.base,
            self.mount,
            self.record_path(id)
        )
    }

    /// The token for the next request: the configured root token, a cached
    /// AppRole session token, or a fresh AppRole login.
    fn ensure_token(&self) -> Result<String, VaultError> {
        if !self.token.is_empty() {
            return Ok(self.token.clone());
        }
        if let Some(tok) = self.session.lock().clone() {
            return Ok(tok);
        }

        #[derive(Deserialize)]
        struct Login {
            auth: Auth,
        }
        #[derive(Deserialize)]
        struct Auth {
            client_token: String,
        }

        let login: Login = self
            .agent
            .post(&format!("{}/v1/auth/approle/login", self.base))
            .send_json(ureq::json!({
                "role_id": self.role,
                "secret_id": self.secret,
            }))
            .map_err(|e| VaultError::Http(Box::new(e)))?
            .into_json()
            .map_err(|e| VaultError::BadResponse(e.to_string()))?;

        *self.session.lock() = Some(login.auth.client_token.clone());
        Ok(login.auth.client_token)
    }
}

// KV v2 wraps record payloads in two levels of `data`.
#[derive(Deserialize)]
struct KvResponse<T> {
    data: KvData<T>,
}

#[derive(Deserialize)]
struct KvData<T> {
    data: T,
}

#[derive(Deserialize)]
struct CipherRecord {
    id: String,
    key: String,
    iv: String,
    alg: String,
}

#[derive(Deserialize)]
struct SecretRecord {
    value: String,
}

impl VaultProvider for HashicorpVault {
    fn get(&self, id: &str) -> Result<Vec<u8>, VaultError> {
        let token = self.ensure_token()?;
        let rsp = self
            .agent
            .get(&self.data_url(id))
            .set("X-Vault-Token", &token)
            .call()
            .map_err(|e| match e {
                ureq::Error::Status(404, _) => VaultError::Missing(id.to_owned()),
                other => VaultError::Http(Box::new(other)),
            })?;
        let record: KvResponse<SecretRecord> = rsp
            .into_json()
            .map_err(|e| VaultError::BadResponse(e.to_string()))?;
        Ok(record.data.data.value.into_bytes())
    }

    fn set_cipher(&self, id: &str, c: &Cipher) -> Result<(), VaultError> {
        let token = self.ensure_token()?;
        self.agent
            .post(&self.data_url(id))
            .set("X-Vault-Token", &token)
            .send_json(ureq::json!({
                "data": {
                    "id": id,
                    "key": hex::encode(&c.key),
                    "iv": hex::encode(&c.iv),
                    "alg": c.algorithm.as_str(),
                }
            }))
            .map_err(|e| VaultError::Http(Box::new(e)))?;
        Ok(())
    }

    fn get_cipher(&self, id: &str) -> Result<Cipher, VaultError> {
        let token = self.ensure_token()?;
        let rsp = self
            .agent
            .get(&self.data_url(id))
            .set("X-Vault-Token", &token)
            .call()
            .map_err(|e| match e {
                ureq::Error::Status(404, _) => VaultError::Missing(id.to_owned()),
                other => VaultError::Http(Box::new(other)),
            })?;
        let record: KvResponse<CipherRecord> = rsp
            .into_json()
            .map_err(|e| VaultError::BadResponse(e.to_string()))?;
        let record = record.data.data;

        if record.id != id {
            return Err(VaultError::IdMismatch(record.id, id.to_owned()));
        }

        Ok(Cipher {
            algorithm: crate::vault::cipher::Encryption::from_str(&record.alg)?,
            key: hex::decode(record.key)?,
            iv: hex::decode(record.iv)?,
        })
    }

    fn delete(&self, id: &str) -> Result<(), VaultError> {
        let token = self.ensure_token()?;
        match self
            .agent
            .delete(&self.metadata_url(id))
            .set("X-Vault-Token", &token)
            .call()
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(VaultError::Http(Box::new(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::cipher::Encryption;
    use assert_matches::assert_matches;
    use mockito::{mock, Matcher};

    fn endpoint(token: &str) -> Endpoint {
        Endpoint {
            url: mockito::server_url(),
            prefix: "secret/ssg".to_owned(),
            token: token.to_owned(),
            ..Endpoint::default()
        }
    }

    #[test]
    fn configure_requires_url_and_prefix() {
        assert!(HashicorpVault::configure(Endpoint::default()).is_err());
        assert!(HashicorpVault::configure(Endpoint {
            url: "http://127.0.0.1:8200".to_owned(),
            ..Endpoint::default()
        })
        .is_err());
    }

    #[test]
    fn set_cipher_writes_a_kv2_record() {
        let c = Cipher::random(Encryption::Aes256Ctr).unwrap();
        let m = mock("POST", "/v1/secret/data/ssg/some/blob")
            .match_header("X-Vault-Token", "root-token")
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(serde_json::json!({
                    "data": {
                        "id": "some/blob",
                        "alg": "aes256-ctr",
                        "key": hex::encode(&c.key),
                        "iv": hex::encode(&c.iv),
                    }
                })),
            ]))
            .with_body(r#"{"data":{"version":1}}"#)
            .create();

        let v = HashicorpVault::configure(endpoint("root-token")).unwrap();
        v.set_cipher("some/blob", &c).unwrap();
        m.assert();
    }

    #[test]
    fn get_cipher_reads_and_validates_the_record() {
        let body = serde_json::json!({
            "data": {
                "data": {
                    "id": "some/blob",
                    "key": hex::encode([1u8; 32]),
                    "iv": hex::encode([2u8; 16]),
                    "alg": "aes256-cfb",
                },
                "metadata": {"version": 1}
            }
        });
        let m = mock("GET", "/v1/secret/data/ssg/some/blob")
            .match_header("X-Vault-Token", "root-token")
            .with_body(body.to_string())
            .create();

        let v = HashicorpVault::configure(endpoint("root-token")).unwrap();
        let c = v.get_cipher("some/blob").unwrap();
        assert_eq!(c.algorithm, Encryption::Aes256Cfb);
        assert_eq!(c.key, vec![1u8; 32]);
        assert_eq!(c.iv, vec![2u8; 16]);
        m.assert();
    }

    #[test]
    fn get_cipher_rejects_a_record_for_another_blob() {
        let body = serde_json::json!({
            "data": {
                "data": {
                    "id": "the/wrong/blob",
                    "key": hex::encode([1u8; 32]),
                    "iv": hex::encode([2u8; 16]),
                    "alg": "aes256-ctr",
                }
            }
        });
        let _m = mock("GET", "/v1/secret/data/ssg/some/blob")
            .with_body(body.to_string())
            .create();

        let v = HashicorpVault::configure(endpoint("root-token")).unwrap();
        assert_matches!(
            v.get_cipher("some/blob"),
            Err(VaultError::IdMismatch(_, _))
        );
    }

    #[test]
    fn missing_records_map_to_missing() {
        let _m = mock("GET", "/v1/secret/data/ssg/no/such")
            .with_status(404)
            .with_body(r#"{"errors":[]}"#)
            .create();

        let v = HashicorpVault::configure(endpoint("root-token")).unwrap();
        assert_matches!(v.get_cipher("no/such"), Err(VaultError::Missing(_)));
    }

    #[test]
    fn delete_uses_the_metadata_endpoint_and_tolerates_absence() {
        let m = mock("DELETE", "/v1/secret/metadata/ssg/some/blob")
            .with_status(204)
            .create();
        let v = HashicorpVault::configure(endpoint("root-token")).unwrap();
        v.delete("some/blob").unwrap();
        m.assert();

        let _gone = mock("DELETE", "/v1/secret/metadata/ssg/other")
            .with_status(404)
            .create();
        v.delete("other").unwrap();
    }

    #[test]
    fn approle_login_is_used_when_no_token_is_configured() {
        let login = mock("POST", "/v1/auth/approle/login")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "role_id": "the-role",
                "secret_id": "the-secret",
            })))
            .with_body(r#"{"auth":{"client_token":"session-token"}}"#)
            .create();
        let read = mock("GET", "/v1/secret/data/ssg/blob")
            .match_header("X-Vault-Token", "session-token")
            .with_body(
                serde_json::json!({
                    "data": {"data": {"value": "hello"}}
                })
                .to_string(),
            )
            .expect(2)
            .create();

        let v = HashicorpVault::configure(Endpoint {
            url: mockito::server_url(),
            prefix: "secret/ssg".to_owned(),
            role: "the-role".to_owned(),
            secret: "the-secret".to_owned(),
            ..Endpoint::default()
        })
        .unwrap();

        assert_eq!(v.get("blob").unwrap(), b"hello");
        // Second call reuses the session token instead of logging in again.
        assert_eq!(v.get("blob").unwrap(), b"hello");
        login.assert();
        read.assert();
    }
}
