// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Remote key manager: keeps key metadata and backend material consistent.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use crypto::ec::Curve;
use log::{info, warn};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::traits::PublicKeyParts;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::backend::{KeyManager, KeyMaterial};
use crate::error::{Error, InternalContext, Result};
use crate::keys::{
    KeyAlgorithm, KeyAttributes, KeyFilter, KeyRequest, AES_KEY_LENGTHS, RSA_KEY_LENGTHS,
};
use crate::store::{KeyStore, PolicyStore};

pub struct RemoteKeyManager {
    key_store: Arc<KeyStore>,
    policy_store: Arc<PolicyStore>,
    backend: Arc<dyn KeyManager>,

    // Transfers hold it shared, deletes exclusively, so a key is never
    // released from a half-deleted state.
    lifecycle: RwLock<()>,
}

/// Material parsed out of a `key_string`, with the length it implies.
struct ParsedKey {
    material: KeyMaterial,
    key_length: Option<u32>,
}

fn check_length(algorithm: KeyAlgorithm, requested: Option<u32>, actual: u32) -> Result<()> {
    match requested {
        Some(requested) if requested != actual => Err(Error::Validation(format!(
            "{algorithm} key_length {requested} does not match the supplied {actual}-bit key"
        ))),
        _ => Ok(()),
    }
}

fn parse_aes_key(encoded: &str, requested: Option<u32>) -> Result<ParsedKey> {
    let bytes = Zeroizing::new(
        STANDARD
            .decode(encoded.trim())
            .map_err(|_| Error::Validation("AES key_string must be base64".to_string()))?,
    );
    let length = (bytes.len() * 8) as u32;
    if !AES_KEY_LENGTHS.contains(&length) {
        return Err(Error::Validation(format!("invalid AES key length: {length}")));
    }
    check_length(KeyAlgorithm::Aes, requested, length)?;

    Ok(ParsedKey {
        material: KeyMaterial {
            algorithm: KeyAlgorithm::Aes,
            bytes,
        },
        key_length: Some(length),
    })
}

fn parse_rsa_key(pem: &str, requested: Option<u32>) -> Result<ParsedKey> {
    let key = rsa::RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| rsa::RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|_| Error::Validation("RSA key_string is not a PEM private key".to_string()))?;
    let length = (key.size() * 8) as u32;
    if !RSA_KEY_LENGTHS.contains(&length) {
        return Err(Error::Validation(format!("invalid RSA key length: {length}")));
    }
    check_length(KeyAlgorithm::Rsa, requested, length)?;

    let der = key.to_pkcs8_der().internal("encode RSA private key")?;
    Ok(ParsedKey {
        material: KeyMaterial {
            algorithm: KeyAlgorithm::Rsa,
            bytes: Zeroizing::new(der.as_bytes().to_vec()),
        },
        key_length: Some(length),
    })
}

fn parse_ec_key(pem: &str, curve: Curve) -> Result<ParsedKey> {
    let invalid = || Error::Validation("EC key_string is not a PEM private key".to_string());
    let (_, block) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).map_err(|_| invalid())?;
    if block.label != "PRIVATE KEY" && block.label != "EC PRIVATE KEY" {
        return Err(invalid());
    }

    // Only P-256 can be checked in depth; other curves are kept as supplied.
    let bytes = match curve {
        Curve::P256 => {
            let key = p256::SecretKey::from_pkcs8_der(&block.contents)
                .or_else(|_| p256::SecretKey::from_sec1_der(&block.contents))
                .map_err(|_| Error::Validation("EC key_string is not a P-256 key".to_string()))?;
            let der = key.to_pkcs8_der().internal("encode EC private key")?;
            Zeroizing::new(der.as_bytes().to_vec())
        }
        _ if block.contents.is_empty() => return Err(invalid()),
        _ => Zeroizing::new(block.contents),
    };

    Ok(ParsedKey {
        material: KeyMaterial {
            algorithm: KeyAlgorithm::Ec,
            bytes,
        },
        key_length: None,
    })
}

impl RemoteKeyManager {
    pub fn new(
        key_store: Arc<KeyStore>,
        policy_store: Arc<PolicyStore>,
        backend: Arc<dyn KeyManager>,
    ) -> Self {
        Self {
            key_store,
            policy_store,
            backend,
            lifecycle: RwLock::new(()),
        }
    }

    /// The transfer policy a new key will reference must already exist.
    async fn require_policy(&self, request: &KeyRequest) -> Result<Uuid> {
        let id = request
            .transfer_policy_id
            .ok_or_else(|| Error::Validation("transfer_policy_id is required".to_string()))?;
        match self
            .policy_store
            .retrieve(&id)
            .await
            .internal("retrieve key transfer policy")?
        {
            Some(_) => Ok(id),
            None => Err(Error::Validation(format!(
                "key transfer policy {id} does not exist"
            ))),
        }
    }

    async fn persist(
        &self,
        request: &KeyRequest,
        policy_id: Uuid,
        backend_id: String,
        key_length: Option<u32>,
    ) -> Result<KeyAttributes> {
        let info = &request.key_information;
        let attributes = KeyAttributes {
            id: Uuid::new_v4(),
            algorithm: info.algorithm,
            key_length,
            curve_type: info.curve_type.clone(),
            kmip_key_id: backend_id,
            transfer_policy_id: policy_id,
            created_at: Utc::now(),
            label: request.label.clone(),
            usage: request.usage.clone(),
        };

        if let Err(e) = self.key_store.create(&attributes).await {
            // Material registered by reference belongs to somebody else.
            if info.kmip_key_id.is_none() {
                if let Err(cleanup) = self.backend.delete_key(&attributes.kmip_key_id).await {
                    warn!(
                        "Failed to remove orphaned backend key {}: {cleanup:?}",
                        attributes.kmip_key_id
                    );
                }
            }
            return Err(Error::internal("persist key metadata", e));
        }

        Ok(attributes)
    }

    /// Generate a new key in the backend. Only AES keys can be generated;
    /// asymmetric keys have to be registered.
    pub async fn create_key(&self, request: &KeyRequest) -> Result<KeyAttributes> {
        request.validate()?;
        if request.is_registration() {
            return self.register_key(request).await;
        }

        let info = &request.key_information;
        if info.algorithm != KeyAlgorithm::Aes {
            return Err(Error::Unsupported(format!(
                "{} keys cannot be generated, register them instead",
                info.algorithm
            )));
        }
        let length = info
            .key_length
            .ok_or_else(|| Error::Validation("key_length is required for AES keys".to_string()))?;
        let policy_id = self.require_policy(request).await?;

        let backend_id = self
            .backend
            .create_symmetric_key(length)
            .await
            .internal("create key in backend")?;
        let attributes = self
            .persist(request, policy_id, backend_id, Some(length))
            .await?;

        info!("Created {} key {}", attributes.algorithm, attributes.id);
        Ok(attributes)
    }

    /// Register caller-supplied material, or material that already lives in
    /// the backend.
    pub async fn register_key(&self, request: &KeyRequest) -> Result<KeyAttributes> {
        request.validate()?;
        let info = &request.key_information;
        let policy_id = self.require_policy(request).await?;

        let (backend_id, key_length) = match (&info.key_string, &info.kmip_key_id) {
            (Some(key_string), None) => {
                let parsed = match info.algorithm {
                    KeyAlgorithm::Aes => parse_aes_key(key_string, info.key_length)?,
                    KeyAlgorithm::Rsa => parse_rsa_key(key_string, info.key_length)?,
                    KeyAlgorithm::Ec => {
                        let curve = info
                            .curve_type
                            .as_deref()
                            .and_then(|c| Curve::from_str(c).ok())
                            .ok_or_else(|| {
                                Error::Validation("curve_type is required for EC keys".to_string())
                            })?;
                        parse_ec_key(key_string, curve)?
                    }
                };
                let backend_id = self
                    .backend
                    .register_key(parsed.material)
                    .await
                    .internal("register key in backend")?;
                (backend_id, parsed.key_length)
            }
            (None, Some(backend_id)) => {
                if !self
                    .backend
                    .contains_key(backend_id)
                    .await
                    .internal("look up backend key")?
                {
                    return Err(Error::Validation(format!(
                        "backend key {backend_id} does not exist"
                    )));
                }
                (backend_id.clone(), info.key_length)
            }
            _ => {
                return Err(Error::Validation(
                    "exactly one of key_string and kmip_key_id is required".to_string(),
                ))
            }
        };

        let attributes = self
            .persist(request, policy_id, backend_id, key_length)
            .await?;

        info!("Registered {} key {}", attributes.algorithm, attributes.id);
        Ok(attributes)
    }

    pub async fn retrieve_key(&self, id: &Uuid) -> Result<KeyAttributes> {
        self.key_store
            .retrieve(id)
            .await
            .internal("retrieve key metadata")?
            .ok_or_else(|| Error::NotFound(format!("key {id}")))
    }

    pub async fn search_keys(&self, filter: &KeyFilter) -> Result<Vec<KeyAttributes>> {
        let keys = self.key_store.list().await.internal("list key metadata")?;
        Ok(keys.into_iter().filter(|k| filter.matches(k)).collect())
    }

    /// Whether any stored key references the given transfer policy.
    pub async fn policy_in_use(&self, policy_id: &Uuid) -> Result<bool> {
        let keys = self.key_store.list().await.internal("list key metadata")?;
        Ok(keys.iter().any(|k| k.transfer_policy_id == *policy_id))
    }

    /// Remove the backend material first, then the metadata. A record is
    /// never removed while its material may still exist.
    pub async fn delete_key(&self, id: &Uuid) -> Result<()> {
        let _exclusive = self.lifecycle.write().await;

        let attributes = self.retrieve_key(id).await?;
        let existed = self
            .backend
            .delete_key(&attributes.kmip_key_id)
            .await
            .internal("delete key from backend")?;

        self.key_store
            .delete(id)
            .await
            .internal("delete key metadata")?;

        if !existed {
            warn!("Key {id} had no backend material; removed its dangling metadata");
            return Err(Error::NotFound(format!("key {id}")));
        }

        info!("Deleted key {id}");
        Ok(())
    }

    /// Fetch the raw material of a key for release. The key's metadata is
    /// read under the same lock, so a concurrent delete either happens
    /// entirely before or entirely after.
    pub async fn key_material(
        &self,
        id: &Uuid,
    ) -> Result<(KeyAttributes, Zeroizing<Vec<u8>>)> {
        let _shared = self.lifecycle.read().await;

        let attributes = self.retrieve_key(id).await?;
        if attributes.algorithm == KeyAlgorithm::Ec {
            return Err(Error::Unsupported(
                "transfer of EC private keys".to_string(),
            ));
        }

        let material = self
            .backend
            .get_key(&attributes.kmip_key_id)
            .await
            .internal("fetch key from backend")?
            .ok_or_else(|| Error::NotFound(format!("key {id}")))?;

        Ok((attributes, material))
    }
}
