// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Release of key material wrapped under a requester's public key.
//!
//! Material that fits a single OAEP block is wrapped directly. Larger
//! material (RSA private keys) is encrypted with a fresh AES-256-GCM
//! session key, and only the session key is OAEP-wrapped.

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use crypto::rsa::{PrivateKey, PublicKey};
use crypto::{aes256gcm, HashAlgorithm};
use log::{info, warn};
use rand::RngCore;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{InternalContext, Result};
use crate::keys::{KeyAlgorithm, KeyAttributes};
use crate::manager::RemoteKeyManager;

/// Key material wrapped for one requester. `wrapped_swk` is set when the
/// material was too large for a single OAEP block; `wrapped_key` is then
/// `iv || AES-256-GCM ciphertext` under the session key.
#[derive(Debug, Clone)]
pub struct WrappedKey {
    pub wrapped_key: Vec<u8>,
    pub wrapped_swk: Option<Vec<u8>>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TransferResponse {
    pub id: Uuid,
    pub algorithm: KeyAlgorithm,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_length: Option<u32>,

    /// Base64 encoded.
    pub wrapped_key: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrapped_swk: Option<String>,
}

impl TransferResponse {
    fn new(attributes: &KeyAttributes, wrapped: WrappedKey) -> Self {
        Self {
            id: attributes.id,
            algorithm: attributes.algorithm,
            key_length: attributes.key_length,
            wrapped_key: STANDARD.encode(wrapped.wrapped_key),
            wrapped_swk: wrapped.wrapped_swk.map(|swk| STANDARD.encode(swk)),
        }
    }
}

pub fn wrap_key(
    public_key: &PublicKey,
    key: &[u8],
    hash: HashAlgorithm,
    label: Option<&str>,
) -> anyhow::Result<WrappedKey> {
    if key.len() <= crypto::rsa::max_oaep_payload(public_key, hash) {
        return Ok(WrappedKey {
            wrapped_key: crypto::rsa::encrypt_oaep(public_key, hash, label, key)?,
            wrapped_swk: None,
        });
    }

    let mut rng = rand::thread_rng();
    let mut swk = Zeroizing::new([0u8; aes256gcm::KEY_LENGTH]);
    rng.fill_bytes(&mut swk[..]);
    let mut iv = [0u8; aes256gcm::IV_LENGTH];
    rng.fill_bytes(&mut iv);

    let mut wrapped_key = iv.to_vec();
    wrapped_key.extend(aes256gcm::encrypt(key, &swk[..], &iv).context("encrypt key material")?);
    let wrapped_swk = crypto::rsa::encrypt_oaep(public_key, hash, label, &swk[..])
        .context("wrap session key")?;

    Ok(WrappedKey {
        wrapped_key,
        wrapped_swk: Some(wrapped_swk),
    })
}

/// Inverse of [`wrap_key`], as performed by the requester.
pub fn unwrap_key(
    private_key: &PrivateKey,
    wrapped: &WrappedKey,
    hash: HashAlgorithm,
    label: Option<&str>,
) -> anyhow::Result<Zeroizing<Vec<u8>>> {
    match &wrapped.wrapped_swk {
        None => crypto::rsa::decrypt_oaep(private_key, hash, label, &wrapped.wrapped_key),
        Some(wrapped_swk) => {
            let swk = crypto::rsa::decrypt_oaep(private_key, hash, label, wrapped_swk)?;
            if wrapped.wrapped_key.len() < aes256gcm::IV_LENGTH {
                anyhow::bail!("wrapped key is shorter than its iv");
            }
            let (iv, ciphertext) = wrapped.wrapped_key.split_at(aes256gcm::IV_LENGTH);
            aes256gcm::decrypt(ciphertext, &swk, iv).map(Zeroizing::new)
        }
    }
}

/// Logs when a release is abandoned while the backend is being asked for key
/// material or after it handed the material out, but before the wrapped key
/// was returned. A token-path release has spent its nonce by then, and the
/// token is bound to that nonce, so the same evidence cannot be replayed.
struct ReleaseGuard {
    key_id: Uuid,
    settled: bool,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                "Release of key {} was abandoned after backend access; the wrapped key was not delivered",
                self.key_id
            );
        }
    }
}

pub struct KeyReleaseEngine {
    manager: Arc<RemoteKeyManager>,
}

impl KeyReleaseEngine {
    pub fn new(manager: Arc<RemoteKeyManager>) -> Self {
        Self { manager }
    }

    pub async fn get_secret_key(
        &self,
        id: &Uuid,
    ) -> Result<(KeyAttributes, Zeroizing<Vec<u8>>)> {
        self.manager.key_material(id).await
    }

    /// Fetch a key and wrap it under `public_key`. Must only be called once
    /// the requester's evidence has been accepted.
    pub async fn release(
        &self,
        id: &Uuid,
        public_key: &PublicKey,
        hash: HashAlgorithm,
        label: Option<&str>,
    ) -> Result<TransferResponse> {
        let mut guard = ReleaseGuard {
            key_id: *id,
            settled: false,
        };
        let released = self.fetch_and_wrap(id, public_key, hash, label).await;
        guard.settled = true;

        let response = released?;
        info!("Released {} key {id}", response.algorithm);
        Ok(response)
    }

    async fn fetch_and_wrap(
        &self,
        id: &Uuid,
        public_key: &PublicKey,
        hash: HashAlgorithm,
        label: Option<&str>,
    ) -> Result<TransferResponse> {
        let (attributes, material) = self.get_secret_key(id).await?;
        let wrapped = wrap_key(public_key, &material, hash, label).internal("wrap key")?;
        Ok(TransferResponse::new(&attributes, wrapped))
    }
}
