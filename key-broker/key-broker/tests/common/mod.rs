// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

#![allow(dead_code)]

use anyhow::bail;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use key_broker::aps::{ApsClient, AttestationTokenRequest};
use key_broker::backend::{KeyManager, KeyMaterial, MemoryKeyManager};
use key_broker::config::Config;
use key_broker::keys::{KeyAttributes, KeyRequest};
use key_broker::policy::KeyTransferPolicy;
use key_broker::store::{MemoryStore, PolicyStore};
use key_broker::token::cert_cache::thumbprint;
use key_broker::token::CertificateSource;
use key_broker::{Collaborators, KeyBroker};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;
use zeroize::Zeroizing;

pub const MRSIGNER: &str = "83d719e77deaca1470f6baf62a4d774303c899db69020f9c70ee1dfc08c7ce9e";
pub const MRENCLAVE: &str = "01c60dd1faeb2b5a2b8e4a8a9d9e3a0eb4b3b2d1f8c5e2b3a1d0f9e8c7b6a5d4";
pub const POLICY_ID: Uuid = Uuid::from_u128(0x9a1f2c3e_5b6d_4e7f_8091_a2b3c4d5e6f7);

pub fn sgx_policy_json(policy_ids: &[Uuid]) -> KeyTransferPolicy {
    let body = serde_json::json!({
        "attestation_type": ["SGX"],
        "sgx": {
            "attributes": {
                "mrsigner": [MRSIGNER],
                "isvprodid": [1],
                "mrenclave": [MRENCLAVE],
                "isvsvn": 0
            },
            "policy_ids": policy_ids
        }
    });
    KeyTransferPolicy::from_json(body.to_string().as_bytes()).unwrap()
}

pub fn aes_key_request(policy_id: Uuid) -> KeyRequest {
    let body = serde_json::json!({
        "key_information": {
            "algorithm": "AES",
            "key_length": 256
        },
        "transfer_policy_id": policy_id,
        "label": "disk-encryption"
    });
    KeyRequest::from_json(body.to_string().as_bytes()).unwrap()
}

pub fn expires_in(secs: i64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    (now + secs) as u64
}

/// Mints tokens the way the provisioning service does: RS256 with the
/// SHA-256 thumbprint of the signing certificate in the header.
pub struct TokenSigner {
    pub cert_pem: String,
    thumbprint: String,
    encoding_key: EncodingKey,
}

impl TokenSigner {
    pub fn new() -> Self {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pkcs8 = private_key.to_pkcs8_pem(LineEnding::LF).unwrap();
        let key_pair =
            rcgen::KeyPair::from_pkcs8_pem_and_sign_algo(&pkcs8, &rcgen::PKCS_RSA_SHA256).unwrap();
        let cert = rcgen::CertificateParams::new(vec!["aps.example.com".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        let pkcs1 = private_key.to_pkcs1_pem(LineEnding::LF).unwrap();

        Self {
            cert_pem: cert.pem(),
            thumbprint: thumbprint(cert.der()),
            encoding_key: EncodingKey::from_rsa_pem(pkcs1.as_bytes()).unwrap(),
        }
    }

    pub fn sign<T: Serialize>(&self, claims: &T) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.x5t_s256 = Some(URL_SAFE_NO_PAD.encode(hex::decode(&self.thumbprint).unwrap()));
        encode(&header, claims, &self.encoding_key).unwrap()
    }
}

pub struct FakeAps {
    signing_certificates: String,
    nonces: AtomicUsize,
}

impl FakeAps {
    pub fn new(signing_certificates: &str) -> Arc<Self> {
        Arc::new(Self {
            signing_certificates: signing_certificates.to_string(),
            nonces: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CertificateSource for FakeAps {
    async fn signing_certificates(&self) -> anyhow::Result<String> {
        Ok(self.signing_certificates.clone())
    }
}

#[async_trait]
impl ApsClient for FakeAps {
    async fn get_nonce(&self) -> anyhow::Result<String> {
        let n = self.nonces.fetch_add(1, Ordering::SeqCst);
        Ok(format!("aps-nonce-{n}"))
    }

    async fn get_attestation_token(&self, _: &AttestationTokenRequest) -> anyhow::Result<String> {
        bail!("not served by the fake APS")
    }
}

/// Memory backend that counts every call made to it.
#[derive(Default)]
pub struct CountingKeyManager {
    inner: MemoryKeyManager,
    pub calls: AtomicUsize,
}

impl CountingKeyManager {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyManager for CountingKeyManager {
    async fn create_symmetric_key(&self, length_bits: u32) -> anyhow::Result<String> {
        self.count();
        self.inner.create_symmetric_key(length_bits).await
    }

    async fn register_key(&self, material: KeyMaterial) -> anyhow::Result<String> {
        self.count();
        self.inner.register_key(material).await
    }

    async fn contains_key(&self, backend_id: &str) -> anyhow::Result<bool> {
        self.count();
        self.inner.contains_key(backend_id).await
    }

    async fn get_key(&self, backend_id: &str) -> anyhow::Result<Option<Zeroizing<Vec<u8>>>> {
        self.count();
        self.inner.get_key(backend_id).await
    }

    async fn delete_key(&self, backend_id: &str) -> anyhow::Result<bool> {
        self.count();
        self.inner.delete_key(backend_id).await
    }
}

pub fn in_memory_broker(aps: Arc<FakeAps>, backend: Arc<dyn KeyManager>) -> KeyBroker {
    let policy_store: Arc<PolicyStore> = Arc::new(MemoryStore::<KeyTransferPolicy>::default());
    KeyBroker::with_collaborators(
        &Config::in_memory(),
        Collaborators {
            policy_store,
            key_store: Arc::new(MemoryStore::<KeyAttributes>::default()),
            key_manager: backend,
            aps,
            auth: None,
            saml: None,
        },
    )
    .unwrap()
}
