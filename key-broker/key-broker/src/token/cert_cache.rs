// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! JWT signing certificates, fetched lazily and kept for a TTL.
//!
//! The cache holds an immutable snapshot behind an `Arc` that is swapped as a
//! whole on refresh, so readers see either the previous set or the new one.
//! Refreshes are single-flight: one task fetches while the others wait on the
//! refresh lock and then re-read the snapshot it installed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{DecodingKey, Header};
use log::{debug, error, warn};
use rsa::pkcs1::EncodeRsaPublicKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use x509_parser::pem::Pem;

use crate::error::Error;

/// A fetched snapshot is not refetched for an unknown thumbprint before this
/// much time has passed, so tokens naming bogus certificates cannot drive a
/// fetch per request.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Where signing certificates come from: the attestation provisioning
/// service for attestation tokens, the authentication service for bearer
/// tokens.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    /// PEM bundle of the currently valid JWT signing certificates.
    async fn signing_certificates(&self) -> Result<String>;
}

pub struct SigningCertificate {
    /// Lowercase hex SHA-256 of the certificate DER.
    pub thumbprint: String,
    pub key: DecodingKey,
}

struct Snapshot {
    certs: HashMap<String, Arc<SigningCertificate>>,
    fetched_at: Instant,
}

enum Lookup {
    Hit(Arc<SigningCertificate>),
    Unknown,
    Stale,
}

pub fn thumbprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

fn decode_thumbprint(value: &str) -> Option<String> {
    if value.len() == 64 && hex::decode(value).is_ok() {
        return Some(value.to_ascii_lowercase());
    }
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .ok()
        .filter(|digest| digest.len() == 32)
        .map(hex::encode)
}

/// The certificate thumbprint a token header names, from `x5t#S256` or, for
/// issuers that put it there, from `kid`.
pub fn header_thumbprint(header: &Header) -> Option<String> {
    header
        .x5t_s256
        .as_deref()
        .and_then(decode_thumbprint)
        .or_else(|| header.kid.as_deref().and_then(decode_thumbprint))
}

fn parse_certificate(pem: &Pem) -> Result<SigningCertificate> {
    let cert = pem.parse_x509().context("parse signing certificate")?;
    if !cert.validity().is_valid() {
        anyhow::bail!("signing certificate is outside its validity period");
    }
    let public_key = crypto::rsa::public_key_from_spki_der(cert.public_key().raw)?;
    let pkcs1 = public_key
        .to_pkcs1_der()
        .context("encode signing certificate key")?;

    Ok(SigningCertificate {
        thumbprint: thumbprint(&pem.contents),
        key: DecodingKey::from_rsa_der(pkcs1.as_bytes()),
    })
}

impl Snapshot {
    fn from_pem_bundle(bundle: &str) -> Self {
        let mut certs = HashMap::new();
        for pem in Pem::iter_from_buffer(bundle.as_bytes()) {
            let pem = match pem {
                Ok(pem) => pem,
                Err(e) => {
                    warn!("Skipping malformed PEM block in signing certificate bundle: {e}");
                    continue;
                }
            };
            match parse_certificate(&pem) {
                Ok(cert) => {
                    certs.insert(cert.thumbprint.clone(), Arc::new(cert));
                }
                Err(e) => warn!("Skipping unusable signing certificate: {e:#}"),
            }
        }

        Self {
            certs,
            fetched_at: Instant::now(),
        }
    }
}

pub struct SigningCertCache {
    source: Arc<dyn CertificateSource>,
    ttl: Duration,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    refresh: Mutex<()>,
}

impl SigningCertCache {
    pub fn new(source: Arc<dyn CertificateSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            snapshot: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    async fn lookup(&self, thumbprint: &str) -> Lookup {
        let Some(snapshot) = self.snapshot.read().await.clone() else {
            return Lookup::Stale;
        };
        let age = snapshot.fetched_at.elapsed();
        if age >= self.ttl {
            return Lookup::Stale;
        }
        match snapshot.certs.get(thumbprint) {
            Some(cert) => Lookup::Hit(cert.clone()),
            None if age < MIN_REFRESH_INTERVAL => Lookup::Unknown,
            None => Lookup::Stale,
        }
    }

    /// The signing certificate with the given thumbprint. A failed fetch
    /// rejects the request; it is not retried.
    pub async fn get(&self, thumbprint: &str) -> crate::error::Result<Arc<SigningCertificate>> {
        let unknown = || Error::Unauthorized("unknown token signing certificate".to_string());

        match self.lookup(thumbprint).await {
            Lookup::Hit(cert) => return Ok(cert),
            Lookup::Unknown => return Err(unknown()),
            Lookup::Stale => {}
        }

        let _refresh = self.refresh.lock().await;
        // whoever held the lock before us may have refreshed already
        match self.lookup(thumbprint).await {
            Lookup::Hit(cert) => return Ok(cert),
            Lookup::Unknown => return Err(unknown()),
            Lookup::Stale => {}
        }

        debug!("Fetching JWT signing certificates");
        let bundle = self.source.signing_certificates().await.map_err(|e| {
            error!("Failed to fetch JWT signing certificates: {e:?}");
            Error::Unauthorized("token signing certificates unavailable".to_string())
        })?;

        let snapshot = Arc::new(Snapshot::from_pem_bundle(&bundle));
        *self.snapshot.write().await = Some(snapshot.clone());

        snapshot.certs.get(thumbprint).cloned().ok_or_else(unknown)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::ErrorKind;

    /// Serves a fixed PEM bundle and counts fetches.
    pub(crate) struct StaticSource {
        pub bundle: Option<String>,
        pub fetches: AtomicUsize,
    }

    impl StaticSource {
        pub(crate) fn new(bundle: Option<String>) -> Arc<Self> {
            Arc::new(Self {
                bundle,
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CertificateSource for StaticSource {
        async fn signing_certificates(&self) -> Result<String> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            // widen the window in which concurrent callers pile up
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.bundle
                .clone()
                .ok_or_else(|| anyhow::anyhow!("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_single_flight_refresh() {
        let signer = crate::token::tests::TokenSigner::new();
        let source = StaticSource::new(Some(signer.cert_pem.clone()));
        let cache = Arc::new(SigningCertCache::new(source.clone(), Duration::from_secs(300)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let thumbprint = signer.thumbprint.clone();
                tokio::spawn(async move { cache.get(&thumbprint).await.map(|c| c.thumbprint.clone()) })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), signer.thumbprint);
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_snapshot_is_refetched() {
        let signer = crate::token::tests::TokenSigner::new();
        let source = StaticSource::new(Some(signer.cert_pem.clone()));
        let cache = SigningCertCache::new(source.clone(), Duration::ZERO);

        cache.get(&signer.thumbprint).await.unwrap();
        cache.get(&signer.thumbprint).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_thumbprint_does_not_refetch() {
        let signer = crate::token::tests::TokenSigner::new();
        let source = StaticSource::new(Some(signer.cert_pem.clone()));
        let cache = SigningCertCache::new(source.clone(), Duration::from_secs(300));

        let bogus = "ab".repeat(32);
        for _ in 0..3 {
            let err = cache.get(&bogus).await.err().unwrap();
            assert_eq!(err.kind(), ErrorKind::Unauthorized);
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_unauthorized() {
        let source = StaticSource::new(None);
        let cache = SigningCertCache::new(source.clone(), Duration::from_secs(300));
        let err = cache.get(&"00".repeat(32)).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        // the failure is not cached; the next request tries again
        let _ = cache.get(&"00".repeat(32)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_header_thumbprint() {
        let digest = [0x5au8; 32];
        let mut header = Header::new(jsonwebtoken::Algorithm::RS256);
        assert!(header_thumbprint(&header).is_none());

        header.kid = Some(hex::encode(digest).to_uppercase());
        assert_eq!(header_thumbprint(&header), Some(hex::encode(digest)));

        header.x5t_s256 = Some(URL_SAFE_NO_PAD.encode(digest));
        header.kid = Some("key-1".to_string());
        assert_eq!(header_thumbprint(&header), Some(hex::encode(digest)));
    }
}
