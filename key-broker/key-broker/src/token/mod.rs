// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Verification of JWTs issued by the attestation provisioning service (and,
//! for bearer tokens, by the authentication service).

use anyhow::bail;
use base64::{engine::general_purpose::STANDARD, Engine};
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use log::warn;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::error::{Error, Result};

pub mod cert_cache;
pub mod claims;

pub use cert_cache::{CertificateSource, SigningCertCache};
pub use claims::match_claims;

/// Claims of an attestation token. Which fields are present depends on the
/// attestation type of the evidence it was minted from.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AttestationTokenClaim {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sgx_mrenclave: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sgx_mrsigner: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sgx_isvprodid: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sgx_isvsvn: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdx_mrsignerseam: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdx_mrseam: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdx_seamsvn: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdx_mrtd: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdx_rtmr0: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdx_rtmr1: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdx_rtmr2: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdx_rtmr3: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attester_tcb_status: Option<String>,

    /// Attestation-service policies the evidence was appraised against.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_ids: Vec<Uuid>,

    /// Nonce the evidence was appraised against. It must be the nonce the
    /// transfer request presents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifier_nonce: Option<String>,

    /// Base64 of the data the TEE bound into its report; for key transfer
    /// this is the canonical encoding of the requester's envelope key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attester_held_data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

impl AttestationTokenClaim {
    pub fn tee_held_data(&self) -> Result<Vec<u8>> {
        let encoded = self
            .attester_held_data
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| Error::Unauthorized("token carries no held data".to_string()))?;
        STANDARD
            .decode(encoded)
            .map_err(|_| Error::Unauthorized("token held data is not base64".to_string()))
    }
}

pub struct TokenVerifier {
    certs: SigningCertCache,
    algorithms: Vec<Algorithm>,
    leeway: u64,
}

impl TokenVerifier {
    pub fn new(
        source: Arc<dyn CertificateSource>,
        cache_ttl: Duration,
        config: &TokenConfig,
    ) -> anyhow::Result<Self> {
        let mut algorithms = Vec::new();
        for name in &config.allowed_algorithms {
            let alg = Algorithm::from_str(name)
                .map_err(|_| anyhow::anyhow!("unknown token algorithm {name}"))?;
            if !matches!(
                alg,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ) {
                bail!("token algorithm {name} is not an RSA algorithm");
            }
            algorithms.push(alg);
        }
        if algorithms.is_empty() {
            bail!("no token algorithms are allowed");
        }

        Ok(Self {
            certs: SigningCertCache::new(source, cache_ttl),
            algorithms,
            leeway: config.leeway_secs,
        })
    }

    /// Check the token's signature against the signing certificate its
    /// header names, check `exp`/`nbf`, and return the claims.
    pub async fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T> {
        let header = decode_header(token)
            .map_err(|_| Error::Unauthorized("malformed token".to_string()))?;
        if !self.algorithms.contains(&header.alg) {
            warn!("Token rejected: algorithm {:?} is not allowed", header.alg);
            return Err(Error::Unauthorized("token algorithm not allowed".to_string()));
        }

        let thumbprint = cert_cache::header_thumbprint(&header).ok_or_else(|| {
            Error::Unauthorized("token does not name its signing certificate".to_string())
        })?;
        let cert = self.certs.get(&thumbprint).await?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway;
        validation.validate_aud = false;
        validation.validate_nbf = true;

        decode::<T>(token, &cert.key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                warn!("Token rejected: {e}");
                Error::Unauthorized("invalid token".to_string())
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    use rsa::RsaPrivateKey;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::cert_cache::tests::StaticSource;
    use super::*;
    use crate::error::ErrorKind;

    /// An RSA key with a self-signed certificate, minting tokens the way the
    /// provisioning service does.
    pub(crate) struct TokenSigner {
        pub cert_pem: String,
        pub thumbprint: String,
        encoding_key: EncodingKey,
    }

    impl TokenSigner {
        pub(crate) fn new() -> Self {
            let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
            let pkcs8 = private_key.to_pkcs8_pem(LineEnding::LF).unwrap();
            let key_pair =
                rcgen::KeyPair::from_pkcs8_pem_and_sign_algo(&pkcs8, &rcgen::PKCS_RSA_SHA256)
                    .unwrap();
            let params =
                rcgen::CertificateParams::new(vec!["aps.example.com".to_string()]).unwrap();
            let cert = params.self_signed(&key_pair).unwrap();

            let pkcs1 = private_key.to_pkcs1_pem(LineEnding::LF).unwrap();
            Self {
                cert_pem: cert.pem(),
                thumbprint: cert_cache::thumbprint(cert.der()),
                encoding_key: EncodingKey::from_rsa_pem(pkcs1.as_bytes()).unwrap(),
            }
        }

        pub(crate) fn sign<T: Serialize>(&self, claims: &T) -> String {
            self.sign_with(Algorithm::RS256, claims)
        }

        pub(crate) fn sign_with<T: Serialize>(&self, alg: Algorithm, claims: &T) -> String {
            let mut header = Header::new(alg);
            header.x5t_s256 = Some(URL_SAFE_NO_PAD.encode(hex::decode(&self.thumbprint).unwrap()));
            encode(&header, claims, &self.encoding_key).unwrap()
        }
    }

    pub(crate) fn expires_in(secs: i64) -> u64 {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        (now + secs) as u64
    }

    fn verifier(signer: &TokenSigner) -> TokenVerifier {
        TokenVerifier::new(
            StaticSource::new(Some(signer.cert_pem.clone())),
            Duration::from_secs(300),
            &TokenConfig::default(),
        )
        .unwrap()
    }

    fn claim() -> AttestationTokenClaim {
        AttestationTokenClaim {
            sgx_mrsigner: Some("ab".repeat(32)),
            attester_tcb_status: Some("OK".to_string()),
            exp: Some(expires_in(600)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_verify_token() {
        let signer = TokenSigner::new();
        let token = signer.sign(&claim());
        let verified: AttestationTokenClaim = verifier(&signer).verify(&token).await.unwrap();
        assert_eq!(verified, claim());
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let signer = TokenSigner::new();
        let mut expired = claim();
        expired.exp = Some(expires_in(-3600));
        let err = verifier(&signer)
            .verify::<AttestationTokenClaim>(&signer.sign(&expired))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_foreign_signer_rejected() {
        let signer = TokenSigner::new();
        let impostor = TokenSigner::new();
        let err = verifier(&signer)
            .verify::<AttestationTokenClaim>(&impostor.sign(&claim()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_tampered_token_rejected() {
        let signer = TokenSigner::new();
        let token = signer.sign(&claim());
        let mut parts: Vec<&str> = token.split('.').collect();
        let mut forged = claim();
        forged.attester_tcb_status = Some("OutOfDate".to_string());
        forged.sgx_mrsigner = Some("cd".repeat(32));
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        parts[1] = &payload;

        let err = verifier(&signer)
            .verify::<AttestationTokenClaim>(&parts.join("."))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_disallowed_algorithm_rejected() {
        let signer = TokenSigner::new();
        let token = signer.sign_with(Algorithm::RS512, &claim());
        let err = verifier(&signer)
            .verify::<AttestationTokenClaim>(&token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn test_non_rsa_algorithm_config() {
        let config = TokenConfig {
            allowed_algorithms: vec!["HS256".to_string()],
            ..Default::default()
        };
        assert!(TokenVerifier::new(StaticSource::new(None), Duration::ZERO, &config).is_err());
    }

    #[test]
    fn test_tee_held_data() {
        let mut claim = claim();
        assert!(claim.tee_held_data().is_err());
        claim.attester_held_data = Some(STANDARD.encode([1u8, 2, 3]));
        assert_eq!(claim.tee_held_data().unwrap(), vec![1, 2, 3]);
    }
}
