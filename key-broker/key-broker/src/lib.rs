// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Key broker: stores keys under transfer policies and releases a key only
//! to a trusted execution environment whose attestation evidence satisfies
//! the key's policy, wrapped so that only that environment can read it.
//!
//! Evidence comes in one of two forms:
//! - an attestation token issued by the Attestation Provisioning Service
//!   (APS), whose claims are matched against the policy and whose held data
//!   carries the envelope key the released key is wrapped under;
//! - a SAML report signed by the host verification service, whose binding
//!   key certificate supplies the wrapping key.

#[macro_use]
extern crate strum;

use async_trait::async_trait;
use chrono::Utc;
use crypto::rsa::{PaddingMode, TPM2_OAEP_LABEL};
use crypto::HashAlgorithm;
use log::{info, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

pub mod aps;
pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod keys;
pub mod manager;
pub mod nonce;
pub mod policy;
pub mod release;
pub mod saml;
pub mod store;
pub mod token;

use crate::aps::{ApsClient, HttpApsClient};
use crate::auth::{AuthServiceClient, BearerAuthenticator, BearerClaims};
use crate::backend::KeyManager;
use crate::config::aps::DEFAULT_CACHE_TTL_SECS;
use crate::config::Config;
use crate::error::{Error, InternalContext, Result};
use crate::keys::{KeyAttributes, KeyFilter, KeyRequest};
use crate::manager::RemoteKeyManager;
use crate::nonce::NonceRegistry;
use crate::policy::{AttestationType, KeyTransferPolicy, PolicyFilter};
use crate::release::{KeyReleaseEngine, TransferResponse};
use crate::saml::{SamlReport, SamlValidator};
use crate::store::{KeyStore, PolicyStore};
use crate::token::{match_claims, AttestationTokenClaim, CertificateSource, TokenVerifier};

/// Body of a transfer request on the token path. Both fields are optional:
/// a request without a token is answered with a nonce challenge.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct TransferRequest {
    #[serde(default)]
    pub attestation_token: Option<String>,

    /// PEM public key the caller expects the key to be wrapped under. Must
    /// be the key bound into the token's held data.
    #[serde(default)]
    pub envelope_key: Option<String>,
}

impl TransferRequest {
    pub fn from_json(body: &[u8]) -> Result<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|e| Error::Validation(format!("invalid transfer request: {e}")))
    }
}

/// Request headers that take part in a token-path transfer.
#[derive(Debug, Default, Clone)]
pub struct TransferHeaders {
    pub authorization: Option<String>,
    pub attestation_type: Option<String>,
    pub nonce: Option<String>,
}

#[derive(Debug)]
pub enum TransferOutcome {
    /// No evidence was presented. The caller is to fetch a token bound to
    /// `nonce` for the given attestation type and retry.
    Challenge {
        nonce: String,
        attestation_type: AttestationType,
    },
    Released(TransferResponse),
}

/// Everything the key broker talks to. [`KeyBroker::new`] builds these from
/// the configuration; tests substitute their own.
pub struct Collaborators {
    pub policy_store: Arc<PolicyStore>,
    pub key_store: Arc<KeyStore>,
    pub key_manager: Arc<dyn KeyManager>,
    pub aps: Arc<dyn ApsClient>,
    pub auth: Option<Arc<dyn CertificateSource>>,
    pub saml: Option<SamlValidator>,
}

/// Serves the APS signing certificates to the token verifier.
struct ApsCertificates(Arc<dyn ApsClient>);

#[async_trait]
impl CertificateSource for ApsCertificates {
    async fn signing_certificates(&self) -> anyhow::Result<String> {
        self.0.signing_certificates().await
    }
}

pub struct KeyBroker {
    policies: Arc<PolicyStore>,
    manager: Arc<RemoteKeyManager>,
    release: KeyReleaseEngine,
    aps: Arc<dyn ApsClient>,
    tokens: TokenVerifier,
    nonces: NonceRegistry,
    saml: Option<SamlValidator>,
    authenticator: Option<BearerAuthenticator>,

    /// Held shared while a key is created against a policy and exclusively
    /// while a policy is deleted.
    policy_references: RwLock<()>,
}

impl KeyBroker {
    /// Create a key broker with the stores, backend and remote services
    /// named in `config`.
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let policy_store = store::new_store::<KeyTransferPolicy>(&config.store).await?;
        let key_store = store::new_store::<KeyAttributes>(&config.store).await?;
        let key_manager = backend::new_key_manager(&config.key_manager).await?;
        let aps: Arc<dyn ApsClient> = Arc::new(HttpApsClient::new(&config.aps)?);

        let auth = match &config.auth {
            Some(auth) => {
                Some(Arc::new(AuthServiceClient::new(auth)?) as Arc<dyn CertificateSource>)
            }
            None => {
                warn!("No authentication service configured; management requests are not authenticated");
                None
            }
        };

        let saml = match &config.saml {
            Some(saml) => Some(SamlValidator::new(saml).await?),
            None => {
                info!("SAML report transfers are disabled");
                None
            }
        };

        Self::with_collaborators(
            config,
            Collaborators {
                policy_store,
                key_store,
                key_manager,
                aps,
                auth,
                saml,
            },
        )
    }

    pub fn with_collaborators(config: &Config, collaborators: Collaborators) -> anyhow::Result<Self> {
        let manager = Arc::new(RemoteKeyManager::new(
            collaborators.key_store,
            collaborators.policy_store.clone(),
            collaborators.key_manager,
        ));

        let tokens = TokenVerifier::new(
            Arc::new(ApsCertificates(collaborators.aps.clone())),
            Duration::from_secs(config.aps.signing_cert_cache_ttl_secs),
            &config.token,
        )?;

        let authenticator = match collaborators.auth {
            Some(source) => {
                let ttl = config
                    .auth
                    .as_ref()
                    .map_or(DEFAULT_CACHE_TTL_SECS, |auth| auth.signing_cert_cache_ttl_secs);
                Some(BearerAuthenticator::new(
                    source,
                    Duration::from_secs(ttl),
                    &config.token,
                )?)
            }
            None => None,
        };

        Ok(Self {
            policies: collaborators.policy_store,
            release: KeyReleaseEngine::new(manager.clone()),
            manager,
            aps: collaborators.aps,
            tokens,
            nonces: NonceRegistry::new(Duration::from_secs(config.aps.nonce_ttl_secs)),
            saml: collaborators.saml,
            authenticator,
            policy_references: RwLock::new(()),
        })
    }

    /// Verify the bearer token of a management request. Returns `None` when
    /// no authentication service is configured.
    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<Option<BearerClaims>> {
        match &self.authenticator {
            Some(authenticator) => authenticator.authenticate(authorization).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn create_policy(&self, mut policy: KeyTransferPolicy) -> Result<KeyTransferPolicy> {
        policy::validate(&policy)?;

        let now = Utc::now();
        policy.id = Uuid::new_v4();
        policy.created_at = Some(now);
        policy.updated_at = Some(now);
        self.policies
            .create(&policy)
            .await
            .internal("create key transfer policy")?;

        info!("Created key transfer policy {}", policy.id);
        Ok(policy)
    }

    pub async fn retrieve_policy(&self, id: &Uuid) -> Result<KeyTransferPolicy> {
        self.policies
            .retrieve(id)
            .await
            .internal("retrieve key transfer policy")?
            .ok_or_else(|| Error::NotFound(format!("key transfer policy {id}")))
    }

    /// Replace a policy wholesale. The ID and creation time are kept.
    pub async fn update_policy(
        &self,
        id: &Uuid,
        mut policy: KeyTransferPolicy,
    ) -> Result<KeyTransferPolicy> {
        policy::validate(&policy)?;

        let existing = self.retrieve_policy(id).await?;
        policy.id = existing.id;
        policy.created_at = existing.created_at;
        policy.updated_at = Some(Utc::now());

        if !self
            .policies
            .update(&policy)
            .await
            .internal("update key transfer policy")?
        {
            return Err(Error::NotFound(format!("key transfer policy {id}")));
        }

        info!("Updated key transfer policy {id}");
        Ok(policy)
    }

    pub async fn delete_policy(&self, id: &Uuid) -> Result<()> {
        let _exclusive = self.policy_references.write().await;

        self.retrieve_policy(id).await?;
        if self.manager.policy_in_use(id).await? {
            return Err(Error::Conflict(format!(
                "key transfer policy {id} is referenced by keys"
            )));
        }

        if !self
            .policies
            .delete(id)
            .await
            .internal("delete key transfer policy")?
        {
            return Err(Error::NotFound(format!("key transfer policy {id}")));
        }

        info!("Deleted key transfer policy {id}");
        Ok(())
    }

    pub async fn search_policies(&self, filter: &PolicyFilter) -> Result<Vec<KeyTransferPolicy>> {
        let policies = self
            .policies
            .list()
            .await
            .internal("list key transfer policies")?;
        Ok(policies.into_iter().filter(|p| filter.matches(p)).collect())
    }

    pub async fn create_key(&self, request: &KeyRequest) -> Result<KeyAttributes> {
        let _shared = self.policy_references.read().await;
        self.manager.create_key(request).await
    }

    pub async fn register_key(&self, request: &KeyRequest) -> Result<KeyAttributes> {
        let _shared = self.policy_references.read().await;
        self.manager.register_key(request).await
    }

    pub async fn retrieve_key(&self, id: &Uuid) -> Result<KeyAttributes> {
        self.manager.retrieve_key(id).await
    }

    pub async fn delete_key(&self, id: &Uuid) -> Result<()> {
        self.manager.delete_key(id).await
    }

    pub async fn search_keys(&self, filter: &KeyFilter) -> Result<Vec<KeyAttributes>> {
        self.manager.search_keys(filter).await
    }

    async fn policy_of_key(&self, id: &Uuid) -> Result<KeyTransferPolicy> {
        let key = self.manager.retrieve_key(id).await?;
        self.policies
            .retrieve(&key.transfer_policy_id)
            .await
            .internal("retrieve key transfer policy")?
            .ok_or_else(|| {
                Error::internal(
                    "retrieve key transfer policy",
                    anyhow::anyhow!(
                        "policy {} referenced by key {id} is missing",
                        key.transfer_policy_id
                    ),
                )
            })
    }

    async fn challenge(&self, id: &Uuid) -> Result<TransferOutcome> {
        let attestation_type = self.policy_of_key(id).await?.attestation_type()?;
        let nonce = self.aps.get_nonce().await.internal("get nonce from APS")?;
        self.nonces.issue(&nonce).await;

        info!("Issued {attestation_type} transfer challenge for key {id}");
        Ok(TransferOutcome::Challenge {
            nonce,
            attestation_type,
        })
    }

    /// The key bound into the token's held data, which must also be the key
    /// the caller named, if it named one.
    fn envelope_key(
        claims: &AttestationTokenClaim,
        requested: Option<&str>,
    ) -> Result<crypto::rsa::PublicKey> {
        let held_data = claims.tee_held_data()?;
        let envelope_key = crypto::rsa::envelope_key_from_bytes(&held_data).map_err(|e| {
            warn!("Token held data is not an envelope key: {e}");
            Error::Unauthorized("malformed envelope key".to_string())
        })?;

        if let Some(pem) = requested {
            let requested = crypto::rsa::public_key_from_pem(pem)
                .and_then(|key| crypto::rsa::envelope_key_bytes(&key))
                .map_err(|e| Error::Validation(format!("invalid envelope key: {e}")))?;
            if requested != held_data {
                warn!("Envelope key of the request is not the one bound to the token");
                return Err(Error::Unauthorized("envelope key mismatch".to_string()));
            }
        }

        Ok(envelope_key)
    }

    /// Release a key against an attestation token. Without a token, a nonce
    /// challenge is returned instead.
    pub async fn transfer_with_token(
        &self,
        id: &Uuid,
        request: &TransferRequest,
        headers: &TransferHeaders,
    ) -> Result<TransferOutcome> {
        let token = request
            .attestation_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .or_else(|| auth::bearer_token(headers.authorization.as_deref()));
        let Some(token) = token else {
            return self.challenge(id).await;
        };

        let claims: AttestationTokenClaim = self.tokens.verify(token).await?;

        let Some(nonce) = headers.nonce.as_deref().filter(|n| !n.is_empty()) else {
            warn!("Transfer of key {id} rejected: no nonce presented");
            return Err(Error::Unauthorized("missing nonce".to_string()));
        };
        if claims.verifier_nonce.as_deref() != Some(nonce) {
            warn!("Transfer of key {id} rejected: token is not bound to the presented nonce");
            return Err(Error::Unauthorized("nonce mismatch".to_string()));
        }
        if !self.nonces.consume(nonce).await {
            warn!("Transfer of key {id} rejected: nonce was not issued or has expired");
            return Err(Error::Unauthorized("invalid nonce".to_string()));
        }

        let policy = self.policy_of_key(id).await?;
        let attestation_type = policy.attestation_type()?;
        if !headers
            .attestation_type
            .as_deref()
            .is_some_and(|value| value.eq_ignore_ascii_case(attestation_type.as_ref()))
        {
            warn!("Transfer of key {id} rejected: attestation type is not {attestation_type}");
            return Err(Error::Unauthorized("attestation type mismatch".to_string()));
        }

        match_claims(&policy, &claims)?;
        let envelope_key = Self::envelope_key(&claims, request.envelope_key.as_deref())?;

        let response = self
            .release
            .release(id, &envelope_key, PaddingMode::Oaep256.hash_algorithm(), None)
            .await?;
        Ok(TransferOutcome::Released(response))
    }

    /// Release a key to a host vouched for by a SAML report. The key is
    /// wrapped for the host's TPM binding key.
    pub async fn transfer_with_saml(&self, id: &Uuid, xml: &str) -> Result<TransferResponse> {
        let validator = self.saml.as_ref().ok_or_else(|| {
            Error::UnsupportedMediaType("SAML reports are not accepted".to_string())
        })?;

        let report = SamlReport::parse(xml)?;
        let binding_key = match validator.is_trusted_by_hvs(xml, &report, id)? {
            (true, Some(binding_key)) => binding_key,
            _ => {
                warn!("Transfer of key {id} rejected: host is not trusted by HVS");
                return Err(Error::Unauthorized("host is not trusted".to_string()));
            }
        };

        self.release
            .release(
                id,
                &binding_key,
                PaddingMode::Oaep384.hash_algorithm(),
                Some(TPM2_OAEP_LABEL),
            )
            .await
    }

    /// Release a key wrapped under a caller-supplied public key. Without
    /// evidence, the caller has to be authenticated, so this path is closed
    /// when no authentication service is configured.
    pub async fn transfer_with_public_key(
        &self,
        id: &Uuid,
        pem: &str,
        authorization: Option<&str>,
    ) -> Result<TransferResponse> {
        let Some(authenticator) = &self.authenticator else {
            warn!("Transfer of key {id} rejected: public key transfers need an authentication service");
            return Err(Error::Unauthorized("authentication required".to_string()));
        };
        let caller = authenticator.authenticate(authorization).await?;

        let public_key = crypto::rsa::public_key_from_pem(pem)
            .map_err(|e| Error::Validation(format!("invalid public key: {e}")))?;

        info!(
            "Key {id} requested under a public key by {}",
            caller.sub.as_deref().unwrap_or("an unnamed caller")
        );
        self.release
            .release(id, &public_key, HashAlgorithm::Sha256, None)
            .await
    }
}
