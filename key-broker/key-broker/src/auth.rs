// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Bearer-token authentication of the management endpoints.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::aps::{fetch_pem_bundle, http_client};
use crate::config::{AuthConfig, TokenConfig};
use crate::error::Error;
use crate::token::{CertificateSource, TokenVerifier};

/// Claims of a bearer token issued by the authentication service.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct BearerClaims {
    #[serde(default)]
    pub sub: Option<String>,

    pub exp: u64,
}

/// The value of an `Authorization: Bearer <token>` header.
pub fn bearer_token(authorization: Option<&str>) -> Option<&str> {
    authorization?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub struct AuthServiceClient {
    url: String,
    client: Client,
}

impl AuthServiceClient {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            client: http_client(config.cert.as_deref())?,
        })
    }
}

#[async_trait]
impl CertificateSource for AuthServiceClient {
    async fn signing_certificates(&self) -> Result<String> {
        fetch_pem_bundle(&self.client, &format!("{}/jwt-certificates", self.url)).await
    }
}

pub struct BearerAuthenticator {
    verifier: TokenVerifier,
}

impl BearerAuthenticator {
    pub fn new(
        source: Arc<dyn CertificateSource>,
        cache_ttl: Duration,
        config: &TokenConfig,
    ) -> Result<Self> {
        Ok(Self {
            verifier: TokenVerifier::new(source, cache_ttl, config)?,
        })
    }

    pub async fn authenticate(
        &self,
        authorization: Option<&str>,
    ) -> crate::error::Result<BearerClaims> {
        let token = bearer_token(authorization)
            .ok_or_else(|| Error::Unauthorized("missing bearer token".to_string()))?;
        self.verifier.verify(token).await
    }
}
