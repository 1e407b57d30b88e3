// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Client of the Attestation Provisioning Service (APS): nonces for transfer
//! challenges, attestation tokens, and the certificates that sign them.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use uuid::Uuid;

use crate::config::ApsConfig;
use crate::token::CertificateSource;

const PEM_CONTENT_TYPE: &str = "application/x-pem-file";

/// Evidence submitted to the APS in exchange for an attestation token.
#[derive(Serialize, Debug, Clone, Default)]
pub struct AttestationTokenRequest {
    /// Base64 encoded SGX or TDX quote.
    pub quote: String,

    pub verifier_nonce: String,

    /// Base64 of the data the TEE bound into the quote.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub policy_ids: Vec<Uuid>,
}

#[async_trait]
pub trait ApsClient: CertificateSource {
    async fn get_nonce(&self) -> Result<String>;

    async fn get_attestation_token(&self, request: &AttestationTokenRequest) -> Result<String>;
}

pub(crate) fn http_client(cert: Option<&str>) -> Result<Client> {
    match cert {
        Some(cert) => {
            let cert = reqwest::Certificate::from_pem(cert.as_bytes())
                .context("parse TLS root certificate")?;
            Ok(Client::builder().add_root_certificate(cert).build()?)
        }
        None => Ok(Client::new()),
    }
}

/// Fetch a PEM bundle of JWT signing certificates from `url`.
pub(crate) async fn fetch_pem_bundle(client: &Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .header("Accept", PEM_CONTENT_TYPE)
        .send()
        .await
        .with_context(|| format!("request {url}"))?;

    if !response.status().is_success() {
        bail!("Failed to get signing certificates: {}", response.status());
    }
    Ok(response.text().await?)
}

pub struct HttpApsClient {
    url: String,
    client: Client,
}

impl HttpApsClient {
    pub fn new(config: &ApsConfig) -> Result<Self> {
        if config.url.is_empty() {
            bail!("APS url is not configured");
        }
        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            client: http_client(config.cert.as_deref())?,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.url)
    }
}

#[async_trait]
impl CertificateSource for HttpApsClient {
    async fn signing_certificates(&self) -> Result<String> {
        fetch_pem_bundle(&self.client, &self.endpoint("jwt-signing-certificates")).await
    }
}

#[async_trait]
impl ApsClient for HttpApsClient {
    async fn get_nonce(&self) -> Result<String> {
        let response = self
            .client
            .get(self.endpoint("nonce"))
            .send()
            .await
            .context("request APS nonce")?;

        match response.status() {
            reqwest::StatusCode::OK => {
                let nonce = response.text().await?.trim().to_string();
                if nonce.is_empty() {
                    bail!("APS returned an empty nonce");
                }
                Ok(nonce)
            }
            status => bail!("Failed to get nonce from APS: {status}"),
        }
    }

    async fn get_attestation_token(&self, request: &AttestationTokenRequest) -> Result<String> {
        let response = self
            .client
            .post(self.endpoint("attestation-token"))
            .header("Content-Type", "application/json")
            .header("Accept", "application/jwt")
            .json(request)
            .send()
            .await
            .context("request attestation token")?;

        match response.status() {
            reqwest::StatusCode::OK => Ok(response.text().await?),
            status => bail!(
                "Attestation token request failed ({status}), APS Response: {:?}",
                response.text().await?
            ),
        }
    }
}
