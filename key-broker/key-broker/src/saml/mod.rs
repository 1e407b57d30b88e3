// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host trust reports: SAML assertions signed by the host verification
//! service (HVS), accepted as evidence by hosts that attest through it
//! instead of through attestation tokens.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use log::{info, warn};
use rsa::RsaPublicKey;
use std::collections::HashMap;
use uuid::Uuid;
use x509_parser::parse_x509_certificate;
use x509_parser::pem::parse_x509_pem;
use xmltree::Element;

use crate::config::SamlConfig;
use crate::error::{Error, Result};

pub mod signature;
pub mod trust_store;

pub use trust_store::TrustStore;

pub const TRUST_OVERALL: &str = "TRUST_OVERALL";
pub const BINDING_KEY_CERTIFICATE: &str = "Binding_Key_Certificate";

/// A parsed SAML assertion. The raw text it came from is still needed to
/// check its signature.
pub struct SamlReport {
    pub id: String,
    pub issuer: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub attributes: HashMap<String, String>,
    root: Element,
}

fn malformed(reason: impl std::fmt::Display) -> Error {
    Error::Validation(format!("malformed SAML report: {reason}"))
}

fn parse_time(conditions: &Element, name: &str) -> Result<Option<DateTime<Utc>>> {
    conditions
        .attributes
        .get(name)
        .map(|value| {
            DateTime::parse_from_rfc3339(value)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| malformed(format!("invalid {name}")))
        })
        .transpose()
}

fn child_elements<'a>(parent: &'a Element, name: &'a str) -> impl Iterator<Item = &'a Element> {
    parent
        .children
        .iter()
        .filter_map(|node| node.as_element())
        .filter(move |element| element.name == name)
}

impl SamlReport {
    pub fn parse(xml: &str) -> Result<Self> {
        let root = Element::parse(xml.as_bytes()).map_err(malformed)?;
        if root.name != "Assertion" {
            return Err(malformed("root element is not an Assertion"));
        }
        let id = root
            .attributes
            .get("ID")
            .cloned()
            .ok_or_else(|| malformed("assertion has no ID"))?;

        let issuer = root
            .get_child("Issuer")
            .and_then(|issuer| issuer.get_text())
            .map(|text| text.trim().to_string());

        let (not_before, not_on_or_after) = match root.get_child("Conditions") {
            Some(conditions) => (
                parse_time(conditions, "NotBefore")?,
                parse_time(conditions, "NotOnOrAfter")?,
            ),
            None => (None, None),
        };

        let mut attributes = HashMap::new();
        for statement in child_elements(&root, "AttributeStatement") {
            for attribute in child_elements(statement, "Attribute") {
                let Some(name) = attribute.attributes.get("Name") else {
                    continue;
                };
                let value = attribute
                    .get_child("AttributeValue")
                    .and_then(|value| value.get_text())
                    .map(|text| text.trim().to_string())
                    .unwrap_or_default();
                attributes.insert(name.clone(), value);
            }
        }

        Ok(Self {
            id,
            issuer,
            not_before,
            not_on_or_after,
            attributes,
            root,
        })
    }

    pub fn trust_overall(&self) -> bool {
        self.attributes
            .get(TRUST_OVERALL)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    pub fn binding_key_certificate(&self) -> Option<&str> {
        self.attributes
            .get(BINDING_KEY_CERTIFICATE)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |t| now >= t)
            && self.not_on_or_after.map_or(true, |t| now < t)
    }
}

/// DER of a certificate given as PEM, base64 PEM, or base64 DER.
fn decode_certificate(value: &str) -> Result<Vec<u8>> {
    let value = value.trim();
    let bytes = if value.starts_with("-----BEGIN") {
        value.as_bytes().to_vec()
    } else {
        let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
        STANDARD
            .decode(compact)
            .map_err(|_| malformed("binding key certificate is not base64"))?
    };

    if bytes.starts_with(b"-----BEGIN") {
        let (_, pem) = parse_x509_pem(&bytes)
            .map_err(|_| malformed("binding key certificate is not PEM"))?;
        Ok(pem.contents)
    } else {
        Ok(bytes)
    }
}

pub struct SamlValidator {
    signers: TrustStore,
    tpm_identity: TrustStore,
}

impl SamlValidator {
    pub async fn new(config: &SamlConfig) -> anyhow::Result<Self> {
        let signers = TrustStore::load_dir(&config.saml_certs_dir)
            .await?
            .merge(TrustStore::load_dir(&config.trusted_ca_dir).await?);
        let tpm_identity = TrustStore::load_dir(&config.tpm_identity_certs_dir).await?;
        if signers.is_empty() {
            warn!("No SAML signing certificates are trusted; every report will be rejected");
        }
        Ok(Self::from_stores(signers, tpm_identity))
    }

    pub fn from_stores(signers: TrustStore, tpm_identity: TrustStore) -> Self {
        Self {
            signers,
            tpm_identity,
        }
    }

    /// Decide whether HVS vouches for the host that sent `raw_xml`. Returns
    /// `(false, None)` for a genuine report that does not establish trust,
    /// and the host's binding key when it does.
    pub fn is_trusted_by_hvs(
        &self,
        raw_xml: &str,
        report: &SamlReport,
        key_id: &Uuid,
    ) -> Result<(bool, Option<RsaPublicKey>)> {
        let chain = signature::verify_enveloped_signature(raw_xml, &report.root, &report.id)?;
        if let Err(e) = self.signers.verify_chain(&chain.signer, &chain.intermediates) {
            warn!("SAML report {} for key {key_id} has an untrusted signer: {e:#}", report.id);
            return Err(Error::Unauthorized("untrusted report signer".to_string()));
        }

        if !report.is_current(Utc::now()) {
            warn!("SAML report {} for key {key_id} is outside its validity window", report.id);
            return Ok((false, None));
        }
        if !report.trust_overall() {
            info!("SAML report {} does not establish overall trust", report.id);
            return Ok((false, None));
        }

        let encoded = report
            .binding_key_certificate()
            .ok_or_else(|| malformed("no binding key certificate"))?;
        let der = decode_certificate(encoded)?;
        if let Err(e) = self.tpm_identity.verify(&der) {
            warn!("Binding key certificate of SAML report {} is not trusted: {e:#}", report.id);
            return Err(Error::Unauthorized(
                "untrusted binding key certificate".to_string(),
            ));
        }

        let (_, cert) = parse_x509_certificate(&der)
            .map_err(|_| malformed("invalid binding key certificate"))?;
        let binding_key = crypto::rsa::public_key_from_spki_der(cert.public_key().raw)
            .map_err(|_| Error::Validation("binding key is not an RSA key".to_string()))?;

        Ok((true, Some(binding_key)))
    }
}
