// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Key metadata. Raw key bytes never live in these records; they stay in the
//! key-manager backend and are referenced through `kmip_key_id`.

use chrono::{DateTime, Utc};
use crypto::ec::Curve;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

pub const AES_KEY_LENGTHS: [u32; 3] = [128, 192, 256];
pub const RSA_KEY_LENGTHS: [u32; 3] = [2048, 3072, 4096];

#[derive(
    EnumString, AsRefStr, Display, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
)]
pub enum KeyAlgorithm {
    #[serde(rename = "AES")]
    #[strum(serialize = "AES")]
    Aes,

    #[serde(rename = "RSA")]
    #[strum(serialize = "RSA")]
    Rsa,

    #[serde(rename = "EC")]
    #[strum(serialize = "EC")]
    Ec,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KeyAttributes {
    pub id: Uuid,
    pub algorithm: KeyAlgorithm,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_length: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curve_type: Option<String>,

    /// Opaque identifier of the material in the key-manager backend.
    pub kmip_key_id: String,

    pub transfer_policy_id: Uuid,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
}

/// Body of `POST /keys`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct KeyRequest {
    pub key_information: KeyInformation,

    #[serde(default)]
    pub transfer_policy_id: Option<Uuid>,

    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub usage: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct KeyInformation {
    pub algorithm: KeyAlgorithm,

    #[serde(default)]
    pub key_length: Option<u32>,

    #[serde(default)]
    pub curve_type: Option<String>,

    /// Caller-supplied key material: base64 raw bytes for AES, PEM private
    /// key for RSA and EC.
    #[serde(default)]
    pub key_string: Option<String>,

    /// Existing key in the backend to register instead of generating one.
    #[serde(default)]
    pub kmip_key_id: Option<String>,
}

impl KeyRequest {
    pub fn from_json(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| Error::Validation(format!("malformed key request: {e}")))
    }

    /// Whether the request registers existing material rather than asking
    /// the backend to generate a key.
    pub fn is_registration(&self) -> bool {
        self.key_information.key_string.is_some() || self.key_information.kmip_key_id.is_some()
    }

    /// Shape checks that need no store or backend access.
    pub fn validate(&self) -> Result<()> {
        let info = &self.key_information;

        if self.transfer_policy_id.is_none() {
            return Err(Error::Validation(
                "transfer_policy_id is required".to_string(),
            ));
        }

        if info.key_string.is_some() && info.kmip_key_id.is_some() {
            return Err(Error::Validation(
                "key_string and kmip_key_id are mutually exclusive".to_string(),
            ));
        }

        match info.algorithm {
            KeyAlgorithm::Aes => {
                if info.curve_type.is_some() {
                    return Err(Error::Validation(
                        "curve_type is only valid for EC keys".to_string(),
                    ));
                }
                match info.key_length {
                    Some(length) if AES_KEY_LENGTHS.contains(&length) => {}
                    Some(length) => {
                        return Err(Error::Validation(format!(
                            "invalid AES key length: {length}"
                        )))
                    }
                    None if info.key_string.is_some() => {}
                    None => {
                        return Err(Error::Validation(
                            "key_length is required for AES keys".to_string(),
                        ))
                    }
                }
            }
            KeyAlgorithm::Rsa => {
                if info.curve_type.is_some() {
                    return Err(Error::Validation(
                        "curve_type is only valid for EC keys".to_string(),
                    ));
                }
                if let Some(length) = info.key_length {
                    if !RSA_KEY_LENGTHS.contains(&length) {
                        return Err(Error::Validation(format!(
                            "invalid RSA key length: {length}"
                        )));
                    }
                }
            }
            KeyAlgorithm::Ec => {
                if info.key_length.is_some() {
                    return Err(Error::Validation(
                        "key_length is not valid for EC keys".to_string(),
                    ));
                }
                let curve = info.curve_type.as_deref().ok_or_else(|| {
                    Error::Validation("curve_type is required for EC keys".to_string())
                })?;
                Curve::from_str(curve)
                    .map_err(|_| Error::Validation(format!("invalid curve_type: {curve}")))?;
            }
        }

        Ok(())
    }
}

/// Key representation returned by the key endpoints.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KeyResponse {
    pub key_information: KeyInformationResponse,
    pub transfer_policy_id: Uuid,
    pub transfer_link: String,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KeyInformationResponse {
    pub id: Uuid,
    pub algorithm: KeyAlgorithm,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_length: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curve_type: Option<String>,

    pub kmip_key_id: String,
}

impl From<&KeyAttributes> for KeyResponse {
    fn from(attributes: &KeyAttributes) -> Self {
        Self {
            key_information: KeyInformationResponse {
                id: attributes.id,
                algorithm: attributes.algorithm,
                key_length: attributes.key_length,
                curve_type: attributes.curve_type.clone(),
                kmip_key_id: attributes.kmip_key_id.clone(),
            },
            transfer_policy_id: attributes.transfer_policy_id,
            transfer_link: format!("/v1/keys/{}/transfer", attributes.id),
            created_at: attributes.created_at,
            label: attributes.label.clone(),
            usage: attributes.usage.clone(),
        }
    }
}

/// Criteria for `GET /keys`. Every criterion that is set must match.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct KeyFilter {
    pub algorithm: Option<KeyAlgorithm>,
    pub key_length: Option<u32>,
    pub curve_type: Option<Curve>,
    pub transfer_policy_id: Option<Uuid>,
}

impl KeyFilter {
    pub fn from_query(params: &HashMap<String, String>) -> Result<Self> {
        let mut filter = Self::default();
        for (name, value) in params {
            match name.as_str() {
                "algorithm" => {
                    filter.algorithm = Some(value.to_uppercase().parse().map_err(|_| {
                        Error::Validation(format!("invalid algorithm filter: {value}"))
                    })?)
                }
                "keyLength" => {
                    filter.key_length = Some(value.parse().map_err(|_| {
                        Error::Validation(format!("invalid keyLength filter: {value}"))
                    })?)
                }
                "curveType" => {
                    filter.curve_type = Some(value.parse().map_err(|_| {
                        Error::Validation(format!("invalid curveType filter: {value}"))
                    })?)
                }
                "transferPolicyId" => {
                    filter.transfer_policy_id = Some(value.parse().map_err(|_| {
                        Error::Validation(format!("invalid transferPolicyId filter: {value}"))
                    })?)
                }
                other => return Err(Error::Validation(format!("unknown key filter: {other}"))),
            }
        }

        Ok(filter)
    }

    pub fn matches(&self, key: &KeyAttributes) -> bool {
        if self.algorithm.is_some_and(|alg| alg != key.algorithm) {
            return false;
        }
        if self.key_length.is_some() && self.key_length != key.key_length {
            return false;
        }
        if let Some(curve) = self.curve_type {
            let key_curve = key
                .curve_type
                .as_deref()
                .and_then(|c| Curve::from_str(c).ok());
            if key_curve != Some(curve) {
                return false;
            }
        }
        if self
            .transfer_policy_id
            .is_some_and(|id| id != key.transfer_policy_id)
        {
            return false;
        }

        true
    }
}
