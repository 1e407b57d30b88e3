// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Key transfer policies: which SGX enclaves or TDX trust domains may
//! receive the keys that reference a policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{Error, Result};

mod validator;
pub use validator::validate;

/// Attestation technology a policy is written for. Used verbatim as the
/// `Attestation-Type` header value.
#[derive(
    EnumString,
    AsRefStr,
    Display,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
)]
pub enum AttestationType {
    #[serde(rename = "SGX")]
    #[strum(serialize = "SGX")]
    Sgx,

    #[serde(rename = "TDX")]
    #[strum(serialize = "TDX")]
    Tdx,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct KeyTransferPolicy {
    /// Assigned by the key broker on creation.
    #[serde(default)]
    pub id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Must hold exactly one entry.
    #[serde(default)]
    pub attestation_type: Vec<AttestationType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sgx: Option<SgxPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdx: Option<TdxPolicy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct SgxPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<SgxAttributes>,

    /// Attestation-service policy IDs; a token must have been appraised
    /// against at least one of them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_ids: Vec<Uuid>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct SgxAttributes {
    /// SHA-256 hex digests; mandatory.
    #[serde(default)]
    pub mrsigner: Vec<String>,

    /// Mandatory.
    #[serde(default)]
    pub isvprodid: Vec<u16>,

    /// SHA-256 hex digests; empty means any enclave of the signer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mrenclave: Vec<String>,

    /// Minimum accepted ISV SVN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isvsvn: Option<u16>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_permissions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforce_tcb_upto_date: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct TdxPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<TdxAttributes>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_ids: Vec<Uuid>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct TdxAttributes {
    /// SHA-384 hex digests; mandatory.
    #[serde(default)]
    pub mrsignerseam: Vec<String>,

    /// SHA-384 hex digests; mandatory.
    #[serde(default)]
    pub mrseam: Vec<String>,

    /// Minimum accepted SEAM SVN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seamsvn: Option<u8>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mrtd: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtmr0: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtmr1: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtmr2: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtmr3: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforce_tcb_upto_date: Option<bool>,
}

impl KeyTransferPolicy {
    /// Parse a policy document from a request body. Unknown fields and
    /// unknown attestation types are validation errors.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| Error::Validation(format!("malformed key transfer policy: {e}")))
    }

    /// The single attestation type of a validated policy.
    pub fn attestation_type(&self) -> Result<AttestationType> {
        match self.attestation_type.as_slice() {
            [single] => Ok(*single),
            _ => Err(Error::Validation(
                "exactly one attestation type must be specified".to_string(),
            )),
        }
    }
}

/// Criteria for searching stored policies. Every criterion that is set must
/// match.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PolicyFilter {
    pub attestation_type: Option<AttestationType>,
    pub sgx_mrsigner: Option<String>,
    pub sgx_isvprodid: Option<u16>,
    pub tdx_mrsignerseam: Option<String>,
    pub tdx_mrseam: Option<String>,
}

fn contains_digest(set: &[String], value: &str) -> bool {
    set.iter().any(|d| d.eq_ignore_ascii_case(value))
}

impl PolicyFilter {
    pub fn from_query(params: &HashMap<String, String>) -> Result<Self> {
        let mut filter = Self::default();
        for (name, value) in params {
            match name.as_str() {
                "attestationType" => {
                    filter.attestation_type = Some(value.parse().map_err(|_| {
                        Error::Validation(format!("invalid attestationType filter: {value}"))
                    })?)
                }
                "sgxMrsigner" => filter.sgx_mrsigner = Some(value.clone()),
                "sgxIsvprodid" => {
                    filter.sgx_isvprodid = Some(value.parse().map_err(|_| {
                        Error::Validation(format!("invalid sgxIsvprodid filter: {value}"))
                    })?)
                }
                "tdxMrsignerseam" => filter.tdx_mrsignerseam = Some(value.clone()),
                "tdxMrseam" => filter.tdx_mrseam = Some(value.clone()),
                other => {
                    return Err(Error::Validation(format!(
                        "unknown policy filter: {other}"
                    )))
                }
            }
        }

        Ok(filter)
    }

    pub fn matches(&self, policy: &KeyTransferPolicy) -> bool {
        if let Some(attestation_type) = self.attestation_type {
            if !policy.attestation_type.contains(&attestation_type) {
                return false;
            }
        }

        let sgx = policy.sgx.as_ref().and_then(|p| p.attributes.as_ref());
        if let Some(mrsigner) = &self.sgx_mrsigner {
            if !sgx.is_some_and(|a| contains_digest(&a.mrsigner, mrsigner)) {
                return false;
            }
        }
        if let Some(prodid) = self.sgx_isvprodid {
            if !sgx.is_some_and(|a| a.isvprodid.contains(&prodid)) {
                return false;
            }
        }

        let tdx = policy.tdx.as_ref().and_then(|p| p.attributes.as_ref());
        if let Some(mrsignerseam) = &self.tdx_mrsignerseam {
            if !tdx.is_some_and(|a| contains_digest(&a.mrsignerseam, mrsignerseam)) {
                return false;
            }
        }
        if let Some(mrseam) = &self.tdx_mrseam {
            if !tdx.is_some_and(|a| contains_digest(&a.mrseam, mrseam)) {
                return false;
            }
        }

        true
    }
}
