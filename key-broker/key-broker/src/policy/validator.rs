// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use crypto::HashAlgorithm;

use uuid::Uuid;

use super::{AttestationType, KeyTransferPolicy, SgxAttributes, TdxAttributes};
use crate::error::{Error, Result};

fn invalid(msg: impl Into<String>) -> Error {
    Error::Validation(msg.into())
}

fn check_digests(name: &str, values: &[String], alg: HashAlgorithm) -> Result<()> {
    for value in values {
        if !alg.is_hex_digest(value) {
            return Err(invalid(format!(
                "{name} entries must be {}-character hex {} digests",
                alg.digest_len() * 2,
                alg
            )));
        }
    }
    Ok(())
}

fn validate_sgx_attributes(attributes: &SgxAttributes) -> Result<()> {
    if attributes.mrsigner.is_empty() {
        return Err(invalid("sgx mrsigner must not be empty"));
    }
    if attributes.isvprodid.is_empty() {
        return Err(invalid("sgx isvprodid must not be empty"));
    }

    check_digests("sgx mrsigner", &attributes.mrsigner, HashAlgorithm::Sha256)?;
    check_digests("sgx mrenclave", &attributes.mrenclave, HashAlgorithm::Sha256)?;

    for permission in &attributes.client_permissions {
        if permission.trim().is_empty() || permission.chars().any(char::is_control) {
            return Err(invalid("sgx client_permissions contain an invalid entry"));
        }
    }

    Ok(())
}

fn validate_tdx_attributes(attributes: &TdxAttributes) -> Result<()> {
    if attributes.mrsignerseam.is_empty() {
        return Err(invalid("tdx mrsignerseam must not be empty"));
    }
    if attributes.mrseam.is_empty() {
        return Err(invalid("tdx mrseam must not be empty"));
    }

    check_digests("tdx mrsignerseam", &attributes.mrsignerseam, HashAlgorithm::Sha384)?;
    check_digests("tdx mrseam", &attributes.mrseam, HashAlgorithm::Sha384)?;
    check_digests("tdx mrtd", &attributes.mrtd, HashAlgorithm::Sha384)?;

    let rtmrs = [
        ("tdx rtmr0", &attributes.rtmr0),
        ("tdx rtmr1", &attributes.rtmr1),
        ("tdx rtmr2", &attributes.rtmr2),
        ("tdx rtmr3", &attributes.rtmr3),
    ];
    for (name, rtmr) in rtmrs {
        if let Some(rtmr) = rtmr.as_deref().filter(|v| !v.is_empty()) {
            if !HashAlgorithm::Sha384.is_hex_digest(rtmr) {
                return Err(invalid(format!(
                    "{name} must be a 96-character hex sha384 digest"
                )));
            }
        }
    }

    Ok(())
}

/// A token must name one of these to match, so an empty set would make the
/// policy unreachable.
fn check_policy_ids(name: &str, policy_ids: &[Uuid]) -> Result<()> {
    if policy_ids.is_empty() {
        return Err(invalid(format!("{name} policy_ids must not be empty")));
    }
    Ok(())
}

/// Check a policy before it is persisted: exactly one attestation type, the
/// matching attribute block present and well formed, and no block for the
/// other technology.
pub fn validate(policy: &KeyTransferPolicy) -> Result<()> {
    match policy.attestation_type()? {
        AttestationType::Sgx => {
            if policy.tdx.is_some() {
                return Err(invalid("tdx block is not allowed in an SGX policy"));
            }
            let sgx = policy
                .sgx
                .as_ref()
                .ok_or_else(|| invalid("sgx attributes are required for an SGX policy"))?;
            let attributes = sgx
                .attributes
                .as_ref()
                .ok_or_else(|| invalid("sgx attributes are required for an SGX policy"))?;
            validate_sgx_attributes(attributes)?;
            check_policy_ids("sgx", &sgx.policy_ids)
        }
        AttestationType::Tdx => {
            if policy.sgx.is_some() {
                return Err(invalid("sgx block is not allowed in a TDX policy"));
            }
            let tdx = policy
                .tdx
                .as_ref()
                .ok_or_else(|| invalid("tdx attributes are required for a TDX policy"))?;
            let attributes = tdx
                .attributes
                .as_ref()
                .ok_or_else(|| invalid("tdx attributes are required for a TDX policy"))?;
            validate_tdx_attributes(attributes)?;
            check_policy_ids("tdx", &tdx.policy_ids)
        }
    }
}
