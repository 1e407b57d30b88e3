// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Matching of attestation token claims against a key transfer policy.
//!
//! Attributes are checked one at a time and the first mismatch rejects. The
//! name of the failing attribute is logged; measured and expected values are
//! not.

use log::{debug, warn};
use uuid::Uuid;

use super::AttestationTokenClaim;
use crate::error::{Error, Result};
use crate::policy::{AttestationType, KeyTransferPolicy, SgxAttributes, TdxAttributes};

const TCB_STATUS_OK: &str = "OK";

/// Name of the attribute that failed to match.
struct Mismatch(&'static str);

type Check = std::result::Result<(), Mismatch>;

fn required<'a>(value: Option<&'a str>, name: &'static str) -> std::result::Result<&'a str, Mismatch> {
    value.filter(|v| !v.is_empty()).ok_or(Mismatch(name))
}

/// The claimed digest must be one of the policy's. An empty policy set can
/// never match.
fn digest_in_set(claim: &str, set: &[String], name: &'static str) -> Check {
    if set.iter().any(|d| d.eq_ignore_ascii_case(claim)) {
        Ok(())
    } else {
        Err(Mismatch(name))
    }
}

fn at_least<T: PartialOrd + Copy>(claim: Option<T>, minimum: Option<T>, name: &'static str) -> Check {
    let claim = claim.ok_or(Mismatch(name))?;
    match minimum {
        Some(minimum) if claim < minimum => Err(Mismatch(name)),
        _ => Ok(()),
    }
}

fn check_tcb_status(claims: &AttestationTokenClaim) -> Check {
    match claims.attester_tcb_status.as_deref() {
        Some(TCB_STATUS_OK) => Ok(()),
        _ => Err(Mismatch("tcb_status")),
    }
}

/// The token must have been appraised against at least one of the policy's
/// attestation-service policies. An empty policy set never matches.
fn check_policy_ids(claimed: &[Uuid], required: &[Uuid]) -> Check {
    if claimed.iter().any(|id| required.contains(id)) {
        Ok(())
    } else {
        Err(Mismatch("policy_ids"))
    }
}

fn match_sgx(attributes: &SgxAttributes, policy_ids: &[Uuid], claims: &AttestationTokenClaim) -> Check {
    let mrsigner = required(claims.sgx_mrsigner.as_deref(), "mrsigner")?;
    digest_in_set(mrsigner, &attributes.mrsigner, "mrsigner")?;

    let isvprodid = claims.sgx_isvprodid.ok_or(Mismatch("isvprodid"))?;
    if !attributes.isvprodid.contains(&isvprodid) {
        return Err(Mismatch("isvprodid"));
    }

    if !attributes.mrenclave.is_empty() {
        let mrenclave = required(claims.sgx_mrenclave.as_deref(), "mrenclave")?;
        digest_in_set(mrenclave, &attributes.mrenclave, "mrenclave")?;
    }

    at_least(claims.sgx_isvsvn, attributes.isvsvn, "isvsvn")?;
    check_tcb_status(claims)?;
    check_policy_ids(&claims.policy_ids, policy_ids)
}

fn match_rtmr(claim: Option<&str>, policy: Option<&str>, name: &'static str) -> Check {
    match policy.filter(|v| !v.is_empty()) {
        Some(expected) => {
            let claim = required(claim, name)?;
            if claim.eq_ignore_ascii_case(expected) {
                Ok(())
            } else {
                Err(Mismatch(name))
            }
        }
        None => Ok(()),
    }
}

fn match_tdx(attributes: &TdxAttributes, policy_ids: &[Uuid], claims: &AttestationTokenClaim) -> Check {
    let mrsignerseam = required(claims.tdx_mrsignerseam.as_deref(), "mrsignerseam")?;
    digest_in_set(mrsignerseam, &attributes.mrsignerseam, "mrsignerseam")?;

    let mrseam = required(claims.tdx_mrseam.as_deref(), "mrseam")?;
    digest_in_set(mrseam, &attributes.mrseam, "mrseam")?;

    at_least(claims.tdx_seamsvn, attributes.seamsvn, "seamsvn")?;

    if !attributes.mrtd.is_empty() {
        let mrtd = required(claims.tdx_mrtd.as_deref(), "mrtd")?;
        digest_in_set(mrtd, &attributes.mrtd, "mrtd")?;
    }

    match_rtmr(claims.tdx_rtmr0.as_deref(), attributes.rtmr0.as_deref(), "rtmr0")?;
    match_rtmr(claims.tdx_rtmr1.as_deref(), attributes.rtmr1.as_deref(), "rtmr1")?;
    match_rtmr(claims.tdx_rtmr2.as_deref(), attributes.rtmr2.as_deref(), "rtmr2")?;
    match_rtmr(claims.tdx_rtmr3.as_deref(), attributes.rtmr3.as_deref(), "rtmr3")?;

    check_tcb_status(claims)?;
    check_policy_ids(&claims.policy_ids, policy_ids)
}

/// Decide whether the claims of a verified token satisfy a policy. A policy
/// without an attribute block for its attestation type never matches.
pub fn match_claims(policy: &KeyTransferPolicy, claims: &AttestationTokenClaim) -> Result<()> {
    let attestation_type = policy.attestation_type()?;
    let outcome = match attestation_type {
        AttestationType::Sgx => match policy.sgx.as_ref() {
            Some(sgx) => match sgx.attributes.as_ref() {
                Some(attributes) => match_sgx(attributes, &sgx.policy_ids, claims),
                None => Err(Mismatch("sgx attributes")),
            },
            None => Err(Mismatch("sgx attributes")),
        },
        AttestationType::Tdx => match policy.tdx.as_ref() {
            Some(tdx) => match tdx.attributes.as_ref() {
                Some(attributes) => match_tdx(attributes, &tdx.policy_ids, claims),
                None => Err(Mismatch("tdx attributes")),
            },
            None => Err(Mismatch("tdx attributes")),
        },
    };

    match outcome {
        Ok(()) => {
            debug!("{attestation_type} claims match policy {}", policy.id);
            Ok(())
        }
        Err(Mismatch(attribute)) => {
            warn!(
                "{attestation_type} claims rejected by policy {}: {attribute} mismatch",
                policy.id
            );
            Err(Error::Unauthorized(format!("{attribute} mismatch")))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use rstest::rstest;

    use super::*;
    use crate::error::ErrorKind;
    use crate::policy::tests::{
        sgx_policy, tdx_policy, MRENCLAVE, MRSEAM, MRSIGNER, MRSIGNERSEAM, MRTD, POLICY_ID,
    };

    pub(crate) fn sgx_claim(policy_ids: Vec<Uuid>) -> AttestationTokenClaim {
        AttestationTokenClaim {
            sgx_mrenclave: Some(MRENCLAVE.to_string()),
            sgx_mrsigner: Some(MRSIGNER.to_string()),
            sgx_isvprodid: Some(1),
            sgx_isvsvn: Some(0),
            attester_tcb_status: Some("OK".to_string()),
            policy_ids,
            ..Default::default()
        }
    }

    pub(crate) fn tdx_claim(policy_ids: Vec<Uuid>) -> AttestationTokenClaim {
        AttestationTokenClaim {
            tdx_mrsignerseam: Some(MRSIGNERSEAM.to_string()),
            tdx_mrseam: Some(MRSEAM.to_string()),
            tdx_seamsvn: Some(2),
            tdx_mrtd: Some(MRTD.to_string()),
            attester_tcb_status: Some("OK".to_string()),
            policy_ids,
            ..Default::default()
        }
    }

    fn flip_last_hex(digest: &str) -> String {
        let mut altered = digest[..digest.len() - 1].to_string();
        altered.push(if digest.ends_with('0') { '1' } else { '0' });
        altered
    }

    fn assert_rejected(policy: &KeyTransferPolicy, claims: &AttestationTokenClaim) {
        let err = match_claims(policy, claims).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn test_sgx_policy_id_family() {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let p3 = Uuid::new_v4();
        let policy = sgx_policy(vec![p1, p2]);

        // measurements match but the token was appraised against P3 only
        assert_rejected(&policy, &sgx_claim(vec![p3]));
        match_claims(&policy, &sgx_claim(vec![p1])).unwrap();
        match_claims(&policy, &sgx_claim(vec![p3, p2])).unwrap();
    }

    #[test]
    fn test_empty_policy_id_set_rejects() {
        assert_rejected(&sgx_policy(vec![]), &sgx_claim(vec![]));
        assert_rejected(&sgx_policy(vec![]), &sgx_claim(vec![POLICY_ID]));
        assert_rejected(&tdx_policy(vec![]), &tdx_claim(vec![Uuid::new_v4()]));
        assert_rejected(&tdx_policy(vec![POLICY_ID]), &tdx_claim(vec![]));
    }

    #[test]
    fn test_empty_tcb_status_rejected() {
        let p1 = Uuid::new_v4();
        let mut claims = sgx_claim(vec![p1]);
        claims.attester_tcb_status = Some(String::new());
        assert_rejected(&sgx_policy(vec![p1]), &claims);
    }

    #[test]
    fn test_tdx_mrseam_altered() {
        let policy = tdx_policy(vec![POLICY_ID]);
        match_claims(&policy, &tdx_claim(vec![POLICY_ID])).unwrap();

        let mut claims = tdx_claim(vec![POLICY_ID]);
        claims.tdx_mrseam = Some(flip_last_hex(MRSEAM));
        assert_rejected(&policy, &claims);
    }

    #[rstest]
    #[case::mrsigner_missing(|c: &mut AttestationTokenClaim| c.sgx_mrsigner = None)]
    #[case::mrsigner_empty(|c: &mut AttestationTokenClaim| c.sgx_mrsigner = Some(String::new()))]
    #[case::mrsigner_other(|c: &mut AttestationTokenClaim| c.sgx_mrsigner = Some("ff".repeat(32)))]
    #[case::isvprodid_missing(|c: &mut AttestationTokenClaim| c.sgx_isvprodid = None)]
    #[case::isvprodid_other(|c: &mut AttestationTokenClaim| c.sgx_isvprodid = Some(2))]
    #[case::mrenclave_missing(|c: &mut AttestationTokenClaim| c.sgx_mrenclave = None)]
    #[case::mrenclave_other(|c: &mut AttestationTokenClaim| c.sgx_mrenclave = Some(flip_last_hex(MRENCLAVE)))]
    #[case::isvsvn_missing(|c: &mut AttestationTokenClaim| c.sgx_isvsvn = None)]
    #[case::tcb_status_missing(|c: &mut AttestationTokenClaim| c.attester_tcb_status = None)]
    #[case::tcb_out_of_date(|c: &mut AttestationTokenClaim| c.attester_tcb_status = Some("OutOfDate".to_string()))]
    #[case::tcb_lowercase(|c: &mut AttestationTokenClaim| c.attester_tcb_status = Some("ok".to_string()))]
    fn test_sgx_claim_rejected(#[case] mutate: fn(&mut AttestationTokenClaim)) {
        let mut claims = sgx_claim(vec![POLICY_ID]);
        mutate(&mut claims);
        assert_rejected(&sgx_policy(vec![POLICY_ID]), &claims);
    }

    #[rstest]
    #[case::mrsignerseam_missing(|c: &mut AttestationTokenClaim| c.tdx_mrsignerseam = None)]
    #[case::mrseam_empty(|c: &mut AttestationTokenClaim| c.tdx_mrseam = Some(String::new()))]
    #[case::seamsvn_missing(|c: &mut AttestationTokenClaim| c.tdx_seamsvn = None)]
    #[case::seamsvn_below(|c: &mut AttestationTokenClaim| c.tdx_seamsvn = Some(1))]
    #[case::mrtd_other(|c: &mut AttestationTokenClaim| c.tdx_mrtd = Some(flip_last_hex(MRTD)))]
    #[case::mrtd_missing(|c: &mut AttestationTokenClaim| c.tdx_mrtd = None)]
    #[case::tcb_status_empty(|c: &mut AttestationTokenClaim| c.attester_tcb_status = Some(String::new()))]
    fn test_tdx_claim_rejected(#[case] mutate: fn(&mut AttestationTokenClaim)) {
        let mut claims = tdx_claim(vec![POLICY_ID]);
        mutate(&mut claims);
        assert_rejected(&tdx_policy(vec![POLICY_ID]), &claims);
    }

    #[rstest]
    #[case(Some(0), 0, true)]
    #[case(Some(3), 2, false)]
    #[case(Some(3), 3, true)]
    #[case(Some(3), 4, true)]
    #[case(None, 0, true)]
    fn test_isvsvn_minimum(#[case] minimum: Option<u16>, #[case] claimed: u16, #[case] ok: bool) {
        let mut policy = sgx_policy(vec![POLICY_ID]);
        policy.sgx.as_mut().unwrap().attributes.as_mut().unwrap().isvsvn = minimum;
        let mut claims = sgx_claim(vec![POLICY_ID]);
        claims.sgx_isvsvn = Some(claimed);
        assert_eq!(match_claims(&policy, &claims).is_ok(), ok);
    }

    #[test]
    fn test_set_membership_any_of() {
        let mut policy = sgx_policy(vec![POLICY_ID]);
        let attributes = policy.sgx.as_mut().unwrap().attributes.as_mut().unwrap();
        attributes.mrsigner = vec!["11".repeat(32), MRSIGNER.to_uppercase(), "22".repeat(32)];
        attributes.isvprodid = vec![7, 1, 9];
        attributes.mrenclave.clear();

        let mut claims = sgx_claim(vec![POLICY_ID]);
        claims.sgx_mrenclave = None;
        match_claims(&policy, &claims).unwrap();
    }

    #[test]
    fn test_empty_mandatory_policy_set_rejects() {
        let mut policy = sgx_policy(vec![POLICY_ID]);
        policy.sgx.as_mut().unwrap().attributes.as_mut().unwrap().mrsigner.clear();
        assert_rejected(&policy, &sgx_claim(vec![POLICY_ID]));

        let mut policy = tdx_policy(vec![POLICY_ID]);
        policy.tdx.as_mut().unwrap().attributes.as_mut().unwrap().mrseam.clear();
        assert_rejected(&policy, &tdx_claim(vec![POLICY_ID]));
    }

    #[test]
    fn test_rtmr_exact_match() {
        let rtmr = "ab".repeat(48);
        let mut policy = tdx_policy(vec![POLICY_ID]);
        policy.tdx.as_mut().unwrap().attributes.as_mut().unwrap().rtmr1 = Some(rtmr.clone());

        let mut claims = tdx_claim(vec![POLICY_ID]);
        assert_rejected(&policy, &claims);

        claims.tdx_rtmr1 = Some(flip_last_hex(&rtmr));
        assert_rejected(&policy, &claims);

        claims.tdx_rtmr1 = Some(rtmr.to_uppercase());
        match_claims(&policy, &claims).unwrap();

        // an empty expected value means the register is not checked
        policy.tdx.as_mut().unwrap().attributes.as_mut().unwrap().rtmr1 = Some(String::new());
        claims.tdx_rtmr1 = None;
        match_claims(&policy, &claims).unwrap();
    }

    #[test]
    fn test_missing_attribute_block_rejects() {
        let mut policy = sgx_policy(vec![POLICY_ID]);
        policy.sgx.as_mut().unwrap().attributes = None;
        assert_rejected(&policy, &sgx_claim(vec![POLICY_ID]));

        let mut policy = tdx_policy(vec![POLICY_ID]);
        policy.tdx = None;
        assert_rejected(&policy, &tdx_claim(vec![POLICY_ID]));
    }

    #[test]
    fn test_claims_of_other_technology_rejected() {
        assert_rejected(&sgx_policy(vec![POLICY_ID]), &tdx_claim(vec![POLICY_ID]));
        assert_rejected(&tdx_policy(vec![POLICY_ID]), &sgx_claim(vec![POLICY_ID]));
    }
}
