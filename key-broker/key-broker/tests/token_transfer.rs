// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

mod common;

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use common::{
    aes_key_request, expires_in, in_memory_broker, sgx_policy_json, CountingKeyManager, FakeAps,
    TokenSigner, MRENCLAVE, MRSIGNER, POLICY_ID,
};
use crypto::HashAlgorithm;
use key_broker::error::{ErrorKind, Result};
use key_broker::release::{unwrap_key, WrappedKey};
use key_broker::{KeyBroker, TransferHeaders, TransferOutcome, TransferRequest};
use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use uuid::Uuid;

struct Enclave {
    envelope: RsaPrivateKey,
    signer: TokenSigner,
}

impl Enclave {
    fn new() -> Self {
        Self {
            envelope: RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap(),
            signer: TokenSigner::new(),
        }
    }

    fn claims(&self, tcb_status: &str, policy_ids: &[Uuid]) -> Value {
        let held_data = crypto::rsa::envelope_key_bytes(&self.envelope.to_public_key()).unwrap();
        json!({
            "sgx_mrenclave": MRENCLAVE,
            "sgx_mrsigner": MRSIGNER,
            "sgx_isvprodid": 1,
            "sgx_isvsvn": 0,
            "attester_tcb_status": tcb_status,
            "policy_ids": policy_ids,
            "attester_held_data": STANDARD.encode(held_data),
            "exp": expires_in(300),
        })
    }

    /// Ask for the key, answer the challenge with a token built from
    /// `claims` and bound to the challenge nonce, and return the final
    /// outcome.
    async fn request_key(&self, broker: &KeyBroker, id: &Uuid, claims: &Value) -> Result<TransferOutcome> {
        let challenge = broker
            .transfer_with_token(id, &TransferRequest::from_json(b"")?, &TransferHeaders::default())
            .await?;
        let TransferOutcome::Challenge {
            nonce,
            attestation_type,
        } = challenge
        else {
            panic!("key released without evidence");
        };

        let mut claims = claims.clone();
        claims["verifier_nonce"] = json!(nonce.as_str());
        let headers = TransferHeaders {
            authorization: Some(format!("Bearer {}", self.signer.sign(&claims))),
            attestation_type: Some(attestation_type.to_string()),
            nonce: Some(nonce),
        };
        broker
            .transfer_with_token(id, &TransferRequest::default(), &headers)
            .await
    }
}

fn setup(enclave: &Enclave) -> (KeyBroker, Arc<CountingKeyManager>) {
    let backend = Arc::new(CountingKeyManager::default());
    let broker = in_memory_broker(FakeAps::new(&enclave.signer.cert_pem), backend.clone());
    (broker, backend)
}

#[tokio::test]
async fn released_key_opens_only_with_envelope_key() {
    let enclave = Enclave::new();
    let (broker, _) = setup(&enclave);
    let p1 = Uuid::new_v4();
    let policy = broker
        .create_policy(sgx_policy_json(&[p1, Uuid::new_v4()]))
        .await
        .unwrap();
    let key = broker.create_key(&aes_key_request(policy.id)).await.unwrap();

    let outcome = enclave
        .request_key(&broker, &key.id, &enclave.claims("OK", &[p1]))
        .await
        .unwrap();
    let TransferOutcome::Released(response) = outcome else {
        panic!("expected a released key");
    };
    assert_eq!(response.id, key.id);

    let wrapped = WrappedKey {
        wrapped_key: STANDARD.decode(&response.wrapped_key).unwrap(),
        wrapped_swk: None,
    };
    let released = unwrap_key(&enclave.envelope, &wrapped, HashAlgorithm::Sha256, None).unwrap();
    assert_eq!(released.len(), 32);

    let stranger = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
    assert!(unwrap_key(&stranger, &wrapped, HashAlgorithm::Sha256, None).is_err());
}

#[tokio::test]
async fn rejected_evidence_never_touches_key_material() {
    let enclave = Enclave::new();
    let (broker, backend) = setup(&enclave);
    let p1 = Uuid::new_v4();
    let policy = broker.create_policy(sgx_policy_json(&[p1])).await.unwrap();
    let key = broker.create_key(&aes_key_request(policy.id)).await.unwrap();
    let calls_after_create = backend.calls();

    for claims in [
        enclave.claims("", &[p1]),
        enclave.claims("OUT_OF_DATE", &[p1]),
        enclave.claims("OK", &[Uuid::new_v4()]),
    ] {
        let err = enclave
            .request_key(&broker, &key.id, &claims)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(err.public_message(), "unauthorized");
    }
    assert_eq!(backend.calls(), calls_after_create);
}

#[tokio::test]
async fn token_from_unknown_signer_is_rejected() {
    let enclave = Enclave::new();
    let (broker, _) = setup(&enclave);
    let policy = broker.create_policy(sgx_policy_json(&[POLICY_ID])).await.unwrap();
    let key = broker.create_key(&aes_key_request(policy.id)).await.unwrap();

    let impostor = Enclave::new();
    let err = impostor
        .request_key(&broker, &key.id, &impostor.claims("OK", &[POLICY_ID]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}
