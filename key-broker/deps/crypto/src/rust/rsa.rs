// Copyright (c) 2023 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! RSA-OAEP wrapping under an envelope public key, and the canonical
//! `exponent || modulus` encoding used to bind an envelope key to evidence.

use anyhow::*;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Sha256, Sha384};
use zeroize::Zeroizing;

use crate::asymmetric::rsa::ENVELOPE_EXPONENT_LEN;
use crate::HashAlgorithm;

pub use rsa::{RsaPrivateKey as PrivateKey, RsaPublicKey as PublicKey};

fn oaep_padding(hash: HashAlgorithm, label: Option<&str>) -> Oaep {
    match (hash, label) {
        (HashAlgorithm::Sha256, None) => Oaep::new::<Sha256>(),
        (HashAlgorithm::Sha384, None) => Oaep::new::<Sha384>(),
        (HashAlgorithm::Sha256, Some(label)) => Oaep::new_with_label::<Sha256, _>(label),
        (HashAlgorithm::Sha384, Some(label)) => Oaep::new_with_label::<Sha384, _>(label),
    }
}

/// Largest payload that fits in a single OAEP block for `public_key`.
pub fn max_oaep_payload(public_key: &RsaPublicKey, hash: HashAlgorithm) -> usize {
    public_key.size().saturating_sub(hash.oaep_overhead())
}

/// Encrypt `data` with RSA-OAEP (MGF1 uses the same digest as the label hash).
pub fn encrypt_oaep(
    public_key: &RsaPublicKey,
    hash: HashAlgorithm,
    label: Option<&str>,
    data: &[u8],
) -> Result<Vec<u8>> {
    if data.len() > max_oaep_payload(public_key, hash) {
        bail!(
            "payload of {} bytes does not fit a {}-bit OAEP block",
            data.len(),
            public_key.size() * 8
        );
    }

    let mut rng = rand::thread_rng();
    public_key
        .encrypt(&mut rng, oaep_padding(hash, label), data)
        .map_err(|e| anyhow!("RSA-OAEP encryption failed: {e}"))
}

pub fn decrypt_oaep(
    private_key: &RsaPrivateKey,
    hash: HashAlgorithm,
    label: Option<&str>,
    data: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    private_key
        .decrypt(oaep_padding(hash, label), data)
        .map(Zeroizing::new)
        .map_err(|e| anyhow!("RSA-OAEP decryption failed: {e}"))
}

/// Canonical encoding of an RSA envelope key: the public exponent as a
/// 4-byte big-endian integer followed by the big-endian modulus.
pub fn envelope_key_bytes(public_key: &RsaPublicKey) -> Result<Vec<u8>> {
    let exponent = public_key.e().to_bytes_be();
    if exponent.len() > ENVELOPE_EXPONENT_LEN {
        bail!("public exponent does not fit in {ENVELOPE_EXPONENT_LEN} bytes");
    }

    let mut encoded = vec![0u8; ENVELOPE_EXPONENT_LEN - exponent.len()];
    encoded.extend_from_slice(&exponent);
    encoded.extend_from_slice(&public_key.n().to_bytes_be());
    Ok(encoded)
}

/// Rebuild an envelope key from its canonical encoding.
pub fn envelope_key_from_bytes(encoded: &[u8]) -> Result<RsaPublicKey> {
    if encoded.len() <= ENVELOPE_EXPONENT_LEN {
        bail!("envelope key encoding too short: {} bytes", encoded.len());
    }

    let (exponent, modulus) = encoded.split_at(ENVELOPE_EXPONENT_LEN);
    RsaPublicKey::new(
        BigUint::from_bytes_be(modulus),
        BigUint::from_bytes_be(exponent),
    )
    .map_err(|e| anyhow!("invalid RSA envelope key: {e}"))
}

/// Parse a PEM encoded RSA public key, either SubjectPublicKeyInfo
/// (`PUBLIC KEY`) or PKCS#1 (`RSA PUBLIC KEY`).
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey> {
    let pem = pem.trim();
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| anyhow!("not an RSA public key: {e}"))
}

/// Parse a DER SubjectPublicKeyInfo carrying an RSA key.
pub fn public_key_from_spki_der(der: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(der).map_err(|e| anyhow!("not an RSA public key: {e}"))
}

#[cfg(test)]
mod tests {
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rstest::rstest;

    use super::*;

    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("generate rsa key");
        let public_key = RsaPublicKey::from(&private_key);
        (private_key, public_key)
    }

    #[rstest]
    #[case(HashAlgorithm::Sha256, None)]
    #[case(HashAlgorithm::Sha384, Some("TPM2\0"))]
    fn oaep_wrap_unwrap(#[case] hash: HashAlgorithm, #[case] label: Option<&str>) {
        let (private_key, public_key) = keypair();
        let secret = [7u8; 32];
        let wrapped = encrypt_oaep(&public_key, hash, label, &secret).unwrap();
        let unwrapped = decrypt_oaep(&private_key, hash, label, &wrapped).unwrap();
        assert_eq!(unwrapped.as_slice(), &secret);
    }

    #[test]
    fn oaep_wrong_key_never_decrypts() {
        let (_, public_key) = keypair();
        let (other_private, _) = keypair();
        let wrapped = encrypt_oaep(&public_key, HashAlgorithm::Sha256, None, &[1u8; 16]).unwrap();
        assert!(decrypt_oaep(&other_private, HashAlgorithm::Sha256, None, &wrapped).is_err());
    }

    #[test]
    fn oaep_label_mismatch_fails() {
        let (private_key, public_key) = keypair();
        let wrapped =
            encrypt_oaep(&public_key, HashAlgorithm::Sha384, Some("TPM2\0"), &[1u8; 16]).unwrap();
        assert!(decrypt_oaep(&private_key, HashAlgorithm::Sha384, None, &wrapped).is_err());
    }

    #[test]
    fn oaep_rejects_oversized_payload() {
        let (_, public_key) = keypair();
        let too_big = vec![0u8; max_oaep_payload(&public_key, HashAlgorithm::Sha256) + 1];
        assert!(encrypt_oaep(&public_key, HashAlgorithm::Sha256, None, &too_big).is_err());
    }

    #[test]
    fn envelope_encoding_round_trip() {
        let (_, public_key) = keypair();
        let encoded = envelope_key_bytes(&public_key).unwrap();
        assert_eq!(&encoded[..4], &[0, 1, 0, 1]);
        assert_eq!(encoded.len(), 4 + 256);
        let decoded = envelope_key_from_bytes(&encoded).unwrap();
        assert_eq!(decoded, public_key);
    }

    #[test]
    fn envelope_encoding_too_short() {
        assert!(envelope_key_from_bytes(&[0, 1, 0, 1]).is_err());
    }

    #[test]
    fn parse_pem_public_key() {
        let (_, public_key) = keypair();
        let pem = public_key.to_public_key_pem(LineEnding::LF).unwrap();
        assert_eq!(public_key_from_pem(&pem).unwrap(), public_key);
        assert!(public_key_from_pem("-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----").is_err());
    }
}
