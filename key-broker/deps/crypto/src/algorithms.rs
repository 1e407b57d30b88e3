// Copyright (c) 2024 Alibaba Cloud
// Copyright (c) 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

/// Digests the broker deals in. SGX measurements and the default OAEP wrap
/// use SHA-256; TDX measurements and the TPM binding-key wrap use SHA-384.
#[derive(EnumString, AsRefStr, Display, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[strum(serialize_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    /// Return the hash value length in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
        }
    }

    /// Whether `value` is a hex encoded measurement of exactly this
    /// algorithm's length. Both upper and lower case hex digits are accepted.
    pub fn is_hex_digest(&self, value: &str) -> bool {
        value.len() == self.digest_len() * 2 && hex::decode(value).is_ok()
    }

    /// Bytes of an RSA-OAEP block consumed by padding when this digest
    /// drives both the label hash and MGF1.
    pub fn oaep_overhead(&self) -> usize {
        2 * self.digest_len() + 2
    }
}
