// Copyright (c) 2023 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

pub mod rsa {
    pub use crate::rust::rsa::*;

    /// Padding modes a released key can be wrapped with. Refer to
    /// <https://datatracker.ietf.org/doc/html/rfc7518#section-4.1> for
    /// the naming.
    #[derive(EnumString, AsRefStr, PartialEq, Debug, Clone, Copy)]
    pub enum PaddingMode {
        /// RSAES OAEP using SHA-256 and MGF1 with SHA-256
        #[strum(serialize = "RSA-OAEP-256")]
        Oaep256,

        /// RSAES OAEP using SHA-384 and MGF1 with SHA-384
        #[strum(serialize = "RSA-OAEP-384")]
        Oaep384,
    }

    impl PaddingMode {
        pub fn hash_algorithm(&self) -> crate::HashAlgorithm {
            match self {
                PaddingMode::Oaep256 => crate::HashAlgorithm::Sha256,
                PaddingMode::Oaep384 => crate::HashAlgorithm::Sha384,
            }
        }
    }

    /// OAEP label a TPM expects when it unwraps with a binding key.
    pub const TPM2_OAEP_LABEL: &str = "TPM2\0";

    /// Length in bytes of the public exponent in the canonical envelope key
    /// encoding.
    pub const ENVELOPE_EXPONENT_LEN: usize = 4;

}

pub mod ec {
    /// Curves accepted for registered EC keys.
    #[derive(EnumString, AsRefStr, Display, Debug, Clone, Copy, PartialEq)]
    pub enum Curve {
        #[strum(to_string = "prime256v1", serialize = "P-256")]
        P256,

        #[strum(to_string = "secp384r1", serialize = "P-384")]
        P384,

        #[strum(to_string = "secp521r1", serialize = "P-521")]
        P521,
    }
}
