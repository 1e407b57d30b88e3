// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::Deserialize;
use std::path::PathBuf;

pub const DEFAULT_SAML_CERTS_DIR: &str = "/etc/kbs/certs/trustedca/saml";
pub const DEFAULT_TRUSTED_CA_DIR: &str = "/etc/kbs/certs/trustedca/root";
pub const DEFAULT_TPM_IDENTITY_CERTS_DIR: &str = "/etc/kbs/certs/trustedca/tpm-identity";

/// Trust-store directories for the host-verification report path. Every
/// file in a directory may hold one or more PEM certificates.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SamlConfig {
    /// Certificates allowed to sign a SAML report, or the CAs issuing them.
    #[serde(default = "default_saml_certs_dir")]
    pub saml_certs_dir: PathBuf,

    /// Additional root CAs accepted as issuers of SAML signing certificates.
    #[serde(default = "default_trusted_ca_dir")]
    pub trusted_ca_dir: PathBuf,

    /// CAs that certify TPM binding keys.
    #[serde(default = "default_tpm_identity_certs_dir")]
    pub tpm_identity_certs_dir: PathBuf,
}

fn default_saml_certs_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SAML_CERTS_DIR)
}

fn default_trusted_ca_dir() -> PathBuf {
    PathBuf::from(DEFAULT_TRUSTED_CA_DIR)
}

fn default_tpm_identity_certs_dir() -> PathBuf {
    PathBuf::from(DEFAULT_TPM_IDENTITY_CERTS_DIR)
}

impl Default for SamlConfig {
    fn default() -> Self {
        Self {
            saml_certs_dir: default_saml_certs_dir(),
            trusted_ca_dir: default_trusted_ca_dir(),
            tpm_identity_certs_dir: default_tpm_identity_certs_dir(),
        }
    }
}
