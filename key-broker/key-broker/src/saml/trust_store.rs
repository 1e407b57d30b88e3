// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use std::path::Path;
use tokio::fs;
use x509_parser::certificate::X509Certificate;
use x509_parser::parse_x509_certificate;
use x509_parser::pem::Pem;

/// Longest run of intermediates accepted between a certificate and a
/// trusted issuer.
const MAX_CHAIN_DEPTH: usize = 8;

/// A set of trusted certificates loaded from PEM files.
#[derive(Default, Clone)]
pub struct TrustStore {
    certs: Vec<Vec<u8>>,
}

/// Whether `cert` may issue certificates with `below` CA certificates
/// between it and the end entity.
fn may_issue(cert: &X509Certificate, below: usize) -> bool {
    match cert.basic_constraints() {
        Ok(Some(ext)) if ext.value.ca => ext
            .value
            .path_len_constraint
            .map_or(true, |limit| below <= limit as usize),
        _ => false,
    }
}

fn issued_by(cert: &X509Certificate, issuer: &X509Certificate, below: usize) -> bool {
    issuer.subject() == cert.issuer()
        && issuer.validity().is_valid()
        && may_issue(issuer, below)
        && cert.verify_signature(Some(issuer.public_key())).is_ok()
}

impl TrustStore {
    pub fn from_pem(bundle: &[u8]) -> Result<Self> {
        let mut store = Self::default();
        store.add_pem(bundle)?;
        Ok(store)
    }

    /// Load every certificate of every file in `dir`. A missing directory
    /// yields an empty store.
    pub async fn load_dir(dir: &Path) -> Result<Self> {
        let mut store = Self::default();
        if !fs::try_exists(dir).await.unwrap_or(false) {
            warn!("Trust store directory {} does not exist", dir.display());
            return Ok(store);
        }

        let mut entries = fs::read_dir(dir)
            .await
            .with_context(|| format!("read trust store {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !fs::metadata(&path).await?.is_file() {
                continue;
            }
            let content = fs::read(&path)
                .await
                .with_context(|| format!("read {}", path.display()))?;
            store
                .add_pem(&content)
                .with_context(|| format!("load certificates from {}", path.display()))?;
        }

        debug!(
            "Loaded {} trusted certificates from {}",
            store.certs.len(),
            dir.display()
        );
        Ok(store)
    }

    fn add_pem(&mut self, bundle: &[u8]) -> Result<()> {
        for pem in Pem::iter_from_buffer(bundle) {
            let pem = pem.map_err(|e| anyhow!("malformed PEM: {e}"))?;
            if pem.label != "CERTIFICATE" {
                continue;
            }
            pem.parse_x509().context("parse certificate")?;
            self.certs.push(pem.contents);
        }
        Ok(())
    }

    pub fn merge(mut self, other: TrustStore) -> Self {
        self.certs.extend(other.certs);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn verify(&self, der: &[u8]) -> Result<()> {
        self.verify_chain(der, &[])
    }

    /// Accept `der` if it is itself trusted, or if it is within its validity
    /// period and a chain of CA certificates leads from it to a trusted CA.
    /// `intermediates` are untrusted candidates for the links in between.
    pub fn verify_chain(&self, der: &[u8], intermediates: &[Vec<u8>]) -> Result<()> {
        let (_, leaf) = parse_x509_certificate(der).context("parse certificate")?;
        if !leaf.validity().is_valid() {
            bail!("certificate is outside its validity period");
        }
        if self.certs.iter().any(|trusted| trusted.as_slice() == der) {
            return Ok(());
        }

        let anchors: Vec<X509Certificate> = self
            .certs
            .iter()
            .filter_map(|trusted| parse_x509_certificate(trusted).ok().map(|(_, c)| c))
            .collect();
        let candidates = intermediates
            .iter()
            .map(|der| parse_x509_certificate(der).map(|(_, c)| c))
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("parse intermediate certificate")?;

        let mut used = vec![false; candidates.len()];
        let mut current = &leaf;
        for below in 0..=MAX_CHAIN_DEPTH {
            if anchors.iter().any(|anchor| issued_by(current, anchor, below)) {
                return Ok(());
            }
            let next = candidates
                .iter()
                .enumerate()
                .find(|(i, candidate)| !used[*i] && issued_by(current, candidate, below));
            match next {
                Some((i, issuer)) => {
                    used[i] = true;
                    current = issuer;
                }
                None => break,
            }
        }

        bail!("certificate does not chain to a trusted CA")
    }
}
