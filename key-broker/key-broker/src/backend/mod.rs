// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Key-manager backends hold the raw key material. A KMIP server is the
//! production backend; the in-tree ones keep material in memory or on disk.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::config::{BackendType, KeyManagerConfig};
use crate::keys::KeyAlgorithm;

pub mod directory;
pub mod memory;

pub use directory::DirectoryKeyManager;
pub use memory::MemoryKeyManager;

/// Key material handed to a backend for registration.
pub struct KeyMaterial {
    pub algorithm: KeyAlgorithm,

    /// Raw bytes for AES, PKCS#8 DER for RSA and EC.
    pub bytes: Zeroizing<Vec<u8>>,
}

#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Generate an AES key of `length_bits` and return its backend ID.
    async fn create_symmetric_key(&self, length_bits: u32) -> Result<String>;

    /// Store caller-supplied material and return its backend ID.
    async fn register_key(&self, material: KeyMaterial) -> Result<String>;

    /// Whether the backend holds material under `backend_id`.
    async fn contains_key(&self, backend_id: &str) -> Result<bool>;

    /// `None` if the backend has no material under `backend_id`.
    async fn get_key(&self, backend_id: &str) -> Result<Option<Zeroizing<Vec<u8>>>>;

    /// Returns `false` if there was nothing to delete.
    async fn delete_key(&self, backend_id: &str) -> Result<bool>;
}

pub(crate) fn generate_symmetric_key(length_bits: u32) -> Zeroizing<Vec<u8>> {
    use rand::RngCore;

    let mut key = Zeroizing::new(vec![0u8; (length_bits / 8) as usize]);
    rand::thread_rng().fill_bytes(&mut key);
    key
}

pub async fn new_key_manager(config: &KeyManagerConfig) -> Result<Arc<dyn KeyManager>> {
    match config.manager_type {
        BackendType::Memory => Ok(Arc::new(MemoryKeyManager::default())),
        BackendType::Directory => Ok(Arc::new(
            DirectoryKeyManager::new(&config.directory_path).await?,
        )),
    }
}
