// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Persistence for key transfer policies and key metadata.

use anyhow::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{BackendType, StoreConfig};
use crate::keys::KeyAttributes;
use crate::policy::KeyTransferPolicy;

pub mod directory;
pub mod memory;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;

/// A record that a [`Store`] keeps under its UUID.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Sub-directory name used by the directory store.
    const KIND: &'static str;

    fn id(&self) -> Uuid;
}

impl Record for KeyTransferPolicy {
    const KIND: &'static str = "keys-transfer-policy";

    fn id(&self) -> Uuid {
        self.id
    }
}

impl Record for KeyAttributes {
    const KIND: &'static str = "keys";

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Each write is atomic per ID. Searching is done by listing and filtering in
/// the caller.
#[async_trait]
pub trait Store<T: Record>: Send + Sync {
    /// Fails if a record with the same ID already exists.
    async fn create(&self, record: &T) -> Result<()>;

    async fn retrieve(&self, id: &Uuid) -> Result<Option<T>>;

    /// Returns `false` if there was nothing to update.
    async fn update(&self, record: &T) -> Result<bool>;

    /// Returns `false` if there was nothing to delete.
    async fn delete(&self, id: &Uuid) -> Result<bool>;

    async fn list(&self) -> Result<Vec<T>>;
}

pub type PolicyStore = dyn Store<KeyTransferPolicy>;
pub type KeyStore = dyn Store<KeyAttributes>;

pub async fn new_store<T: Record>(config: &StoreConfig) -> Result<Arc<dyn Store<T>>> {
    match config.store_type {
        BackendType::Memory => Ok(Arc::new(MemoryStore::<T>::default())),
        BackendType::Directory => Ok(Arc::new(
            DirectoryStore::<T>::new(&config.directory_path).await?,
        )),
    }
}
