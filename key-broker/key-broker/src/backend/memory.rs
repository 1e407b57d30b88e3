// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{generate_symmetric_key, KeyManager, KeyMaterial};

#[derive(Default)]
pub struct MemoryKeyManager {
    keys: RwLock<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemoryKeyManager {
    async fn insert(&self, bytes: Zeroizing<Vec<u8>>) -> String {
        let id = Uuid::new_v4().to_string();
        self.keys.write().await.insert(id.clone(), bytes);
        id
    }
}

#[async_trait]
impl KeyManager for MemoryKeyManager {
    async fn create_symmetric_key(&self, length_bits: u32) -> Result<String> {
        Ok(self.insert(generate_symmetric_key(length_bits)).await)
    }

    async fn register_key(&self, material: KeyMaterial) -> Result<String> {
        Ok(self.insert(material.bytes).await)
    }

    async fn contains_key(&self, backend_id: &str) -> Result<bool> {
        Ok(self.keys.read().await.contains_key(backend_id))
    }

    async fn get_key(&self, backend_id: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        Ok(self.keys.read().await.get(backend_id).cloned())
    }

    async fn delete_key(&self, backend_id: &str) -> Result<bool> {
        Ok(self.keys.write().await.remove(backend_id).is_some())
    }
}
