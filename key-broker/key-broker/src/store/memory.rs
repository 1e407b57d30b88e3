// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Record, Store};

pub struct MemoryStore<T> {
    records: RwLock<HashMap<Uuid, T>>,
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<T: Record> Store<T> for MemoryStore<T> {
    async fn create(&self, record: &T) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id()) {
            bail!("{} record {} already exists", T::KIND, record.id());
        }
        records.insert(record.id(), record.clone());
        Ok(())
    }

    async fn retrieve(&self, id: &Uuid) -> Result<Option<T>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn update(&self, record: &T) -> Result<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id()) {
            Some(existing) => {
                *existing = record.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: &Uuid) -> Result<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<T>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}
