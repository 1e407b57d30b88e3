// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! One JSON document per record, named after the record's UUID.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Record, Store};

const RECORD_EXTENSION: &str = "json";

pub struct DirectoryStore<T> {
    dir: PathBuf,
    // Serializes writers; readers only ever see a complete file thanks to the
    // rename in `write_record`.
    write_lock: Mutex<()>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> DirectoryStore<T> {
    pub async fn new(root: &Path) -> Result<Self> {
        let dir = root.join(T::KIND);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create store directory {}", dir.display()))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
            _record: PhantomData,
        })
    }

    fn record_path(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXTENSION}"))
    }

    async fn write_record(&self, record: &T) -> Result<()> {
        let path = self.record_path(&record.id());
        let tmp = path.with_extension("tmp");
        let content = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp, content)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("rename {} to {}", tmp.display(), path.display()))?;
        Ok(())
    }

    async fn read_record(path: &Path) -> Result<T> {
        let content = fs::read(path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        serde_json::from_slice(&content).with_context(|| format!("parse {}", path.display()))
    }
}

#[async_trait]
impl<T: Record> Store<T> for DirectoryStore<T> {
    async fn create(&self, record: &T) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if fs::try_exists(self.record_path(&record.id())).await? {
            bail!("{} record {} already exists", T::KIND, record.id());
        }
        self.write_record(record).await
    }

    async fn retrieve(&self, id: &Uuid) -> Result<Option<T>> {
        let path = self.record_path(id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read_record(&path).await.map(Some)
    }

    async fn update(&self, record: &T) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if !fs::try_exists(self.record_path(&record.id())).await? {
            return Ok(false);
        }
        self.write_record(record).await?;
        Ok(true)
    }

    async fn delete(&self, id: &Uuid) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("delete {} record {id}", T::KIND)),
        }
    }

    async fn list(&self) -> Result<Vec<T>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("read store directory {}", self.dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            records.push(Self::read_record(&path).await?);
        }

        Ok(records)
    }
}
