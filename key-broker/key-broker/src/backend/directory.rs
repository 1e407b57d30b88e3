// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Keeps each key's material in its own file under `<root>/key-material`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{generate_symmetric_key, KeyManager, KeyMaterial};

const MATERIAL_DIR: &str = "key-material";

pub struct DirectoryKeyManager {
    dir: PathBuf,
}

impl DirectoryKeyManager {
    pub async fn new(root: &Path) -> Result<Self> {
        let dir = root.join(MATERIAL_DIR);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create key material directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    // Backend IDs are generated here, but they come back through stored
    // metadata; anything that is not a UUID never maps to a file.
    fn material_path(&self, backend_id: &str) -> Option<PathBuf> {
        let id = Uuid::parse_str(backend_id).ok()?;
        Some(self.dir.join(id.to_string()))
    }

    async fn store(&self, bytes: &[u8]) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let path = self.dir.join(&id);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("write key material {}", tmp.display()))?;
        restrict_permissions(&tmp).await?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("persist key material {}", path.display()))?;
        Ok(id)
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .with_context(|| format!("restrict permissions of {}", path.display()))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl KeyManager for DirectoryKeyManager {
    async fn create_symmetric_key(&self, length_bits: u32) -> Result<String> {
        if length_bits == 0 || length_bits % 8 != 0 {
            bail!("invalid symmetric key length {length_bits}");
        }
        self.store(&generate_symmetric_key(length_bits)).await
    }

    async fn register_key(&self, material: KeyMaterial) -> Result<String> {
        self.store(&material.bytes).await
    }

    async fn contains_key(&self, backend_id: &str) -> Result<bool> {
        match self.material_path(backend_id) {
            Some(path) => Ok(fs::try_exists(&path).await?),
            None => Ok(false),
        }
    }

    async fn get_key(&self, backend_id: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let Some(path) = self.material_path(backend_id) else {
            return Ok(None);
        };
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(Zeroizing::new(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read key material {}", path.display())),
        }
    }

    async fn delete_key(&self, backend_id: &str) -> Result<bool> {
        let Some(path) = self.material_path(backend_id) else {
            return Ok(false);
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("delete key material {}", path.display())),
        }
    }
}
