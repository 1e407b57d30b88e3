// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! This mod implements aes-256-gcm encryption & decryption.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::*;

pub const KEY_LENGTH: usize = 32;
pub const IV_LENGTH: usize = 12;

pub fn decrypt(encrypted_data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != IV_LENGTH {
        bail!("Illegal length of iv: {}", iv.len());
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(iv), encrypted_data)
        .map_err(|e| anyhow!(e.to_string()))
}

/// Returns the ciphertext with the 16-byte tag appended.
pub fn encrypt(data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != IV_LENGTH {
        bail!("Illegal length of iv: {}", iv.len());
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!(e.to_string()))?;
    cipher
        .encrypt(Nonce::from_slice(iv), data)
        .map_err(|e| anyhow!(e.to_string()))
}
