// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Nonces handed out with a transfer challenge. Each one is accepted at most
//! once and only until it expires.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub struct NonceRegistry {
    ttl: Duration,
    issued: Mutex<HashMap<String, Instant>>,
}

impl NonceRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            issued: Mutex::new(HashMap::new()),
        }
    }

    pub async fn issue(&self, nonce: &str) {
        let mut issued = self.issued.lock().await;
        let ttl = self.ttl;
        issued.retain(|_, at| at.elapsed() < ttl);
        issued.insert(nonce.to_string(), Instant::now());
    }

    /// Remove the nonce and report whether it was issued and still fresh.
    pub async fn consume(&self, nonce: &str) -> bool {
        if nonce.is_empty() {
            return false;
        }
        match self.issued.lock().await.remove(nonce) {
            Some(at) => at.elapsed() < self.ttl,
            None => false,
        }
    }
}
