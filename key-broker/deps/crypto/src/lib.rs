// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Cryptographic primitives used by the key broker: digest helpers for
//! measurement values, RSA-OAEP key wrapping under a caller's envelope key
//! and AES-256-GCM for the session-key envelope.

#[macro_use]
extern crate strum;

mod algorithms;
pub use algorithms::*;

mod asymmetric;
pub use asymmetric::*;

mod rust;
pub use rust::aes256gcm;
