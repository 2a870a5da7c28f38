// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("firmware size mismatch for {ip}: expected {expected}, received {received}")]
    FirmwareSizeMismatch {
        ip: String,
        expected: u64,
        received: u64,
    },

    #[error("no firmware upload in progress for {0}")]
    NoFirmwareUpload(String),
}
