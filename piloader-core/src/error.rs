// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

use thiserror::Error;

/// Core-level errors
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ACL error: {0}")]
    Acl(String),

    #[error("ioctl {request} failed: {errno}")]
    Ioctl { request: u64, errno: i32 },

    #[error("write at {position} exceeds process image of {length} bytes")]
    OutOfImage { position: u64, length: u64 },

    #[error("operation not supported on this platform")]
    Unsupported,
}

/// Configuration parsing errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid value for '{key}': {value}")]
    InvalidValue { key: String, value: String },

    #[error("validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
