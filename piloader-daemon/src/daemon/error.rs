// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Error types for daemon operations

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] piloader_core::ConfigError),

    #[error("core error: {0}")]
    Core(#[from] piloader_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fatal error: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
