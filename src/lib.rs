// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Piloader
//!
//! Root crate re-exporting the core library. The daemon itself lives in
//! the `piloader-daemon` crate; the cross-crate integration tests under
//! `tests/` drive both.

pub use piloader_core::*;
