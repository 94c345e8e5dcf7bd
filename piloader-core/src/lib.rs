// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Piloader core library
//!
//! Building blocks of the piloader daemon with no runtime dependencies:
//!
//! - [`IpAclManager`]: wildcard IP access control lists with memoized
//!   lookups, used by both the PLC server and the XML-RPC surface
//! - [`ProcessImage`]: positional access to the piControl process image,
//!   including the driver ioctls
//! - [`pictory`]: hardware configuration document handling (required key
//!   check, status LED address, module ids, published digests)
//! - [`Settings`]: the typed view over the INI daemon configuration with
//!   legacy migration, update validation and restart predicates
//!
//! The daemon itself (program supervisor, PLC server, RPC surface,
//! mainloop) lives in the `piloader-daemon` crate.

pub mod acl;
pub mod config;
pub mod error;
pub mod pictory;
pub mod procimg;

// Re-exports for convenience
pub use acl::IpAclManager;
pub use config::{ResetDriverAction, Settings};
pub use error::{ConfigError, CoreError};
pub use pictory::FileDigests;
pub use procimg::ProcessImage;
