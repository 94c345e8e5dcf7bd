// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Daemon core: wiring, reload loop and signal handling.

pub mod context;
pub mod error;
pub mod logging;
pub mod reset_watchdog;
pub mod service;

pub use context::{DaemonArgs, DaemonContext};
pub use error::{DaemonError, Result};
pub use logging::ReopenableWriter;
pub use reset_watchdog::ResetDriverWatchdog;
pub use service::DaemonService;

/// Commands consumed by the daemon mainloop.
pub enum DaemonCommand {
    /// A parsed XML-RPC call waiting for its reply.
    Rpc(crate::rpc::RpcCall),
    /// Set the reload event (SIGHUP or the `reload` method).
    Reload,
    /// Clean shutdown (SIGINT/SIGTERM).
    Shutdown,
    /// Rotate all log files (SIGUSR1).
    RotateLogs,
}
