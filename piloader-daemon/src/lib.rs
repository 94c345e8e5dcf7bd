// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Piloader daemon library
//!
//! The daemon side of piloader: the program supervisor with its log pipe
//! and soft watchdog, the binary PLC server, the XML-RPC control surface
//! and the daemon core that wires them together. The `piloader` binary
//! in this crate is a thin bootstrap around [`DaemonService`].

pub mod daemon;
pub mod plcserver;
pub mod rpc;
pub mod supervisor;

pub use daemon::{DaemonArgs, DaemonCommand, DaemonContext, DaemonService};
pub use plcserver::PlcServer;
pub use rpc::RpcServer;
pub use supervisor::PlcProgram;
