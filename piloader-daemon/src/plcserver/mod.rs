// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Binary PLC server.
//!
//! A TCP acceptor that hands every connection to a [`Connection`] worker
//! after resolving the peer address against the ACL. The server keeps a
//! registry of live workers so the daemon can re-check ACLs after a
//! reload, drop overlay clients after an IO remap change, or drop
//! everything after a hardware configuration change.

pub mod connection;
pub mod frame;

pub use connection::ConnectionState;

use connection::Connection;
use piloader_core::{FileDigests, IpAclManager};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State shared between the acceptor, its workers and the daemon core.
pub struct ServerShared {
    pub acl: Arc<RwLock<IpAclManager>>,
    pub digests: Arc<FileDigests>,
    pub procimg: PathBuf,
    pub configrsc: PathBuf,
    /// Current IO overlay file; `None` while no overlay is configured.
    pub replace_ios: Mutex<Option<PathBuf>>,
    /// Enforce connection deadlines instead of only warning.
    pub watchdog: AtomicBool,
}

/// The PLC server with its acceptor task and worker registry.
pub struct PlcServer {
    shared: Arc<ServerShared>,
    connections: Arc<Mutex<Vec<Arc<ConnectionState>>>>,
    local_addr: std::net::SocketAddr,
    shutdown: Arc<Notify>,
    exiting: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl PlcServer {
    /// Bind the listening socket and start accepting connections.
    ///
    /// An empty `bind_ip` binds all interfaces.
    pub async fn start(
        bind_ip: &str,
        port: u16,
        shared: Arc<ServerShared>,
    ) -> std::io::Result<Self> {
        let bind_ip = if bind_ip.is_empty() { "0.0.0.0" } else { bind_ip };
        let listener = TcpListener::bind((bind_ip, port)).await?;
        let local_addr = listener.local_addr()?;
        info!("plc server listening on {}", local_addr);

        let connections: Arc<Mutex<Vec<Arc<ConnectionState>>>> = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(Notify::new());
        let exiting = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(accept_loop(
            listener,
            shared.clone(),
            connections.clone(),
            shutdown.clone(),
            exiting.clone(),
        ));

        Ok(Self {
            shared,
            connections,
            local_addr,
            shutdown,
            exiting,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// The acceptor is supervised by the daemon core and revived when it
    /// died unexpectedly.
    pub fn is_alive(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Re-resolve every live connection against the current ACL; workers
    /// that lost their access get dropped, others are updated in place.
    pub fn check_connected_acl(&self) {
        let acl = self.shared.acl.read().unwrap();
        for conn in self.connections.lock().unwrap().iter() {
            let level = acl.level_of(&conn.peer_ip);
            if level < 0 {
                warn!(
                    "host ip '{}' lost access after acl reload - disconnect",
                    conn.peer_ip
                );
                conn.kick();
            } else {
                conn.level.store(level, Ordering::Release);
            }
        }
    }

    /// Toggle deadline enforcement for current and future connections.
    pub fn set_watchdog(&self, enabled: bool) {
        self.shared.watchdog.store(enabled, Ordering::Release);
    }

    /// Point the overlay document serving at a new file (or none).
    pub fn set_replace_ios(&self, path: Option<PathBuf>) {
        *self.shared.replace_ios.lock().unwrap() = path;
    }

    pub fn disconnect_all(&self) {
        for conn in self.connections.lock().unwrap().iter() {
            conn.kick();
        }
    }

    /// Drop only connections that ever requested the IO overlay.
    pub fn disconnect_overlay_clients(&self) {
        for conn in self.connections.lock().unwrap().iter() {
            if conn.got_io_overlay.load(Ordering::Acquire) {
                conn.kick();
            }
        }
    }

    /// Stop the acceptor and all workers.
    pub async fn stop(&mut self) {
        debug!("enter PlcServer.stop()");
        self.exiting.store(true, Ordering::Release);
        self.shutdown.notify_one();
        self.disconnect_all();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!("leave PlcServer.stop()");
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    connections: Arc<Mutex<Vec<Arc<ConnectionState>>>>,
    shutdown: Arc<Notify>,
    exiting: Arc<AtomicBool>,
) {
    debug!("enter plc server accept loop");

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = shutdown.notified() => break,
        };
        if exiting.load(Ordering::Acquire) {
            break;
        }

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };

        let peer_ip = peer.ip().to_string();
        let level = shared.acl.read().unwrap().level_of(&peer_ip);
        if level < 0 {
            warn!("host ip '{}' does not match acl - disconnect", peer_ip);
            drop(stream);
            continue;
        }

        let state = Arc::new(ConnectionState::new(peer_ip, level));
        let worker = match Connection::new(stream, state.clone(), shared.clone()) {
            Ok(worker) => worker,
            Err(e) => {
                warn!("can not open process image for connection: {}", e);
                continue;
            }
        };

        {
            let mut registry = connections.lock().unwrap();
            registry.push(state.clone());
        }

        let connections = connections.clone();
        tokio::spawn(async move {
            worker.run().await;
            connections
                .lock()
                .unwrap()
                .retain(|entry| !Arc::ptr_eq(entry, &state));
        });
    }

    debug!("leave plc server accept loop");
}
