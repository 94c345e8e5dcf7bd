// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! The daemon's shared state.
//!
//! [`DaemonContext`] carries everything that was process-global in older
//! loaders: resolved paths, the parsed settings, both ACL managers, the
//! published digests and the subsystem handles. The mainloop is the only
//! writer; RPC methods run on the mainloop and see `&mut` access.

use crate::plcserver::{PlcServer, ServerShared};
use crate::rpc::{LogReader, RpcServer};
use crate::supervisor::{PlcProgram, ProgramConfig};
use piloader_core::{FileDigests, IpAclManager, Settings, pictory};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use tracing::{error, info, warn};

/// Resolved invocation parameters, fixed for the daemon's lifetime.
#[derive(Debug, Clone)]
pub struct DaemonArgs {
    /// Run as a system daemon (pid file, file logging).
    pub daemon: bool,
    /// Daemon configuration file.
    pub conffile: PathBuf,
    /// Process image device or file.
    pub procimg: PathBuf,
    /// Hardware configuration document.
    pub configrsc: PathBuf,
    /// File names of the module catalog, when a catalog directory exists.
    pub rap_catalog: Option<Vec<String>>,
    /// Log file of the supervised program.
    pub logapp: PathBuf,
    /// Log file of the daemon itself.
    pub logplc: PathBuf,
    /// Widen both ACL ranges to 0..9 and enable developer opcodes.
    pub developermode: bool,
}

pub struct DaemonContext {
    pub args: DaemonArgs,
    pub settings: Settings,
    pub plcserver_acl: Arc<RwLock<IpAclManager>>,
    pub xmlrpc_acl: Arc<RwLock<IpAclManager>>,
    pub digests: Arc<FileDigests>,
    pub logreader: LogReader,
    pub plc: Option<PlcProgram>,
    pub plcserver: Option<PlcServer>,
    pub rpc: Option<RpcServer>,
    /// Set by SIGHUP or the reload method, consumed once per tick.
    pub reload_event: Arc<AtomicBool>,
    pub pictory_mtime: Option<SystemTime>,
    pub replaceios_mtime: Option<SystemTime>,
    pub replaceio_fail: bool,
    /// Byte address of the status LED register, -1 while unknown.
    pub revpi_led_address: i32,
}

impl DaemonContext {
    pub fn new(args: DaemonArgs, settings: Settings) -> piloader_core::error::Result<Self> {
        let (plc_max, rpc_max) = if args.developermode { (9, 9) } else { (1, 4) };
        let plcserver_acl = Arc::new(RwLock::new(IpAclManager::new(0, plc_max)?));
        let xmlrpc_acl = Arc::new(RwLock::new(IpAclManager::new(0, rpc_max)?));
        let logreader = LogReader::new(&args.logapp, &args.logplc);

        Ok(Self {
            args,
            settings,
            plcserver_acl,
            xmlrpc_acl,
            digests: Arc::new(FileDigests::new()),
            logreader,
            plc: None,
            plcserver: None,
            rpc: None,
            reload_event: Arc::new(AtomicBool::new(false)),
            pictory_mtime: None,
            replaceios_mtime: None,
            replaceio_fail: false,
            revpi_led_address: -1,
        })
    }

    pub fn workdir(&self) -> PathBuf {
        PathBuf::from(&self.settings.program.plcworkdir)
    }

    /// Reload an ACL manager from its configured file; on failure the
    /// previous entries stay live.
    pub fn reload_acls(&self) {
        reload_acl(
            &self.plcserver_acl,
            &self.settings.plcserver.aclfile,
            "plcserver",
        );
        reload_acl(&self.xmlrpc_acl, &self.settings.xmlrpc.aclfile, "xmlrpc");
    }

    /// The configured IO overlay file, resolved against the work
    /// directory; `None` while no overlay is configured or readable.
    pub fn replace_ios_path(&self) -> Option<PathBuf> {
        let configured = &self.settings.program.replace_ios;
        if configured.is_empty() {
            return None;
        }
        let path = Path::new(configured);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir().join(path)
        };
        Some(path)
    }

    fn readable_replace_ios_path(&self) -> Option<PathBuf> {
        self.replace_ios_path()
            .filter(|p| !self.replaceio_fail && p.exists())
    }

    /// Re-hash the hardware configuration document on mtime change.
    ///
    /// Refreshes the status LED address for the soft watchdog; a running
    /// program is stopped when the watchdog is required but the address
    /// vanished. Returns true when the document content changed.
    pub async fn check_pictory_changed(&mut self) -> bool {
        let mtime = match std::fs::metadata(&self.args.configrsc).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(_) => {
                self.pictory_mtime = None;
                return false;
            }
        };
        if self.pictory_mtime == Some(mtime) {
            return false;
        }
        self.pictory_mtime = Some(mtime);

        let Ok(buff) = std::fs::read(&self.args.configrsc) else {
            return false;
        };

        self.revpi_led_address = pictory::status_led_address(&buff);
        if let Some(plc) = &mut self.plc
            && plc.running()
        {
            if self.revpi_led_address >= 0 {
                plc.softdog.set_address(self.revpi_led_address);
            } else if self.settings.program.plcprogram_watchdog > 0 {
                error!(
                    "stop plc program, because watchdog is activated but no \
                     address was found in hardware configuration"
                );
                plc.stop().await;
            }
        }

        let digest = pictory::digest_bytes(&buff);
        if self.digests.pictory() == digest {
            return false;
        }
        self.digests.set_pictory(digest);
        true
    }

    /// Re-hash the IO overlay document; absence is a valid state mapped
    /// to the all-zero digest sentinel. Returns true on change.
    pub fn check_replace_ios_changed(&mut self) -> bool {
        let path = self.replace_ios_path();

        match &path {
            Some(path) if !path.exists() || std::fs::File::open(path).is_err() => {
                if !self.replaceio_fail {
                    error!(
                        "can not access the io overlay file '{}' using defaults",
                        path.display()
                    );
                }
                self.replaceio_fail = true;
            }
            _ => self.replaceio_fail = false,
        }

        if path.is_none() || self.replaceio_fail {
            if self.replaceios_mtime.is_some()
                || self.digests.replace_ios() != pictory::DIGEST_ABSENT
            {
                self.replaceios_mtime = None;
                self.digests.set_replace_ios(pictory::DIGEST_ABSENT);
                return true;
            }
            return false;
        }

        let path = path.expect("checked above");
        let mtime = match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(_) => return false,
        };
        if self.replaceios_mtime == Some(mtime) {
            return false;
        }
        self.replaceios_mtime = Some(mtime);

        let digest = pictory::digest_file(&path);
        if self.digests.replace_ios() == digest {
            return false;
        }
        self.digests.set_replace_ios(digest);
        true
    }

    /// Build a program supervisor from the current settings.
    pub fn build_program(&self) -> Option<PlcProgram> {
        let program_path = self.workdir().join(&self.settings.program.plcprogram);
        if !program_path.exists() {
            error!("plc file does not exist {}", program_path.display());
            return None;
        }
        if self.revpi_led_address < 0 && self.settings.program.plcprogram_watchdog > 0 {
            error!(
                "can not start plc program, because watchdog is activated but \
                 no address was found in hardware configuration"
            );
            return None;
        }

        let cfg = ProgramConfig::from_settings(
            &self.settings,
            &self.args.procimg,
            Some(self.args.logapp.as_path()),
        );
        match PlcProgram::new(cfg, &self.settings) {
            Ok(plc) => {
                plc.softdog.set_address(self.revpi_led_address.max(0));
                Some(plc)
            }
            Err(e) => {
                error!("can not create plc program supervisor: {}", e);
                None
            }
        }
    }

    /// Bind and start the PLC server from the current settings.
    pub async fn start_plc_server(&self) -> std::io::Result<PlcServer> {
        let shared = Arc::new(ServerShared {
            acl: self.plcserver_acl.clone(),
            digests: self.digests.clone(),
            procimg: self.args.procimg.clone(),
            configrsc: self.args.configrsc.clone(),
            replace_ios: Mutex::new(self.readable_replace_ios_path()),
            watchdog: AtomicBool::new(self.settings.plcserver.watchdog),
        });
        PlcServer::start(
            &self.settings.plcserver.bindip,
            self.settings.plcserver.port,
            shared,
        )
        .await
    }

    /// Restart the supervised program (driver reset, file change, RPC).
    pub async fn restart_program(&mut self) {
        if let Some(plc) = &mut self.plc {
            plc.stop().await;
        }
        self.plc = self.build_program();
        if let Some(plc) = &mut self.plc {
            plc.start();
        }
    }

    /// Push hot state into a (possibly restarted) PLC server.
    pub fn refresh_plc_server(&self) {
        if let Some(server) = &self.plcserver {
            server.check_connected_acl();
            server.set_watchdog(self.settings.plcserver.watchdog);
            server.set_replace_ios(self.readable_replace_ios_path());
        }
    }
}

fn reload_acl(manager: &Arc<RwLock<IpAclManager>>, aclfile: &str, name: &str) {
    if aclfile.is_empty() {
        warn!("no {} acl file configured", name);
        return;
    }
    match manager.write().unwrap().load_file(aclfile) {
        Ok(()) => info!("loaded {} acl from '{}'", name, aclfile),
        Err(e) => warn!("can not load {} acl - wrong format: {}", name, e),
    }
}
