// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! The daemon mainloop.
//!
//! Once per second the loop consumes the reload event, samples the
//! reset-driver watchdog, re-hashes the hardware configuration and
//! overlay documents, and revives subsystems that died. XML-RPC calls
//! arrive on the same command channel and execute here, which keeps the
//! mainloop the single writer of all daemon state.

use crate::daemon::context::{DaemonArgs, DaemonContext};
use crate::daemon::error::{DaemonError, Result};
use crate::daemon::logging::ReopenableWriter;
use crate::daemon::reset_watchdog::ResetDriverWatchdog;
use crate::daemon::DaemonCommand;
use crate::rpc::{RpcServer, methods};
use piloader_core::config::{self, Settings};
use piloader_core::ResetDriverAction;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Main daemon service coordinating all components.
pub struct DaemonService {
    ctx: DaemonContext,
    command_tx: mpsc::Sender<DaemonCommand>,
    command_rx: mpsc::Receiver<DaemonCommand>,
    log_writer: Option<ReopenableWriter>,
    /// One-shot marker for a reset restart without a program.
    warned_no_program: bool,
}

impl DaemonService {
    /// Load the configuration and prepare the context. A missing or
    /// corrupt configuration file refuses to come up.
    pub fn new(args: DaemonArgs, log_writer: Option<ReopenableWriter>) -> Result<Self> {
        info!("loading config file: {}", args.conffile.display());
        if config::migrate_legacy_sections(&args.conffile)? {
            info!(
                "renamed obsolete config values in {}",
                args.conffile.display()
            );
        }
        let settings = Settings::load(&args.conffile)?;

        let ctx = DaemonContext::new(args, settings).map_err(DaemonError::Core)?;
        ctx.reload_acls();

        let (command_tx, command_rx) = mpsc::channel(64);
        Ok(Self {
            ctx,
            command_tx,
            command_rx,
            log_writer,
            warned_no_program: false,
        })
    }

    /// Command sender for external control (tests).
    pub fn command_sender(&self) -> mpsc::Sender<DaemonCommand> {
        self.command_tx.clone()
    }

    /// Run until a shutdown signal or command arrives.
    pub async fn run(&mut self) -> Result<()> {
        info!("starting piloader");

        // First digest pass publishes the document state
        self.ctx.check_pictory_changed().await;
        self.ctx.check_replace_ios_changed();

        self.start_subsystems().await;

        let reset_dog = ResetDriverWatchdog::new(&self.ctx.args.procimg);
        reset_dog.register_call(|| debug!("driver reset event delivered"));

        spawn_signal_handler(self.command_tx.clone());

        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(&reset_dog).await;
                }
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        DaemonCommand::Rpc(call) => {
                            let result = methods::dispatch(
                                &mut self.ctx,
                                call.method,
                                &call.params,
                                call.level,
                            )
                            .await;
                            let _ = call.respond.send(result);
                        }
                        DaemonCommand::Reload => {
                            self.ctx.reload_event.store(true, Ordering::Release);
                        }
                        DaemonCommand::RotateLogs => self.rotate_logs(),
                        DaemonCommand::Shutdown => break,
                    }
                }
            }
        }

        info!("stopping piloader");
        reset_dog.stop();
        self.stop_subsystems().await;
        Ok(())
    }

    async fn start_subsystems(&mut self) {
        self.ctx.plc = self.ctx.build_program();
        if self.ctx.settings.program.autostart
            && let Some(plc) = &mut self.ctx.plc
        {
            debug!("starting plc program");
            plc.start();
        }

        if self.ctx.settings.plcserver.enabled {
            match self.ctx.start_plc_server().await {
                Ok(server) => self.ctx.plcserver = Some(server),
                Err(e) => error!("can not start plc server: {}", e),
            }
        }

        if self.ctx.settings.xmlrpc.enabled {
            match RpcServer::start(
                &self.ctx.settings.xmlrpc.bindip,
                self.ctx.settings.xmlrpc.port,
                self.ctx.xmlrpc_acl.clone(),
                self.command_tx.clone(),
            )
            .await
            {
                Ok(server) => self.ctx.rpc = Some(server),
                Err(e) => error!("can not start xmlrpc server: {}", e),
            }
        }
    }

    async fn stop_subsystems(&mut self) {
        if let Some(plc) = &mut self.ctx.plc {
            plc.stop().await;
        }
        if let Some(server) = &mut self.ctx.plcserver {
            server.stop().await;
        }
        if let Some(server) = &mut self.ctx.rpc {
            server.stop().await;
        }
        self.ctx.logreader.close_all();
    }

    /// One second of housekeeping.
    async fn tick(&mut self, reset_dog: &ResetDriverWatchdog) {
        if self.ctx.reload_event.swap(false, Ordering::AcqRel) {
            info!("got request to reload config");
            self.reload().await;
        }

        let mut file_changed = false;
        let reset_detected = reset_dog.triggered();

        if (reset_detected || reset_dog.not_implemented())
            && self.ctx.check_pictory_changed().await
        {
            file_changed = true;
            warn!("hardware configuration was changed");
            if let Some(server) = &self.ctx.plcserver {
                server.disconnect_all();
            }
        }

        if self.ctx.check_replace_ios_changed() {
            if !file_changed && let Some(server) = &self.ctx.plcserver {
                server.disconnect_overlay_clients();
            }
            file_changed = true;
            warn!("io overlay file was changed");
            self.ctx.refresh_plc_server();
        }

        // Restart the program on driver reset, per configuration
        let action = self.ctx.settings.program.reset_driver_action;
        let restart_wanted = !reset_dog.not_implemented()
            && ((action == ResetDriverAction::OnResetEvent && reset_detected)
                || (action == ResetDriverAction::OnFileChange && file_changed));
        if restart_wanted {
            match &self.ctx.plc {
                Some(plc) if plc.running() => {
                    warn!("restart plc program after 'reset driver' was requested");
                    self.ctx.restart_program().await;
                }
                None => {
                    if !self.warned_no_program {
                        info!("driver reset detected but no plc program is configured");
                        self.warned_no_program = true;
                    }
                }
                _ => {}
            }
        }

        // Revive servers that died unexpectedly
        if self.ctx.settings.plcserver.enabled
            && self.ctx.plcserver.as_ref().is_some_and(|s| !s.is_alive())
        {
            warn!("restart plc server after it was not running");
            if let Some(server) = &mut self.ctx.plcserver {
                server.stop().await;
            }
            match self.ctx.start_plc_server().await {
                Ok(server) => self.ctx.plcserver = Some(server),
                Err(e) => {
                    error!("can not restart plc server: {}", e);
                    self.ctx.plcserver = None;
                }
            }
        }
        if self.ctx.settings.xmlrpc.enabled
            && self.ctx.rpc.as_ref().is_some_and(|s| !s.is_alive())
        {
            warn!("restart xmlrpc server after it was not running");
            self.restart_rpc().await;
        }
    }

    /// Re-read the configuration and restart or reconfigure the
    /// subsystems depending on which of their fields changed.
    async fn reload(&mut self) {
        let new_settings = match Settings::load(&self.ctx.args.conffile) {
            Ok(settings) => settings,
            Err(e) => {
                // The running configuration stays in place
                error!("can not reload config file: {}", e);
                return;
            }
        };

        let restart_program = self.ctx.plc.is_none()
            || self.ctx.settings.program_fields_changed(&new_settings)
            || (self.ctx.plc.as_ref().is_some_and(|p| !p.running())
                && !self.ctx.settings.program.autostart
                && new_settings.program.autostart);
        let restart_plcserver = self.ctx.plcserver.is_none()
            || self.ctx.settings.plcserver_fields_changed(&new_settings);
        let restart_rpc =
            self.ctx.rpc.is_none() || self.ctx.settings.xmlrpc_fields_changed(&new_settings);

        self.ctx.settings = new_settings;
        self.ctx.reload_acls();

        // Both checks must run once per reload
        let pictory_changed = self.ctx.check_pictory_changed().await;
        let overlay_changed = self.ctx.check_replace_ios_changed();
        let file_changed = pictory_changed || overlay_changed;

        if restart_program || file_changed {
            if let Some(plc) = &mut self.ctx.plc {
                plc.stop().await;
            }
            self.ctx.plc = self.ctx.build_program();
            if self.ctx.settings.program.autostart
                && let Some(plc) = &mut self.ctx.plc
            {
                info!("restart plc program after reload");
                plc.start();
            }
        } else if let Some(plc) = &self.ctx.plc {
            info!("configure plc program parameters after reload");
            plc.apply_settings(&self.ctx.settings);
            plc.softdog.set_address(self.ctx.revpi_led_address.max(0));
        }

        if restart_plcserver {
            if let Some(server) = &mut self.ctx.plcserver {
                server.stop().await;
            }
            self.ctx.plcserver = None;
            if self.ctx.settings.plcserver.enabled {
                match self.ctx.start_plc_server().await {
                    Ok(server) => {
                        info!("restart plc server after reload");
                        self.ctx.plcserver = Some(server);
                    }
                    Err(e) => error!("can not start plc server: {}", e),
                }
            }
        }
        self.ctx.refresh_plc_server();

        if restart_rpc {
            if let Some(server) = &mut self.ctx.rpc {
                server.stop().await;
            }
            self.ctx.rpc = None;
            if self.ctx.settings.xmlrpc.enabled {
                self.restart_rpc().await;
            }
        }
    }

    async fn restart_rpc(&mut self) {
        if let Some(server) = &mut self.ctx.rpc {
            server.stop().await;
        }
        match RpcServer::start(
            &self.ctx.settings.xmlrpc.bindip,
            self.ctx.settings.xmlrpc.port,
            self.ctx.xmlrpc_acl.clone(),
            self.command_tx.clone(),
        )
        .await
        {
            Ok(server) => self.ctx.rpc = Some(server),
            Err(e) => {
                error!("can not start xmlrpc server: {}", e);
                self.ctx.rpc = None;
            }
        }
    }

    /// SIGUSR1: reopen the daemon log and rotate the program log.
    fn rotate_logs(&mut self) {
        if let Some(writer) = &self.log_writer {
            writer.reopen();
        }
        warn!("start new logfile: {}", chrono::Local::now().format("%c"));
        if let Some(plc) = &self.ctx.plc {
            plc.new_logfile();
        }
        self.ctx.logreader.close_all();
    }

    /// Context access for tests.
    pub fn context_mut(&mut self) -> &mut DaemonContext {
        &mut self.ctx
    }
}

fn spawn_signal_handler(command_tx: mpsc::Sender<DaemonCommand>) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sighup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
        let mut sigusr1 = signal(SignalKind::user_defined1()).expect("install SIGUSR1 handler");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("received SIGTERM, initiating shutdown");
                    let _ = command_tx.send(DaemonCommand::Shutdown).await;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, initiating shutdown");
                    let _ = command_tx.send(DaemonCommand::Shutdown).await;
                }
                _ = sighup.recv() => {
                    info!("received SIGHUP, reloading configuration");
                    let _ = command_tx.send(DaemonCommand::Reload).await;
                }
                _ = sigusr1.recv() => {
                    info!("received SIGUSR1, rotating log files");
                    let _ = command_tx.send(DaemonCommand::RotateLogs).await;
                }
            }
        }
    });

    #[cfg(not(unix))]
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = command_tx.send(DaemonCommand::Shutdown).await;
        }
    });
}
