// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Piloader - supervisor daemon for piControl based edge controllers
//!
//! Supervises the user control program, serves the process image over
//! the binary PLC protocol, exposes the XML-RPC control surface and
//! reacts to hardware configuration changes.

use clap::Parser;
use piloader_daemon::daemon::{DaemonArgs, DaemonService, ReopenableWriter};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const PIDFILE: &str = "/var/run/revpipyload.pid";
const DAEMON_CONFFILE: &str = "/etc/revpipyload/revpipyload.conf";
const DAEMON_LOGAPP: &str = "/var/log/revpipyloadapp";
const DAEMON_LOGPLC: &str = "/var/log/revpipyload";

/// Known locations of the hardware configuration document.
const CONFIGRSC_CANDIDATES: &[&str] = &["/etc/revpi/config.rsc", "/opt/KUNBUS/config.rsc"];

/// Known locations of the module catalog.
const RAP_CANDIDATES: &[&str] = &[
    "/opt/KUNBUS/pictory/resources/data/rap",
    "/var/www/pictory/resources/data/rap",
];

/// RevolutionPi loader daemon
#[derive(Parser, Debug)]
#[command(name = "piloader")]
#[command(version)]
#[command(about = "Supervisor daemon for piControl based edge controllers", long_about = None)]
struct Args {
    /// Run program as a daemon in background (pid file, file logging)
    #[arg(short, long)]
    daemon: bool,

    /// Application configuration file
    #[arg(short, long, value_name = "FILE", default_value = "revpipyload.conf")]
    conffile: PathBuf,

    /// Save log entries to this file
    #[arg(short = 'f', long, value_name = "FILE")]
    logfile: Option<PathBuf>,

    /// Path to the process image
    #[arg(long, value_name = "DEVICE", default_value = "/dev/piControl0")]
    procimg: PathBuf,

    /// Hardware configuration file to use
    #[arg(long = "pictory", value_name = "FILE")]
    configrsc: Option<PathBuf>,

    /// Switch on verbose logging (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Widen ACL ranges to 0..9 and enable developer opcodes
    #[arg(long)]
    developermode: bool,
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let configrsc = match resolve_configrsc(args.configrsc.as_deref()) {
        Some(path) => path,
        None => {
            eprintln!(
                "can not find known hardware configurations at {}",
                CONFIGRSC_CANDIDATES.join(", ")
            );
            return std::process::ExitCode::FAILURE;
        }
    };

    let (conffile, logapp, logplc) = if args.daemon {
        (
            PathBuf::from(DAEMON_CONFFILE),
            PathBuf::from(DAEMON_LOGAPP),
            PathBuf::from(DAEMON_LOGPLC),
        )
    } else {
        (
            args.conffile.clone(),
            PathBuf::from("revpipyloadapp.log"),
            args.logfile
                .clone()
                .unwrap_or_else(|| PathBuf::from("revpipyload.log")),
        )
    };

    let log_writer = if args.daemon {
        ReopenableWriter::file(&logplc)
    } else if let Some(logfile) = &args.logfile {
        ReopenableWriter::file(logfile)
    } else {
        ReopenableWriter::stdout()
    };
    setup_logging(args.verbose, log_writer.clone());

    info!("piloader {}", env!("CARGO_PKG_VERSION"));

    let pidfile = if args.daemon {
        match write_pidfile(Path::new(PIDFILE)) {
            Ok(()) => Some(PathBuf::from(PIDFILE)),
            Err(e) => {
                error!("{}", e);
                return std::process::ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    let daemon_args = DaemonArgs {
        daemon: args.daemon,
        conffile,
        procimg: args.procimg.clone(),
        configrsc,
        rap_catalog: load_rap_catalog(),
        logapp,
        logplc,
        developermode: args.developermode,
    };

    let result = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime.block_on(async {
            let mut service = DaemonService::new(daemon_args, Some(log_writer))?;
            service.run().await
        }),
        Err(e) => {
            error!("can not create runtime: {}", e);
            cleanup_pidfile(pidfile.as_deref());
            return std::process::ExitCode::FAILURE;
        }
    };

    cleanup_pidfile(pidfile.as_deref());

    match result {
        Ok(()) => {
            info!("piloader stopped");
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            error!("daemon error: {}", e);
            eprintln!("Error: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn setup_logging(verbose: u8, writer: ReopenableWriter) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("piloader={level},piloader_core={level},piloader_daemon={level},warn")));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
}

fn resolve_configrsc(requested: Option<&Path>) -> Option<PathBuf> {
    match requested {
        Some(path) if path.exists() => Some(path.to_path_buf()),
        Some(_) => None,
        None => CONFIGRSC_CANDIDATES
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists()),
    }
}

fn load_rap_catalog() -> Option<Vec<String>> {
    for candidate in RAP_CANDIDATES {
        let Ok(entries) = std::fs::read_dir(candidate) else {
            continue;
        };
        return Some(
            entries
                .flatten()
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect(),
        );
    }
    None
}

fn write_pidfile(path: &Path) -> Result<(), String> {
    if path.exists() {
        return Err(format!(
            "program already running as daemon. check {}",
            path.display()
        ));
    }
    std::fs::write(path, std::process::id().to_string())
        .map_err(|e| format!("can not write pid file {}: {}", path.display(), e))
}

fn cleanup_pidfile(path: Option<&Path>) {
    if let Some(path) = path
        && path.exists()
    {
        let _ = std::fs::remove_file(path);
    }
}
