// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Supervisor for the user control program.
//!
//! Spawns the program as a child process with its output routed through
//! the [`PipeLogWriter`], watches it, applies the restart policy, and
//! carries the [`SoftWatchdog`]. Exit codes observable from the outside:
//! -1 while running, -3 when the program never ran, -9 when the watchdog
//! or the OS killed it, otherwise the process exit code.

pub mod log_pipe;
pub mod softdog;

pub use log_pipe::PipeLogWriter;
pub use softdog::SoftWatchdog;

use chrono::Local;
use piloader_core::Settings;
use piloader_core::procimg;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Exit code while the program is running.
pub const EXITCODE_RUNNING: i32 = -1;
/// Exit code when no program is configured.
pub const EXITCODE_NO_PROGRAM: i32 = -2;
/// Exit code when the program never ran.
pub const EXITCODE_NEVER_RAN: i32 = -3;
/// Exit code when the watchdog or the OS killed the program.
pub const EXITCODE_KILLED: i32 = -9;

/// Static spawn parameters; changing any of these means a restart.
#[derive(Debug, Clone)]
pub struct ProgramConfig {
    pub program: PathBuf,
    pub arguments: String,
    pub pythonversion: u8,
    pub uid: u32,
    pub gid: u32,
    pub rtlevel: u8,
    pub procimg: PathBuf,
    pub logfile: Option<PathBuf>,
}

impl ProgramConfig {
    pub fn from_settings(settings: &Settings, procimg: &Path, logfile: Option<&Path>) -> Self {
        let program = Path::new(&settings.program.plcworkdir).join(&settings.program.plcprogram);
        Self {
            program,
            arguments: settings.program.plcarguments.clone(),
            pythonversion: settings.program.pythonversion,
            uid: settings.program.plcuid,
            gid: settings.program.plcgid,
            rtlevel: settings.program.rtlevel,
            procimg: procimg.to_path_buf(),
            logfile: logfile.map(Path::to_path_buf),
        }
    }
}

/// Hot-applied knobs shared with the supervision task.
struct Knobs {
    autoreload: AtomicBool,
    autoreloaddelay: AtomicU32,
    stop_timeout: AtomicU32,
    zeroonerror: AtomicBool,
    zeroonexit: AtomicBool,
}

struct Shared {
    running: AtomicBool,
    started: AtomicBool,
    child_pid: AtomicI32,
    exit_code: Mutex<Option<i32>>,
    stop_requested: AtomicBool,
    stop_notify: Notify,
}

/// The supervised control program.
pub struct PlcProgram {
    cfg: ProgramConfig,
    knobs: Arc<Knobs>,
    shared: Arc<Shared>,
    pub softdog: Arc<SoftWatchdog>,
    logwriter: Option<Arc<PipeLogWriter>>,
    task: Option<JoinHandle<()>>,
}

impl PlcProgram {
    /// Build a supervisor from the configuration. Fails when the program
    /// file does not exist.
    pub fn new(cfg: ProgramConfig, settings: &Settings) -> std::io::Result<Self> {
        if !cfg.program.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("plc file does not exist {}", cfg.program.display()),
            ));
        }

        let logwriter = match &cfg.logfile {
            Some(path) => Some(Arc::new(PipeLogWriter::new(path)?)),
            None => None,
        };

        let softdog = Arc::new(SoftWatchdog::new(&cfg.procimg));
        softdog.set_timeout(settings.program.plcprogram_watchdog);

        Ok(Self {
            cfg,
            knobs: Arc::new(Knobs {
                autoreload: AtomicBool::new(settings.program.autoreload),
                autoreloaddelay: AtomicU32::new(settings.program.autoreloaddelay),
                stop_timeout: AtomicU32::new(settings.program.plcprogram_stop_timeout),
                zeroonerror: AtomicBool::new(settings.program.zeroonerror),
                zeroonexit: AtomicBool::new(settings.program.zeroonexit),
            }),
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                started: AtomicBool::new(false),
                child_pid: AtomicI32::new(0),
                exit_code: Mutex::new(None),
                stop_requested: AtomicBool::new(false),
                stop_notify: Notify::new(),
            }),
            softdog,
            logwriter,
            task: None,
        })
    }

    /// Apply the hot knobs from a freshly loaded configuration.
    pub fn apply_settings(&self, settings: &Settings) {
        self.knobs
            .autoreload
            .store(settings.program.autoreload, Ordering::Release);
        self.knobs
            .autoreloaddelay
            .store(settings.program.autoreloaddelay, Ordering::Release);
        self.knobs
            .stop_timeout
            .store(settings.program.plcprogram_stop_timeout, Ordering::Release);
        self.knobs
            .zeroonerror
            .store(settings.program.zeroonerror, Ordering::Release);
        self.knobs
            .zeroonexit
            .store(settings.program.zeroonexit, Ordering::Release);
        self.softdog.set_timeout(settings.program.plcprogram_watchdog);
    }

    /// Spawn the supervision task.
    pub fn start(&mut self) {
        if self.running() || self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.shared.stop_requested.store(false, Ordering::Release);

        let cfg = self.cfg.clone();
        let knobs = self.knobs.clone();
        let shared = self.shared.clone();
        let softdog = self.softdog.clone();
        let logwriter = self.logwriter.clone();
        self.task = Some(tokio::spawn(async move {
            supervise(cfg, knobs, shared, softdog, logwriter).await;
        }));
    }

    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Observable exit code with the sentinel mapping documented above.
    pub fn exit_code(&self) -> i32 {
        if self.running() {
            return EXITCODE_RUNNING;
        }
        match *self.shared.exit_code.lock().unwrap() {
            Some(code) => code,
            None => EXITCODE_NEVER_RAN,
        }
    }

    /// Stop the program: SIGTERM, wait up to the stop timeout, SIGKILL.
    ///
    /// Waits for the supervision task to wind down and stops the log
    /// writer. Idempotent.
    pub async fn stop(&mut self) {
        debug!("enter PlcProgram.stop()");
        self.shared.stop_requested.store(true, Ordering::Release);
        // notify_one stores a permit, so a task between wait points still
        // observes the stop
        self.shared.stop_notify.notify_one();
        self.softdog.stop();

        if let Some(task) = self.task.take()
            && task.await.is_err()
        {
            error!("supervision task panicked");
        }
        if let Some(plw) = &self.logwriter {
            plw.stop();
        }
        debug!("leave PlcProgram.stop()");
    }

    /// Re-point the log pipe at a fresh log file.
    pub fn new_logfile(&self) {
        if let Some(plw) = &self.logwriter {
            if let Err(e) = plw.rotate() {
                error!("can not rotate plc program logfile: {}", e);
                return;
            }
            plw.log_line(&"-".repeat(55));
            plw.log_line(&format!("start new logfile: {}", Local::now().format("%c")));
        }
    }
}

async fn supervise(
    cfg: ProgramConfig,
    knobs: Arc<Knobs>,
    shared: Arc<Shared>,
    softdog: Arc<SoftWatchdog>,
    logwriter: Option<Arc<PipeLogWriter>>,
) {
    debug!("enter plc supervision loop");

    let program_name = cfg
        .program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if let Some(plw) = &logwriter {
        plw.log_line(&"-".repeat(55));
        plw.log_line(&format!(
            "plc: {} started: {}",
            program_name,
            Local::now().format("%c")
        ));
    }

    loop {
        info!("start plc program {}", cfg.program.display());
        let mut child = match spawn_child(&cfg, logwriter.as_deref()) {
            Ok(child) => child,
            Err(e) => {
                error!("can not start plc program: {}", e);
                break;
            }
        };

        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        shared.child_pid.store(pid, Ordering::Release);
        shared.started.store(true, Ordering::Release);
        shared.running.store(true, Ordering::Release);
        softdog.set_pid(pid);
        softdog.reset();
        softdog.start().await;

        // Give the interpreter a head start before touching the scheduler
        if cfg.rtlevel > 0 {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(5)) => {
                    if child.try_wait().ok().flatten().is_none() {
                        setup_rt(pid).await;
                    }
                }
                () = shared.stop_notify.notified() => {}
            }
        }

        let status = if shared.stop_requested.load(Ordering::Acquire) {
            terminate_child(&mut child, pid, &knobs, &cfg.program).await
        } else {
            tokio::select! {
                status = child.wait() => status.ok(),
                () = shared.stop_notify.notified() => {
                    terminate_child(&mut child, pid, &knobs, &cfg.program).await
                }
            }
        };

        let code = status.map(exit_code_of).unwrap_or(EXITCODE_KILLED);
        *shared.exit_code.lock().unwrap() = Some(code);
        shared.running.store(false, Ordering::Release);
        softdog.stop();

        apply_zero_rules(&cfg.procimg, code, &knobs);

        if shared.stop_requested.load(Ordering::Acquire)
            || !knobs.autoreload.load(Ordering::Acquire)
        {
            break;
        }

        if code == 0 {
            warn!("restart plc program after clean exit");
        } else {
            warn!("restart plc program after crash - exitcode: {}", code);
        }

        let delay = knobs.autoreloaddelay.load(Ordering::Acquire);
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(u64::from(delay))) => {}
            () = shared.stop_notify.notified() => break,
        }
        if shared.stop_requested.load(Ordering::Acquire) {
            break;
        }
    }

    shared.running.store(false, Ordering::Release);
    if let Some(plw) = &logwriter {
        plw.log_line(&"-".repeat(55));
        plw.log_line(&format!(
            "plc: {} stopped: {}",
            program_name,
            Local::now().format("%c")
        ));
    }

    debug!("leave plc supervision loop");
}

fn spawn_child(
    cfg: &ProgramConfig,
    logwriter: Option<&PipeLogWriter>,
) -> std::io::Result<tokio::process::Child> {
    let python = if cfg.pythonversion == 2 {
        "python2"
    } else {
        "python3"
    };

    let mut cmd = Command::new("/usr/bin/env");
    cmd.arg(python).arg("-u").arg(&cfg.program);
    for arg in cfg.arguments.split_whitespace() {
        cmd.arg(arg);
    }
    if let Some(dir) = cfg.program.parent() {
        cmd.current_dir(dir);
    }
    match logwriter {
        Some(plw) => {
            cmd.stdout(plw.child_stdio()?);
            cmd.stderr(plw.child_stdio()?);
        }
        None => {
            cmd.stdout(std::process::Stdio::inherit());
            cmd.stderr(std::process::Stdio::inherit());
        }
    }
    #[cfg(unix)]
    {
        info!("set uid {} and gid {} for plc program", cfg.uid, cfg.gid);
        cmd.uid(cfg.uid).gid(cfg.gid);
    }
    cmd.kill_on_drop(false);
    cmd.spawn()
}

/// SIGTERM, poll up to the stop timeout, then SIGKILL.
async fn terminate_child(
    child: &mut tokio::process::Child,
    pid: i32,
    knobs: &Knobs,
    program: &Path,
) -> Option<ExitStatus> {
    info!("term plc program {}", program.display());
    if pid > 0 {
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }

    let timeout = Duration::from_secs(u64::from(knobs.stop_timeout.load(Ordering::Acquire)));
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            warn!("can not term plc program {}", program.display());
            let _ = child.start_kill();
            warn!("killed plc program");
            child.wait().await.ok()
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal().is_some() {
            return EXITCODE_KILLED;
        }
    }
    status.code().unwrap_or(EXITCODE_KILLED)
}

fn apply_zero_rules(procimg: &Path, code: i32, knobs: &Knobs) {
    if code == 0 {
        info!("plc program did a clean exit");
        if knobs.zeroonexit.load(Ordering::Acquire) {
            zero_image(procimg);
            info!("set process image to ZERO after clean program exit");
        }
    } else {
        error!("plc program crashed - exitcode: {}", code);
        if knobs.zeroonerror.load(Ordering::Acquire) {
            zero_image(procimg);
            warn!("set process image to ZERO after plc program error");
        }
    }
}

fn zero_image(procimg: &Path) {
    if let Err(e) = procimg::zero_image(procimg) {
        error!("can not zero process image: {}", e);
    }
}

/// Raise the softirq/timer kernel threads and put the child on the
/// round-robin scheduler.
async fn setup_rt(pid: i32) {
    debug!("enter setup_rt()");

    for (group, target_prio) in [
        ("ksoftirqd/0,ksoftirqd/1,ksoftirqd/2,ksoftirqd/3", 10),
        ("ktimersoftd/0,ktimersoftd/1,ktimersoftd/2,ktimersoftd/3", 20),
    ] {
        let output = match tokio::time::timeout(
            Duration::from_secs(5),
            Command::new("/bin/ps")
                .args(["-o", "pid=,rtprio=", "-C", group])
                .output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!("can not get pid and prio - no rt active: {}", e);
                return;
            }
            Err(_) => {
                error!("ps timeout to get rt prio info - no rt active");
                return;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut tokens = stdout.split_whitespace();
        while let (Some(kpid), Some(kprio)) = (tokens.next(), tokens.next()) {
            let Ok(kpid) = kpid.parse::<i32>() else {
                error!("pid={} and prio={} are not valid - no rt active", kpid, kprio);
                return;
            };
            let kprio: i32 = kprio.parse().unwrap_or(0);

            if kprio < 10 {
                let ok = Command::new("/usr/bin/env")
                    .args(["chrt", "-fp", &target_prio.to_string(), &kpid.to_string()])
                    .status()
                    .await
                    .map(|s| s.success())
                    .unwrap_or(false);
                if !ok {
                    error!("could not adjust scheduler - no rt active");
                    return;
                }
            }
        }
    }

    info!("set scheduler profile of pid {}", pid);
    let ok = Command::new("/usr/bin/env")
        .args(["chrt", "-p", "1", &pid.to_string()])
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false);
    if !ok {
        error!("could not set scheduler profile of pid {}", pid);
    }

    debug!("leave setup_rt()");
}
