// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Soft watchdog on the status LED register.
//!
//! A healthy control program toggles bit 7 of the status LED byte in the
//! process image. The watchdog samples that bit and, when it stops
//! toggling for the configured timeout, kills the program with SIGKILL.
//! It never owns the child's lifecycle: restarting is the supervisor's
//! decision, the watchdog only holds the pid and a kill capability.

use piloader_core::ProcessImage;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

struct DogState {
    /// Byte address of the status LED register in the image
    address: AtomicI32,
    /// Timeout in seconds; 0 disables the watchdog
    timeout: AtomicU32,
    /// Pid of the watched program; 0 while no child runs
    pid: AtomicI32,
    triggered: AtomicBool,
    stopped: AtomicBool,
}

/// Bit of the LED register a healthy program toggles.
const TOGGLE_BIT: u8 = 7;

pub struct SoftWatchdog {
    procimg: PathBuf,
    state: Arc<DogState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SoftWatchdog {
    pub fn new(procimg: impl Into<PathBuf>) -> Self {
        Self {
            procimg: procimg.into(),
            state: Arc::new(DogState {
                address: AtomicI32::new(0),
                timeout: AtomicU32::new(0),
                pid: AtomicI32::new(0),
                triggered: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn set_address(&self, address: i32) {
        self.state.address.store(address, Ordering::Release);
    }

    /// Change the timeout; setting 0 stops a running watchdog task.
    pub fn set_timeout(&self, seconds: u32) {
        self.state.timeout.store(seconds, Ordering::Release);
        if seconds == 0 {
            self.state.stopped.store(true, Ordering::Release);
        }
    }

    pub fn timeout(&self) -> u32 {
        self.state.timeout.load(Ordering::Acquire)
    }

    /// Point the kill capability at the current child.
    pub fn set_pid(&self, pid: i32) {
        self.state.pid.store(pid, Ordering::Release);
    }

    pub fn triggered(&self) -> bool {
        self.state.triggered.load(Ordering::Acquire)
    }

    /// Return to a clean startable state.
    pub fn reset(&self) {
        self.state.triggered.store(false, Ordering::Release);
        self.state.stopped.store(false, Ordering::Release);
    }

    /// Start the sampling task; a no-op while the timeout is 0.
    pub async fn start(&self) {
        if self.state.timeout.load(Ordering::Acquire) == 0 {
            return;
        }
        let mut task = self.task.lock().await;
        if let Some(handle) = task.as_ref()
            && !handle.is_finished()
        {
            return;
        }

        let state = self.state.clone();
        let procimg = self.procimg.clone();
        *task = Some(tokio::spawn(async move {
            sample_loop(procimg, state).await;
        }));
    }

    /// Ask the sampling task to stop; it winds down on its next sample.
    pub fn stop(&self) {
        self.state.stopped.store(true, Ordering::Release);
    }
}

async fn sample_loop(procimg: PathBuf, state: Arc<DogState>) {
    debug!("enter softdog sample loop");

    let image = match ProcessImage::open_read_only(&procimg) {
        Ok(image) => image,
        Err(e) => {
            error!("can not open process image for soft watchdog: {}", e);
            return;
        }
    };

    let mut last_bit = None;
    let mut deadline = armed_deadline(&state);
    loop {
        if state.stopped.load(Ordering::Acquire) {
            break;
        }
        let timeout = state.timeout.load(Ordering::Acquire);
        if timeout == 0 {
            break;
        }

        let jitter = rand::thread_rng().gen_range(0..100u64);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let address = state.address.load(Ordering::Acquire).max(0) as u16;
        match image.read_bit(address, TOGGLE_BIT) {
            Ok(bit) => {
                if last_bit != Some(bit) {
                    last_bit = Some(bit);
                    deadline = Instant::now() + Duration::from_secs(u64::from(timeout));
                }
            }
            Err(e) => {
                // Transient driver trouble must not look like a dead program
                warn!("soft watchdog can not sample toggle bit: {}", e);
                continue;
            }
        }

        if Instant::now() >= deadline {
            let pid = state.pid.load(Ordering::Acquire);
            state.triggered.store(true, Ordering::Release);
            error!("runtime watchdog triggered, kill plc program with pid {}", pid);
            if pid > 0 {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
            break;
        }
    }

    debug!("leave softdog sample loop");
}

fn armed_deadline(state: &DogState) -> Instant {
    Instant::now() + Duration::from_secs(u64::from(state.timeout.load(Ordering::Acquire)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_watchdog_does_not_start() {
        let dog = SoftWatchdog::new("/nonexistent");
        dog.start().await;
        assert!(dog.task.lock().await.is_none());
    }

    #[tokio::test]
    async fn zero_timeout_stops_the_task() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 16]).unwrap();

        let dog = SoftWatchdog::new(file.path());
        dog.set_timeout(5);
        dog.start().await;
        assert!(dog.task.lock().await.is_some());

        dog.set_timeout(0);
        let handle = dog.task.lock().await.take().unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("task should wind down")
            .unwrap();
        assert!(!dog.triggered());
    }

    #[test]
    fn reset_returns_to_clean_state() {
        let dog = SoftWatchdog::new("/nonexistent");
        dog.state.triggered.store(true, Ordering::Release);
        dog.state.stopped.store(true, Ordering::Release);
        dog.reset();
        assert!(!dog.triggered());
        assert!(!dog.state.stopped.load(Ordering::Acquire));
    }
}
