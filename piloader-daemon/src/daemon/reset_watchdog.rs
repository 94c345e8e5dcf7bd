// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Watchdog for the driver reset event.
//!
//! A dedicated thread blocks in the driver's wait-for-event ioctl and
//! raises an edge flag when the hardware configuration tool re-initialized
//! the driver. On kernels where the ioctl is not implemented the thread
//! exits and `triggered` answers true unconditionally, so the mtime based
//! file change detection takes over.

use std::ffi::CString;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;
use std::thread;
use tracing::{debug, error, warn};

type ResetCallback = Box<dyn Fn() + Send + Sync>;

struct WatchState {
    triggered: AtomicBool,
    exited: AtomicBool,
    stop: AtomicBool,
    fd: AtomicI32,
    callbacks: Mutex<Vec<ResetCallback>>,
}

pub struct ResetDriverWatchdog {
    state: Arc<WatchState>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ResetDriverWatchdog {
    /// Open the process image and start the watcher thread.
    pub fn new(procimg: impl AsRef<Path>) -> Self {
        let state = Arc::new(WatchState {
            triggered: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            fd: AtomicI32::new(-1),
            callbacks: Mutex::new(Vec::new()),
        });

        let procimg = procimg.as_ref().to_path_buf();
        let thread_state = state.clone();
        let handle = thread::Builder::new()
            .name("reset-driver-watchdog".into())
            .spawn(move || watch_loop(&procimg, &thread_state))
            .expect("spawn reset-driver watchdog thread");

        Self {
            state,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Register a callback fired on every detected driver reset.
    pub fn register_call(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.state.callbacks.lock().unwrap().push(Box::new(callback));
    }

    /// Edge read of the trigger flag; clears it.
    ///
    /// Always true once the watcher is gone, so callers fall back to
    /// file based change detection.
    pub fn triggered(&self) -> bool {
        self.state.triggered.swap(false, Ordering::AcqRel) || self.not_implemented()
    }

    /// The wait-for-event ioctl is unavailable and the watcher exited.
    pub fn not_implemented(&self) -> bool {
        self.state.exited.load(Ordering::Acquire)
    }

    /// Stop the watcher; closes the descriptor to unblock the ioctl.
    pub fn stop(&self) {
        debug!("enter ResetDriverWatchdog.stop()");
        self.state.stop.store(true, Ordering::Release);
        let fd = self.state.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        debug!("leave ResetDriverWatchdog.stop()");
    }
}

impl Drop for ResetDriverWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_loop(procimg: &Path, state: &WatchState) {
    debug!("enter reset-driver watch loop");

    let Some(path) = procimg.to_str().and_then(|p| CString::new(p).ok()) else {
        state.exited.store(true, Ordering::Release);
        return;
    };
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        error!(
            "can not open process image at '{}' for reset-driver watchdog",
            procimg.display()
        );
        state.exited.store(true, Ordering::Release);
        return;
    }
    state.fd.store(fd, Ordering::Release);

    // The ioctl fills two bytes of event status
    let mut status = [0u8; 2];
    while !state.stop.load(Ordering::Acquire) {
        let rc = unsafe {
            libc::ioctl(
                fd,
                piloader_core::procimg::KB_WAIT_FOR_EVENT as libc::c_ulong,
                status.as_mut_ptr(),
            )
        };
        if rc < 0 {
            if !state.stop.load(Ordering::Acquire) {
                let fd = state.fd.swap(-1, Ordering::AcqRel);
                if fd >= 0 {
                    unsafe {
                        libc::close(fd);
                    }
                }
                warn!("wait-for-event ioctl is not implemented");
                state.exited.store(true, Ordering::Release);
            }
            break;
        }
        if rc == 0 && status[0] == 1 {
            state.triggered.store(true, Ordering::Release);
            debug!("driver reset detected");
            for callback in state.callbacks.lock().unwrap().iter() {
                callback();
            }
        }
    }

    debug!("leave reset-driver watch loop");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// A plain file does not implement the ioctl, which is exactly the
    /// fallback path: the thread exits and `triggered` stays true.
    #[test]
    fn unimplemented_ioctl_falls_back_to_always_triggered() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let dog = ResetDriverWatchdog::new(file.path());

        for _ in 0..100 {
            if dog.not_implemented() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(dog.not_implemented());
        assert!(dog.triggered());
        assert!(dog.triggered(), "stays true after the edge read");
        dog.stop();
    }

    #[test]
    fn missing_device_behaves_like_unimplemented() {
        let dog = ResetDriverWatchdog::new("/nonexistent/piControl0");
        for _ in 0..100 {
            if dog.not_implemented() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(dog.triggered());
        dog.stop();
    }

    #[test]
    fn callbacks_can_be_registered() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let dog = ResetDriverWatchdog::new(file.path());
        dog.register_call(|| {});
        dog.stop();
    }
}
