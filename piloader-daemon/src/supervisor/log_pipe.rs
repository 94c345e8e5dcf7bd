// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Pipe-fed writer for the supervised program's log file.
//!
//! The child's stdout/stderr cannot be re-pointed at a new file handle
//! after a logrotate; routing them through a pipe sidesteps that. The
//! write end of the pipe is handed to the child as its stdio, a
//! background thread drains the read end into the current log file, and
//! `rotate` swaps the file under the shared mutex without touching the
//! child.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error};

struct Inner {
    logfile: PathBuf,
    file: Mutex<File>,
    stop: AtomicBool,
}

/// Background writer draining a pipe into a rotatable log file.
pub struct PipeLogWriter {
    inner: Arc<Inner>,
    write_end: OwnedFd,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PipeLogWriter {
    /// Open the log file and the pipe pair.
    pub fn new(logfile: impl AsRef<Path>) -> std::io::Result<Self> {
        let logfile = logfile.as_ref().to_path_buf();
        let file = open_logfile(&logfile)?;
        let (read_end, write_end) = make_pipe()?;
        debug!(
            "pipe fd read: {} / write: {}",
            read_end.as_raw_fd(),
            write_end.as_raw_fd()
        );

        let inner = Arc::new(Inner {
            logfile,
            file: Mutex::new(file),
            stop: AtomicBool::new(false),
        });

        let writer = Self {
            inner,
            write_end,
            reader: Mutex::new(None),
        };
        writer.start(read_end);
        Ok(writer)
    }

    fn start(&self, read_end: OwnedFd) {
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("pipe-logwriter".into())
            .spawn(move || {
                let mut reader = BufReader::new(File::from(read_end));
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            let mut file = inner.file.lock().unwrap();
                            if let Err(e) =
                                file.write_all(line.as_bytes()).and_then(|()| file.flush())
                            {
                                error!("can not write log line: {}", e);
                            }
                        }
                        Err(e) => {
                            error!("pipe read failed: {}", e);
                            break;
                        }
                    }
                    if inner.stop.load(Ordering::Acquire) {
                        break;
                    }
                }
                debug!("leave logwriter pipe loop");
            })
            .expect("spawn pipe-logwriter thread");
        *self.reader.lock().unwrap() = Some(handle);
    }

    /// Write end of the pipe as stdio for a spawned child.
    pub fn child_stdio(&self) -> std::io::Result<Stdio> {
        Ok(Stdio::from(self.write_end.try_clone()?))
    }

    /// Write a line directly into the log file (banner messages).
    pub fn log_line(&self, message: &str) {
        let mut file = self.inner.file.lock().unwrap();
        if let Err(e) = writeln!(file, "{message}").and_then(|()| file.flush()) {
            error!("can not write log line: {}", e);
        }
    }

    /// Close and reopen the log file (logrotate support).
    pub fn rotate(&self) -> std::io::Result<()> {
        let mut file = self.inner.file.lock().unwrap();
        *file = open_logfile(&self.inner.logfile)?;
        Ok(())
    }

    /// Stop the reader thread and close both pipe ends. Idempotent.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);

        // One newline to unblock the reader
        let fd = self.write_end.as_raw_fd();
        unsafe {
            libc::write(fd, b"\n".as_ptr().cast(), 1);
        }

        if let Some(handle) = self.reader.lock().unwrap().take()
            && handle.join().is_err()
        {
            error!("pipe-logwriter thread panicked");
        }
    }
}

impl Drop for PipeLogWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_logfile(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn make_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn wait_for_content(path: &Path, needle: &str) -> String {
        for _ in 0..50 {
            let content = std::fs::read_to_string(path).unwrap_or_default();
            if content.contains(needle) {
                return content;
            }
            thread::sleep(Duration::from_millis(20));
        }
        std::fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn pipe_lines_end_up_in_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let logfile = dir.path().join("app.log");
        let writer = PipeLogWriter::new(&logfile).unwrap();

        let fd = writer.write_end.as_raw_fd();
        let line = b"hello from the child\n";
        assert_eq!(
            unsafe { libc::write(fd, line.as_ptr().cast(), line.len()) },
            line.len() as isize
        );

        let content = wait_for_content(&logfile, "hello from the child");
        assert!(content.contains("hello from the child"));
        writer.stop();
    }

    #[test]
    fn log_line_is_synchronous() {
        let dir = tempfile::tempdir().unwrap();
        let logfile = dir.path().join("app.log");
        let writer = PipeLogWriter::new(&logfile).unwrap();

        writer.log_line("banner");
        let content = std::fs::read_to_string(&logfile).unwrap();
        assert_eq!(content, "banner\n");
        writer.stop();
    }

    #[test]
    fn rotate_switches_to_the_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let logfile = dir.path().join("app.log");
        let writer = PipeLogWriter::new(&logfile).unwrap();

        writer.log_line("before rotate");
        std::fs::rename(&logfile, dir.path().join("app.log.1")).unwrap();
        writer.rotate().unwrap();
        writer.log_line("after rotate");

        let content = std::fs::read_to_string(&logfile).unwrap();
        assert!(!content.contains("before rotate"));
        assert!(content.contains("after rotate"));
        writer.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PipeLogWriter::new(dir.path().join("app.log")).unwrap();
        writer.stop();
        writer.stop();
    }
}
