// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Incremental access to the daemon and program log files.
//!
//! Control clients poll the logs with a byte offset and get the tail
//! delta back. Two sentinel bytes replace missing data: `0x16` when the
//! file is not readable, `0x19` when the requested start lies beyond the
//! current end of the file (logrotate happened; the client starts over).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The log file is not accessible.
pub const LOG_UNREADABLE: u8 = 0x16;
/// The requested start byte lies beyond the end of the file.
pub const LOG_OUT_OF_RANGE: u8 = 0x19;

/// Reader with one cached handle per log file.
pub struct LogReader {
    logapp: PathBuf,
    logplc: PathBuf,
    app: Mutex<Option<File>>,
    plc: Mutex<Option<File>>,
}

impl LogReader {
    pub fn new(logapp: impl Into<PathBuf>, logplc: impl Into<PathBuf>) -> Self {
        Self {
            logapp: logapp.into(),
            logplc: logplc.into(),
            app: Mutex::new(None),
            plc: Mutex::new(None),
        }
    }

    /// Read the supervised program's log from `start`, at most `count` bytes.
    pub fn load_applog(&self, start: u64, count: usize) -> Vec<u8> {
        Self::load(&self.logapp, &self.app, start, count)
    }

    /// Read the daemon's own log from `start`, at most `count` bytes.
    pub fn load_plclog(&self, start: u64, count: usize) -> Vec<u8> {
        Self::load(&self.logplc, &self.plc, start, count)
    }

    /// Drop the cached handles; the next read reopens (logrotate).
    pub fn close_all(&self) {
        *self.app.lock().unwrap() = None;
        *self.plc.lock().unwrap() = None;
    }

    fn load(path: &Path, handle: &Mutex<Option<File>>, start: u64, count: usize) -> Vec<u8> {
        let size = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(_) => return vec![LOG_UNREADABLE],
        };
        if start > size {
            return vec![LOG_OUT_OF_RANGE];
        }

        let mut guard = handle.lock().unwrap();
        if guard.is_none() {
            match File::open(path) {
                Ok(file) => *guard = Some(file),
                Err(_) => return vec![LOG_UNREADABLE],
            }
        }
        let file = guard.as_mut().expect("handle just opened");

        let mut buff = vec![0u8; count];
        let read = file
            .seek(SeekFrom::Start(start))
            .and_then(|_| file.read(&mut buff));
        match read {
            Ok(n) => {
                buff.truncate(n);
                buff
            }
            Err(_) => vec![LOG_UNREADABLE],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_incrementally() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app.log");
        let plc = dir.path().join("plc.log");
        std::fs::write(&app, b"hello world").unwrap();
        std::fs::write(&plc, b"daemon log").unwrap();

        let reader = LogReader::new(&app, &plc);
        assert_eq!(reader.load_applog(0, 5), b"hello");
        assert_eq!(reader.load_applog(6, 100), b"world");
        assert_eq!(reader.load_plclog(0, 6), b"daemon");
    }

    #[test]
    fn sentinels_for_missing_and_rotated_files() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app.log");
        let reader = LogReader::new(&app, dir.path().join("absent.log"));

        assert_eq!(reader.load_plclog(0, 16), vec![LOG_UNREADABLE]);

        std::fs::write(&app, b"short").unwrap();
        assert_eq!(reader.load_applog(100, 16), vec![LOG_OUT_OF_RANGE]);
    }

    #[test]
    fn close_all_reopens_after_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app.log");
        std::fs::write(&app, b"first file").unwrap();

        let reader = LogReader::new(&app, dir.path().join("plc.log"));
        assert_eq!(reader.load_applog(0, 5), b"first");

        std::fs::remove_file(&app).unwrap();
        std::fs::write(&app, b"second").unwrap();
        reader.close_all();
        assert_eq!(reader.load_applog(0, 6), b"second");
    }
}
