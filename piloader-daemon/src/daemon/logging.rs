// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Log output target that can be reopened on SIGUSR1.
//!
//! `tracing` subscribers cannot be re-initialized at runtime, so file
//! rotation works the other way around: the subscriber writes through a
//! shared handle and `reopen` swaps the underlying file after logrotate
//! moved it away.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

enum Target {
    Stdout,
    File { path: PathBuf, file: Option<File> },
}

/// Shared, reopenable writer handed to the tracing fmt layer.
#[derive(Clone)]
pub struct ReopenableWriter {
    target: Arc<Mutex<Target>>,
}

impl ReopenableWriter {
    pub fn stdout() -> Self {
        Self {
            target: Arc::new(Mutex::new(Target::Stdout)),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            target: Arc::new(Mutex::new(Target::File {
                path: path.into(),
                file: None,
            })),
        }
    }

    /// Drop the current handle; the next write reopens the file.
    pub fn reopen(&self) {
        if let Target::File { file, .. } = &mut *self.target.lock().unwrap() {
            *file = None;
        }
    }
}

pub struct WriterHandle {
    target: Arc<Mutex<Target>>,
}

impl Write for WriterHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut *self.target.lock().unwrap() {
            Target::Stdout => std::io::stdout().write(buf),
            Target::File { path, file } => {
                if file.is_none() {
                    *file = Some(OpenOptions::new().create(true).append(true).open(path)?);
                }
                file.as_mut().expect("file just opened").write(buf)
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut *self.target.lock().unwrap() {
            Target::Stdout => std::io::stdout().flush(),
            Target::File { file, .. } => match file {
                Some(file) => file.flush(),
                None => Ok(()),
            },
        }
    }
}

impl<'a> MakeWriter<'a> for ReopenableWriter {
    type Writer = WriterHandle;

    fn make_writer(&'a self) -> Self::Writer {
        WriterHandle {
            target: self.target.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_land_in_the_file_and_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        let writer = ReopenableWriter::file(&path);

        let mut handle = writer.make_writer();
        handle.write_all(b"first\n").unwrap();
        handle.flush().unwrap();

        std::fs::rename(&path, dir.path().join("daemon.log.1")).unwrap();
        writer.reopen();

        let mut handle = writer.make_writer();
        handle.write_all(b"second\n").unwrap();
        handle.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\n");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("daemon.log.1")).unwrap(),
            "first\n"
        );
    }
}
