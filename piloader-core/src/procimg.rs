// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Access to the piControl process image.
//!
//! The process image is a fixed-length byte region exposed as a character
//! device (`/dev/piControl0`). Reads and writes are byte exact and
//! positional. Writers intentionally do not lock against each other:
//! concurrent writes to non-overlapping ranges are the normal case.
//!
//! Every owning subsystem or connection keeps its own handle instead of
//! sharing one descriptor.

use crate::error::{CoreError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Default length of the process image in bytes.
pub const DEFAULT_IMAGE_SIZE: u64 = 4096;

// piControl ioctl requests ('K' block, 19200 + n)
/// Reset the driver including the configuration file.
pub const KB_RESET: u64 = 19212;
/// Read a single bit out of the image (struct { addr: u16, bit: u8, value: u8 }).
pub const KB_GET_VALUE: u64 = 19215;
/// Block until the driver signals an event; writes a 2 byte status.
pub const KB_WAIT_FOR_EVENT: u64 = 19250;

/// Handle on the process image device or an image file.
pub struct ProcessImage {
    file: File,
    path: PathBuf,
    size: u64,
}

impl ProcessImage {
    /// Open the image for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = image_size(&file);
        Ok(Self { file, path, size })
    }

    /// Open the image read-only (watchdog samplers).
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path)?;
        let size = image_size(&file);
        Ok(Self { file, path, size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Image length in bytes; constant for the lifetime of the handle.
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Read up to `length` bytes at `position`; short past the end.
    pub fn read_at(&mut self, position: u64, length: usize) -> Result<Vec<u8>> {
        if position >= self.size {
            return Ok(Vec::new());
        }
        let avail = (self.size - position).min(length as u64) as usize;
        let mut buff = vec![0u8; avail];
        self.file.seek(SeekFrom::Start(position))?;
        let mut done = 0;
        while done < avail {
            let n = self.file.read(&mut buff[done..])?;
            if n == 0 {
                buff.truncate(done);
                break;
            }
            done += n;
        }
        Ok(buff)
    }

    /// Write `bytes` at `position`; the whole range must lie inside the image.
    pub fn write_at(&mut self, position: u64, bytes: &[u8]) -> Result<()> {
        if position + bytes.len() as u64 > self.size {
            return Err(CoreError::OutOfImage {
                position,
                length: self.size,
            });
        }
        self.file.seek(SeekFrom::Start(position))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// Write zero across the entire image.
    pub fn zero(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&vec![0u8; self.size as usize])?;
        Ok(())
    }

    /// Read the bit `bit` of the byte at `byte_address` via the driver.
    #[cfg(target_os = "linux")]
    pub fn read_bit(&self, byte_address: u16, bit: u8) -> Result<bool> {
        use std::os::unix::io::AsRawFd;

        #[repr(C)]
        struct SpiValue {
            address: u16,
            bit: u8,
            value: u8,
        }

        let mut value = SpiValue {
            address: byte_address,
            bit,
            value: 0,
        };
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                KB_GET_VALUE as libc::c_ulong,
                &mut value as *mut SpiValue,
            )
        };
        if rc < 0 {
            return Err(ioctl_error(KB_GET_VALUE));
        }
        Ok(value.value != 0)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn read_bit(&self, _byte_address: u16, _bit: u8) -> Result<bool> {
        Err(CoreError::Unsupported)
    }

    /// Block until the driver has been reset; fills a 2 byte status.
    #[cfg(target_os = "linux")]
    pub fn wait_for_driver_reset(&self, status: &mut [u8; 2]) -> Result<i32> {
        use std::os::unix::io::AsRawFd;

        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                KB_WAIT_FOR_EVENT as libc::c_ulong,
                status.as_mut_ptr(),
            )
        };
        if rc < 0 {
            return Err(ioctl_error(KB_WAIT_FOR_EVENT));
        }
        Ok(rc)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn wait_for_driver_reset(&self, _status: &mut [u8; 2]) -> Result<i32> {
        Err(CoreError::Unsupported)
    }

    /// Synchronous reset of the piControl driver.
    #[cfg(target_os = "linux")]
    pub fn reset_driver(&self) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), KB_RESET as libc::c_ulong) };
        if rc < 0 {
            return Err(ioctl_error(KB_RESET));
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn reset_driver(&self) -> Result<()> {
        Err(CoreError::Unsupported)
    }

    /// Forward an arbitrary ioctl request with a caller supplied buffer.
    #[cfg(target_os = "linux")]
    pub fn ioctl_raw(&self, request: u64, buff: &mut [u8]) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let rc = if buff.is_empty() {
            unsafe { libc::ioctl(self.file.as_raw_fd(), request as libc::c_ulong) }
        } else {
            unsafe {
                libc::ioctl(
                    self.file.as_raw_fd(),
                    request as libc::c_ulong,
                    buff.as_mut_ptr(),
                )
            }
        };
        if rc < 0 {
            return Err(ioctl_error(request));
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn ioctl_raw(&self, _request: u64, _buff: &mut [u8]) -> Result<()> {
        Err(CoreError::Unsupported)
    }
}

/// Zero the image at `path` with a one-shot handle.
pub fn zero_image(path: impl AsRef<Path>) -> Result<()> {
    ProcessImage::open(path)?.zero()
}

/// Character devices report no size; fall back to the piControl default.
fn image_size(file: &File) -> u64 {
    match file.metadata() {
        Ok(meta) if meta.is_file() && meta.len() > 0 => meta.len(),
        _ => DEFAULT_IMAGE_SIZE,
    }
}

#[cfg(target_os = "linux")]
fn ioctl_error(request: u64) -> CoreError {
    CoreError::Ioctl {
        request,
        errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
    }
}
