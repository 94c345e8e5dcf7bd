// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Per-connection worker of the PLC server.
//!
//! Requests are handled strictly serialized per connection. The worker
//! keeps the connection's dirty set; every way of leaving the loop except
//! a clean `EX` applies the recorded bytes to the process image in
//! insertion order, so a client gets its fail-safe state without having
//! to participate at the moment of failure.

use super::ServerShared;
use crate::plcserver::frame::{ACK, DENIED, ERR, FRAME_LEN, Request};
use piloader_core::ProcessImage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Registry entry shared between a worker and the server.
pub struct ConnectionState {
    pub peer_ip: String,
    pub level: AtomicI32,
    pub got_io_overlay: AtomicBool,
    pub error_injection: AtomicBool,
    kicked: AtomicBool,
    kick: Notify,
}

impl ConnectionState {
    pub fn new(peer_ip: String, level: i32) -> Self {
        Self {
            peer_ip,
            level: AtomicI32::new(level),
            got_io_overlay: AtomicBool::new(false),
            error_injection: AtomicBool::new(false),
            kicked: AtomicBool::new(false),
            kick: Notify::new(),
        }
    }

    /// Ask the worker to drop the connection.
    pub fn kick(&self) {
        self.kicked.store(true, Ordering::Release);
        // notify_one stores a permit for a worker that is mid-handler
        self.kick.notify_one();
    }
}

enum Flow {
    Continue,
    CleanExit,
    DirtyExit,
}

pub(crate) struct Connection {
    stream: TcpStream,
    state: Arc<ConnectionState>,
    shared: Arc<ServerShared>,
    image: ProcessImage,
    deadline: Option<Duration>,
    /// Insertion-ordered position -> bytes
    dirty: Vec<(u16, Vec<u8>)>,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        state: Arc<ConnectionState>,
        shared: Arc<ServerShared>,
    ) -> std::io::Result<Self> {
        let image = ProcessImage::open(&shared.procimg)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(Self {
            stream,
            state,
            shared,
            image,
            deadline: None,
            dirty: Vec::new(),
        })
    }

    pub async fn run(mut self) {
        info!(
            "got new connection from host {} with acl {}",
            self.state.peer_ip,
            self.state.level.load(Ordering::Acquire)
        );

        let mut clean = false;
        loop {
            if self.state.kicked.load(Ordering::Acquire) {
                break;
            }

            let mut raw = [0u8; FRAME_LEN];
            let state = self.state.clone();
            let received = tokio::select! {
                r = read_frame(&mut self.stream, self.deadline, &mut raw) => r,
                () = state.kick.notified() => break,
            };
            match received {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    warn!("connection deadline hit while waiting for request");
                    break;
                }
                Err(_) => break,
            }

            let request = match Request::parse(&raw) {
                Ok(request) => request,
                Err(e) => {
                    error!("net cmd not valid: {}", e);
                    break;
                }
            };

            let started = Instant::now();
            let flow = match self.dispatch(&request).await {
                Ok(flow) => flow,
                Err(e) => {
                    debug!("connection io failed: {}", e);
                    break;
                }
            };

            match flow {
                Flow::Continue => {}
                Flow::CleanExit => {
                    clean = true;
                    break;
                }
                Flow::DirtyExit => break,
            }

            // Runtime accounting; the configuration stream is exempt
            if request.opcode != *b"PI"
                && let Some(deadline) = self.deadline
            {
                let elapsed = started.elapsed();
                if elapsed > deadline {
                    warn!(
                        "runtime more than {} ms: {} ms!",
                        deadline.as_millis(),
                        elapsed.as_millis()
                    );
                    if self.shared.watchdog.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
        }

        if !clean {
            self.apply_dirty_set();
        }

        info!("disconnected from {}", self.state.peer_ip);
    }

    async fn dispatch(&mut self, request: &Request) -> std::io::Result<Flow> {
        let level = self.state.level.load(Ordering::Acquire);
        match &request.opcode {
            b"DA" => self.handle_read(request).await,
            b"WD" => {
                if level < 1 {
                    return self.deny().await;
                }
                self.handle_write(request).await
            }
            b"FD" => {
                if level < 1 {
                    return self.deny().await;
                }
                self.handle_scatter_write(request).await
            }
            b"\x06\x16" => {
                self.stream.write_all(b"\x06\x16").await?;
                Ok(Flow::Continue)
            }
            b"CF" => self.handle_configure(request).await,
            b"EY" => {
                if level < 1 {
                    return self.deny().await;
                }
                self.handle_dirty_set(request).await
            }
            b"PI" => self.stream_document(Some(self.shared.configrsc.clone())).await,
            b"PH" => {
                let digest = self.shared.digests.pictory();
                self.stream.write_all(&digest).await?;
                Ok(Flow::Continue)
            }
            b"RP" => {
                self.state.got_io_overlay.store(true, Ordering::Release);
                let path = self.shared.replace_ios.lock().unwrap().clone();
                self.stream_document(path).await
            }
            b"RH" => {
                self.state.got_io_overlay.store(true, Ordering::Release);
                let digest = self.shared.digests.replace_ios();
                self.stream.write_all(&digest).await?;
                Ok(Flow::Continue)
            }
            b"EX" => Ok(Flow::CleanExit),
            b"IC" => self.handle_ioctl(request).await,
            b"DV" => {
                if level < 9 {
                    return self.deny().await;
                }
                self.handle_developer(request).await
            }
            other => {
                error!("unknown net cmd {:02x?}", other);
                Ok(Flow::DirtyExit)
            }
        }
    }

    async fn deny(&mut self) -> std::io::Result<Flow> {
        warn!(
            "host {} got access denied at level {}",
            self.state.peer_ip,
            self.state.level.load(Ordering::Acquire)
        );
        self.stream.write_all(&[DENIED]).await?;
        Ok(Flow::DirtyExit)
    }

    async fn handle_read(&mut self, request: &Request) -> std::io::Result<Flow> {
        if self.state.error_injection.load(Ordering::Acquire) {
            self.stream.write_all(&[ERR]).await?;
            return Ok(Flow::Continue);
        }
        match self
            .image
            .read_at(u64::from(request.position), usize::from(request.length))
        {
            Ok(bytes) => {
                self.stream.write_all(&bytes).await?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                error!("error while reading process image: {}", e);
                self.stream.write_all(&[ERR]).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_write(&mut self, request: &Request) -> std::io::Result<Flow> {
        let block = match self.receive_payload(usize::from(request.length)).await {
            Ok(block) => block,
            Err(e) => {
                error!("error while recv data to write: {}", e);
                return Ok(Flow::DirtyExit);
            }
        };
        if self.state.error_injection.load(Ordering::Acquire) {
            self.stream.write_all(&[ERR]).await?;
            return Ok(Flow::Continue);
        }
        match self.image.write_at(u64::from(request.position), &block) {
            Ok(()) => {
                self.stream.write_all(&[ACK]).await?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                error!("error while writing process image: {}", e);
                self.stream.write_all(&[ERR]).await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Scatter write: repeated `(pos:u16le, len:u16le, bytes[len])`
    /// records, applied in arrival order.
    async fn handle_scatter_write(&mut self, request: &Request) -> std::io::Result<Flow> {
        let block = match self.receive_payload(usize::from(request.length)).await {
            Ok(block) => block,
            Err(e) => {
                error!("error while recv scatter data: {}", e);
                return Ok(Flow::DirtyExit);
            }
        };
        if self.state.error_injection.load(Ordering::Acquire) {
            self.stream.write_all(&[ERR]).await?;
            return Ok(Flow::Continue);
        }

        let mut offset = 0usize;
        let mut failed = false;
        while offset < block.len() {
            if block.len() - offset < 4 {
                error!("scatter write record header truncated");
                return Ok(Flow::DirtyExit);
            }
            let pos = u16::from_le_bytes([block[offset], block[offset + 1]]);
            let len = usize::from(u16::from_le_bytes([block[offset + 2], block[offset + 3]]));
            offset += 4;
            if block.len() - offset < len {
                error!("scatter write record data truncated");
                return Ok(Flow::DirtyExit);
            }
            if let Err(e) = self
                .image
                .write_at(u64::from(pos), &block[offset..offset + len])
            {
                error!("error while scatter writing process image: {}", e);
                failed = true;
            }
            offset += len;
        }

        let reply = if failed { ERR } else { ACK };
        self.stream.write_all(&[reply]).await?;
        Ok(Flow::Continue)
    }

    async fn handle_configure(&mut self, request: &Request) -> std::io::Result<Flow> {
        let timeout_ms = request.position;
        if timeout_ms == 0 || timeout_ms == u16::MAX {
            error!("timeout value must be 1 to 65534");
            return Ok(Flow::DirtyExit);
        }
        self.deadline = Some(Duration::from_millis(u64::from(timeout_ms)));
        self.stream.write_all(&[ACK]).await?;
        Ok(Flow::Continue)
    }

    async fn handle_dirty_set(&mut self, request: &Request) -> std::io::Result<Flow> {
        match request.blob[0] {
            0xFF => {
                self.dirty.clear();
                self.stream.write_all(&[ACK]).await?;
                info!("cleared all dirty bytes");
            }
            0xFE => {
                self.dirty.retain(|(pos, _)| *pos != request.position);
                self.stream.write_all(&[ACK]).await?;
                info!("cleared dirty bytes on position {}", request.position);
            }
            _ => {
                let block = match self.receive_payload(usize::from(request.length)).await {
                    Ok(block) => block,
                    Err(e) => {
                        error!("error while recv dirty bytes: {}", e);
                        return Ok(Flow::DirtyExit);
                    }
                };
                match self.dirty.iter_mut().find(|(pos, _)| *pos == request.position) {
                    Some((_, bytes)) => *bytes = block,
                    None => self.dirty.push((request.position, block)),
                }
                self.stream.write_all(&[ACK]).await?;
                info!(
                    "got dirty bytes to write on error on position {}",
                    request.position
                );
            }
        }
        Ok(Flow::Continue)
    }

    /// Stream a document as 4 byte little-endian length plus bytes; a
    /// 4 byte zero signals failure or absence.
    async fn stream_document(&mut self, path: Option<std::path::PathBuf>) -> std::io::Result<Flow> {
        let bytes = match path {
            Some(path) => std::fs::read(path).ok(),
            None => None,
        };
        match bytes {
            Some(bytes) => {
                self.stream
                    .write_all(&(bytes.len() as u32).to_le_bytes())
                    .await?;
                self.stream.write_all(&bytes).await?;
            }
            None => {
                self.stream.write_all(&0u32.to_le_bytes()).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_ioctl(&mut self, request: &Request) -> std::io::Result<Flow> {
        let mut buff = match self.receive_payload(usize::from(request.length)).await {
            Ok(buff) => buff,
            Err(e) => {
                error!("error while recv ioctl data: {}", e);
                return Ok(Flow::DirtyExit);
            }
        };
        let code = u64::from(u32::from_le_bytes(
            request.blob[0..4].try_into().expect("4 code bytes"),
        ));
        match self.image.ioctl_raw(code, &mut buff) {
            Ok(()) => self.stream.write_all(&[ACK]).await?,
            Err(e) => {
                error!("ioctl {} failed: {}", code, e);
                self.stream.write_all(&[ERR]).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_developer(&mut self, request: &Request) -> std::io::Result<Flow> {
        match request.blob[0] {
            b'a' => {
                self.state.level.store(0, Ordering::Release);
                warn!("developer request dropped acl of {} to 0", self.state.peer_ip);
                self.stream.write_all(&[ACK]).await?;
            }
            b'b' => {
                let injecting = !self.state.error_injection.load(Ordering::Acquire);
                self.state.error_injection.store(injecting, Ordering::Release);
                warn!(
                    "developer request set error injection to {} for {}",
                    injecting, self.state.peer_ip
                );
                self.stream.write_all(&[ACK]).await?;
            }
            other => {
                error!("unknown developer sub-command {:#04x}", other);
                self.stream.write_all(&[ERR]).await?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Read an opcode payload from the socket, bounded by the deadline.
    async fn receive_payload(&mut self, length: usize) -> std::io::Result<Vec<u8>> {
        let mut block = vec![0u8; length];
        match self.deadline {
            Some(deadline) => {
                tokio::time::timeout(deadline, self.stream.read_exact(&mut block))
                    .await
                    .map_err(|_| {
                        std::io::Error::new(std::io::ErrorKind::TimedOut, "payload deadline")
                    })??;
            }
            None => {
                self.stream.read_exact(&mut block).await?;
            }
        }
        Ok(block)
    }

    fn apply_dirty_set(&mut self) {
        if self.dirty.is_empty() {
            return;
        }
        for (pos, bytes) in &self.dirty {
            if let Err(e) = self.image.write_at(u64::from(*pos), bytes) {
                error!("can not apply dirty bytes at position {}: {}", pos, e);
            }
        }
        error!("dirty shutdown of connection");
    }
}

async fn read_frame(
    stream: &mut TcpStream,
    deadline: Option<Duration>,
    raw: &mut [u8; FRAME_LEN],
) -> std::io::Result<()> {
    match deadline {
        Some(deadline) => {
            tokio::time::timeout(deadline, stream.read_exact(raw))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "frame deadline"))??;
        }
        None => {
            stream.read_exact(raw).await?;
        }
    }
    Ok(())
}
