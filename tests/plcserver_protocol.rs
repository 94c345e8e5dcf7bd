// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! End-to-end tests of the binary PLC protocol over loopback.

use piloader_core::{FileDigests, IpAclManager, pictory};
use piloader_daemon::plcserver::frame::{ACK, DENIED, FRAME_LEN, Request};
use piloader_daemon::plcserver::{PlcServer, ServerShared};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const SAMPLE_RSC: &str = r#"{"App": {}, "Summary": {}, "Devices": []}"#;

struct Harness {
    _dir: TempDir,
    server: PlcServer,
    image: PathBuf,
    acl: Arc<RwLock<IpAclManager>>,
}

async fn start_server(level: i32, watchdog: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("image.bin");
    let mut content = vec![0u8; 4096];
    content[5..9].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
    std::fs::write(&image, &content).unwrap();

    let configrsc = dir.path().join("config.rsc");
    std::fs::write(&configrsc, SAMPLE_RSC).unwrap();

    let mut manager = IpAclManager::new(0, 9).unwrap();
    manager.load(&format!("127.0.0.1,{level}")).unwrap();
    let acl = Arc::new(RwLock::new(manager));

    let digests = Arc::new(FileDigests::new());
    digests.set_pictory(pictory::digest_file(&configrsc));

    let shared = Arc::new(ServerShared {
        acl: acl.clone(),
        digests,
        procimg: image.clone(),
        configrsc,
        replace_ios: Mutex::new(None),
        watchdog: AtomicBool::new(watchdog),
    });

    let server = PlcServer::start("127.0.0.1", 0, shared).await.unwrap();
    Harness {
        _dir: dir,
        server,
        image,
        acl,
    }
}

async fn connect(harness: &Harness) -> TcpStream {
    TcpStream::connect(harness.server.local_addr()).await.unwrap()
}

async fn send_frame(stream: &mut TcpStream, request: Request) {
    stream.write_all(&request.encode()).await.unwrap();
}

async fn read_bytes(stream: &mut TcpStream, count: usize) -> Vec<u8> {
    let mut buff = vec![0u8; count];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut buff))
        .await
        .expect("reply within deadline")
        .unwrap();
    buff
}

async fn wait_for_image(harness: &Harness, position: usize, expected: &[u8]) {
    for _ in 0..50 {
        let content = std::fs::read(&harness.image).unwrap();
        if &content[position..position + expected.len()] == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let content = std::fs::read(&harness.image).unwrap();
    assert_eq!(
        &content[position..position + expected.len()],
        expected,
        "image content at {position}"
    );
}

#[tokio::test]
async fn read_returns_exact_image_bytes() {
    let harness = start_server(0, true).await;
    let mut stream = connect(&harness).await;

    // "DA" at position 5, length 4, as raw wire bytes
    let raw: [u8; FRAME_LEN] = [
        0x01, 0x44, 0x41, 0x05, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x17,
    ];
    stream.write_all(&raw).await.unwrap();
    assert_eq!(read_bytes(&mut stream, 4).await, vec![0xAA, 0xBB, 0xCC, 0xDD]);
}

#[tokio::test]
async fn write_persists_and_acknowledges() {
    let harness = start_server(1, true).await;
    let mut stream = connect(&harness).await;

    send_frame(&mut stream, Request::new(*b"WD", 10, 3)).await;
    stream.write_all(&[0xAA, 0xBB, 0xCC]).await.unwrap();
    assert_eq!(read_bytes(&mut stream, 1).await, vec![ACK]);

    wait_for_image(&harness, 10, &[0xAA, 0xBB, 0xCC]).await;
}

#[tokio::test]
async fn write_denied_at_level_zero() {
    let harness = start_server(0, true).await;
    let mut stream = connect(&harness).await;

    send_frame(&mut stream, Request::new(*b"WD", 10, 3)).await;
    assert_eq!(read_bytes(&mut stream, 1).await, vec![DENIED]);

    // The server closes the connection after the denial
    let mut buff = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buff))
        .await
        .expect("close within deadline")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn dirty_set_applies_on_abrupt_disconnect() {
    let harness = start_server(1, true).await;
    let mut stream = connect(&harness).await;

    send_frame(&mut stream, Request::new(*b"EY", 20, 2)).await;
    stream.write_all(&[0xDE, 0xAD]).await.unwrap();
    assert_eq!(read_bytes(&mut stream, 1).await, vec![ACK]);

    drop(stream);
    wait_for_image(&harness, 20, &[0xDE, 0xAD]).await;
}

#[tokio::test]
async fn dirty_set_skipped_on_clean_exit() {
    let harness = start_server(1, true).await;
    let mut stream = connect(&harness).await;

    send_frame(&mut stream, Request::new(*b"EY", 20, 2)).await;
    stream.write_all(&[0xDE, 0xAD]).await.unwrap();
    assert_eq!(read_bytes(&mut stream, 1).await, vec![ACK]);

    send_frame(&mut stream, Request::new(*b"EX", 0, 0)).await;
    drop(stream);

    // Give the worker time to wind down, then verify nothing was written
    tokio::time::sleep(Duration::from_millis(300)).await;
    let content = std::fs::read(&harness.image).unwrap();
    assert_eq!(&content[20..22], &[0x00, 0x00]);
}

#[tokio::test]
async fn cleared_dirty_entries_are_not_applied() {
    let harness = start_server(1, true).await;
    let mut stream = connect(&harness).await;

    send_frame(&mut stream, Request::new(*b"EY", 20, 2)).await;
    stream.write_all(&[0xDE, 0xAD]).await.unwrap();
    assert_eq!(read_bytes(&mut stream, 1).await, vec![ACK]);

    // Clear position 20 again
    send_frame(
        &mut stream,
        Request::new(*b"EY", 20, 0).with_blob([0xFE, 0, 0, 0, 0, 0, 0, 0]),
    )
    .await;
    assert_eq!(read_bytes(&mut stream, 1).await, vec![ACK]);

    drop(stream);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let content = std::fs::read(&harness.image).unwrap();
    assert_eq!(&content[20..22], &[0x00, 0x00]);
}

#[tokio::test]
async fn scatter_write_applies_records_in_order() {
    let harness = start_server(1, true).await;
    let mut stream = connect(&harness).await;

    // Two records for position 3: the later one wins
    let mut payload = Vec::new();
    payload.extend_from_slice(&3u16.to_le_bytes());
    payload.extend_from_slice(&1u16.to_le_bytes());
    payload.push(0x11);
    payload.extend_from_slice(&3u16.to_le_bytes());
    payload.extend_from_slice(&1u16.to_le_bytes());
    payload.push(0x22);
    payload.extend_from_slice(&100u16.to_le_bytes());
    payload.extend_from_slice(&2u16.to_le_bytes());
    payload.extend_from_slice(&[0x33, 0x44]);

    send_frame(&mut stream, Request::new(*b"FD", 0, payload.len() as u16)).await;
    stream.write_all(&payload).await.unwrap();
    assert_eq!(read_bytes(&mut stream, 1).await, vec![ACK]);

    wait_for_image(&harness, 3, &[0x22]).await;
    wait_for_image(&harness, 100, &[0x33, 0x44]).await;
}

#[tokio::test]
async fn ping_echoes() {
    let harness = start_server(0, true).await;
    let mut stream = connect(&harness).await;

    send_frame(&mut stream, Request::new([0x06, 0x16], 0, 0)).await;
    assert_eq!(read_bytes(&mut stream, 2).await, vec![0x06, 0x16]);
}

#[tokio::test]
async fn digest_matches_document_bytes() {
    let harness = start_server(0, true).await;
    let mut stream = connect(&harness).await;

    send_frame(&mut stream, Request::new(*b"PH", 0, 0)).await;
    let digest = read_bytes(&mut stream, 16).await;
    assert_eq!(digest, md5::compute(SAMPLE_RSC.as_bytes()).0.to_vec());

    // Overlay digest is the all-zero sentinel while absent
    send_frame(&mut stream, Request::new(*b"RH", 0, 0)).await;
    assert_eq!(read_bytes(&mut stream, 16).await, vec![0u8; 16]);
}

#[tokio::test]
async fn document_stream_carries_length_prefix() {
    let harness = start_server(0, true).await;
    let mut stream = connect(&harness).await;

    send_frame(&mut stream, Request::new(*b"PI", 0, 0)).await;
    let length = read_bytes(&mut stream, 4).await;
    let length = u32::from_le_bytes(length.try_into().unwrap()) as usize;
    assert_eq!(length, SAMPLE_RSC.len());
    assert_eq!(read_bytes(&mut stream, length).await, SAMPLE_RSC.as_bytes());

    // The overlay is absent: a zero length follows
    send_frame(&mut stream, Request::new(*b"RP", 0, 0)).await;
    assert_eq!(read_bytes(&mut stream, 4).await, vec![0u8; 4]);
}

#[tokio::test]
async fn deadline_closes_idle_connection_and_applies_dirty_set() {
    let harness = start_server(1, true).await;
    let mut stream = connect(&harness).await;

    send_frame(&mut stream, Request::new(*b"EY", 30, 1)).await;
    stream.write_all(&[0x5A]).await.unwrap();
    assert_eq!(read_bytes(&mut stream, 1).await, vec![ACK]);

    // 100 ms deadline via CF
    send_frame(&mut stream, Request::new(*b"CF", 100, 0)).await;
    assert_eq!(read_bytes(&mut stream, 1).await, vec![ACK]);

    // Stay idle past the deadline: the server closes and persists
    wait_for_image(&harness, 30, &[0x5A]).await;
    let mut buff = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buff))
        .await
        .expect("close within deadline")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn malformed_frame_terminates_the_connection() {
    let harness = start_server(1, true).await;
    let mut stream = connect(&harness).await;

    let mut raw = Request::new(*b"DA", 0, 1).encode();
    raw[0] = 0x55;
    stream.write_all(&raw).await.unwrap();

    let mut buff = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buff))
        .await
        .expect("close within deadline")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn acl_recheck_drops_and_updates_connections() {
    let harness = start_server(1, true).await;
    let mut stream = connect(&harness).await;

    // Connection is alive
    send_frame(&mut stream, Request::new([0x06, 0x16], 0, 0)).await;
    assert_eq!(read_bytes(&mut stream, 2).await, vec![0x06, 0x16]);

    // Replace the ACL and recheck: the worker gets kicked
    harness.acl.write().unwrap().load("10.0.0.1,1").unwrap();
    harness.server.check_connected_acl();

    let mut buff = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buff))
        .await
        .expect("close within deadline")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn developer_commands_drop_acl_and_inject_errors() {
    let harness = start_server(9, true).await;
    let mut stream = connect(&harness).await;

    // 'b' switches error injection on: reads answer with the error byte
    send_frame(
        &mut stream,
        Request::new(*b"DV", 0, 0).with_blob([b'b', 0, 0, 0, 0, 0, 0, 0]),
    )
    .await;
    assert_eq!(read_bytes(&mut stream, 1).await, vec![ACK]);

    send_frame(&mut stream, Request::new(*b"DA", 5, 4)).await;
    assert_eq!(read_bytes(&mut stream, 1).await, vec![0xFF]);

    // Switch injection off again, then drop the connection's level
    send_frame(
        &mut stream,
        Request::new(*b"DV", 0, 0).with_blob([b'b', 0, 0, 0, 0, 0, 0, 0]),
    )
    .await;
    assert_eq!(read_bytes(&mut stream, 1).await, vec![ACK]);
    send_frame(
        &mut stream,
        Request::new(*b"DV", 0, 0).with_blob([b'a', 0, 0, 0, 0, 0, 0, 0]),
    )
    .await;
    assert_eq!(read_bytes(&mut stream, 1).await, vec![ACK]);

    // Writes are denied at the dropped level
    send_frame(&mut stream, Request::new(*b"WD", 0, 1)).await;
    assert_eq!(read_bytes(&mut stream, 1).await, vec![DENIED]);
}

#[tokio::test]
async fn developer_commands_are_denied_below_level_nine() {
    let harness = start_server(1, true).await;
    let mut stream = connect(&harness).await;

    send_frame(
        &mut stream,
        Request::new(*b"DV", 0, 0).with_blob([b'a', 0, 0, 0, 0, 0, 0, 0]),
    )
    .await;
    assert_eq!(read_bytes(&mut stream, 1).await, vec![DENIED]);
}

#[tokio::test]
async fn ioctl_forwarding_reports_driver_errors() {
    let harness = start_server(0, true).await;
    let mut stream = connect(&harness).await;

    // Request code 19212 against a plain file: the driver call fails
    let mut blob = [0u8; 8];
    blob[0..4].copy_from_slice(&19212u32.to_le_bytes());
    send_frame(&mut stream, Request::new(*b"IC", 0, 2).with_blob(blob)).await;
    stream.write_all(&[0x00, 0x00]).await.unwrap();
    assert_eq!(read_bytes(&mut stream, 1).await, vec![0xFF]);

    // The connection survives the failure
    send_frame(&mut stream, Request::new([0x06, 0x16], 0, 0)).await;
    assert_eq!(read_bytes(&mut stream, 2).await, vec![0x06, 0x16]);
}

#[tokio::test]
async fn dirty_clear_all_removes_every_entry() {
    let harness = start_server(1, true).await;
    let mut stream = connect(&harness).await;

    for position in [40u16, 42u16] {
        send_frame(&mut stream, Request::new(*b"EY", position, 1)).await;
        stream.write_all(&[0x77]).await.unwrap();
        assert_eq!(read_bytes(&mut stream, 1).await, vec![ACK]);
    }

    send_frame(
        &mut stream,
        Request::new(*b"EY", 0, 0).with_blob([0xFF, 0, 0, 0, 0, 0, 0, 0]),
    )
    .await;
    assert_eq!(read_bytes(&mut stream, 1).await, vec![ACK]);

    drop(stream);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let content = std::fs::read(&harness.image).unwrap();
    assert_eq!(&content[40..44], &[0x00, 0x00, 0x00, 0x00]);
}

#[tokio::test]
async fn last_dirty_insert_per_position_wins() {
    let harness = start_server(1, true).await;
    let mut stream = connect(&harness).await;

    for value in [0x11u8, 0x22u8] {
        send_frame(&mut stream, Request::new(*b"EY", 50, 1)).await;
        stream.write_all(&[value]).await.unwrap();
        assert_eq!(read_bytes(&mut stream, 1).await, vec![ACK]);
    }

    drop(stream);
    wait_for_image(&harness, 50, &[0x22]).await;
}
