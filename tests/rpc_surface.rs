// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! End-to-end tests of the XML-RPC control surface over loopback.

use piloader_core::Settings;
use piloader_daemon::daemon::{DaemonArgs, DaemonCommand, DaemonContext};
use piloader_daemon::rpc::xmlrpc::{self, Value};
use piloader_daemon::rpc::{RpcServer, methods};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

struct Harness {
    dir: TempDir,
    server: RpcServer,
}

async fn start_surface(acl_entry: &str) -> Harness {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("image.bin"), vec![0u8; 64]).unwrap();
    std::fs::write(
        dir.path().join("config.rsc"),
        r#"{"App": {}, "Summary": {}, "Devices": []}"#,
    )
    .unwrap();
    std::fs::write(dir.path().join("revpipyload.conf"), "[DEFAULT]\n").unwrap();

    let args = DaemonArgs {
        daemon: false,
        conffile: dir.path().join("revpipyload.conf"),
        procimg: dir.path().join("image.bin"),
        configrsc: dir.path().join("config.rsc"),
        rap_catalog: None,
        logapp: dir.path().join("app.log"),
        logplc: dir.path().join("plc.log"),
        developermode: false,
    };
    let mut settings = Settings::default();
    settings.program.plcworkdir = dir.path().to_string_lossy().into_owned();

    let mut ctx = DaemonContext::new(args, settings).unwrap();
    if !acl_entry.is_empty() {
        ctx.xmlrpc_acl.write().unwrap().load(acl_entry).unwrap();
    }
    let acl = ctx.xmlrpc_acl.clone();

    // Stand-in for the daemon mainloop: dispatch calls on a task
    let (command_tx, mut command_rx) = mpsc::channel(8);
    tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            if let DaemonCommand::Rpc(call) = command {
                let result =
                    methods::dispatch(&mut ctx, call.method, &call.params, call.level).await;
                let _ = call.respond.send(result);
            }
        }
    });

    let server = RpcServer::start("127.0.0.1", 0, acl, command_tx).await.unwrap();
    Harness { dir, server }
}

/// Minimal HTTP/1.1 POST; returns status line and body.
async fn http_post(harness: &Harness, body: &str) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(harness.server.local_addr()).await.unwrap();
    let request = format!(
        "POST / HTTP/1.1\r\nHost: piloader\r\nContent-Type: text/xml\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("response within deadline")
        .unwrap();

    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("complete header");
    let status = String::from_utf8_lossy(&response[..response.iter().position(|&b| b == b'\r').unwrap()])
        .into_owned();
    (status, response[header_end + 4..].to_vec())
}

async fn call(harness: &Harness, method: &str, params: &[Value]) -> Result<Value, xmlrpc::Fault> {
    let body = xmlrpc::write_method_call(method, params);
    let (status, body) = http_post(harness, &body).await;
    assert!(status.contains("200"), "unexpected status: {status}");
    xmlrpc::parse_method_response(&body).unwrap()
}

#[tokio::test]
async fn version_is_served() {
    let harness = start_surface("127.0.0.1,0").await;
    let value = call(&harness, "version", &[]).await.unwrap();
    assert_eq!(value, Value::Str(env!("CARGO_PKG_VERSION").to_string()));
}

#[tokio::test]
async fn xmlmodus_reports_the_caller_level() {
    let harness = start_surface("127.0.0.1,3").await;
    let value = call(&harness, "xmlmodus", &[]).await.unwrap();
    assert_eq!(value, Value::Int(3));
}

#[tokio::test]
async fn unknown_peer_is_rejected_before_dispatch() {
    let harness = start_surface("").await;
    let body = xmlrpc::write_method_call("version", &[]);
    let (status, _) = http_post(&harness, &body).await;
    assert!(status.contains("401"), "expected 401, got: {status}");
}

#[tokio::test]
async fn low_level_caller_cannot_reach_privileged_methods() {
    let harness = start_surface("127.0.0.1,1").await;
    let fault = call(&harness, "set_config", &[]).await.unwrap_err();
    assert!(fault.message.contains("access level"));

    // But level 1 methods work
    let value = call(&harness, "psstart", &[]).await.unwrap();
    assert_eq!(value, Value::Bool(false));
}

#[tokio::test]
async fn unknown_method_faults() {
    let harness = start_surface("127.0.0.1,4").await;
    let fault = call(&harness, "no_such_method", &[]).await.unwrap_err();
    assert!(fault.message.contains("not supported"));
}

#[tokio::test]
async fn exitcode_without_program_is_minus_two() {
    let harness = start_surface("127.0.0.1,0").await;
    let value = call(&harness, "plcexitcode", &[]).await.unwrap();
    assert_eq!(value, Value::Int(-2));
    let value = call(&harness, "plcrunning", &[]).await.unwrap();
    assert_eq!(value, Value::Bool(false));
}

#[tokio::test]
async fn procimg_dump_returns_the_raw_image() {
    let harness = start_surface("127.0.0.1,2").await;
    let value = call(&harness, "get_procimg", &[]).await.unwrap();
    assert_eq!(value, Value::Base64(vec![0u8; 64]));
}

#[tokio::test]
async fn upload_refuses_paths_outside_the_workdir() {
    let harness = start_surface("127.0.0.1,3").await;

    let payload = {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write as _;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"print('pwned')\n").unwrap();
        encoder.finish().unwrap()
    };

    let value = call(
        &harness,
        "plcupload",
        &[
            Value::Base64(payload.clone()),
            Value::Str("../escape.py".into()),
        ],
    )
    .await
    .unwrap();
    assert_eq!(value, Value::Bool(false));

    let value = call(
        &harness,
        "plcupload",
        &[Value::Base64(payload), Value::Str("sub/dir/ok.py".into())],
    )
    .await
    .unwrap();
    assert_eq!(value, Value::Bool(true));

    let uploaded = harness.dir.path().join("sub/dir/ok.py");
    assert_eq!(std::fs::read(uploaded).unwrap(), b"print('pwned')\n");
}

#[tokio::test]
async fn filelist_reflects_the_workdir() {
    let harness = start_surface("127.0.0.1,2").await;
    let workdir = harness.dir.path();
    std::fs::write(workdir.join("main.py"), "x").unwrap();

    let value = call(&harness, "get_filelist", &[]).await.unwrap();
    let Value::Array(files) = value else {
        panic!("expected array");
    };
    assert!(files.contains(&Value::Str("main.py".into())));
}

#[tokio::test]
async fn config_survives_the_get_set_roundtrip() {
    let harness = start_surface("127.0.0.1,4").await;

    let value = call(&harness, "get_config", &[]).await.unwrap();
    let Value::Struct(config) = value else {
        panic!("expected struct");
    };
    assert_eq!(config["autostart"], Value::Int(0));
    assert_eq!(config["pythonversion"], Value::Int(3));
    assert_eq!(config["plcslaveport"], Value::Int(55234));

    // Push an update; the daemon persists it into the configuration file
    let mut update = std::collections::BTreeMap::new();
    update.insert("autostart".to_string(), Value::Str("1".into()));
    update.insert("autoreloaddelay".to_string(), Value::Str("9".into()));
    let value = call(
        &harness,
        "set_config",
        &[Value::Struct(update), Value::Bool(false)],
    )
    .await
    .unwrap();
    assert_eq!(value, Value::Bool(true));

    let written = std::fs::read_to_string(harness.dir.path().join("revpipyload.conf")).unwrap();
    assert!(written.contains("autostart"));
    let reloaded =
        piloader_core::Settings::load(harness.dir.path().join("revpipyload.conf")).unwrap();
    assert!(reloaded.program.autostart);
    assert_eq!(reloaded.program.autoreloaddelay, 9);
}

#[tokio::test]
async fn invalid_config_updates_are_rejected_wholesale() {
    let harness = start_surface("127.0.0.1,4").await;

    let mut update = std::collections::BTreeMap::new();
    update.insert("autostart".to_string(), Value::Str("1".into()));
    update.insert("pythonversion".to_string(), Value::Str("7".into()));
    let value = call(
        &harness,
        "set_config",
        &[Value::Struct(update), Value::Bool(false)],
    )
    .await
    .unwrap();
    assert_eq!(value, Value::Bool(false));

    let reloaded =
        piloader_core::Settings::load(harness.dir.path().join("revpipyload.conf")).unwrap();
    assert!(!reloaded.program.autostart);
}

#[tokio::test]
async fn download_and_delete_single_files() {
    let harness = start_surface("127.0.0.1,3").await;
    let workdir = harness.dir.path();
    std::fs::write(workdir.join("job.py"), b"while True: pass\n").unwrap();

    let value = call(
        &harness,
        "plcdownload_file",
        &[Value::Str("job.py".into())],
    )
    .await
    .unwrap();
    let Value::Base64(compressed) = value else {
        panic!("expected base64");
    };
    let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
    let mut payload = Vec::new();
    std::io::Read::read_to_end(&mut decoder, &mut payload).unwrap();
    assert_eq!(payload, b"while True: pass\n");

    let value = call(&harness, "plcdeletefile", &[Value::Str("job.py".into())])
        .await
        .unwrap();
    assert_eq!(value, Value::Bool(true));
    assert!(!workdir.join("job.py").exists());

    // Deleting it again reports failure
    let value = call(&harness, "plcdeletefile", &[Value::Str("job.py".into())])
        .await
        .unwrap();
    assert_eq!(value, Value::Bool(false));
}
