// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Implementations of the registered XML-RPC methods.
//!
//! Every method runs on the daemon mainloop with `&mut` access to the
//! [`DaemonContext`]. Status conventions follow the wire contract of the
//! control clients: most failures are ordinary return codes, not faults.

use crate::daemon::DaemonContext;
use crate::rpc::xmlrpc::{Fault, Value};
use crate::rpc::RpcMethod;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use piloader_core::{ProcessImage, config, pictory};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

pub async fn dispatch(
    ctx: &mut DaemonContext,
    method: RpcMethod,
    params: &[Value],
    level: i32,
) -> Result<Value, Fault> {
    match method {
        RpcMethod::Version => Ok(Value::Str(env!("CARGO_PKG_VERSION").to_string())),
        RpcMethod::XmlModus => Ok(params.first().cloned().unwrap_or(Value::Int(level))),

        RpcMethod::LoadAppLog => {
            let (start, count) = log_window(params)?;
            Ok(Value::Base64(ctx.logreader.load_applog(start, count)))
        }
        RpcMethod::LoadPlcLog => {
            let (start, count) = log_window(params)?;
            Ok(Value::Base64(ctx.logreader.load_plclog(start, count)))
        }

        RpcMethod::PlcExitcode => {
            debug!("xmlrpc call plcexitcode");
            Ok(Value::Int(match &ctx.plc {
                None => crate::supervisor::EXITCODE_NO_PROGRAM,
                Some(plc) => plc.exit_code(),
            }))
        }
        RpcMethod::PlcRunning => {
            debug!("xmlrpc call plcrunning");
            Ok(Value::Bool(ctx.plc.as_ref().is_some_and(|p| p.running())))
        }
        RpcMethod::PlcStart => {
            debug!("xmlrpc call plcstart");
            if ctx.plc.as_ref().is_some_and(|p| p.running()) {
                return Ok(Value::Int(-1));
            }
            ctx.plc = ctx.build_program();
            match &mut ctx.plc {
                None => Ok(Value::Int(-2)),
                Some(plc) => {
                    plc.start();
                    Ok(Value::Int(0))
                }
            }
        }
        RpcMethod::PlcStop => {
            debug!("xmlrpc call plcstop");
            match &mut ctx.plc {
                Some(plc) if plc.running() => {
                    plc.stop().await;
                    Ok(Value::Int(plc.exit_code()))
                }
                _ => Ok(Value::Int(-1)),
            }
        }
        RpcMethod::Reload => {
            debug!("xmlrpc call reload");
            ctx.reload_event.store(true, Ordering::Release);
            Ok(Value::Nil)
        }

        RpcMethod::MqttRunning => Ok(Value::Bool(false)),
        RpcMethod::MqttStart => Ok(Value::Int(-1)),
        RpcMethod::MqttStop => Ok(Value::Bool(false)),
        RpcMethod::PsStart | RpcMethod::PsStop => Ok(Value::Bool(false)),

        RpcMethod::PlcServerRunning => {
            debug!("xmlrpc call plcserverrunning");
            Ok(Value::Bool(
                ctx.plcserver.as_ref().is_some_and(|s| s.is_alive()),
            ))
        }
        RpcMethod::PlcServerStart => {
            if ctx.plcserver.as_ref().is_some_and(|s| s.is_alive()) {
                return Ok(Value::Int(-2));
            }
            if !ctx.settings.plcserver.enabled {
                return Ok(Value::Int(-1));
            }
            match ctx.start_plc_server().await {
                Ok(server) => {
                    ctx.plcserver = Some(server);
                    Ok(Value::Int(0))
                }
                Err(e) => {
                    error!("can not start plc server: {}", e);
                    Ok(Value::Int(-1))
                }
            }
        }
        RpcMethod::PlcServerStop => match &mut ctx.plcserver {
            Some(server) => {
                server.stop().await;
                ctx.plcserver = None;
                Ok(Value::Bool(true))
            }
            None => Ok(Value::Bool(false)),
        },

        RpcMethod::GetConfig => Ok(get_config(ctx)),
        RpcMethod::GetFileList => {
            debug!("xmlrpc call getfilelist");
            let files = walk_files(&ctx.workdir())
                .into_iter()
                .map(|(_, rel)| Value::Str(rel))
                .collect();
            Ok(Value::Array(files))
        }
        RpcMethod::GetPictoryRsc => {
            debug!("xmlrpc call getpictoryrsc");
            match std::fs::read(&ctx.args.configrsc) {
                Ok(bytes) => Ok(Value::Base64(bytes)),
                Err(e) => Err(Fault::new(2001, format!("can not read configuration: {e}"))),
            }
        }
        RpcMethod::GetProcImg => {
            debug!("xmlrpc call getprocimg");
            let bytes = ProcessImage::open_read_only(&ctx.args.procimg)
                .and_then(|mut img| {
                    let len = img.len() as usize;
                    img.read_at(0, len)
                })
                .map_err(|e| Fault::new(4001, format!("can not read process image: {e}")))?;
            Ok(Value::Base64(bytes))
        }

        RpcMethod::PlcDownload => {
            debug!("xmlrpc call plcdownload");
            let mode = params.first().and_then(Value::as_str).unwrap_or("tar");
            let with_pictory = params.get(1).and_then(Value::as_bool).unwrap_or(false);
            match pack_archive(ctx, mode, with_pictory) {
                Ok(bytes) => Ok(Value::Base64(bytes)),
                Err(e) => {
                    error!("can not pack plc archive: {}", e);
                    Ok(Value::Base64(Vec::new()))
                }
            }
        }
        RpcMethod::PlcDownloadFile => {
            let Some(name) = params.first().and_then(Value::as_str) else {
                return Ok(Value::Base64(Vec::new()));
            };
            Ok(Value::Base64(download_file(ctx, name).unwrap_or_default()))
        }
        RpcMethod::PlcUpload => {
            debug!("xmlrpc call plcupload");
            let data = params.first().and_then(Value::as_base64);
            let name = params.get(1).and_then(Value::as_str);
            match (data, name) {
                (Some(data), Some(name)) => Ok(Value::Bool(upload_file(ctx, data, name))),
                _ => Ok(Value::Bool(false)),
            }
        }
        RpcMethod::PlcUploadClean => {
            debug!("xmlrpc call plcuploadclean");
            Ok(Value::Bool(clean_workdir(&ctx.workdir())))
        }
        RpcMethod::PlcDeleteFile => {
            let Some(name) = params.first().and_then(Value::as_str) else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(delete_file(ctx, name)))
        }

        RpcMethod::ResetPiControl => {
            let rc = match ProcessImage::open(&ctx.args.procimg) {
                Ok(img) => match img.reset_driver() {
                    Ok(()) => {
                        info!("reset piControl driver");
                        0
                    }
                    Err(e) => {
                        warn!("could not reset piControl driver: {}", e);
                        1
                    }
                },
                Err(e) => {
                    warn!("could not open piControl to reset driver: {}", e);
                    1
                }
            };
            Ok(Value::Int(rc))
        }

        RpcMethod::SetConfig => {
            debug!("xmlrpc call setconfig");
            let Some(Value::Struct(members)) = params.first() else {
                return Ok(Value::Bool(false));
            };
            let loadnow = params.get(1).and_then(Value::as_bool).unwrap_or(false);
            Ok(Value::Bool(set_config(ctx, members, loadnow)))
        }
        RpcMethod::SetPictoryRsc => {
            debug!("xmlrpc call setpictoryrsc");
            let Some(bytes) = params.first().and_then(Value::as_base64) else {
                return Ok(Value::Int(-1));
            };
            let reset = params.get(1).and_then(Value::as_bool).unwrap_or(false);
            Ok(Value::Int(set_pictoryrsc(ctx, bytes, reset)))
        }
    }
}

fn log_window(params: &[Value]) -> Result<(u64, usize), Fault> {
    let start = params.first().and_then(Value::as_int).unwrap_or(0);
    let count = params.get(1).and_then(Value::as_int).unwrap_or(0);
    if start < 0 || count < 0 {
        return Err(Fault::new(1004, "start and count must not be negative"));
    }
    Ok((start as u64, count as usize))
}

fn get_config(ctx: &DaemonContext) -> Value {
    debug!("xmlrpc call getconfig");
    let s = &ctx.settings;
    let mut dc = BTreeMap::new();
    let mut put = |key: &str, value: Value| {
        dc.insert(key.to_string(), value);
    };

    let int_of = |b: bool| Value::Int(i32::from(b));

    put("autoreload", int_of(s.program.autoreload));
    put("autoreloaddelay", Value::Int(s.program.autoreloaddelay as i32));
    put("autostart", int_of(s.program.autostart));
    put("plcworkdir", Value::Str(s.program.plcworkdir.clone()));
    put("plcworkdir_set_uid", int_of(s.program.plcworkdir_set_uid));
    put("plcprogram", Value::Str(s.program.plcprogram.clone()));
    put(
        "plcprogram_stop_timeout",
        Value::Int(s.program.plcprogram_stop_timeout as i32),
    );
    put(
        "plcprogram_watchdog",
        Value::Int(s.program.plcprogram_watchdog as i32),
    );
    put("plcarguments", Value::Str(s.program.plcarguments.clone()));
    put("plcuid", Value::Int(s.program.plcuid as i32));
    put("plcgid", Value::Int(s.program.plcgid as i32));
    put("pythonversion", Value::Int(i32::from(s.program.pythonversion)));
    let replace_ios = s
        .program
        .replace_ios
        .strip_prefix(&format!("{}/", s.program.plcworkdir))
        .unwrap_or(&s.program.replace_ios);
    put("replace_ios", Value::Str(replace_ios.to_string()));
    put(
        "reset_driver_action",
        Value::Int(i32::from(s.program.reset_driver_action.as_int())),
    );
    put("rtlevel", Value::Int(i32::from(s.program.rtlevel)));
    put("zeroonerror", int_of(s.program.zeroonerror));
    put("zeroonexit", int_of(s.program.zeroonexit));

    put("mqtt", int_of(s.mqtt.enabled));
    put("mqttbasetopic", Value::Str(s.mqtt.basetopic.clone()));
    put("mqttsendinterval", Value::Int(s.mqtt.sendinterval as i32));
    put("mqttbroker_address", Value::Str(s.mqtt.broker_address.clone()));
    put("mqttport", Value::Int(i32::from(s.mqtt.port)));
    put("mqtttls_set", int_of(s.mqtt.tls_set));
    put("mqttusername", Value::Str(s.mqtt.username.clone()));
    put("mqttpassword", Value::Str(s.mqtt.password.clone()));
    put("mqttclient_id", Value::Str(s.mqtt.client_id.clone()));
    put("mqttsend_on_event", int_of(s.mqtt.send_on_event));
    put("mqttwrite_outputs", int_of(s.mqtt.write_outputs));

    // Server keys keep their legacy wire names for client compatibility
    put("plcslave", int_of(s.plcserver.enabled));
    put(
        "plcslaveacl",
        Value::Str(ctx.plcserver_acl.read().unwrap().acl_string()),
    );
    put("plcslavebindip", Value::Str(s.plcserver.bindip.clone()));
    put("plcslaveport", Value::Int(i32::from(s.plcserver.port)));
    put("plcslavewatchdog", int_of(s.plcserver.watchdog));

    put("xmlrpc", int_of(s.xmlrpc.enabled));
    put(
        "xmlrpcacl",
        Value::Str(ctx.xmlrpc_acl.read().unwrap().acl_string()),
    );
    put("xmlrpcbindip", Value::Str(s.xmlrpc.bindip.clone()));

    Value::Struct(dc)
}

fn set_config(ctx: &mut DaemonContext, members: &BTreeMap<String, Value>, loadnow: bool) -> bool {
    let mut updates = BTreeMap::new();
    for (key, value) in members {
        let text = match value {
            Value::Str(s) => s.clone(),
            Value::Int(v) => v.to_string(),
            Value::Bool(v) => u8::from(*v).to_string(),
            Value::Double(v) => v.to_string(),
            _ => continue,
        };
        updates.insert(key.clone(), text);
    }

    let plc_pattern = ctx.plcserver_acl.read().unwrap().regex_acl();
    let rpc_pattern = ctx.xmlrpc_acl.read().unwrap().regex_acl();
    let applied = match config::update_file(&ctx.args.conffile, &updates, &plc_pattern, &rpc_pattern)
    {
        Ok(applied) => applied,
        Err(e) => {
            error!("got wrong setting: {}", e);
            return false;
        }
    };
    info!("got new config and wrote it to {}", ctx.args.conffile.display());

    // ACLs take effect immediately and are written to their own files
    if let Some(acl) = applied.plcserver_acl
        && !store_acl(&ctx.plcserver_acl, &acl, "PLC-SERVER")
    {
        return false;
    }
    if let Some(acl) = applied.xmlrpc_acl
        && !store_acl(&ctx.xmlrpc_acl, &acl, "XML-RPC")
    {
        return false;
    }
    ctx.refresh_plc_server();

    if loadnow {
        ctx.reload_event.store(true, Ordering::Release);
    }
    true
}

fn store_acl(
    manager: &std::sync::Arc<std::sync::RwLock<piloader_core::IpAclManager>>,
    acl: &str,
    name: &str,
) -> bool {
    let mut manager = manager.write().unwrap();
    if manager.acl_string() == acl {
        return true;
    }
    if let Err(e) = manager.load(acl) {
        error!("can not load new {} acl: {}", name, e);
        return false;
    }
    match manager.write_file(None, Some(name)) {
        Ok(()) => {
            info!(
                "wrote new acl file '{}' for {}",
                manager.filename().map(|p| p.display().to_string()).unwrap_or_default(),
                name
            );
            true
        }
        Err(e) => {
            error!("can not write acl file for {}: {}", name, e);
            false
        }
    }
}

fn set_pictoryrsc(ctx: &mut DaemonContext, bytes: &[u8], reset: bool) -> i32 {
    match pictory::validate_document(bytes) {
        Ok(()) => {}
        Err(pictory::DocumentError::NotJson) => return -1,
        Err(pictory::DocumentError::MissingKey(_)) => return -2,
    }

    let Some(catalog) = &ctx.args.rap_catalog else {
        return -5;
    };
    let Ok(ids) = pictory::module_ids(bytes) else {
        return -2;
    };
    for id in &ids {
        if !catalog.iter().any(|entry| entry.contains(id.as_str())) {
            return -4;
        }
    }

    if std::fs::write(&ctx.args.configrsc, bytes).is_err() {
        return -3;
    }

    if reset {
        let rc = ProcessImage::open(&ctx.args.procimg)
            .and_then(|img| img.reset_driver())
            .map(|()| 0)
            .unwrap_or(1);
        return rc;
    }
    0
}

/// Recursive file list below `dir`, as `(absolute, relative)` pairs.
/// Interpreter caches are left out, matching the archive content.
fn walk_files(dir: &Path) -> Vec<(PathBuf, String)> {
    fn walk(base: &Path, dir: &Path, out: &mut Vec<(PathBuf, String)>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let mut entries: Vec<_> = entries.flatten().collect();
        entries.sort_by_key(std::fs::DirEntry::file_name);
        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                if entry.file_name() != "__pycache__" {
                    walk(base, &path, out);
                }
            } else if let Ok(rel) = path.strip_prefix(base) {
                out.push((path.clone(), rel.to_string_lossy().into_owned()));
            }
        }
    }

    let mut out = Vec::new();
    walk(dir, dir, &mut out);
    out
}

fn pack_archive(ctx: &DaemonContext, mode: &str, with_pictory: bool) -> std::io::Result<Vec<u8>> {
    let workdir = ctx.workdir();
    let base = workdir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plc".to_string());
    let files = walk_files(&workdir);

    if mode == "zip" {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (path, rel) in &files {
                zip.start_file(format!("{base}/{rel}"), options)?;
                let mut file = std::fs::File::open(path)?;
                std::io::copy(&mut file, &mut zip)?;
            }
            if with_pictory && ctx.args.configrsc.exists() {
                zip.start_file("config.rsc", options)?;
                let mut file = std::fs::File::open(&ctx.args.configrsc)?;
                std::io::copy(&mut file, &mut zip)?;
            }
            zip.finish()?;
        }
        Ok(cursor.into_inner())
    } else {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(true);
        for (path, rel) in &files {
            builder.append_path_with_name(path, format!("{base}/{rel}"))?;
        }
        if with_pictory && ctx.args.configrsc.exists() {
            builder.append_path_with_name(&ctx.args.configrsc, "config.rsc")?;
        }
        let encoder = builder.into_inner()?;
        Ok(encoder.finish()?)
    }
}

fn download_file(ctx: &DaemonContext, name: &str) -> Option<Vec<u8>> {
    let target = normalized_within(&ctx.workdir(), name)?;
    let bytes = std::fs::read(target).ok()?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&bytes).ok()?;
    encoder.finish().ok()
}

fn delete_file(ctx: &DaemonContext, name: &str) -> bool {
    let workdir = ctx.workdir();
    let Some(target) = normalized_within(&workdir, name) else {
        return false;
    };
    if !target.exists() {
        return false;
    }
    if std::fs::remove_file(&target).is_err() {
        return false;
    }
    // Drop the parent directory when the delete emptied it
    if let Some(parent) = target.parent()
        && parent != workdir
    {
        let _ = std::fs::remove_dir(parent);
    }
    true
}

fn upload_file(ctx: &DaemonContext, data: &[u8], filename: &str) -> bool {
    let filename = filename.replace('\\', "/");
    let workdir = ctx.workdir();
    let Some(target) = normalized_within(&workdir, &filename) else {
        warn!("file path is not in plc working directory");
        return false;
    };

    let (set_uid, set_gid) = if ctx.settings.program.plcworkdir_set_uid {
        (ctx.settings.program.plcuid, ctx.settings.program.plcgid)
    } else {
        (0, 0)
    };

    // Create missing intermediate directories one by one so ownership is
    // only set on newly created ones
    if let Some(dirname) = target.parent()
        && !dirname.exists()
        && let Ok(rel) = dirname.strip_prefix(&workdir)
    {
        let mut current = workdir.clone();
        for part in rel.components() {
            current = current.join(part);
            if current.exists() {
                continue;
            }
            if std::fs::create_dir(&current).is_err() {
                return false;
            }
            chown_path(&current, set_uid, set_gid);
        }
    }

    let mut decoder = GzDecoder::new(data);
    let mut payload = Vec::new();
    if decoder.read_to_end(&mut payload).is_err() {
        return false;
    }
    if std::fs::write(&target, payload).is_err() {
        return false;
    }
    chown_path(&target, set_uid, set_gid);
    true
}

fn clean_workdir(workdir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(workdir) else {
        return false;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if removed.is_err() {
            return false;
        }
    }
    true
}

/// Join a client supplied relative path onto the work directory; `None`
/// when normalization escapes it.
fn normalized_within(workdir: &Path, relative: &str) -> Option<PathBuf> {
    let mut stack = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => stack.push(part),
            Component::ParentDir => {
                stack.pop()?;
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if stack.is_empty() {
        return None;
    }
    let mut target = workdir.to_path_buf();
    for part in stack {
        target.push(part);
    }
    Some(target)
}

#[cfg(unix)]
fn chown_path(path: &Path, uid: u32, gid: u32) {
    use std::os::unix::ffi::OsStrExt;
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    if unsafe { libc::chown(cpath.as_ptr(), uid, gid) } != 0 {
        warn!("could not set owner on '{}'", path.display());
    }
}

#[cfg(not(unix))]
fn chown_path(_path: &Path, _uid: u32, _gid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("program.py", Some("program.py"))]
    #[case("sub/dir/file.py", Some("sub/dir/file.py"))]
    #[case("sub/../program.py", Some("program.py"))]
    #[case("./program.py", Some("program.py"))]
    #[case("../escape.py", None)]
    #[case("sub/../../escape.py", None)]
    #[case("/etc/passwd", None)]
    #[case("..", None)]
    fn upload_paths_stay_inside_the_workdir(#[case] input: &str, #[case] expected: Option<&str>) {
        let workdir = PathBuf::from("/var/lib/revpipyload/plc");
        let result = normalized_within(&workdir, input);
        assert_eq!(result, expected.map(|rel| workdir.join(rel)));
    }

    #[test]
    fn gzip_roundtrip_of_uploads() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"print('hello')\n").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"print('hello')\n");
    }

    #[test]
    fn walk_skips_interpreter_caches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "x").unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/util.py"), "y").unwrap();
        std::fs::create_dir(dir.path().join("__pycache__")).unwrap();
        std::fs::write(dir.path().join("__pycache__/main.pyc"), "z").unwrap();

        let rels: Vec<String> = walk_files(dir.path()).into_iter().map(|(_, r)| r).collect();
        assert_eq!(rels, vec!["lib/util.py".to_string(), "main.py".to_string()]);
    }
}
