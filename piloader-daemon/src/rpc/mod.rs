// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! XML-RPC control surface.
//!
//! An HTTP/1.1 endpoint whose method dispatch is gated by a per-method
//! minimum ACL level. The peer address is resolved against the ACL on
//! every request; unknown peers are rejected with 401 before any
//! dispatch. Method execution itself happens on the daemon mainloop (the
//! single writer of daemon state): the HTTP task forwards a parsed call
//! over the command channel and waits for the reply.

pub mod logreader;
pub mod methods;
pub mod xmlrpc;

pub use logreader::LogReader;
pub use xmlrpc::{Fault, Value};

use crate::daemon::DaemonCommand;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use piloader_core::IpAclManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Identifier of a registered method; dispatch is a typed match, not
/// name-based reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    Version,
    XmlModus,
    LoadAppLog,
    LoadPlcLog,
    PlcExitcode,
    PlcRunning,
    PlcStart,
    PlcStop,
    Reload,
    MqttRunning,
    PlcServerRunning,
    PsStart,
    PsStop,
    GetConfig,
    GetFileList,
    GetPictoryRsc,
    GetProcImg,
    PlcDownload,
    PlcUpload,
    PlcUploadClean,
    ResetPiControl,
    MqttStart,
    MqttStop,
    PlcServerStart,
    PlcServerStop,
    PlcDeleteFile,
    PlcDownloadFile,
    SetConfig,
    SetPictoryRsc,
}

/// One row of the method table: wire name, required ACL level, method id.
pub struct MethodEntry {
    pub name: &'static str,
    pub level: i32,
    pub method: RpcMethod,
}

/// The complete method registry with the required level per method.
pub static METHOD_TABLE: &[MethodEntry] = &[
    MethodEntry { name: "version", level: 0, method: RpcMethod::Version },
    MethodEntry { name: "xmlmodus", level: 0, method: RpcMethod::XmlModus },
    MethodEntry { name: "load_applog", level: 0, method: RpcMethod::LoadAppLog },
    MethodEntry { name: "load_plclog", level: 0, method: RpcMethod::LoadPlcLog },
    MethodEntry { name: "plcexitcode", level: 0, method: RpcMethod::PlcExitcode },
    MethodEntry { name: "plcrunning", level: 0, method: RpcMethod::PlcRunning },
    MethodEntry { name: "plcstart", level: 0, method: RpcMethod::PlcStart },
    MethodEntry { name: "plcstop", level: 0, method: RpcMethod::PlcStop },
    MethodEntry { name: "reload", level: 0, method: RpcMethod::Reload },
    MethodEntry { name: "mqttrunning", level: 0, method: RpcMethod::MqttRunning },
    MethodEntry { name: "plcslaverunning", level: 0, method: RpcMethod::PlcServerRunning },
    MethodEntry { name: "psstart", level: 1, method: RpcMethod::PsStart },
    MethodEntry { name: "psstop", level: 1, method: RpcMethod::PsStop },
    MethodEntry { name: "get_config", level: 2, method: RpcMethod::GetConfig },
    MethodEntry { name: "get_filelist", level: 2, method: RpcMethod::GetFileList },
    MethodEntry { name: "get_pictoryrsc", level: 2, method: RpcMethod::GetPictoryRsc },
    MethodEntry { name: "get_procimg", level: 2, method: RpcMethod::GetProcImg },
    MethodEntry { name: "plcdownload", level: 2, method: RpcMethod::PlcDownload },
    MethodEntry { name: "plcupload", level: 3, method: RpcMethod::PlcUpload },
    MethodEntry { name: "plcuploadclean", level: 3, method: RpcMethod::PlcUploadClean },
    MethodEntry { name: "resetpicontrol", level: 3, method: RpcMethod::ResetPiControl },
    MethodEntry { name: "mqttstart", level: 3, method: RpcMethod::MqttStart },
    MethodEntry { name: "mqttstop", level: 3, method: RpcMethod::MqttStop },
    MethodEntry { name: "plcslavestart", level: 3, method: RpcMethod::PlcServerStart },
    MethodEntry { name: "plcslavestop", level: 3, method: RpcMethod::PlcServerStop },
    MethodEntry { name: "plcdeletefile", level: 3, method: RpcMethod::PlcDeleteFile },
    MethodEntry { name: "plcdownload_file", level: 3, method: RpcMethod::PlcDownloadFile },
    MethodEntry { name: "set_config", level: 4, method: RpcMethod::SetConfig },
    MethodEntry { name: "set_pictoryrsc", level: 4, method: RpcMethod::SetPictoryRsc },
];

pub fn lookup(name: &str) -> Option<&'static MethodEntry> {
    METHOD_TABLE.iter().find(|entry| entry.name == name)
}

/// A parsed call on its way to the daemon mainloop.
pub struct RpcCall {
    pub method: RpcMethod,
    pub params: Vec<Value>,
    pub level: i32,
    pub respond: oneshot::Sender<Result<Value, Fault>>,
}

/// The RPC endpoint with its acceptor task.
pub struct RpcServer {
    local_addr: std::net::SocketAddr,
    shutdown: Arc<Notify>,
    exiting: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl RpcServer {
    /// Bind the endpoint and start serving. An empty `bind_ip` binds all
    /// interfaces.
    pub async fn start(
        bind_ip: &str,
        port: u16,
        acl: Arc<RwLock<IpAclManager>>,
        command_tx: mpsc::Sender<DaemonCommand>,
    ) -> std::io::Result<Self> {
        let bind_ip = if bind_ip.is_empty() { "0.0.0.0" } else { bind_ip };
        let listener = TcpListener::bind((bind_ip, port)).await?;
        let local_addr = listener.local_addr()?;
        info!("xmlrpc server listening on {}", local_addr);

        let shutdown = Arc::new(Notify::new());
        let exiting = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(accept_loop(
            listener,
            acl,
            command_tx,
            shutdown.clone(),
            exiting.clone(),
        ));

        Ok(Self {
            local_addr,
            shutdown,
            exiting,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn is_alive(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub async fn stop(&mut self) {
        debug!("enter RpcServer.stop()");
        self.exiting.store(true, Ordering::Release);
        self.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!("leave RpcServer.stop()");
    }
}

async fn accept_loop(
    listener: TcpListener,
    acl: Arc<RwLock<IpAclManager>>,
    command_tx: mpsc::Sender<DaemonCommand>,
    shutdown: Arc<Notify>,
    exiting: Arc<AtomicBool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = shutdown.notified() => break,
        };
        if exiting.load(Ordering::Acquire) {
            break;
        }

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("xmlrpc accept failed: {}", e);
                continue;
            }
        };

        let peer_ip = peer.ip().to_string();
        let acl = acl.clone();
        let command_tx = command_tx.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request: Request<hyper::body::Incoming>| {
                let peer_ip = peer_ip.clone();
                let acl = acl.clone();
                let command_tx = command_tx.clone();
                async move { handle_request(request, peer_ip, acl, command_tx).await }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("xmlrpc connection ended: {}", e);
            }
        });
    }
}

async fn handle_request(
    request: Request<hyper::body::Incoming>,
    peer_ip: String,
    acl: Arc<RwLock<IpAclManager>>,
    command_tx: mpsc::Sender<DaemonCommand>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let level = acl.read().unwrap().level_of(&peer_ip);
    if level < 0 {
        warn!("host ip '{}' not allowed with acl level {}", peer_ip, level);
        return Ok(plain_response(
            StatusCode::UNAUTHORIZED,
            format!("IP '{peer_ip}' not allowed with acl level '{level}'"),
        ));
    }

    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Ok(plain_response(
                StatusCode::BAD_REQUEST,
                format!("can not read request body: {e}"),
            ));
        }
    };

    let (name, mut params) = match xmlrpc::parse_method_call(&body) {
        Ok(call) => call,
        Err(e) => {
            return Ok(xml_response(xmlrpc::write_fault(&Fault::new(
                1001,
                format!("invalid method call: {e}"),
            ))));
        }
    };

    let Some(entry) = lookup(&name) else {
        return Ok(xml_response(xmlrpc::write_fault(&Fault::new(
            1,
            format!("method \"{name}\" is not supported"),
        ))));
    };
    if level < entry.level {
        return Ok(xml_response(xmlrpc::write_fault(&Fault::new(
            1,
            format!("method \"{name}\" requires a higher access level"),
        ))));
    }

    // The caller's level is the one argument of xmlmodus
    if entry.method == RpcMethod::XmlModus {
        params = vec![Value::Int(level)];
    }

    let (respond, reply) = oneshot::channel();
    let call = RpcCall {
        method: entry.method,
        params,
        level,
        respond,
    };
    if command_tx.send(DaemonCommand::Rpc(call)).await.is_err() {
        return Ok(xml_response(xmlrpc::write_fault(&Fault::new(
            4001,
            "daemon is shutting down",
        ))));
    }

    let body = match reply.await {
        Ok(Ok(value)) => xmlrpc::write_method_response(&value),
        Ok(Err(fault)) => xmlrpc::write_fault(&fault),
        Err(_) => xmlrpc::write_fault(&Fault::new(4001, "daemon dropped the request")),
    };
    Ok(xml_response(body))
}

fn xml_response(body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/xml")
        .body(Full::new(Bytes::from(body)))
        .expect("static response")
}

fn plain_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body)))
        .expect("static response")
}
