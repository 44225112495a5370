//! `RelayWorker`: one upstream HTTP/1.0 fetch, driven into a
//! `SourcePipeline` for the lifetime of the connection (spec.md §4.1).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::Engine;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::collaborators::{BoxedStream, MountRegistry, SourcePipeline, Stats, Yp};
use crate::http::{self, HttpResponse, CONNECT_TIMEOUT, HEADER_READ_LIMIT};
use crate::record::RelayRecord;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Connecting,
    HeaderRead,
    Streaming,
    Terminating,
}

/// Everything a worker needs that isn't carried on the record itself:
/// the collaborator handles and the handful of server-wide settings that
/// shape the outbound request (spec.md §4.1 step 2).
pub struct WorkerEnv {
    pub mount_registry: Arc<dyn MountRegistry>,
    pub source_pipeline: Arc<dyn SourcePipeline>,
    pub stats: Arc<dyn Stats>,
    pub yp: Arc<dyn Yp>,
    pub local_hostname: String,
    pub master_redirect_port: Option<u16>,
    pub server_version: String,
    /// Set when this worker wants the control loop to rescan on its next
    /// tick (spec.md §4.1: "signal the supervisor to rescan").
    pub rescan_relays: Arc<AtomicBool>,
}

/// Drive `record`'s upstream fetch to completion (success or failure),
/// then run the termination phase: YP deregistration, `cleanup_requested`,
/// and a rescan signal. Never panics and never returns an error — per
/// spec.md §4.1 the worker's output is side effects only.
pub async fn run_relay_worker(record: Arc<RelayRecord>, env: Arc<WorkerEnv>) {
    let outcome = drive(&record, &env).await;

    match &outcome {
        Ok(()) => debug!("relay {}: upstream stream ended", record.local_mount),
        Err(err) => {
            warn!("relay {}: {}", record.local_mount, err);
            attempt_fallback(&record, &env).await;
        }
    }

    if !record.on_demand() {
        env.yp.deregister(&record.local_mount).await;
    }

    {
        let mut runtime = record.runtime.lock().unwrap();
        runtime.cleanup_requested = true;
    }
    env.rescan_relays.store(true, Ordering::SeqCst);
}

async fn drive(record: &RelayRecord, env: &WorkerEnv) -> Result<()> {
    let mut state = WorkerState::Connecting;
    let addr = format!("{}:{}", record.upstream_host, record.upstream_port);
    let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::connect(format!("timed out connecting to {addr}")))?
        .map_err(|e| Error::connect(format!("{addr}: {e}")))?;
    tcp.set_nodelay(true).ok();
    info!("relay {}: connected to {}", record.local_mount, addr);

    let mut stream = tcp;
    let request = build_relay_request(record, env);
    stream.write_all(request.as_bytes()).await?;

    state = WorkerState::HeaderRead;
    let (header_bytes, _leftover) = http::read_header_block(&mut stream, HEADER_READ_LIMIT).await?;
    let response = HttpResponse::parse(&header_bytes)?;
    if response.status_code >= 300 || response.status_code < 200 {
        return Err(Error::upstream_response(format!(
            "upstream returned {} {}",
            response.status_code, response.reason
        )));
    }

    state = WorkerState::Streaming;
    let boxed: BoxedStream = Box::new(stream);
    env.source_pipeline.complete_source(&record.local_mount, boxed).await?;

    env.stats.increment_relay_connections().await;
    env.stats.set_source_ip(&record.local_mount, &record.upstream_host).await;

    env.source_pipeline.run(&record.local_mount).await?;

    state = WorkerState::Terminating;
    debug!("relay {}: reached {:?}", record.local_mount, state);
    Ok(())
}

fn build_relay_request(record: &RelayRecord, env: &WorkerEnv) -> String {
    let mut request = format!("GET {} HTTP/1.0\r\n", record.upstream_mount);
    request.push_str(&format!("User-Agent: {}\r\n", env.server_version));
    if record.send_icy_metadata {
        request.push_str("Icy-MetaData: 1\r\n");
    }
    if let Some(port) = env.master_redirect_port {
        request.push_str(&format!("ice-redirect: {}:{}\r\n", env.local_hostname, port));
    }
    if let Some((user, pass)) = record.credentials() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");
    request
}

/// Connect-failure / stream-failure path of spec.md §4.1: if the reserved
/// source has a fallback mount configured, move its listeners there before
/// the worker finishes tearing down.
async fn attempt_fallback(record: &RelayRecord, env: &WorkerEnv) {
    let fallback = env.source_pipeline.fallback_info(&record.local_mount).await;
    let Some(fallback_mount) = fallback.fallback_mount else {
        return;
    };

    match env.mount_registry.move_listeners(&record.local_mount, &fallback_mount).await {
        Ok(moved) => {
            if moved > 0 {
                info!(
                    "relay {}: moved {} listener(s) to fallback {}",
                    record.local_mount, moved, fallback_mount
                );
            }
        }
        Err(err) => warn!(
            "relay {}: fallback move to {} failed: {}",
            record.local_mount, fallback_mount, err
        ),
    }
}
