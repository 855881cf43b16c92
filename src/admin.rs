//! Admin API: inbound management, traffic reports and process control
//!
//! Every route except `/health` and `/version` requires the bearer token.
//! Routes acting on behalf of a user read the owner id from `X-User-Id`.

use crate::error::{json_error_response, json_response, ApiErrorCode, Envelope, Error, Result};
use crate::inbound::Inbound;
use crate::restart::RestartCoordinator;
use crate::service::InboundService;
use crate::supervisor::ProcessSupervisor;
use crate::traffic::{Traffic, TrafficAccumulator};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderMap, AUTHORIZATION};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Header carrying the id of the user a request acts for
pub const USER_ID_HEADER: &str = "x-user-id";

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Everything the request handlers need
pub struct AdminContext {
    service: InboundService,
    traffic: TrafficAccumulator,
    coordinator: Arc<RestartCoordinator>,
    supervisor: Arc<ProcessSupervisor>,
    auth_token: String,
}

impl AdminContext {
    pub fn new(
        service: InboundService,
        traffic: TrafficAccumulator,
        coordinator: Arc<RestartCoordinator>,
        supervisor: Arc<ProcessSupervisor>,
        auth_token: String,
    ) -> Self {
        Self {
            service,
            traffic,
            coordinator,
            supervisor,
            auth_token,
        }
    }
}

/// Body of `/inbound/paged-list`; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PageRequest {
    pub page: i64,
    #[serde(rename = "perpage")]
    pub per_page: i64,
    pub query: String,
}

#[derive(Debug, Serialize)]
struct ProcessStatus {
    running: bool,
    pid: Option<u32>,
    dirty: bool,
    restarting: bool,
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    context: Arc<AdminContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        context: Arc<AdminContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            context,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening (HTTP/1.1 and HTTP/2)");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, context).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, context: Arc<AdminContext>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { Ok::<_, hyper::Error>(handle_request(req, &context).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(headers: &HeaderMap, expected_token: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

/// Owner id from the `X-User-Id` header
fn owner_id(headers: &HeaderMap) -> Result<i64> {
    let value = headers
        .get(USER_ID_HEADER)
        .ok_or_else(|| Error::Validation("missing X-User-Id header".to_string()))?;
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| Error::Validation("X-User-Id must be an integer".to_string()))
}

/// Numeric id at the end of `path` after `prefix`
fn path_id(path: &str, prefix: &str) -> Result<i64> {
    path.strip_prefix(prefix)
        .and_then(|id| id.parse::<i64>().ok())
        .ok_or_else(|| Error::Validation(format!("invalid inbound id in {}", path)))
}

async fn read_body<B>(body: B) -> Result<Bytes>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| Error::Validation(format!("failed to read body: {}", e)))
}

async fn read_json<T, B>(body: B) -> Result<T>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: std::fmt::Display,
{
    let bytes = read_body(body).await?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Validation(format!("invalid JSON body: {}", e)))
}

fn ok<T: Serialize>(msg: &str, obj: T) -> Response<Full<Bytes>> {
    let envelope = Envelope {
        msg: msg.to_string(),
        ..Envelope::ok(obj)
    };
    json_response(StatusCode::OK, &envelope)
}

/// Handle one admin API request
pub async fn handle_request<B>(req: Request<B>, context: &AdminContext) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Admin API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return response(StatusCode::OK, "ok"),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return json_response(StatusCode::OK, &Envelope::ok(version_info));
        }
        _ => {}
    }

    if !check_auth(req.headers(), &context.auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return json_error_response(ApiErrorCode::Unauthorized, "unauthorized");
    }

    match dispatch(method, &path, req, context).await {
        Ok(response) => response,
        Err(e) => {
            if e.code().status_code().is_server_error() {
                error!(%path, error = %e, "Admin API request failed");
            } else {
                debug!(%path, error = %e, "Admin API request rejected");
            }
            Response::from(&e)
        }
    }
}

async fn dispatch<B>(
    method: Method,
    path: &str,
    req: Request<B>,
    context: &AdminContext,
) -> Result<Response<Full<Bytes>>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    if method != Method::POST {
        return Ok(json_error_response(ApiErrorCode::UnknownRoute, "not found"));
    }

    let (parts, body) = req.into_parts();
    let response = match path {
        "/inbound/list" => {
            let owner = owner_id(&parts.headers)?;
            ok("", context.service.list(owner)?)
        }

        "/inbound/paged-list" => {
            let owner = owner_id(&parts.headers)?;
            let bytes = read_body(body).await?;
            let request: PageRequest = if bytes.is_empty() {
                PageRequest::default()
            } else {
                serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Validation(format!("invalid JSON body: {}", e)))?
            };
            let page = context
                .service
                .list_paged(owner, request.page, request.per_page, &request.query)?;
            ok("", page)
        }

        "/inbound/add" => {
            let owner = owner_id(&parts.headers)?;
            let payload: Inbound = read_json(body).await?;
            ok("Inbound added", context.service.add(owner, payload)?)
        }

        "/inbound/add-batch" => {
            let owner = owner_id(&parts.headers)?;
            let payloads: Vec<Inbound> = read_json(body).await?;
            let count = context.service.add_batch(owner, payloads)?;
            ok("Inbounds imported", serde_json::json!({ "count": count }))
        }

        p if p.starts_with("/inbound/update/") => {
            let id = path_id(p, "/inbound/update/")?;
            let payload: Inbound = read_json(body).await?;
            ok("Inbound updated", context.service.update(id, payload)?)
        }

        p if p.starts_with("/inbound/del/") => {
            let id = path_id(p, "/inbound/del/")?;
            context.service.delete(id)?;
            ok("Inbound deleted", serde_json::json!({ "id": id }))
        }

        "/traffic" => {
            let traffics: Vec<Traffic> = read_json(body).await?;
            context.traffic.apply_deltas(&traffics)?;
            ok("Traffic applied", serde_json::json!({ "count": traffics.len() }))
        }

        "/server/restart" => {
            context
                .coordinator
                .restart_now(context.supervisor.as_ref(), true)
                .await?;
            json_response(StatusCode::OK, &Envelope::message("Proxy process restarted"))
        }

        "/server/status" => {
            let status = ProcessStatus {
                running: context.supervisor.is_running().await,
                pid: context.supervisor.pid().await,
                dirty: context.coordinator.is_dirty(),
                restarting: context.coordinator.is_restarting(),
            };
            ok("", status)
        }

        _ => json_error_response(ApiErrorCode::UnknownRoute, "not found"),
    };

    Ok(response)
}
