//! HTTP handlers for the patch log server.
//!
//! Endpoints:
//!   GET    /info                     → server identity & active sources
//!   GET    /sources                  → SourceInfo list
//!   POST   /sources                  → create a source (JSON {source_id})
//!   DELETE /sources/{id}             → delete a source (idempotent)
//!   GET    /{id}/head                → current head version
//!   POST   /{id}/append?base=N       → append raw payload bytes
//!   GET    /{id}/patches?from=A&to=B → binary patch range frame
//!   GET    /{id}/verify              → replay and verify the chain

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Response, StatusCode};
use patchlog_core::protocol::{
    self, AppendResponse, CreateSourceRequest, ErrorBody, HeadResponse, ServerInfo, SourceInfo,
    PROTOCOL_VERSION,
};
use patchlog_core::{PatchLogError, PatchLogServer};
use std::collections::HashMap;
use std::sync::Arc;

/// Maximum accepted payload size for a single append (64 MB).
const MAX_APPEND_BODY: usize = 64 * 1024 * 1024;

/// Maximum number of records served in a single range request.
const MAX_RANGE_LEN: u64 = 1000;

/// Request router over one PatchLogServer instance.
pub struct LogHandler {
    server: Arc<PatchLogServer>,
}

impl LogHandler {
    pub fn new(server: Arc<PatchLogServer>) -> Self {
        Self { server }
    }

    /// Dispatch one request.
    pub async fn handle(&self, req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().trim_end_matches('/').to_string();
        let query = req.uri().query().unwrap_or("").to_string();

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return plain_error(StatusCode::BAD_REQUEST, &format!("bad body: {}", e)),
        };
        if body.len() > MAX_APPEND_BODY {
            return plain_error(StatusCode::PAYLOAD_TOO_LARGE, "payload too large");
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match (&method, segments.as_slice()) {
            (&Method::GET, ["info"]) => self.handle_info().await,
            (&Method::GET, ["sources"]) => self.handle_list().await,
            (&Method::POST, ["sources"]) => self.handle_create(&body).await,
            (&Method::GET, ["sources", id]) => self.handle_describe(id).await,
            (&Method::DELETE, ["sources", id]) => self.handle_delete(id).await,
            (&Method::GET, [id, "head"]) => self.handle_head(id).await,
            (&Method::POST, [id, "append"]) => self.handle_append(id, &query, &body).await,
            (&Method::GET, [id, "patches"]) => self.handle_patches(id, &query).await,
            (&Method::GET, [id, "verify"]) => self.handle_verify(id).await,
            _ => plain_error(
                StatusCode::NOT_FOUND,
                &format!("unknown endpoint: {} {}", method, path),
            ),
        }
    }

    async fn handle_info(&self) -> Response<Full<Bytes>> {
        let info = ServerInfo {
            registry_id: self.server.registry().registry_id().to_string(),
            protocol_version: PROTOCOL_VERSION,
            sources: self.server.list_sources().await,
        };
        json_ok(&info)
    }

    async fn handle_list(&self) -> Response<Full<Bytes>> {
        let mut infos: Vec<SourceInfo> = Vec::new();
        for id in self.server.list_sources().await {
            match self.server.describe_source(&id).await {
                Ok(desc) => infos.push(desc.into()),
                Err(e) => return error_response(&e),
            }
        }
        json_ok(&infos)
    }

    async fn handle_create(&self, body: &[u8]) -> Response<Full<Bytes>> {
        let req: CreateSourceRequest = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(e) => {
                return plain_error(StatusCode::BAD_REQUEST, &format!("bad request body: {}", e));
            }
        };
        match self.server.create_source(&req.source_id).await {
            Ok(desc) => json_status(StatusCode::CREATED, &SourceInfo::from(desc)),
            Err(e) => error_response(&e),
        }
    }

    async fn handle_describe(&self, source_id: &str) -> Response<Full<Bytes>> {
        match self.server.describe_source(source_id).await {
            Ok(desc) => json_ok(&SourceInfo::from(desc)),
            Err(e) => error_response(&e),
        }
    }

    async fn handle_delete(&self, source_id: &str) -> Response<Full<Bytes>> {
        match self.server.delete_source(source_id).await {
            Ok(()) => Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Full::new(Bytes::new()))
                .expect("static response"),
            Err(e) => error_response(&e),
        }
    }

    async fn handle_head(&self, source_id: &str) -> Response<Full<Bytes>> {
        match self.server.head_version(source_id).await {
            Ok(head_version) => json_ok(&HeadResponse { head_version }),
            Err(e) => error_response(&e),
        }
    }

    async fn handle_append(
        &self,
        source_id: &str,
        query: &str,
        body: &[u8],
    ) -> Response<Full<Bytes>> {
        let params = parse_query(query);
        let base: u64 = match params.get("base").and_then(|v| v.parse().ok()) {
            Some(b) => b,
            None => return plain_error(StatusCode::BAD_REQUEST, "missing or bad base parameter"),
        };

        match self.server.append(source_id, base, body.to_vec()).await {
            Ok(version) => json_ok(&AppendResponse { version }),
            Err(e) => error_response(&e),
        }
    }

    async fn handle_patches(&self, source_id: &str, query: &str) -> Response<Full<Bytes>> {
        let params = parse_query(query);
        let from: u64 = params.get("from").and_then(|v| v.parse().ok()).unwrap_or(1);
        let to: Option<u64> = params.get("to").and_then(|v| v.parse().ok());

        let head = match self.server.head_version(source_id).await {
            Ok(head) => head,
            Err(e) => return error_response(&e),
        };
        let to = match bounded_range_end(from, to, head) {
            Some(to) => to,
            None => return plain_error(StatusCode::RANGE_NOT_SATISFIABLE, "range too large"),
        };

        let records = match self.server.fetch_range(source_id, from, Some(to)).await {
            Ok(records) => records,
            Err(e) => return error_response(&e),
        };

        match protocol::encode_range(&records) {
            Ok(frame) => Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/octet-stream")
                .body(Full::new(Bytes::from(frame)))
                .expect("static response"),
            Err(e) => error_response(&e),
        }
    }

    async fn handle_verify(&self, source_id: &str) -> Response<Full<Bytes>> {
        match self.server.verify_source(source_id).await {
            Ok(()) => json_ok(&serde_json::json!({ "verified": true })),
            Err(e) => error_response(&e),
        }
    }
}

/// Effective inclusive end of one range response. An explicit range larger
/// than the cap is refused (`None`); an open-ended request is bounded to the
/// cap before any record is read, so the response window is always explicit.
fn bounded_range_end(from: u64, to: Option<u64>, head: u64) -> Option<u64> {
    match to {
        Some(to) if to >= from && to - from + 1 > MAX_RANGE_LEN => None,
        Some(to) => Some(to),
        None => Some(head.min(from.saturating_add(MAX_RANGE_LEN - 1))),
    }
}

/// Map an engine error to its HTTP status.
fn status_for(e: &PatchLogError) -> StatusCode {
    match e {
        PatchLogError::VersionConflict { .. } => StatusCode::CONFLICT,
        PatchLogError::DuplicateSource(_) => StatusCode::CONFLICT,
        PatchLogError::UnknownSource(_) => StatusCode::NOT_FOUND,
        PatchLogError::SourceDeleted(_) => StatusCode::GONE,
        PatchLogError::RangeNotFound { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        PatchLogError::ChainCorruption { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &PatchLogError) -> Response<Full<Bytes>> {
    let status = status_for(e);
    if status.is_server_error() {
        tracing::error!(error = %e, "request failed");
    } else {
        tracing::debug!(error = %e, "request rejected");
    }
    let body = ErrorBody::from_error(e);
    json_status(status, &body)
}

fn json_ok<T: serde::Serialize>(value: &T) -> Response<Full<Bytes>> {
    json_status(StatusCode::OK, value)
}

fn json_status<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(json) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .expect("static response"),
        Err(e) => plain_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("serialization failed: {}", e),
        ),
    }
}

fn plain_error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = ErrorBody {
        kind: "bad-request".to_string(),
        message: message.to_string(),
        current_head: None,
    };
    json_status(status, &body)
}

/// Parse a query string into a key/value map (no percent decoding needed
/// for the numeric parameters this API takes).
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some(k), Some(v)) if !k.is_empty() => Some((k.to_string(), v.to_string())),
                _ => None,
            }
        })
        .collect()
}
