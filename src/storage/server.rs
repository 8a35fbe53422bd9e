//! HTTP server exposing any [`Storage`] over the REST surface
//!
//! ```text
//! HEAD /blobs/<ref>   200 + Content-Length + X-CAS-Ref | 404
//! GET  /blobs/<ref>   200 blob bytes
//! GET  /blobs/        newline-delimited JSON of SizedRef
//! HEAD /pins/<name>   200 + X-CAS-Ref | 404
//! GET  /pins/<name>   302 -> /blobs/<ref>
//! GET  /pins/         newline-delimited JSON of Pin
//! ```
//!
//! other methods answer 405. the storage itself is blocking, so handlers
//! hop onto the blocking pool for every storage call.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::task::spawn_blocking;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::hash::Ref;

use super::http::REF_HEADER;
use super::{BlobSource, PinStorage, Storage};

type AppState = Arc<dyn Storage>;

/// build the REST router over a shared storage
pub fn router(storage: AppState) -> Router {
    Router::new()
        .route("/blobs/", get(list_blobs))
        .route("/blobs/:ref", get(serve_blob))
        .route("/pins/", get(list_pins))
        .route("/pins/:name", get(serve_pin))
        .with_state(storage)
}

/// a bound listener that can report its address before serving
pub struct Server {
    listener: std::net::TcpListener,
}

impl Server {
    pub fn bind(addr: &str) -> Result<Server> {
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| Error::from_io(e, addr))?;
        Ok(Server { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::from_io(e, "<listener>"))
    }

    /// run until the process exits
    pub fn serve(self, storage: AppState) -> Result<()> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::from_io(e, "<runtime>"))?;
        rt.block_on(async move {
            self.listener
                .set_nonblocking(true)
                .map_err(|e| Error::from_io(e, "<listener>"))?;
            let listener = tokio::net::TcpListener::from_std(self.listener)
                .map_err(|e| Error::from_io(e, "<listener>"))?;
            axum::serve(listener, router(storage))
                .await
                .map_err(|e| Error::from_io(e, "<serve>"))
        })
    }
}

fn error_response(err: Error) -> Response {
    match err {
        Error::NotFound => StatusCode::NOT_FOUND.into_response(),
        Error::InvalidRef | Error::NotARef | Error::InvalidPinName(_) => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
    }
}

async fn serve_blob(
    State(s): State<AppState>,
    Path(raw): Path<String>,
    method: Method,
) -> Response {
    let r = match Ref::parse(&raw) {
        Ok(r) => r,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let head = method == Method::HEAD;
    let res = spawn_blocking(move || -> Result<(u64, Vec<u8>)> {
        let cancel = CancelToken::new();
        if head {
            return Ok((s.stat_blob(&cancel, &r)?, Vec::new()));
        }
        let (mut rc, size) = s.fetch_blob(&cancel, &r)?;
        let mut buf = Vec::with_capacity(size as usize);
        rc.read_to_end(&mut buf)
            .map_err(|e| Error::from_io(e, "<blob>"))?;
        Ok((size, buf))
    })
    .await;
    let (size, body) = match res {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => return error_response(e),
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    };
    let mut resp = body.into_response();
    resp.headers_mut().insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(size),
    );
    if let Ok(v) = HeaderValue::from_str(&r.to_string()) {
        resp.headers_mut().insert(REF_HEADER, v);
    }
    resp
}

async fn serve_pin(
    State(s): State<AppState>,
    Path(name): Path<String>,
    method: Method,
) -> Response {
    let res = spawn_blocking(move || {
        let cancel = CancelToken::new();
        s.get_pin(&cancel, &name)
    })
    .await;
    let r = match res {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => return error_response(e),
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    };
    let mut resp = if method == Method::HEAD {
        StatusCode::OK.into_response()
    } else {
        let mut resp = StatusCode::FOUND.into_response();
        if let Ok(v) = HeaderValue::from_str(&format!("/blobs/{r}")) {
            resp.headers_mut().insert(header::LOCATION, v);
        }
        resp
    };
    if let Ok(v) = HeaderValue::from_str(&r.to_string()) {
        resp.headers_mut().insert(REF_HEADER, v);
    }
    resp
}

async fn list_blobs(State(s): State<AppState>) -> Response {
    let res = spawn_blocking(move || {
        let cancel = CancelToken::new();
        let mut out = String::new();
        for item in s.iterate_blobs(&cancel) {
            match item {
                Ok(sr) => {
                    out.push_str(&serde_json::to_string(&sr).unwrap_or_default());
                    out.push('\n');
                }
                Err(e) => {
                    warn!("error when iterating blobs: {e}");
                    break;
                }
            }
        }
        out
    })
    .await;
    ndjson_response(res)
}

async fn list_pins(State(s): State<AppState>) -> Response {
    let res = spawn_blocking(move || {
        let cancel = CancelToken::new();
        let mut out = String::new();
        for item in s.iterate_pins(&cancel) {
            match item {
                Ok(p) => {
                    out.push_str(&serde_json::to_string(&p).unwrap_or_default());
                    out.push('\n');
                }
                Err(e) => {
                    warn!("error when iterating pins: {e}");
                    break;
                }
            }
        }
        out
    })
    .await;
    ndjson_response(res)
}

fn ndjson_response(res: std::result::Result<String, tokio::task::JoinError>) -> Response {
    match res {
        Ok(body) => (
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
