use crate::{
    compress::Compression,
    server::{Server, Ticket},
    url::SsgUrl,
    vault::cipher::Encryption,
    Error,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use futures::SinkExt;
use hyper::Body;
use serde::{Deserialize, Serialize};
use slog::warn;
use std::{collections::BTreeMap, convert::Infallible, io, net::SocketAddr, sync::Arc};
use warp::{
    filters::BoxedFilter,
    http::{header::CONTENT_TYPE, HeaderValue, Response, StatusCode},
    Filter, Reply,
};

const DOWNLOAD_CHUNK: usize = 32 * 1024;

/// Parses the configured bind string (`*:8080`, `:8080`, `127.0.0.1:9000`)
/// into a socket address.
pub fn bind_addr(bind: &str) -> Result<SocketAddr, Error> {
    let normalized = if let Some(port) = bind.strip_prefix("*:") {
        format!("0.0.0.0:{}", port)
    } else if bind.starts_with(':') {
        format!("0.0.0.0{}", bind)
    } else {
        bind.to_owned()
    };
    normalized.parse().map_err(|_| Error::Bind(bind.to_owned()))
}

/// Binds and runs the HTTP API until the process dies.
pub async fn serve(server: Arc<Server>) -> Result<(), Error> {
    let addr = bind_addr(&server.bind)?;
    warp::serve(routes(server)).run(addr).await;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    target: String,
}

#[derive(Debug, Deserialize)]
struct SegmentRequest {
    #[serde(default)]
    data: String,
    #[serde(default)]
    eof: bool,
}

#[derive(Debug, Serialize)]
struct SegmentResponse {
    segments: u64,
    compressed: u64,
    uncompressed: u64,
    sent: usize,
}

#[derive(Debug, Serialize)]
struct BucketInfo {
    key: String,
    name: String,
    description: String,
    compression: Compression,
    encryption: Encryption,
}

#[derive(Debug, Serialize)]
struct ExpungeResponse {
    kind: &'static str,
    canon: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

fn json_reply<T: Serialize>(status: StatusCode, value: &T) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(value), status).into_response()
}

fn error_reply(status: StatusCode, message: &str) -> warp::reply::Response {
    json_reply(status, &ErrorBody { error: message })
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, warp::reply::Response> {
    serde_json::from_slice(body).map_err(|e| {
        error_reply(
            StatusCode::BAD_REQUEST,
            &format!("unable to parse request body: {}", e),
        )
    })
}

enum Bearer {
    Missing,
    Malformed,
    Token(String),
}

fn bearer(header: &Option<String>) -> Bearer {
    match header {
        None => Bearer::Missing,
        Some(h) => match h.strip_prefix("Bearer ") {
            Some(t) if !t.is_empty() => Bearer::Token(t.to_owned()),
            _ => Bearer::Malformed,
        },
    }
}

/// Checks a control- or monitor-plane request against the corresponding
/// allow-list. A missing header is 401; anything else short of a listed
/// bearer token is 403.
fn authz(
    server: &Server,
    header: &Option<String>,
    monitor: bool,
) -> Result<(), warp::reply::Response> {
    let what = if monitor { "monitor auth" } else { "control auth" };
    match bearer(header) {
        Bearer::Missing => Err(error_reply(
            StatusCode::UNAUTHORIZED,
            &format!("{} required", what),
        )),
        Bearer::Malformed => Err(error_reply(
            StatusCode::FORBIDDEN,
            &format!("{} forbidden", what),
        )),
        Bearer::Token(t) => {
            let allowed = if monitor {
                server.is_monitor_token(&t)
            } else {
                server.is_control_token(&t)
            };
            if allowed {
                Ok(())
            } else {
                Err(error_reply(
                    StatusCode::FORBIDDEN,
                    &format!("{} forbidden", what),
                ))
            }
        }
    }
}

/// The stream-token rule is deliberately blunter: a presented token either
/// resolves a live stream or the caller learns nothing. Only the header
/// shape itself gets distinct statuses.
fn stream_token(header: &Option<String>) -> Result<String, warp::reply::Response> {
    match bearer(header) {
        Bearer::Missing => Err(error_reply(StatusCode::UNAUTHORIZED, "blob auth required")),
        Bearer::Malformed => Err(error_reply(StatusCode::FORBIDDEN, "blob auth forbidden")),
        Bearer::Token(t) => Ok(t),
    }
}

fn with_server(
    server: Arc<Server>,
) -> impl Filter<Extract = (Arc<Server>,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

fn auth_header() -> impl Filter<Extract = (Option<String>,), Error = warp::Rejection> + Clone {
    warp::header::optional::<String>("authorization")
}

/// The full route table. Everything answers JSON except the blob download
/// body itself; anything unrouted lands on the trailing 404.
pub fn routes(server: Arc<Server>) -> BoxedFilter<(warp::reply::Response,)> {
    let index = warp::get()
        .and(warp::path::end())
        .and(with_server(server.clone()))
        .map(|server: Arc<Server>| {
            json_reply(
                StatusCode::OK,
                &serde_json::json!({ "ok": format!("{} storage gateway", server.cluster) }),
            )
        });

    let buckets = warp::get()
        .and(warp::path!("buckets"))
        .and(with_server(server.clone()))
        .and(auth_header())
        .map(|server: Arc<Server>, auth: Option<String>| {
            if let Err(denied) = authz(&server, &auth, false) {
                return denied;
            }
            let list: Vec<BucketInfo> = server
                .buckets()
                .iter()
                .map(|b| BucketInfo {
                    key: b.key.clone(),
                    name: b.name.clone(),
                    description: b.description.clone(),
                    compression: b.compression,
                    encryption: b.encryption,
                })
                .collect();
            json_reply(StatusCode::OK, &list)
        });

    let control = warp::post()
        .and(warp::path!("control"))
        .and(with_server(server.clone()))
        .and(auth_header())
        .and(warp::body::bytes())
        .and_then(handle_control);

    let blob_put = warp::post()
        .and(warp::path!("blob" / String))
        .and(with_server(server.clone()))
        .and(auth_header())
        .and(warp::body::bytes())
        .and_then(handle_blob_put);

    let blob_get = warp::get()
        .and(warp::path!("blob" / String))
        .and(with_server(server.clone()))
        .and(auth_header())
        .and_then(handle_blob_get);

    let streams = warp::get()
        .and(warp::path!("streams"))
        .and(with_server(server.clone()))
        .and(auth_header())
        .map(|server: Arc<Server>, auth: Option<String>| {
            if let Err(denied) = authz(&server, &auth, false) {
                return denied;
            }
            json_reply(StatusCode::OK, &server.streams())
        });

    let metrics_get = warp::get()
        .and(warp::path!("metrics"))
        .and(with_server(server.clone()))
        .and(auth_header())
        .map(|server: Arc<Server>, auth: Option<String>| {
            if let Err(denied) = authz(&server, &auth, true) {
                return denied;
            }
            let m: BTreeMap<String, crate::metrics::Snapshot> = server
                .buckets()
                .iter()
                .map(|b| (b.key.clone(), b.metrics.snapshot()))
                .collect();
            json_reply(StatusCode::OK, &m)
        });

    let metrics_delete = warp::delete()
        .and(warp::path!("metrics"))
        .and(with_server(server))
        .and(auth_header())
        .map(|server: Arc<Server>, auth: Option<String>| {
            if let Err(denied) = authz(&server, &auth, true) {
                return denied;
            }
            let m: BTreeMap<String, crate::metrics::Snapshot> = server
                .buckets()
                .iter()
                .map(|b| {
                    b.metrics.reset();
                    (b.key.clone(), b.metrics.snapshot())
                })
                .collect();
            json_reply(StatusCode::OK, &m)
        });

    let fallback = warp::any().map(|| error_reply(StatusCode::NOT_FOUND, "not found"));

    index
        .or(buckets)
        .unify()
        .or(control)
        .unify()
        .or(blob_get)
        .unify()
        .or(blob_put)
        .unify()
        .or(streams)
        .unify()
        .or(metrics_get)
        .unify()
        .or(metrics_delete)
        .unify()
        .or(fallback)
        .unify()
        .boxed()
}

async fn handle_control(
    server: Arc<Server>,
    auth: Option<String>,
    body: Bytes,
) -> Result<warp::reply::Response, Infallible> {
    if let Err(denied) = authz(&server, &auth, false) {
        return Ok(denied);
    }

    let req: ControlRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(bad) => return Ok(bad),
    };

    if req.kind.is_empty() {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            "missing parameter: kind",
        ));
    }
    if !matches!(req.kind.as_str(), "upload" | "download" | "expunge") {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            &format!("invalid kind: '{}'", req.kind),
        ));
    }

    let target = match SsgUrl::parse(&req.target) {
        Ok(t) => t,
        Err(e) => {
            return Ok(error_reply(
                StatusCode::BAD_REQUEST,
                &format!("invalid target '{}': {}", req.target, e),
            ))
        }
    };

    // Starting a stream opens the whole backend pipeline, which blocks.
    let kind = req.kind;
    let joined = tokio::task::spawn_blocking(move || -> Result<warp::reply::Response, Error> {
        match kind.as_str() {
            "upload" => Ok(json_reply::<Ticket>(
                StatusCode::OK,
                &server.start_upload(&target)?,
            )),
            "download" => Ok(json_reply::<Ticket>(
                StatusCode::OK,
                &server.start_download(&target)?,
            )),
            _ => {
                server.expunge(&target)?;
                Ok(json_reply(
                    StatusCode::OK,
                    &ExpungeResponse {
                        kind: "expunge",
                        canon: target.to_string(),
                    },
                ))
            }
        }
    })
    .await;

    Ok(match joined {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) if e.is_not_found() => error_reply(StatusCode::NOT_FOUND, &e.to_string()),
        Ok(Err(e)) => error_reply(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        Err(_) => error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    })
}

async fn handle_blob_put(
    id: String,
    server: Arc<Server>,
    auth: Option<String>,
    body: Bytes,
) -> Result<warp::reply::Response, Infallible> {
    let token = match stream_token(&auth) {
        Ok(t) => t,
        Err(denied) => return Ok(denied),
    };

    let segment: SegmentRequest = match parse_body(&body) {
        Ok(s) => s,
        Err(bad) => return Ok(bad),
    };

    let data = if segment.data.is_empty() {
        Vec::new()
    } else {
        match BASE64.decode(segment.data.as_bytes()) {
            Ok(b) => b,
            Err(e) => {
                return Ok(error_reply(
                    StatusCode::BAD_REQUEST,
                    &format!("unable to decode base64 payload: {}", e),
                ))
            }
        }
    };

    enum PutError {
        Gone,
        Backend(Error),
    }

    let eof = segment.eof;
    let joined = tokio::task::spawn_blocking(move || -> Result<SegmentResponse, PutError> {
        let stream = server.get_upload(&id, &token).ok_or(PutError::Gone)?;

        let mut sent = 0;
        if !data.is_empty() {
            sent = stream.lock().write(&data).map_err(PutError::Backend)?;
        }
        if eof {
            stream.lock().close().map_err(PutError::Backend)?;
            server.forget(&id);
        }

        let stream = stream.lock();
        Ok(SegmentResponse {
            segments: stream.segments(),
            compressed: stream.compressed_total(),
            uncompressed: stream.uncompressed_total(),
            sent,
        })
    })
    .await;

    Ok(match joined {
        Ok(Ok(rsp)) => json_reply(StatusCode::OK, &rsp),
        Ok(Err(PutError::Gone)) => error_reply(StatusCode::NOT_FOUND, "stream not found"),
        Ok(Err(PutError::Backend(e))) => error_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("unable to upload data to stream: {}", e),
        ),
        Err(_) => error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    })
}

async fn handle_blob_get(
    id: String,
    server: Arc<Server>,
    auth: Option<String>,
) -> Result<warp::reply::Response, Infallible> {
    let token = match stream_token(&auth) {
        Ok(t) => t,
        Err(denied) => return Ok(denied),
    };

    // The lookup is a map probe plus a lease renewal: no I/O, safe inline.
    let stream = match server.get_download(&id, &token) {
        Some(s) => s,
        None => return Ok(error_reply(StatusCode::NOT_FOUND, "stream not found")),
    };

    // The body is produced by a blocking reader task feeding a channel;
    // hyper drains the channel end as the client consumes the response. If
    // the client disappears the channel closes and the reader stops early.
    // Either way the stream is closed and forgotten afterwards.
    let (mut tx, rx) = futures::channel::mpsc::channel::<Result<Bytes, io::Error>>(4);
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        loop {
            match stream.lock().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if futures::executor::block_on(tx.send(Ok(chunk))).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let failure = io::Error::new(io::ErrorKind::Other, err.to_string());
                    let _ = futures::executor::block_on(tx.send(Err(failure)));
                    break;
                }
            }
        }

        let close_result = stream.lock().close();
        if let Err(err) = close_result {
            warn!(slog_scope::logger(), "error closing download stream: {}", err;
                  "stream_id" => stream.lock().id().to_owned());
        }
        server.forget(&id);
    });

    let mut response = Response::new(Body::wrap_stream(rx));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    Ok(response)
}
