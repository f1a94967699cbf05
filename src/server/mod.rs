//! HTTP surface: a thin adapter from wire requests to the mount table.
//!
//! Routing is a pure function over method, path, query, and body so the
//! whole surface is testable without sockets; the hyper glue only collects
//! bodies and renders [`ApiReply`] values.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tracing::debug;

use crate::mount::MountableFs;
use crate::plugin::ConfigMap;
use crate::sandbox::{self, ModuleSource};
use crate::vfs::{ErrorKind, FileSystem, FsError, FsResult};

const API_PREFIX: &str = "/api/v1";
const JSON: &str = "application/json";
const OCTET_STREAM: &str = "application/octet-stream";
const EOF_HEADER: &str = "x-agfs-eof";

/// Map an error kind onto its wire status.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound | ErrorKind::NotMounted => StatusCode::NOT_FOUND,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::AlreadyExists
        | ErrorKind::NotEmpty
        | ErrorKind::AlreadyMounted
        | ErrorKind::CrossMountRename => StatusCode::CONFLICT,
        ErrorKind::InvalidArgument
        | ErrorKind::NotADirectory
        | ErrorKind::IsDirectory
        | ErrorKind::StreamingUnsupported => StatusCode::BAD_REQUEST,
        ErrorKind::InvalidConfig | ErrorKind::UnknownFsType | ErrorKind::InitFailed => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorKind::ShutdownFailed | ErrorKind::DeadlineExceeded | ErrorKind::Other => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Rendered API response.
#[derive(Debug)]
pub struct ApiReply {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Bytes,
    pub eof: Option<bool>,
}

impl ApiReply {
    fn json_value(value: serde_json::Value) -> FsResult<Self> {
        let body = serde_json::to_vec(&value)
            .map_err(|err| FsError::other(format!("encoding response: {err}")))?;
        Ok(Self { status: StatusCode::OK, content_type: JSON, body: Bytes::from(body), eof: None })
    }

    fn json<T: serde::Serialize>(value: &T) -> FsResult<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|err| FsError::other(format!("encoding response: {err}")))?;
        Ok(Self { status: StatusCode::OK, content_type: JSON, body: Bytes::from(body), eof: None })
    }

    fn octets(data: Vec<u8>, eof: bool) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: OCTET_STREAM,
            body: Bytes::from(data),
            eof: Some(eof),
        }
    }
}

fn hex_digit(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|digit| digit as u8)
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(percent_decode(key), percent_decode(value));
    }
    params
}

fn required<'a>(params: &'a BTreeMap<String, String>, key: &str) -> FsResult<&'a str> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| FsError::invalid_argument(format!("missing query parameter `{key}`")))
}

fn parse_i64(params: &BTreeMap<String, String>, key: &str, default: i64) -> FsResult<i64> {
    match params.get(key) {
        Some(value) => value
            .parse()
            .map_err(|_| FsError::invalid_argument(format!("`{key}` is not an integer"))),
        None => Ok(default),
    }
}

fn parse_octal(params: &BTreeMap<String, String>, key: &str, default: u32) -> FsResult<u32> {
    match params.get(key) {
        Some(value) => u32::from_str_radix(value, 8)
            .map_err(|_| FsError::invalid_argument(format!("`{key}` is not an octal mode"))),
        None => Ok(default),
    }
}

#[derive(Deserialize)]
struct RenameRequest {
    old: String,
    new: String,
}

#[derive(Deserialize)]
struct ChmodRequest {
    path: String,
    mode: String,
}

#[derive(Deserialize)]
struct MountRequest {
    fstype: String,
    path: String,
    #[serde(default)]
    config: ConfigMap,
}

#[derive(Deserialize)]
struct UnmountRequest {
    path: String,
}

#[derive(Deserialize)]
struct LoadRequest {
    name: String,
    url: String,
}

fn parse_json_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> FsResult<T> {
    serde_json::from_slice(body)
        .map_err(|err| FsError::invalid_argument(format!("malformed request body: {err}")))
}

/// Route one API request. Pure over its inputs apart from the filesystem
/// itself.
pub async fn dispatch(
    fs: &Arc<MountableFs>,
    method: &Method,
    path: &str,
    query: &str,
    body: &[u8],
    content_type: Option<&str>,
) -> FsResult<ApiReply> {
    let route = path
        .strip_prefix(API_PREFIX)
        .ok_or_else(|| FsError::not_found(path))?;
    let params = parse_query(query);

    match (method, route) {
        (&Method::GET, "/stat") => {
            let target = required(&params, "path")?;
            ApiReply::json(&fs.stat(target).await?)
        }
        (&Method::GET, "/ls") => {
            let target = required(&params, "path")?;
            ApiReply::json(&fs.readdir(target).await?)
        }
        (&Method::GET, "/read") => {
            let target = required(&params, "path")?;
            let offset = parse_i64(&params, "offset", 0)?;
            let size = parse_i64(&params, "size", -1)?;
            let (data, eof) = fs.read(target, offset, size).await?;
            Ok(ApiReply::octets(data, eof))
        }
        (&Method::POST, "/write") => {
            let target = required(&params, "path")?;
            let ack = fs.write(target, body).await?;
            ApiReply::json_value(json!({
                "ack": ack.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
            }))
        }
        (&Method::POST, "/mkdir") => {
            let target = required(&params, "path")?;
            let perm = parse_octal(&params, "perm", 0o755)?;
            fs.mkdir(target, perm).await?;
            ApiReply::json_value(json!({"status": "ok"}))
        }
        (&Method::DELETE, "/rm") => {
            let target = required(&params, "path")?;
            let recursive = matches!(
                params.get("recursive").map(String::as_str),
                Some("true") | Some("1")
            );
            if recursive {
                fs.remove_all(target).await?;
            } else {
                fs.remove(target).await?;
            }
            ApiReply::json_value(json!({"status": "ok"}))
        }
        (&Method::POST, "/rename") => {
            let request: RenameRequest = parse_json_body(body)?;
            fs.rename(&request.old, &request.new).await?;
            ApiReply::json_value(json!({"status": "ok"}))
        }
        (&Method::POST, "/chmod") => {
            let request: ChmodRequest = parse_json_body(body)?;
            let mode = u32::from_str_radix(&request.mode, 8)
                .map_err(|_| FsError::invalid_argument("`mode` is not an octal mode"))?;
            fs.chmod(&request.path, mode).await?;
            ApiReply::json_value(json!({"status": "ok"}))
        }
        (&Method::GET, "/mounts") => ApiReply::json(&fs.mounts().await),
        (&Method::POST, "/mount") => {
            let request: MountRequest = parse_json_body(body)?;
            fs.mount(&request.fstype, &request.path, &request.config).await?;
            ApiReply::json_value(json!({"status": "ok"}))
        }
        (&Method::POST, "/unmount") => {
            let request: UnmountRequest = parse_json_body(body)?;
            fs.unmount(&request.path).await?;
            ApiReply::json_value(json!({"status": "ok"}))
        }
        (&Method::GET, "/health") => ApiReply::json_value(json!({"status": "ok"})),
        (&Method::GET, "/plugins") => {
            ApiReply::json_value(json!({"plugins": fs.registry().names()}))
        }
        (&Method::GET, "/readme") => {
            let target = required(&params, "path")?;
            ApiReply::json_value(json!({"readme": fs.readme(target).await?}))
        }
        (&Method::POST, "/plugins/load") => {
            let source = if content_type.is_some_and(|ct| ct.starts_with(OCTET_STREAM)) {
                ModuleSource::Bytes(body.to_vec())
            } else {
                let request: LoadRequest = parse_json_body(body)?;
                return load_plugin(fs, &request.name, ModuleSource::Url(request.url)).await;
            };
            let name = required(&params, "name")?;
            load_plugin(fs, name, source).await
        }
        _ => Err(FsError::not_found(path)),
    }
}

async fn load_plugin(
    fs: &Arc<MountableFs>,
    name: &str,
    source: ModuleSource,
) -> FsResult<ApiReply> {
    let registry = fs.registry().clone();
    sandbox::load(fs, &registry, name, source).await?;
    ApiReply::json_value(json!({"status": "ok", "name": name}))
}

/// Error envelope: `{"error": {"kind", "message"}}`, status per
/// [`status_for`].
fn error_response(err: &FsError) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&json!({
        "error": {"kind": err.kind, "message": err.message},
    }))
    .unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status_for(err.kind);
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(JSON));
    response
}

fn render(result: FsResult<ApiReply>) -> Response<Full<Bytes>> {
    match result {
        Ok(reply) => {
            let mut response = Response::new(Full::new(reply.body));
            *response.status_mut() = reply.status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(reply.content_type));
            if let Some(eof) = reply.eof {
                response.headers_mut().insert(
                    HeaderName::from_static(EOF_HEADER),
                    HeaderValue::from_static(if eof { "true" } else { "false" }),
                );
            }
            response
        }
        Err(err) => error_response(&err),
    }
}

async fn handle(
    fs: Arc<MountableFs>,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return Ok(error_response(&FsError::invalid_argument(format!(
                "reading request body: {err}"
            ))));
        }
    };
    let result = dispatch(
        &fs,
        &method,
        uri.path(),
        uri.query().unwrap_or(""),
        &body,
        content_type.as_deref(),
    )
    .await;
    Ok(render(result))
}

/// Serve one accepted connection on its own task.
pub fn serve_connection(socket: TcpStream, fs: Arc<MountableFs>) {
    tokio::spawn(async move {
        let io = TokioIo::new(socket);
        let service = service_fn(move |request| handle(fs.clone(), request));
        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            debug!(error = %err, "connection closed with error");
        }
    });
}
