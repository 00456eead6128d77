//! Replay service: inspects stored transactions and re-issues a stored request
//! against its origin, optionally with some fields replaced.

use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    HeaderMap, Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderName, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    client::legacy::Client,
    rt::{TokioExecutor, TokioIo, TokioTimer},
};
use rustls::ClientConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    config::{RepeaterConfig, Timeouts},
    error::StoreError,
    proxy::strip_hop_by_hop_headers,
    record::{RequestRecord, ResponseRecord, parse_raw_request},
    storage::RecordStore,
    tls::{self, UpstreamHttpsConnector},
};

type ReplayClient = Client<UpstreamHttpsConnector, Full<Bytes>>;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("request {0} was not found")]
    NotFound(i64),

    #[error("{0}")]
    BadRequest(String),

    #[error("replay upstream {target} failed: {reason}")]
    Upstream { target: String, reason: String },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ReplayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

impl ReplayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Fields a caller may replace before a stored request is re-sent. Header
/// overrides replace every stored value of the same name.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReplayOverrides {
    pub method: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReplayedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Re-executes stored requests with its own TLS client. Replays are not
/// recorded.
#[derive(Clone)]
pub struct Replayer {
    store: RecordStore,
    client: ReplayClient,
    timeouts: Timeouts,
}

impl Replayer {
    pub fn new(store: RecordStore, client_config: &ClientConfig, timeouts: Timeouts) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .build(tls::https_connector(client_config, timeouts.read));
        Self {
            store,
            client,
            timeouts,
        }
    }

    pub async fn replay(
        &self,
        id: i64,
        overrides: &ReplayOverrides,
    ) -> Result<ReplayedResponse, ReplayError> {
        let record = self.store.get_by_id(id).await?;
        let request = build_replay_request(&record, overrides)?;
        let target = request.uri().to_string();
        tracing::debug!(id, method = %request.method(), target = %target, "replaying stored request");

        let upstream_error = |reason: String| ReplayError::Upstream {
            target: target.clone(),
            reason,
        };
        let response = tokio::time::timeout(self.timeouts.read, self.client.request(request))
            .await
            .map_err(|_| upstream_error("timed out".to_owned()))?
            .map_err(|err| upstream_error(err.to_string()))?;
        let (parts, body) = response.into_parts();
        let body = tokio::time::timeout(self.timeouts.read, body.collect())
            .await
            .map_err(|_| upstream_error("timed out reading body".to_owned()))?
            .map_err(|err| upstream_error(err.to_string()))?
            .to_bytes();

        let mut headers = parts.headers;
        strip_hop_by_hop_headers(&mut headers);
        Ok(ReplayedResponse {
            status: parts.status,
            headers,
            body,
        })
    }
}

/// Rebuilds the stored request from its raw capture and applies `overrides`.
pub fn build_replay_request(
    record: &RequestRecord,
    overrides: &ReplayOverrides,
) -> Result<Request<Full<Bytes>>, ReplayError> {
    let raw = parse_raw_request(&record.raw).map_err(|err| {
        ReplayError::BadRequest(format!("stored request {} is unreadable: {err}", record.id))
    })?;

    let method = overrides.method.as_deref().unwrap_or(&raw.method);
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|err| ReplayError::BadRequest(format!("invalid method `{method}`: {err}")))?;

    let path = match overrides.path.as_deref() {
        Some(path) if path.starts_with('/') => path.to_owned(),
        Some(path) => {
            return Err(ReplayError::BadRequest(format!(
                "path override `{path}` must start with `/`"
            )));
        }
        None => match raw.uri() {
            Ok(uri) => uri
                .path_and_query()
                .map(|path_and_query| path_and_query.as_str().to_owned())
                .unwrap_or_else(|| "/".to_owned()),
            Err(_) => raw.target.clone(),
        },
    };
    let scheme = if record.is_https { "https" } else { "http" };
    let uri: Uri = format!("{scheme}://{}{path}", record.host)
        .parse()
        .map_err(|err| ReplayError::BadRequest(format!("invalid replay target: {err}")))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &raw.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        headers.append(name, value);
    }
    for (name, value) in &overrides.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| ReplayError::BadRequest(format!("invalid header `{name}`: {err}")))?;
        let value = HeaderValue::from_str(value).map_err(|err| {
            ReplayError::BadRequest(format!("invalid value for header `{name}`: {err}"))
        })?;
        headers.insert(name, value);
    }
    strip_hop_by_hop_headers(&mut headers);
    headers.remove(header::CONTENT_LENGTH);
    if !headers.contains_key(header::HOST)
        && let Ok(host) = HeaderValue::from_str(&record.host)
    {
        headers.insert(header::HOST, host);
    }

    let body = match &overrides.body {
        Some(body) => Bytes::from(body.clone().into_bytes()),
        None => Bytes::from(raw.body),
    };

    let mut request = Request::new(Full::new(body));
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.headers_mut() = headers;
    Ok(request)
}

pub struct RepeaterHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl RepeaterHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

pub async fn serve(
    config: &RepeaterConfig,
    store: RecordStore,
    client_config: Arc<ClientConfig>,
) -> anyhow::Result<RepeaterHandle> {
    let listen = config.addr()?;
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind repeater {listen}: {err}"))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get repeater local_addr: {err}"))?;

    let timeouts = config.timeouts();
    let replayer = Arc::new(Replayer::new(store, &client_config, timeouts));

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let replayer = Arc::clone(&replayer);
                    tokio::spawn(async move {
                        let mut builder = hyper::server::conn::http1::Builder::new();
                        builder
                            .timer(TokioTimer::new())
                            .header_read_timeout(timeouts.read);
                        let service = service_fn(move |req| {
                            repeater_handler(req, Arc::clone(&replayer))
                        });
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("repeater connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    tracing::info!(%listen_addr, "repeater listening");
    Ok(RepeaterHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    List,
    Detail(i64),
    Repeat(i64),
}

fn route(path: &str) -> Option<Result<Route, String>> {
    let segments: Vec<_> = path.trim_matches('/').split('/').collect();
    let parse_id = |raw: &str| {
        raw.parse::<i64>()
            .map_err(|_| format!("invalid request id `{raw}`"))
    };
    match segments.as_slice() {
        ["requests"] => Some(Ok(Route::List)),
        ["requests", id] => Some(parse_id(id).map(Route::Detail)),
        ["requests", id, "repeat"] => Some(parse_id(id).map(Route::Repeat)),
        _ => None,
    }
}

async fn repeater_handler(
    req: Request<Incoming>,
    replayer: Arc<Replayer>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let route = match route(&path) {
        Some(Ok(route)) => route,
        Some(Err(reason)) => return Ok(error_response(StatusCode::BAD_REQUEST, reason)),
        None => return Ok(error_response(StatusCode::NOT_FOUND, "not found")),
    };

    let response = match (route, &method) {
        (Route::List, &Method::GET) => list_requests(&replayer.store).await,
        (Route::Detail(id), &Method::GET) => request_detail(&replayer.store, id).await,
        (Route::Repeat(id), &Method::POST) => repeat_request(req, &replayer, id).await,
        _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    };
    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        "repeater request completed",
    );
    Ok(response)
}

async fn list_requests(store: &RecordStore) -> Response<Full<Bytes>> {
    match store.list_all().await {
        Ok(requests) => {
            let views: Vec<_> = requests.into_iter().map(RequestView::from).collect();
            json_response(StatusCode::OK, &views)
        }
        Err(err) => store_error_response(err),
    }
}

async fn request_detail(store: &RecordStore, id: i64) -> Response<Full<Bytes>> {
    let request = match store.get_by_id(id).await {
        Ok(request) => request,
        Err(err) => return store_error_response(err),
    };
    let response = match store.get_response(id).await {
        Ok(response) => response,
        Err(err) => return store_error_response(err),
    };
    json_response(
        StatusCode::OK,
        &RequestDetailView {
            request: RequestView::from(request),
            response: response.map(ResponseView::from),
        },
    )
}

async fn repeat_request(
    req: Request<Incoming>,
    replayer: &Replayer,
    id: i64,
) -> Response<Full<Bytes>> {
    let body = match req.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {err}"),
            );
        }
    };
    let overrides = if body.iter().all(u8::is_ascii_whitespace) {
        ReplayOverrides::default()
    } else {
        match serde_json::from_slice::<ReplayOverrides>(&body) {
            Ok(overrides) => overrides,
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("invalid JSON body: {err}"),
                );
            }
        }
    };

    match replayer.replay(id, &overrides).await {
        Ok(replayed) => {
            let mut response = Response::new(Full::new(replayed.body));
            *response.status_mut() = replayed.status;
            *response.headers_mut() = replayed.headers;
            response
        }
        Err(err) => {
            if matches!(err, ReplayError::Upstream { .. } | ReplayError::Store(_)) {
                tracing::warn!(id, "replay failed: {err}");
            }
            error_response(err.status(), err.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestView {
    id: i64,
    method: String,
    scheme: String,
    host: String,
    path: String,
    get_params: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    cookies: BTreeMap<String, String>,
    post_params: BTreeMap<String, String>,
    raw: String,
    is_https: bool,
    created_at_unix_ms: i64,
}

impl From<RequestRecord> for RequestView {
    fn from(request: RequestRecord) -> Self {
        Self {
            id: request.id,
            method: request.method,
            scheme: request.scheme,
            host: request.host,
            path: request.path,
            get_params: request.get_params,
            headers: request.headers,
            cookies: request.cookies,
            post_params: request.post_params,
            raw: String::from_utf8_lossy(&request.raw).into_owned(),
            is_https: request.is_https,
            created_at_unix_ms: request.created_at_unix_ms,
        }
    }
}

#[derive(Debug, Serialize)]
struct ResponseView {
    code: u16,
    message: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl From<ResponseRecord> for ResponseView {
    fn from(response: ResponseRecord) -> Self {
        Self {
            code: response.code,
            message: response.message,
            headers: response.headers,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestDetailView {
    #[serde(flatten)]
    request: RequestView,
    response: Option<ResponseView>,
}

#[derive(Debug, Serialize)]
struct ErrorView {
    error: String,
}

fn store_error_response(err: StoreError) -> Response<Full<Bytes>> {
    let err = ReplayError::from(err);
    if matches!(err, ReplayError::Store(_)) {
        tracing::warn!("record store query failed: {err}");
    }
    error_response(err.status(), err.to_string())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(
        status,
        &ErrorView {
            error: message.into(),
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(payload) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(err) => {
            tracing::debug!("failed to serialize repeater JSON response: {err}");
            let mut response = Response::new(Full::new(Bytes::from_static(
                b"{\"error\":\"internal error\"}",
            )));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use hyper::{Method, Request, header};

    use super::{ReplayOverrides, Route, build_replay_request, route};
    use crate::record::{RequestRecord, Scheme};

    fn stored_post() -> RequestRecord {
        let request = Request::builder()
            .method(Method::POST)
            .uri("http://example.test/echo?x=1")
            .header("host", "example.test")
            .header("proxy-connection", "keep-alive")
            .header("content-type", "text/plain")
            .header("content-length", "1")
            .body(())
            .unwrap();
        let (parts, ()) = request.into_parts();
        let mut record = RequestRecord::capture(&parts, Scheme::Http, "example.test", b"x");
        record.id = 7;
        record
    }

    #[test]
    fn routes_cover_list_detail_and_repeat() {
        assert_eq!(route("/requests"), Some(Ok(Route::List)));
        assert_eq!(route("/requests/"), Some(Ok(Route::List)));
        assert_eq!(route("/requests/12"), Some(Ok(Route::Detail(12))));
        assert_eq!(route("/requests/12/repeat"), Some(Ok(Route::Repeat(12))));
        assert!(matches!(route("/requests/abc"), Some(Err(_))));
        assert_eq!(route("/other"), None);
    }

    #[test]
    fn replay_request_reuses_stored_fields() {
        let request = build_replay_request(&stored_post(), &ReplayOverrides::default()).unwrap();

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri().to_string(), "http://example.test/echo?x=1");
        assert_eq!(request.headers().get(header::HOST).unwrap(), "example.test");
        assert!(request.headers().get("proxy-connection").is_none());
        assert!(request.headers().get(header::CONTENT_LENGTH).is_none());
        assert_eq!(request.headers().get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn overrides_replace_method_path_headers_and_body() {
        let overrides = ReplayOverrides {
            method: Some("PUT".to_owned()),
            path: Some("/echo/2".to_owned()),
            headers: BTreeMap::from([("Content-Type".to_owned(), "application/json".to_owned())]),
            body: Some("{}".to_owned()),
        };

        let request = build_replay_request(&stored_post(), &overrides).unwrap();
        assert_eq!(request.method(), Method::PUT);
        assert_eq!(request.uri().path(), "/echo/2");
        assert_eq!(request.uri().query(), None);
        let content_types: Vec<_> = request.headers().get_all("content-type").iter().collect();
        assert_eq!(content_types, vec!["application/json"]);
    }

    #[test]
    fn https_records_replay_over_https() {
        let mut record = stored_post();
        record.is_https = true;
        record.scheme = "https".to_owned();
        record.host = "example.test:8443".to_owned();

        let request = build_replay_request(&record, &ReplayOverrides::default()).unwrap();
        assert_eq!(request.uri().scheme_str(), Some("https"));
        assert_eq!(request.uri().authority().unwrap().as_str(), "example.test:8443");
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let bad_path = ReplayOverrides {
            path: Some("echo".to_owned()),
            ..ReplayOverrides::default()
        };
        assert!(build_replay_request(&stored_post(), &bad_path).is_err());

        let bad_method = ReplayOverrides {
            method: Some("NOT A METHOD".to_owned()),
            ..ReplayOverrides::default()
        };
        assert!(build_replay_request(&stored_post(), &bad_method).is_err());
    }

    #[test]
    fn overrides_reject_unknown_fields() {
        let err = serde_json::from_str::<ReplayOverrides>(r#"{"url": "/x"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown field"), "error: {err}");
    }
}
