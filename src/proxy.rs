use std::{
    convert::Infallible,
    error::Error as StdError,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    Method, Request, Response, StatusCode, Version,
    body::{Body, Frame, Incoming, SizeHint},
    header::{self, HeaderName},
    http::request,
    service::service_fn,
};
use hyper_util::{
    client::legacy::Client,
    rt::{TokioExecutor, TokioIo, TokioTimer},
};
use tokio::{
    net::TcpListener,
    sync::oneshot,
    time::{Sleep, sleep},
};
use tokio_rustls::TlsConnector;

use crate::{
    ca::{CaKeystore, LeafIssuer},
    config::{Config, Timeouts},
    error::ProxyError,
    intercept::{self, ConnectTarget, InterceptContext},
    record::{BoxError, CapturedBody, RequestRecord, ResponseRecord, Scheme, TeeBody},
    repeater::{self, RepeaterHandle},
    storage::RecordStore,
    tls::{self, UpstreamHttpsConnector},
};

pub type ProxyBody = BoxBody<Bytes, Box<dyn StdError + Send + Sync>>;
type HttpClient = Client<UpstreamHttpsConnector, ProxyBody>;

/// Headers that describe a single connection and never cross the proxy.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub repeater_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
    repeater: RepeaterHandle,
}

impl ProxyHandle {
    /// Stops accepting connections. In-flight transactions run to completion
    /// or time out on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
        self.repeater.shutdown().await;
    }
}

struct ProxyState {
    client: HttpClient,
    store: RecordStore,
    timeouts: Timeouts,
    intercept: Arc<InterceptContext>,
}

/// Loads the CA and the record store, then starts the proxy and replay
/// listeners.
pub async fn serve(config: &Config) -> anyhow::Result<ProxyHandle> {
    tls::ensure_rustls_crypto_provider()?;

    let ca = CaKeystore::load(
        &config.proxy.ca_cert,
        &config.proxy.ca_key,
        &config.proxy.common_name,
    )
    .context("load CA material")?;
    let store = RecordStore::from_config(&config.db)?;
    let upstream_tls = tls::upstream_client_config(&config.proxy.upstream_root_certs)?;
    let timeouts = config.proxy.timeouts();

    let listen = config.proxy.addr()?;
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {listen}: {err}"))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;

    let repeater =
        repeater::serve(&config.repeater, store.clone(), Arc::clone(&upstream_tls)).await?;
    let repeater_addr = repeater.listen_addr;

    let mut intercept_tls = (*upstream_tls).clone();
    intercept_tls.alpn_protocols = vec![b"http/1.1".to_vec()];
    let state = Arc::new(ProxyState {
        client: Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .build(tls::https_connector(&upstream_tls, timeouts.read)),
        store: store.clone(),
        timeouts,
        intercept: Arc::new(InterceptContext {
            issuer: Arc::new(LeafIssuer::new(Arc::new(ca))),
            store,
            connector: TlsConnector::from(Arc::new(intercept_tls)),
            timeouts,
        }),
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::debug!("accept failed: {err}");
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let mut builder = hyper::server::conn::http1::Builder::new();
                        builder
                            .timer(TokioTimer::new())
                            .header_read_timeout(state.timeouts.read);
                        let service = service_fn(move |req| dispatch(req, Arc::clone(&state)));
                        if let Err(err) = builder.serve_connection(io, service).with_upgrades().await {
                            tracing::debug!(%peer, "connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    tracing::info!(%listen_addr, %repeater_addr, "proxy listening");
    Ok(ProxyHandle {
        listen_addr,
        repeater_addr,
        shutdown_tx,
        join,
        repeater,
    })
}

/// Routes one request and emits its access log line. The handler runs in its
/// own task so that a panic turns into a `500` instead of a dropped listener.
async fn dispatch(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
) -> Result<Response<ProxyBody>, Infallible> {
    let started_at = Instant::now();
    let method = req.method().clone();
    let url = req.uri().to_string();
    let kind = if method == Method::CONNECT {
        "connect"
    } else {
        "http"
    };

    let response = contain_panics(&method, &url, handle(req, state)).await;

    emit_access_log(
        method.as_str(),
        &url,
        kind,
        response.status(),
        started_at.elapsed(),
    );
    Ok(response)
}

/// Runs `handler` on its own task; a panic or abort becomes a `500`.
async fn contain_panics<F>(method: &Method, url: &str, handler: F) -> Response<ProxyBody>
where
    F: Future<Output = Response<ProxyBody>> + Send + 'static,
{
    match tokio::spawn(handler).await {
        Ok(response) => response,
        Err(err) => {
            if err.is_panic() {
                tracing::error!(method = %method, url = %url, "request handler panicked");
            } else {
                tracing::error!(method = %method, url = %url, "request handler aborted: {err}");
            }
            simple_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn handle(req: Request<Incoming>, state: Arc<ProxyState>) -> Response<ProxyBody> {
    let result = if req.method() == Method::CONNECT {
        handle_connect(req, &state)
    } else {
        forward_plain(req, &state).await
    };

    result.unwrap_or_else(|err| {
        match &err {
            ProxyError::CaUnusable(_) => tracing::error!("request failed: {err}"),
            ProxyError::Store(_) => tracing::warn!("request failed: {err}"),
            _ => tracing::debug!("request failed: {err}"),
        }
        simple_response(err.status(), &err.public_message())
    })
}

/// Acknowledges the tunnel and hands the connection to the interception
/// engine once hyper releases it.
fn handle_connect(
    mut req: Request<Incoming>,
    state: &ProxyState,
) -> Result<Response<ProxyBody>, ProxyError> {
    let target = ConnectTarget::from_uri(req.uri())?;
    // Presented to clients that send no SNI.
    let provisional = state.intercept.issuer.issue_for_host(&target.host)?;

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(intercept::run(
        on_upgrade,
        target,
        provisional,
        Arc::clone(&state.intercept),
    ));

    // hyper writes this as a bare `200 OK` head (plus `date`) and releases the
    // socket to `on_upgrade` once it is flushed.
    Ok(Response::new(boxed_full(Bytes::new())))
}

async fn forward_plain(
    req: Request<Incoming>,
    state: &ProxyState,
) -> Result<Response<ProxyBody>, ProxyError> {
    let (parts, body) = req.into_parts();
    let Some(authority) = parts.uri.authority().map(|authority| authority.to_string()) else {
        return Err(ProxyError::BadRequest(
            "proxy requests must use an absolute-form target".to_owned(),
        ));
    };
    let scheme = match parts.uri.scheme_str().and_then(Scheme::parse) {
        Some(scheme) => scheme,
        None => {
            return Err(ProxyError::BadRequest(format!(
                "unsupported request target `{}`",
                parts.uri
            )));
        }
    };

    let (request_tee, request_capture) =
        TeeBody::new(IdleTimeoutBody::new(body, state.timeouts.read));
    let mut upstream_req = Request::new(request_tee.boxed());
    *upstream_req.method_mut() = parts.method.clone();
    *upstream_req.uri_mut() = parts.uri.clone();
    *upstream_req.version_mut() = Version::HTTP_11;
    *upstream_req.headers_mut() = parts.headers.clone();
    strip_hop_by_hop_headers(upstream_req.headers_mut());

    let upstream = tokio::time::timeout(state.timeouts.read, state.client.request(upstream_req))
        .await
        .map_err(|_| format!("no response within {}s", state.timeouts.read.as_secs()))
        .and_then(|result| result.map_err(|err| upstream_error_reason(&err)));

    let response = match upstream {
        Ok(response) => response,
        Err(reason) => {
            tokio::spawn(record_plain_transaction(
                state.store.clone(),
                parts,
                scheme,
                authority.clone(),
                request_capture,
                None,
            ));
            return Err(ProxyError::no_upstream(authority, reason));
        }
    };

    let (mut response_parts, response_body) = response.into_parts();
    let response_record = ResponseRecord::capture(&response_parts, &[]);
    strip_hop_by_hop_headers(&mut response_parts.headers);
    let (response_tee, response_capture) =
        TeeBody::new(IdleTimeoutBody::new(response_body, state.timeouts.read));

    tokio::spawn(record_plain_transaction(
        state.store.clone(),
        parts,
        scheme,
        authority,
        request_capture,
        Some((response_record, response_capture)),
    ));

    Ok(Response::from_parts(response_parts, response_tee.boxed()))
}

/// Waits for both tees to finish, then stores whatever was seen. A store
/// failure is logged and otherwise ignored.
async fn record_plain_transaction(
    store: RecordStore,
    parts: request::Parts,
    scheme: Scheme,
    authority: String,
    request_capture: oneshot::Receiver<CapturedBody>,
    response: Option<(ResponseRecord, oneshot::Receiver<CapturedBody>)>,
) {
    let request_body = request_capture.await.unwrap_or_default();
    let request = RequestRecord::capture(&parts, scheme, &authority, &request_body.bytes);

    let response = match response {
        Some((mut record, capture)) => {
            let captured = capture.await.unwrap_or_default();
            if !captured.complete {
                tracing::debug!(authority = %authority, "response body was truncated before recording");
            }
            record.body = captured.bytes;
            Some(record)
        }
        None => None,
    };

    if let Err(err) = store.record_transaction(request, response).await {
        tracing::warn!(authority = %authority, "failed to record transaction: {err}");
    }
}

fn upstream_error_reason(err: &hyper_util::client::legacy::Error) -> String {
    match err.source() {
        Some(source) => format!("{err}: {source}"),
        None => err.to_string(),
    }
}

fn emit_access_log(method: &str, url: &str, kind: &str, status: StatusCode, latency: Duration) {
    let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);

    tracing::info!(
        method = method,
        url = url,
        kind = kind,
        status = status.as_u16(),
        latency_ms,
        "proxy request completed",
    );
}

/// Removes the RFC 7230 §6.1 hop-by-hop set, `Proxy-Connection`, and any
/// header named in `Connection`.
pub(crate) fn strip_hop_by_hop_headers(headers: &mut hyper::HeaderMap) {
    let mut to_remove = Vec::new();
    for value in headers.get_all(header::CONNECTION).iter() {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            to_remove.push(header_name);
        }
    }

    for header_name in to_remove {
        headers.remove(header_name);
    }
    for header_name in HOP_BY_HOP_HEADERS {
        headers.remove(*header_name);
    }
}

/// Fails the stream when `inner` yields no frame for `idle`. The timer
/// restarts after every frame.
pub(crate) struct IdleTimeoutBody<B> {
    inner: B,
    idle: Duration,
    timer: Pin<Box<Sleep>>,
    expired: bool,
}

impl<B> IdleTimeoutBody<B> {
    pub(crate) fn new(inner: B, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            timer: Box::pin(sleep(idle)),
            expired: false,
        }
    }
}

impl<B> Body for IdleTimeoutBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.expired {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                let deadline = tokio::time::Instant::now() + this.idle;
                this.timer.as_mut().reset(deadline);
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match this.timer.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.expired = true;
                    Poll::Ready(Some(Err(Box::new(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("body stalled for {}s", this.idle.as_secs()),
                    )))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pub(crate) fn boxed_full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| -> Box<dyn StdError + Send + Sync> { match never {} })
        .boxed()
}

pub(crate) fn simple_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(boxed_full(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
