//! HTTPS interception: terminate the client's TLS session with a minted leaf
//! and relay one request to the origin over a separate TLS session.
//!
//! The upstream session is always dialled, with the name the client sent in
//! its ClientHello, before the client-facing handshake completes. A client
//! that sends no SNI gets the CONNECT host instead, and still gets a live
//! upstream session.

use std::{
    convert::Infallible,
    net::IpAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
    upgrade::OnUpgrade,
};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::{net::TcpStream, sync::oneshot};
use tokio_rustls::{LazyConfigAcceptor, TlsConnector, client::TlsStream};

use crate::{
    ca::{LeafCert, LeafIssuer},
    config::Timeouts,
    error::ProxyError,
    proxy::{IdleTimeoutBody, ProxyBody, simple_response, strip_hop_by_hop_headers},
    record::{CapturedBody, RequestRecord, ResponseRecord, Scheme, TeeBody},
    storage::RecordStore,
    tls,
};

type UpstreamStream = TlsStream<TcpStream>;

/// Shared, read-only collaborators of every interception task.
pub(crate) struct InterceptContext {
    pub issuer: Arc<LeafIssuer>,
    pub store: RecordStore,
    pub connector: TlsConnector,
    pub timeouts: Timeouts,
}

/// `host:port` from a CONNECT request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    pub fn from_uri(uri: &Uri) -> Result<Self, ProxyError> {
        let raw = uri.to_string();
        let Some(authority) = uri.authority() else {
            return Err(ProxyError::no_upstream(raw, "CONNECT target has no host"));
        };
        let Some(port) = authority.port_u16() else {
            return Err(ProxyError::no_upstream(raw, "CONNECT target has no port"));
        };
        let host = authority.host();
        let host = host
            .strip_prefix('[')
            .and_then(|inner| inner.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(ProxyError::no_upstream(raw, "CONNECT target has no host"));
        }

        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }

    pub fn authority(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

/// State owned by one interception task.
struct Transaction {
    target: ConnectTarget,
    /// SNI from the ClientHello, if any.
    server_name: Option<String>,
    leaf: Arc<LeafCert>,
    upstream: Option<UpstreamStream>,
}

impl Transaction {
    fn upstream_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.target.host)
    }
}

/// Captured halves of the single exchange relayed through the tunnel. The
/// response body arrives on the receiver once the client-facing stream ends.
#[derive(Default)]
struct Exchange {
    request: Option<RequestRecord>,
    response: Option<(ResponseRecord, oneshot::Receiver<CapturedBody>)>,
}

pub(crate) async fn run(
    on_upgrade: OnUpgrade,
    target: ConnectTarget,
    provisional: Arc<LeafCert>,
    ctx: Arc<InterceptContext>,
) {
    let authority = target.authority();
    match intercept(on_upgrade, target, provisional, &ctx).await {
        Ok(()) => tracing::debug!(authority = %authority, "https transaction closed"),
        Err(err @ ProxyError::CaUnusable(_)) => {
            tracing::error!(authority = %authority, "https interception failed: {err}");
        }
        Err(err) => tracing::warn!(authority = %authority, "https interception failed: {err}"),
    }
}

async fn intercept(
    on_upgrade: OnUpgrade,
    target: ConnectTarget,
    provisional: Arc<LeafCert>,
    ctx: &InterceptContext,
) -> Result<(), ProxyError> {
    let authority = target.authority();
    let read_timeout = ctx.timeouts.read;

    let upgraded = on_upgrade
        .await
        .map_err(|err| ProxyError::handshake(&authority, format!("take over tunnel: {err}")))?;

    let acceptor = LazyConfigAcceptor::new(
        rustls::server::Acceptor::default(),
        TokioIo::new(upgraded),
    );
    let start = with_deadline(read_timeout, acceptor)
        .await
        .map_err(|err| ProxyError::handshake(&authority, format!("read ClientHello: {err}")))?;

    let mut tx = Transaction {
        server_name: start.client_hello().server_name().map(str::to_owned),
        target,
        leaf: provisional,
        upstream: None,
    };
    tracing::debug!(
        authority = %authority,
        sni = tx.server_name.as_deref().unwrap_or(""),
        "received ClientHello"
    );

    tx.upstream = Some(dial_upstream(&tx, ctx).await?);

    if let Some(name) = tx.server_name.as_deref()
        && !name.eq_ignore_ascii_case(&tx.target.host)
    {
        tx.leaf = ctx.issuer.issue_for_host(name)?;
    }
    let server_config = tx
        .leaf
        .server_config()
        .map_err(|err| ProxyError::handshake(&authority, err))?;
    let client_tls = with_deadline(read_timeout, start.into_stream(server_config))
        .await
        .map_err(|err| ProxyError::handshake(&authority, format!("client handshake: {err}")))?;

    let upstream = Arc::new(Mutex::new(tx.upstream.take()));
    let exchange = Arc::new(Mutex::new(Exchange::default()));
    let service = {
        let upstream = Arc::clone(&upstream);
        let exchange = Arc::clone(&exchange);
        let authority = authority.clone();
        let timeouts = ctx.timeouts;
        service_fn(move |req| {
            let upstream = lock(&upstream).take();
            let exchange = Arc::clone(&exchange);
            let authority = authority.clone();
            async move {
                Ok::<_, Infallible>(relay(req, upstream, exchange, authority, timeouts).await)
            }
        })
    };

    let mut builder = hyper::server::conn::http1::Builder::new();
    builder
        .keep_alive(false)
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout);
    let served = tokio::time::timeout(
        read_timeout + ctx.timeouts.write,
        builder.serve_connection(TokioIo::new(client_tls), service),
    )
    .await;

    let exchange = std::mem::take(&mut *lock(&exchange));
    let Some(request) = exchange.request else {
        return match served {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ProxyError::handshake(&authority, err)),
            Err(_) => Err(ProxyError::handshake(&authority, "client sent no request in time")),
        };
    };
    // The connection future is gone by now, so the response tee has either
    // finished or been dropped.
    let response = match exchange.response {
        Some((mut record, capture)) => {
            let captured = capture.await.unwrap_or_default();
            if !captured.complete {
                tracing::debug!(authority = %authority, "origin response was truncated before recording");
            }
            record.body = captured.bytes;
            Some(record)
        }
        None => None,
    };
    if let Err(err) = ctx.store.record_transaction(request, response).await {
        tracing::warn!(authority = %authority, "failed to record https transaction: {err}");
    }

    match served {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            tracing::debug!(authority = %authority, "client connection ended with error: {err}");
            Ok(())
        }
        Err(_) => {
            tracing::debug!(authority = %authority, "client connection timed out");
            Ok(())
        }
    }
}

async fn dial_upstream(tx: &Transaction, ctx: &InterceptContext) -> Result<UpstreamStream, ProxyError> {
    let authority = tx.target.authority();
    let tcp = with_deadline(
        ctx.timeouts.read,
        TcpStream::connect((tx.target.host.as_str(), tx.target.port)),
    )
    .await
    .map_err(|err| ProxyError::no_upstream(&authority, err))?;

    let server_name =
        tls::server_name(tx.upstream_name()).map_err(|err| ProxyError::handshake(&authority, err))?;
    with_deadline(ctx.timeouts.read, ctx.connector.connect(server_name, tcp))
        .await
        .map_err(|err| ProxyError::handshake(&authority, format!("origin handshake: {err}")))
}

/// Reads the decrypted request, sends it upstream, and streams the origin's
/// response back. Both halves are left in `exchange` for recording. A body
/// the origin cuts short reaches the client and the store truncated.
async fn relay(
    req: Request<Incoming>,
    upstream: Option<UpstreamStream>,
    exchange: Arc<Mutex<Exchange>>,
    authority: String,
    timeouts: Timeouts,
) -> Response<ProxyBody> {
    let (parts, body) = req.into_parts();
    let body = match with_deadline(timeouts.read, body.collect()).await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::debug!(authority = %authority, "failed to read tunneled request body: {err}");
            return simple_response(StatusCode::BAD_REQUEST, "unreadable request body");
        }
    };
    lock(&exchange).request = Some(RequestRecord::capture(
        &parts,
        Scheme::Https,
        &authority,
        &body,
    ));

    let Some(upstream) = upstream else {
        let err = ProxyError::no_upstream(&authority, "upstream session already used");
        return simple_response(err.status(), &err.public_message());
    };

    match send_upstream(parts, body, upstream, &authority, timeouts).await {
        Ok((mut response_parts, response_body)) => {
            let record = ResponseRecord::capture(&response_parts, &[]);
            strip_hop_by_hop_headers(&mut response_parts.headers);
            let (response_tee, response_capture) =
                TeeBody::new(IdleTimeoutBody::new(response_body, timeouts.read));
            lock(&exchange).response = Some((record, response_capture));
            Response::from_parts(response_parts, response_tee.boxed())
        }
        Err(err) => {
            tracing::warn!(authority = %authority, "https upstream exchange failed: {err}");
            simple_response(err.status(), &err.public_message())
        }
    }
}

async fn send_upstream(
    parts: hyper::http::request::Parts,
    body: Bytes,
    upstream: UpstreamStream,
    authority: &str,
    timeouts: Timeouts,
) -> Result<(hyper::http::response::Parts, Incoming), ProxyError> {
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(upstream))
        .await
        .map_err(|err| ProxyError::no_upstream(authority, err))?;
    let connection_authority = authority.to_owned();
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!(
                authority = connection_authority,
                "upstream connection error: {err}"
            );
        }
    });

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or("/");
    let uri: Uri = path_and_query
        .parse()
        .map_err(|err| ProxyError::BadRequest(format!("invalid request target: {err}")))?;
    let mut headers = parts.headers;
    strip_hop_by_hop_headers(&mut headers);
    if !headers.contains_key(header::HOST)
        && let Ok(host) = HeaderValue::from_str(authority)
    {
        headers.insert(header::HOST, host);
    }

    let mut upstream_req = Request::new(Full::new(body));
    *upstream_req.method_mut() = parts.method;
    *upstream_req.uri_mut() = uri;
    *upstream_req.headers_mut() = headers;

    let response = with_deadline(timeouts.write, sender.send_request(upstream_req))
        .await
        .map_err(|err| ProxyError::no_upstream(authority, err))?;
    Ok(response.into_parts())
}

async fn with_deadline<T, E, F>(deadline: Duration, future: F) -> Result<T, String>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(deadline, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err(format!("timed out after {}s", deadline.as_secs())),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
