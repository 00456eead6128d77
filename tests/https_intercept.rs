use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{Request, Response, StatusCode, body::Incoming, header, service::service_fn};
use hyper_util::rt::TokioIo;
use rustls::{ClientConfig, RootCertStore, pki_types::ServerName};
use tapproxy::{
    ca::{CaKeystore, CaMaterialPaths, LeafIssuer},
    config::Config,
    proxy::ProxyHandle,
    record::RequestRecord,
    storage::RecordStore,
};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::{TlsAcceptor, TlsConnector, client::TlsStream};
use x509_parser::{extensions::GeneralName, prelude::*};

struct Harness {
    proxy: ProxyHandle,
    store: RecordStore,
    ca: Arc<CaKeystore>,
    origin: SocketAddr,
    _dir: tempfile::TempDir,
}

async fn start() -> Harness {
    tapproxy::tls::ensure_rustls_crypto_provider().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let ca_paths = tapproxy::ca::generate_ca(&dir.path().join("ca"), "Intercept Test CA", false).unwrap();
    let ca = Arc::new(
        CaKeystore::load(&ca_paths.cert_path, &ca_paths.key_path, "Intercept Test CA").unwrap(),
    );

    let origin = spawn_origin(&ca).await;
    let config = test_config(dir.path(), &ca_paths);
    let proxy = tapproxy::proxy::serve(&config).await.unwrap();
    let store = RecordStore::open(config.db.path.clone(), 2).unwrap();

    Harness {
        proxy,
        store,
        ca,
        origin,
        _dir: dir,
    }
}

fn test_config(dir: &Path, ca: &CaMaterialPaths) -> Config {
    Config::from_toml_str(&format!(
        r#"
[proxy]
host = "127.0.0.1"
port = 0
read_timeout = 5
write_timeout = 5
ca_cert = "{cert}"
ca_key = "{key}"
common_name = "Intercept Test CA"
upstream_root_certs = ["{cert}"]

[repeater]
host = "127.0.0.1"
port = 0

[db]
path = "{db}"
"#,
        cert = ca.cert_path.display(),
        key = ca.key_path.display(),
        db = dir.join("records.db").display(),
    ))
    .unwrap()
}

/// TLS origin whose certificate chains to the same CA the proxy signs with,
/// valid for `origin.test`, `a.test`, `b.test` and `127.0.0.1`.
async fn spawn_origin(ca: &Arc<CaKeystore>) -> SocketAddr {
    let leaf = LeafIssuer::new(Arc::clone(ca))
        .issue(&["origin.test", "a.test", "b.test", "127.0.0.1"])
        .unwrap();
    let acceptor = TlsAcceptor::from(leaf.server_config().unwrap());
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let service = service_fn(|req: Request<Incoming>| async move {
                    let path = req.uri().path().to_owned();
                    let host = req
                        .headers()
                        .get(header::HOST)
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default()
                        .to_owned();
                    let method = req.method().clone();
                    let body = req.into_body().collect().await.unwrap().to_bytes();
                    let reply = format!("{method} {path} {}", String::from_utf8_lossy(&body));
                    let mut response = Response::new(Full::new(Bytes::from(reply)));
                    response
                        .headers_mut()
                        .insert("x-origin", header::HeaderValue::from_static("tls"));
                    response
                        .headers_mut()
                        .insert("x-seen-host", header::HeaderValue::from_str(&host).unwrap());
                    Ok::<_, std::convert::Infallible>(response)
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service)
                    .await;
            });
        }
    });

    addr
}

/// TLS origin that promises 100 body bytes, sends a few, then closes.
async fn spawn_truncating_origin(ca: &Arc<CaKeystore>) -> SocketAddr {
    let leaf = LeafIssuer::new(Arc::clone(ca))
        .issue(&["origin.test", "127.0.0.1"])
        .unwrap();
    let acceptor = TlsAcceptor::from(leaf.server_config().unwrap());
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut head = Vec::new();
                let mut buf = [0_u8; 1024];
                while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(read) => head.extend_from_slice(&buf[..read]),
                    }
                }
                let _ = tls
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\npartial-body")
                    .await;
                let _ = tls.shutdown().await;
            });
        }
    });

    addr
}

fn client_tls(ca: &CaKeystore) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(ca.certificate_der().clone()).unwrap();
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Opens a tunnel through the proxy and completes the client-side handshake.
async fn open_tunnel(
    proxy: SocketAddr,
    connect_authority: &str,
    connector: &TlsConnector,
    server_name: ServerName<'static>,
) -> TlsStream<TcpStream> {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(
            format!("CONNECT {connect_authority} HTTP/1.1\r\nHost: {connect_authority}\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await.unwrap();
        assert_eq!(read, 1, "proxy closed before finishing CONNECT response");
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head);
    assert!(head.starts_with("HTTP/1.1 200"), "CONNECT response: {head}");

    connector.connect(server_name, stream).await.unwrap()
}

async fn tunneled_request(
    tls: TlsStream<TcpStream>,
    req: Request<Full<Bytes>>,
) -> (StatusCode, hyper::HeaderMap, Bytes) {
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(connection);
    let response = sender.send_request(req).await.unwrap();
    let (parts, body) = response.into_parts();
    (parts.status, parts.headers, body.collect().await.unwrap().to_bytes())
}

async fn wait_for_records(store: &RecordStore, count: usize) -> Vec<RequestRecord> {
    for _ in 0..100 {
        let records = store.list_all().await.unwrap();
        if records.len() >= count {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("expected {count} stored requests");
}

fn peer_leaf_sans(tls: &TlsStream<TcpStream>) -> Vec<String> {
    let (_, session) = tls.get_ref();
    let chain = session.peer_certificates().unwrap();
    let (_, cert) = X509Certificate::from_der(chain[0].as_ref()).unwrap();
    let san = cert.subject_alternative_name().unwrap().unwrap();
    san.value
        .general_names
        .iter()
        .map(|name| match name {
            GeneralName::DNSName(dns) => dns.to_string(),
            GeneralName::IPAddress(ip) => format!("ip:{ip:?}"),
            other => format!("{other:?}"),
        })
        .collect()
}

#[tokio::test]
async fn https_request_is_intercepted_and_recorded() {
    let h = start().await;
    let connector = client_tls(&h.ca);

    let tls = open_tunnel(
        h.proxy.listen_addr,
        &format!("127.0.0.1:{}", h.origin.port()),
        &connector,
        ServerName::try_from("origin.test").unwrap(),
    )
    .await;
    assert_eq!(peer_leaf_sans(&tls), vec!["origin.test".to_owned()]);

    let req = Request::builder()
        .method("POST")
        .uri("/submit?q=1")
        .header(header::HOST, "origin.test")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Full::new(Bytes::from_static(b"a=1")))
        .unwrap();
    let (status, headers, body) = tunneled_request(tls, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-origin").unwrap(), "tls");
    assert_eq!(&body[..], b"POST /submit a=1");

    let records = wait_for_records(&h.store, 1).await;
    let record = &records[0];
    assert!(record.is_https);
    assert_eq!(record.scheme, "https");
    assert_eq!(record.host, format!("127.0.0.1:{}", h.origin.port()));
    assert_eq!(record.path, "/submit");
    assert_eq!(record.post_params.get("a").map(String::as_str), Some("1"));

    let response = h.store.get_response(record.id).await.unwrap().unwrap();
    assert_eq!(response.code, 200);
    assert_eq!(response.body, b"POST /submit a=1");

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn ip_literal_tunnel_presents_ip_san() {
    let h = start().await;
    let connector = client_tls(&h.ca);

    let tls = open_tunnel(
        h.proxy.listen_addr,
        &format!("127.0.0.1:{}", h.origin.port()),
        &connector,
        ServerName::try_from("127.0.0.1").unwrap(),
    )
    .await;
    assert_eq!(peer_leaf_sans(&tls), vec!["ip:[127, 0, 0, 1]".to_owned()]);

    let req = Request::builder()
        .uri("/ip")
        .header(header::HOST, "127.0.0.1")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, body) = tunneled_request(tls, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"GET /ip ");

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn concurrent_tunnels_get_distinct_ids() {
    let h = start().await;
    let connector = client_tls(&h.ca);
    let authority = format!("127.0.0.1:{}", h.origin.port());

    let mut tasks = Vec::new();
    for i in 0..5 {
        let connector = connector.clone();
        let authority = authority.clone();
        let proxy = h.proxy.listen_addr;
        tasks.push(tokio::spawn(async move {
            let tls = open_tunnel(
                proxy,
                &authority,
                &connector,
                ServerName::try_from("origin.test").unwrap(),
            )
            .await;
            let req = Request::builder()
                .uri(format!("/n/{i}"))
                .header(header::HOST, "origin.test")
                .body(Full::new(Bytes::new()))
                .unwrap();
            tunneled_request(tls, req).await.0
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), StatusCode::OK);
    }

    let records = wait_for_records(&h.store, 5).await;
    let ids: Vec<i64> = records.iter().map(|record| record.id).collect();
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]), "ids: {ids:?}");
    let mut paths: Vec<_> = records.iter().map(|record| record.path.clone()).collect();
    paths.sort();
    assert_eq!(paths, (0..5).map(|i| format!("/n/{i}")).collect::<Vec<_>>());

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn replay_api_lists_and_repeats_recorded_requests() {
    let h = start().await;
    let connector = client_tls(&h.ca);

    let tls = open_tunnel(
        h.proxy.listen_addr,
        &format!("127.0.0.1:{}", h.origin.port()),
        &connector,
        ServerName::try_from("origin.test").unwrap(),
    )
    .await;
    let req = Request::builder()
        .method("POST")
        .uri("/echo")
        .header(header::HOST, "origin.test")
        .body(Full::new(Bytes::from_static(b"x")))
        .unwrap();
    let (status, _, _) = tunneled_request(tls, req).await;
    assert_eq!(status, StatusCode::OK);
    let records = wait_for_records(&h.store, 1).await;
    let id = records[0].id;

    let repeater = h.proxy.repeater_addr;
    let (status, body) = repeater_call(repeater, "GET", "/requests", "").await;
    assert_eq!(status, StatusCode::OK);
    let listed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["id"], id);
    assert_eq!(listed[0]["is_https"], true);

    let (status, body) = repeater_call(repeater, "GET", &format!("/requests/{id}"), "").await;
    assert_eq!(status, StatusCode::OK);
    let detail: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(detail["path"], "/echo");
    assert_eq!(detail["response"]["code"], 200);

    let (status, body) = repeater_call(repeater, "POST", &format!("/requests/{id}/repeat"), "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"POST /echo x");

    let (status, again) = repeater_call(repeater, "POST", &format!("/requests/{id}/repeat"), "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again, body, "replaying the same record twice gives the same response");

    let (status, body) = repeater_call(
        repeater,
        "POST",
        &format!("/requests/{id}/repeat"),
        r#"{"path": "/other", "body": "yz"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"POST /other yz");

    let (status, _) = repeater_call(repeater, "GET", "/requests/9999", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Replays are not recorded.
    assert_eq!(h.store.list_all().await.unwrap().len(), 1);

    h.proxy.shutdown().await;
}

async fn repeater_call(addr: SocketAddr, method: &str, path: &str, body: &str) -> (StatusCode, Bytes) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(connection);
    let req = Request::builder()
        .method(method)
        .uri(path)
        .header(header::HOST, addr.to_string())
        .body(Full::new(Bytes::from(body.to_owned())))
        .unwrap();
    let response = sender.send_request(req).await.unwrap();
    let status = response.status();
    (status, response.into_body().collect().await.unwrap().to_bytes())
}

#[tokio::test]
async fn truncated_origin_response_reaches_client_and_store() {
    let h = start().await;
    let origin = spawn_truncating_origin(&h.ca).await;
    let connector = client_tls(&h.ca);

    let tls = open_tunnel(
        h.proxy.listen_addr,
        &format!("127.0.0.1:{}", origin.port()),
        &connector,
        ServerName::try_from("origin.test").unwrap(),
    )
    .await;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(connection);
    let req = Request::builder()
        .uri("/cut")
        .header(header::HOST, "origin.test")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = sender.send_request(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.into_body().collect().await.is_err(),
        "client must see the body cut short"
    );

    let records = wait_for_records(&h.store, 1).await;
    let stored = h.store.get_response(records[0].id).await.unwrap().unwrap();
    assert_eq!(stored.code, 200);
    assert_eq!(stored.body, b"partial-body");

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn unreachable_origin_closes_tunnel_without_record() {
    let h = start().await;
    let connector = client_tls(&h.ca);
    let closed = TcpListener::bind(("127.0.0.1", 0)).await.unwrap().local_addr().unwrap();

    let mut stream = TcpStream::connect(h.proxy.listen_addr).await.unwrap();
    stream
        .write_all(format!("CONNECT {closed} HTTP/1.1\r\nHost: {closed}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        assert_eq!(stream.read(&mut byte).await.unwrap(), 1);
        head.push(byte[0]);
    }
    assert!(head.starts_with(b"HTTP/1.1 200"));

    let handshake = tokio::time::timeout(
        Duration::from_secs(5),
        connector.connect(ServerName::try_from("origin.test").unwrap(), stream),
    )
    .await
    .expect("proxy should close the tunnel promptly");
    assert!(handshake.is_err(), "handshake must fail when the origin is down");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.store.list_all().await.unwrap().is_empty());

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn each_sni_gets_its_own_leaf_and_dials_connect_target() {
    let h = start().await;
    let connector = client_tls(&h.ca);
    // The names do not resolve; only the CONNECT address reaches the origin.
    let authority = format!("127.0.0.1:{}", h.origin.port());

    for name in ["a.test", "b.test"] {
        let tls = open_tunnel(
            h.proxy.listen_addr,
            &authority,
            &connector,
            ServerName::try_from(name).unwrap(),
        )
        .await;
        assert_eq!(peer_leaf_sans(&tls), vec![name.to_owned()]);

        let req = Request::builder()
            .uri("/whoami")
            .header(header::HOST, name)
            .body(Full::new(Bytes::new()))
            .unwrap();
        let (status, headers, _) = tunneled_request(tls, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-seen-host").unwrap(), name);
    }

    let records = wait_for_records(&h.store, 2).await;
    assert!(records.iter().all(|record| record.host == authority));

    h.proxy.shutdown().await;
}
