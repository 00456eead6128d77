//! Transaction capture: the request/response pair persisted for every proxied
//! exchange, plus the helpers that build them from live HTTP messages.

use std::{
    collections::BTreeMap,
    error::Error as StdError,
    pin::Pin,
    task::{Context, Poll},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use hyper::{
    HeaderMap, Method, Uri, Version,
    body::{Body, Frame, SizeHint},
    header,
    http::{request, response},
};
use tokio::sync::oneshot;

use crate::error::ProxyError;

pub type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    /// Zero until the store assigns one.
    pub id: i64,
    pub method: String,
    pub scheme: String,
    /// Origin authority (`host` or `host:port`).
    pub host: String,
    pub path: String,
    pub get_params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub cookies: BTreeMap<String, String>,
    pub post_params: BTreeMap<String, String>,
    pub raw: Vec<u8>,
    pub is_https: bool,
    pub created_at_unix_ms: i64,
}

impl RequestRecord {
    /// Builds a record from a request head as received from the client,
    /// before any header rewriting.
    pub fn capture(parts: &request::Parts, scheme: Scheme, authority: &str, body: &[u8]) -> Self {
        let target = request_target(&parts.uri);
        let raw = dump_raw_request(&parts.method, &target, parts.version, &parts.headers, body);
        let headers = header_pairs(&parts.headers);

        Self {
            id: 0,
            method: parts.method.as_str().to_owned(),
            scheme: scheme.as_str().to_owned(),
            host: authority.to_owned(),
            path: parts.uri.path().to_owned(),
            get_params: query_pairs(parts.uri.query()),
            cookies: cookies_from_headers(&headers),
            post_params: form_params(&headers, body),
            headers,
            raw,
            is_https: scheme == Scheme::Https,
            created_at_unix_ms: now_unix_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub request_id: i64,
    pub code: u16,
    pub message: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ResponseRecord {
    pub fn capture(parts: &response::Parts, body: &[u8]) -> Self {
        Self {
            request_id: 0,
            code: parts.status.as_u16(),
            message: parts
                .status
                .canonical_reason()
                .unwrap_or_default()
                .to_owned(),
            headers: header_pairs(&parts.headers),
            body: body.to_vec(),
        }
    }
}

/// A request recovered from its recorded wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawRequest {
    pub fn uri(&self) -> Result<Uri, ProxyError> {
        self.target.parse::<Uri>().map_err(|err| {
            ProxyError::BadRequest(format!("invalid request target `{}`: {err}", self.target))
        })
    }

    pub fn path(&self) -> String {
        self.uri()
            .map(|uri| uri.path().to_owned())
            .unwrap_or_else(|_| self.target.clone())
    }

    pub fn query(&self) -> Option<String> {
        self.uri()
            .ok()
            .and_then(|uri| uri.query().map(str::to_owned))
    }
}

/// Request line with the original target, then the headers and the body.
///
/// Header names come out lower-cased and repeated names grouped, as hyper
/// delivers them. The body is already transfer-decoded, so a
/// `transfer-encoding` header is written as the matching `content-length`.
pub fn dump_raw_request(
    method: &Method,
    target: &str,
    version: Version,
    headers: &HeaderMap,
    body: &[u8],
) -> Vec<u8> {
    let decoded = headers.contains_key(header::TRANSFER_ENCODING);
    let mut raw = Vec::with_capacity(256 + body.len());
    raw.extend_from_slice(method.as_str().as_bytes());
    raw.push(b' ');
    raw.extend_from_slice(target.as_bytes());
    raw.push(b' ');
    raw.extend_from_slice(version_str(version).as_bytes());
    raw.extend_from_slice(b"\r\n");
    let mut length_written = false;
    for (name, value) in headers {
        if decoded && (name == header::TRANSFER_ENCODING || name == header::CONTENT_LENGTH) {
            if !length_written {
                raw.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
                length_written = true;
            }
            continue;
        }
        raw.extend_from_slice(name.as_str().as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(body);
    raw
}

pub fn parse_raw_request(raw: &[u8]) -> Result<RawRequest, ProxyError> {
    let bad = |reason: &str| ProxyError::BadRequest(format!("recorded request: {reason}"));

    let head_end = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| bad("missing end of headers"))?;
    let head = std::str::from_utf8(&raw[..head_end]).map_err(|_| bad("head is not UTF-8"))?;
    let body = raw[head_end + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| bad("missing request line"))?;
    let mut parts = request_line.splitn(3, ' ');
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(bad("malformed request line"));
    };
    if method.is_empty() || target.is_empty() {
        return Err(bad("malformed request line"));
    }

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| bad("malformed header line"))?;
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }

    Ok(RawRequest {
        method: method.to_owned(),
        target: target.to_owned(),
        version: version.to_owned(),
        headers,
        body,
    })
}

/// Request target as it appeared on the request line.
pub fn request_target(uri: &Uri) -> String {
    if uri.scheme().is_some() || uri.authority().is_some() {
        return uri.to_string();
    }
    uri.path_and_query()
        .map(|path_and_query| path_and_query.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned())
}

pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

pub fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

pub fn cookies_from_headers(headers: &[(String, String)]) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case(header::COOKIE.as_str()))
        .flat_map(|(_, value)| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_owned(), value.trim().trim_matches('"').to_owned()))
        })
        .collect()
}

/// Decoded body parameters, only for `application/x-www-form-urlencoded`.
pub fn form_params(headers: &[(String, String)], body: &[u8]) -> BTreeMap<String, String> {
    let is_form = headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case(header::CONTENT_TYPE.as_str())
            && value
                .split(';')
                .next()
                .is_some_and(|mime| {
                    mime.trim()
                        .eq_ignore_ascii_case("application/x-www-form-urlencoded")
                })
    });
    if !is_form {
        return BTreeMap::new();
    }
    url::form_urlencoded::parse(body).into_owned().collect()
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Bytes seen by a [`TeeBody`]. `complete` is false when the stream failed
/// or was dropped before its end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedBody {
    pub bytes: Vec<u8>,
    pub complete: bool,
}

/// Forwards every frame of `inner` unchanged while keeping a copy of the data
/// frames. The copy is delivered once, at end of stream, on error, or on drop.
pub struct TeeBody<B> {
    inner: B,
    captured: Vec<u8>,
    done: Option<oneshot::Sender<CapturedBody>>,
}

impl<B> TeeBody<B> {
    pub fn new(inner: B) -> (Self, oneshot::Receiver<CapturedBody>) {
        let (done_tx, done_rx) = oneshot::channel();
        (
            Self {
                inner,
                captured: Vec::new(),
                done: Some(done_tx),
            },
            done_rx,
        )
    }

    fn finish(&mut self, complete: bool) {
        if let Some(done) = self.done.take() {
            let _ = done.send(CapturedBody {
                bytes: std::mem::take(&mut self.captured),
                complete,
            });
        }
    }
}

impl<B> Drop for TeeBody<B> {
    fn drop(&mut self) {
        self.finish(false);
    }
}

impl<B> Body for TeeBody<B>
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
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.captured.extend_from_slice(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finish(false);
                Poll::Ready(Some(Err(err.into())))
            }
            Poll::Ready(None) => {
                this.finish(true);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
