//! Relaying unintercepted requests to the forward target.
//!
//! Each forwarded request gets its own upstream connection with
//! `Connection: close`, so the upstream response body can be streamed back
//! verbatim until EOF without re-framing it. WebSocket upgrades that are not
//! tunnel requests are forwarded the same way; once upstream answers `101`, the
//! two sockets are spliced together.
//!
//! A request body nobody has looked at is copied from the client to upstream as
//! it arrives, so uploads of any size pass through without being buffered.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use url::Url;

use crate::http::{self, Headers};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "Connection",
    "Proxy-Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Te",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
];

/// Why a request could not be forwarded. Each becomes a 502.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported target scheme {0}")]
    UnsupportedScheme(String),
    #[error("target has no host")]
    MissingHost,
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("upstream I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad upstream response: {0}")]
    BadResponse(#[from] http::Error),
    #[error("could not relay request body: {0}")]
    Body(#[source] http::Error),
}

/// Where the request body is when forwarding starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body {
    /// Already read into [`http::Request::body`] and its trailers.
    Read,
    /// Still on the client connection, framed as given.
    Unread(http::Framing),
}

/// The request-target to send upstream: the target's base path joined with the
/// request path, and the two queries merged.
///
/// ```
/// use autohook::forward::upstream_target;
/// let base = url::Url::parse("http://up.test/base/?k=1").unwrap();
/// assert_eq!(upstream_target(&base, "/users?id=2"), "/base/users?k=1&id=2");
/// let root = url::Url::parse("http://up.test").unwrap();
/// assert_eq!(upstream_target(&root, "/x"), "/x");
/// ```
pub fn upstream_target(target: &Url, request_uri: &str) -> String {
    let (path, query) = match request_uri.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (request_uri, None),
    };
    let base = target.path();
    let joined = match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    };
    let query = match (target.query().filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
        (Some(a), Some(b)) => Some(format!("{a}&{b}")),
        (Some(a), None) => Some(a.to_string()),
        (None, Some(b)) => Some(b.to_string()),
        (None, None) => None,
    };
    match query {
        Some(q) => format!("{joined}?{q}"),
        None => joined,
    }
}

/// Removes hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut Headers) {
    let named: Vec<String> = headers
        .get_all("Connection")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    for name in named.iter().map(String::as_str).chain(HOP_BY_HOP) {
        headers.remove(name);
    }
}

/// Forwards `request` to `target` and streams the answer to `client`.
///
/// `reader` is the client connection's reader; an [`Body::Unread`] body is
/// copied out of it, and for an upgrade any bytes it holds past the request go
/// upstream once the splice starts. An `Err` means nothing was written to the
/// client, so it can still be sent a 502.
pub fn forward(
    client: &mut TcpStream,
    reader: &mut http::Reader<TcpStream>,
    request: &http::Request,
    body: Body,
    request_uri: &str,
    peer: SocketAddr,
    target: &Url,
) -> Result<(), Error> {
    if target.scheme() != "http" {
        return Err(Error::UnsupportedScheme(target.scheme().to_string()));
    }
    let host = target.host_str().filter(|h| !h.is_empty()).ok_or(Error::MissingHost)?;
    let authority = match target.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let upgrade = request.is_websocket_upgrade();
    let upgrade_value = request.headers.get("Upgrade").map(str::to_string);
    let mut headers = request.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.set("Host", authority.clone());
    let forwarded_for = match headers.get("X-Forwarded-For") {
        Some(prior) => format!("{prior}, {}", peer.ip()),
        None => peer.ip().to_string(),
    };
    headers.set("X-Forwarded-For", forwarded_for);
    headers.remove("Content-Length");
    let carries_body = matches!(request.method.as_str(), "POST" | "PUT" | "PATCH");
    match body {
        Body::Read => {
            for (name, value) in request.trailers.iter() {
                headers.append(name, value);
            }
            if !request.body.is_empty() || carries_body {
                headers.append("Content-Length", request.body.len().to_string());
            }
        }
        Body::Unread(http::Framing::Chunked) => headers.append("Transfer-Encoding", "chunked"),
        Body::Unread(http::Framing::Length(len)) => headers.append("Content-Length", len.to_string()),
        Body::Unread(http::Framing::Empty) if carries_body => headers.append("Content-Length", "0"),
        Body::Unread(http::Framing::Empty) => {}
    }
    match (upgrade, upgrade_value) {
        (true, Some(value)) => {
            headers.append("Connection", "Upgrade");
            headers.append("Upgrade", value);
        }
        _ => headers.append("Connection", "close"),
    }

    let addr = target
        .socket_addrs(|| Some(80))
        .map_err(|e| Error::Connect { addr: authority.clone(), source: e })?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Resolve(authority.clone()))?;
    let mut upstream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .map_err(|e| Error::Connect { addr: authority.clone(), source: e })?;
    let path = upstream_target(target, request_uri);
    upstream.write_all(&http::request_head(&request.method, &path, &headers))?;
    match body {
        Body::Read => upstream.write_all(&request.body)?,
        Body::Unread(framing) => reader.copy_body(framing, &mut upstream).map_err(Error::Body)?,
    }
    upstream.flush()?;

    let mut response = http::Reader::new(upstream.try_clone()?);
    let mut head = response.read_response_head()?;
    let body_start = response.take_buffered();
    logwise::info_sync!(
        "forwarded {method} {path} -> {status}",
        method = logwise::privacy::LogIt(&request.method),
        path = logwise::privacy::LogIt(&path),
        status = logwise::privacy::LogIt(&head.status)
    );

    if upgrade && head.status == 101 {
        client.write_all(&head.to_bytes())?;
        client.write_all(&body_start)?;
        splice(client, upstream, reader.take_buffered());
        return Ok(());
    }

    head.headers.remove("Connection");
    head.headers.remove("Keep-Alive");
    head.headers.append("Connection", "close");
    // past this point the client has seen bytes, so failures only end the stream
    if let Err(e) = stream_back(client, &head.to_bytes(), &body_start, &mut upstream) {
        logwise::info_sync!("forwarded body cut short: {e}", e = logwise::privacy::LogIt(&e));
    }
    let _ = upstream.shutdown(Shutdown::Both);
    Ok(())
}

fn stream_back(
    client: &mut TcpStream,
    head: &[u8],
    body_start: &[u8],
    upstream: &mut TcpStream,
) -> std::io::Result<()> {
    client.write_all(head)?;
    client.write_all(body_start)?;
    std::io::copy(upstream, client)?;
    client.flush()
}

/// Copies bytes both ways until either side closes.
fn splice(client: &mut TcpStream, upstream: TcpStream, leftover: Vec<u8>) {
    let (Ok(mut client_read), Ok(mut upstream_write)) = (client.try_clone(), upstream.try_clone())
    else {
        return;
    };
    let up = std::thread::Builder::new()
        .name("autohook::forward::splice".to_string())
        .spawn(move || {
            let _ = upstream_write.write_all(&leftover);
            let _ = std::io::copy(&mut client_read, &mut upstream_write);
            let _ = upstream_write.shutdown(Shutdown::Write);
        });
    let mut upstream_read = upstream;
    let _ = std::io::copy(&mut upstream_read, client);
    let _ = client.shutdown(Shutdown::Both);
    let _ = upstream_read.shutdown(Shutdown::Both);
    if let Ok(handle) = up {
        let _ = handle.join();
    }
}
