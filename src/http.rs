//! Minimal HTTP/1.1 codec for the front door and the forwarder.
//!
//! Requests are parsed off a blocking [`Read`] with a small push/pop parser that
//! keeps any bytes it read past the end of a message. Those leftover bytes matter:
//! a keep-alive client may have pipelined its next request, and a WebSocket client
//! may have sent its first frame right behind the upgrade request.
//!
//! A request head can be read on its own, leaving the body on the stream. The
//! body is then either materialized in full (capped at [`MAX_BODY`]) or copied
//! through to another writer without buffering. Both `Content-Length` and
//! `chunked` framing are understood; trailers of a chunked body are kept
//! separately.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{Read, Write};

/// Largest request or response head we are willing to buffer.
const MAX_HEAD: usize = 64 * 1024;
/// Largest request body we are willing to buffer in memory.
pub const MAX_BODY: usize = 64 * 1024 * 1024;

/// Why a message could not be read.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed mid-message")]
    UnexpectedEof,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message head exceeds {MAX_HEAD} bytes")]
    HeadTooLarge,
    #[error("message body exceeds {MAX_BODY} bytes")]
    BodyTooLarge,
}

/// Returns the canonical form of a header name: the first letter and any letter
/// following a hyphen are upper case, the rest lower case.
///
/// ```
/// use autohook::http::canonical_name;
/// assert_eq!(canonical_name("content-type"), "Content-Type");
/// assert_eq!(canonical_name("X-HOOK"), "X-Hook");
/// assert_eq!(canonical_name("sec-websocket-protocol"), "Sec-Websocket-Protocol");
/// ```
pub fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// An ordered header list. Names compare case-insensitively; repeated names are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// An empty header list.
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in the order they appeared.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether `name` has at least one value.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Appends a value, keeping any existing ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replaces every value of `name` with a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.0.push((name, value.into()));
    }

    /// Removes every value of `name`.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Whether any value of the comma-separated header `name` contains `token`.
    ///
    /// ```
    /// use autohook::http::Headers;
    /// let mut h = Headers::new();
    /// h.append("Connection", "keep-alive, Upgrade");
    /// assert!(h.has_token("connection", "upgrade"));
    /// assert!(!h.has_token("connection", "close"));
    /// ```
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Every name and value, in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of header lines.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Groups values under canonical names, preserving value order per name.
    pub fn to_multimap(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (k, v) in &self.0 {
            map.entry(canonical_name(k)).or_default().push(v.clone());
        }
        map
    }

    fn write_to(&self, out: &mut String) {
        for (k, v) in &self.0 {
            let _ = write!(out, "{k}: {v}\r\n");
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Headers(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A fully read request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// The request-target exactly as it appeared on the request line.
    pub target: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Trailer fields of a chunked body.
    pub trailers: Headers,
}

impl Request {
    /// Whether this is a WebSocket upgrade request.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers.has_token("Connection", "upgrade")
            && self.headers.has_token("Upgrade", "websocket")
    }

    /// Whether the connection may carry another request after this one.
    pub fn keep_alive(&self) -> bool {
        if self.version.eq_ignore_ascii_case("HTTP/1.0") {
            self.headers.has_token("Connection", "keep-alive")
        } else {
            !self.headers.has_token("Connection", "close")
        }
    }

    /// The path portion of the target, without query.
    ///
    /// Absolute-form targets are reduced to their path.
    pub fn path(&self) -> &str {
        let target = self.origin_form();
        match target.find('?') {
            Some(i) => &target[..i],
            None => target,
        }
    }

    /// The target in origin form (`/path?query`).
    pub fn origin_form(&self) -> &str {
        let target = self.target.as_str();
        if let Some(rest) = target
            .strip_prefix("http://")
            .or_else(|| target.strip_prefix("https://"))
        {
            match rest.find('/') {
                Some(i) => &rest[i..],
                None => "/",
            }
        } else {
            target
        }
    }
}

/// How a request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body.
    Empty,
    /// Exactly this many bytes follow the head.
    Length(u64),
    /// `Transfer-Encoding: chunked`, possibly with trailers.
    Chunked,
}

impl Framing {
    /// Determines the framing from request headers. `chunked` wins over `Content-Length`.
    ///
    /// ```
    /// use autohook::http::{Framing, Headers};
    /// let h: Headers = [("Content-Length", "12")].into_iter().collect();
    /// assert_eq!(Framing::of(&h).unwrap(), Framing::Length(12));
    /// assert_eq!(Framing::of(&Headers::new()).unwrap(), Framing::Empty);
    /// ```
    pub fn of(headers: &Headers) -> Result<Framing, Error> {
        if headers.has_token("Transfer-Encoding", "chunked") {
            return Ok(Framing::Chunked);
        }
        match headers.get("Content-Length") {
            Some(len) => match len.trim().parse::<u64>() {
                Ok(0) => Ok(Framing::Empty),
                Ok(len) => Ok(Framing::Length(len)),
                Err(_) => Err(Error::Malformed(format!("invalid Content-Length: {len}"))),
            },
            None => Ok(Framing::Empty),
        }
    }
}

/// The status line and headers of a response read from upstream.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// The head as written on the wire, blank line included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.version, self.status, self.reason);
        self.headers.write_to(&mut out);
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// A response generated locally.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    /// An empty response with `status`.
    pub fn new(status: u16) -> Self {
        Response {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// A `text/plain` response carrying `message`.
    pub fn text(status: u16, message: impl Into<String>) -> Self {
        Response::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(message.into().into_bytes())
    }

    /// Adds a header, keeping existing values of the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replaces the body.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Serializes the response. `Content-Length` always reflects the body;
    /// with `head_only` the body itself is left out.
    pub fn to_bytes(&self, head_only: bool, keep_alive: bool) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status));
        let mut headers = self.headers.clone();
        headers.remove("Content-Length");
        headers.remove("Transfer-Encoding");
        headers.remove("Connection");
        headers.write_to(&mut head);
        if self.status != 304 && !(100..200).contains(&self.status) {
            let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
        }
        head.push_str(if keep_alive {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        head.push_str("\r\n");
        let mut bytes = head.into_bytes();
        if !head_only && self.status != 304 {
            bytes.extend_from_slice(&self.body);
        }
        bytes
    }

    /// Writes [`to_bytes`](Self::to_bytes) to `w` and flushes.
    pub fn write_to<W: Write>(
        &self,
        w: &mut W,
        head_only: bool,
        keep_alive: bool,
    ) -> std::io::Result<()> {
        w.write_all(&self.to_bytes(head_only, keep_alive))?;
        w.flush()
    }
}

/// The reason phrase for `status`.
pub fn reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        418 => "I'm a teapot",
        422 => "Unprocessable Entity",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Reads HTTP messages off a stream, retaining bytes read past the current message.
#[derive(Debug)]
pub struct Reader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: Read> Reader<R> {
    /// A reader with nothing buffered yet.
    pub fn new(inner: R) -> Self {
        Reader {
            inner,
            buf: Vec::new(),
        }
    }

    /// Bytes already read from the stream but not yet consumed.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Reads the next request, body included. Returns `Ok(None)` if the peer
    /// closed the connection cleanly between requests.
    pub fn read_request(&mut self) -> Result<Option<Request>, Error> {
        let Some((mut request, framing)) = self.read_request_head()? else {
            return Ok(None);
        };
        self.read_body(framing, &mut request)?;
        Ok(Some(request))
    }

    /// Reads the next request head and leaves its body on the stream.
    ///
    /// The returned request has an empty body; follow up with
    /// [`read_body`](Self::read_body) or [`copy_body`](Self::copy_body) before
    /// reading the next request.
    pub fn read_request_head(&mut self) -> Result<Option<(Request, Framing)>, Error> {
        let head = match self.read_head()? {
            Some(head) => head,
            None => return Ok(None),
        };
        let (request_line, headers) = parse_head(&head)?;
        let mut parts = request_line.split(' ').filter(|p| !p.is_empty());
        let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v)) if v.starts_with("HTTP/") => {
                (m.to_string(), t.to_string(), v.to_string())
            }
            _ => {
                return Err(Error::Malformed(format!(
                    "invalid request line: {request_line}"
                )));
            }
        };
        let framing = Framing::of(&headers)?;
        Ok(Some((
            Request {
                method,
                target,
                version,
                headers,
                body: Vec::new(),
                trailers: Headers::new(),
            },
            framing,
        )))
    }

    /// Reads a body framed as `framing` into `request`.
    pub fn read_body(&mut self, framing: Framing, request: &mut Request) -> Result<(), Error> {
        match framing {
            Framing::Empty => {}
            Framing::Length(len) => {
                let len = usize::try_from(len)
                    .ok()
                    .filter(|len| *len <= MAX_BODY)
                    .ok_or(Error::BodyTooLarge)?;
                request.body = self.read_exact_body(len)?;
            }
            Framing::Chunked => request.body = self.read_chunked(&mut request.trailers)?,
        }
        Ok(())
    }

    /// Copies a body framed as `framing` to `out` without buffering it.
    ///
    /// A chunked body is re-emitted chunked, trailers included, so `out` sees
    /// the same framing the peer sent.
    pub fn copy_body<W: Write>(&mut self, framing: Framing, out: &mut W) -> Result<(), Error> {
        match framing {
            Framing::Empty => Ok(()),
            Framing::Length(len) => self.copy_exact(len, out),
            Framing::Chunked => self.copy_chunked(out),
        }
    }

    /// Reads a response status line and headers, leaving the body in the stream.
    pub fn read_response_head(&mut self) -> Result<ResponseHead, Error> {
        let head = self.read_head()?.ok_or(Error::UnexpectedEof)?;
        let (status_line, headers) = parse_head(&head)?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default().to_string();
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .filter(|_| version.starts_with("HTTP/"))
            .ok_or_else(|| Error::Malformed(format!("invalid status line: {status_line}")))?;
        let reason = parts.next().unwrap_or_default().to_string();
        Ok(ResponseHead {
            version,
            status,
            reason,
            headers,
        })
    }

    fn fill(&mut self) -> Result<usize, Error> {
        let mut chunk = [0u8; 4096];
        let read = self.inner.read(&mut chunk)?;
        self.buf.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    fn read_head(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let mut searched = 0;
        loop {
            if let Some(end) = find_head_end(&self.buf, searched) {
                let head: Vec<u8> = self.buf.drain(..end).collect();
                return Ok(Some(head));
            }
            searched = self.buf.len().saturating_sub(3);
            if self.buf.len() > MAX_HEAD {
                return Err(Error::HeadTooLarge);
            }
            if self.fill()? == 0 {
                return if self.buf.iter().all(|b| b.is_ascii_whitespace()) {
                    Ok(None)
                } else {
                    Err(Error::UnexpectedEof)
                };
            }
        }
    }

    fn read_exact_body(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        if len > MAX_BODY {
            return Err(Error::BodyTooLarge);
        }
        while self.buf.len() < len {
            if self.fill()? == 0 {
                return Err(Error::UnexpectedEof);
            }
        }
        Ok(self.buf.drain(..len).collect())
    }

    fn read_line(&mut self) -> Result<String, Error> {
        loop {
            if let Some(i) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=i).collect();
                return Ok(String::from_utf8_lossy(&line).trim_end().to_string());
            }
            if self.buf.len() > MAX_HEAD {
                return Err(Error::HeadTooLarge);
            }
            if self.fill()? == 0 {
                return Err(Error::UnexpectedEof);
            }
        }
    }

    fn copy_exact<W: Write>(&mut self, mut len: u64, out: &mut W) -> Result<(), Error> {
        while len > 0 {
            if self.buf.is_empty() && self.fill()? == 0 {
                return Err(Error::UnexpectedEof);
            }
            let n = usize::try_from(len).map_or(self.buf.len(), |len| len.min(self.buf.len()));
            out.write_all(&self.buf[..n])?;
            self.buf.drain(..n);
            len -= n as u64;
        }
        Ok(())
    }

    fn copy_chunked<W: Write>(&mut self, out: &mut W) -> Result<(), Error> {
        loop {
            let line = self.read_line()?;
            let size = chunk_size(&line)?;
            write!(out, "{size:x}\r\n")?;
            if size == 0 {
                break;
            }
            self.copy_exact(size as u64, out)?;
            if !self.read_line()?.is_empty() {
                return Err(Error::Malformed("chunk not followed by CRLF".to_string()));
            }
            out.write_all(b"\r\n")?;
        }
        loop {
            let line = self.read_line()?;
            if line.is_empty() {
                out.write_all(b"\r\n")?;
                return Ok(());
            }
            parse_header_line(&line)?;
            out.write_all(line.as_bytes())?;
            out.write_all(b"\r\n")?;
        }
    }

    fn read_chunked(&mut self, trailers: &mut Headers) -> Result<Vec<u8>, Error> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line()?;
            let size = chunk_size(&line)?;
            if size == 0 {
                break;
            }
            if body.len() + size > MAX_BODY {
                return Err(Error::BodyTooLarge);
            }
            body.extend(self.read_exact_body(size)?);
            if !self.read_line()?.is_empty() {
                return Err(Error::Malformed("chunk not followed by CRLF".to_string()));
            }
        }
        loop {
            let line = self.read_line()?;
            if line.is_empty() {
                return Ok(body);
            }
            let (name, value) = parse_header_line(&line)?;
            trailers.append(name, value);
        }
    }
}

fn chunk_size(line: &str) -> Result<usize, Error> {
    let size = line.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(size, 16)
        .map_err(|_| Error::Malformed(format!("invalid chunk size: {line}")))
}

/// Offset just past the blank line ending a message head, if present.
fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            if buf[i + 1..].starts_with(b"\r\n") {
                return Some(i + 3);
            }
            if buf[i + 1..].starts_with(b"\n") {
                return Some(i + 2);
            }
        }
        i += 1;
    }
    None
}

fn parse_head(head: &[u8]) -> Result<(String, Headers), Error> {
    let text = String::from_utf8_lossy(head);
    // tolerate stray blank lines before the start line
    let mut lines = text
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .skip_while(|l| l.is_empty());
    let start = lines
        .next()
        .ok_or_else(|| Error::Malformed("missing start line".to_string()))?
        .to_string();
    let mut headers = Headers::new();
    for line in lines.take_while(|l| !l.is_empty()) {
        let (name, value) = parse_header_line(line)?;
        headers.append(name, value);
    }
    Ok((start, headers))
}

fn parse_header_line(line: &str) -> Result<(String, String), Error> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| Error::Malformed(format!("invalid header line: {line}")))?;
    let name = name.trim();
    if name.is_empty() || name.contains(' ') {
        return Err(Error::Malformed(format!("invalid header name: {line}")));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Serializes a request head for sending upstream.
pub fn request_head(method: &str, target: &str, headers: &Headers) -> Vec<u8> {
    let mut out = format!("{method} {target} HTTP/1.1\r\n");
    headers.write_to(&mut out);
    out.push_str("\r\n");
    out.into_bytes()
}
