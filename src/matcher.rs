//! Deciding whether a request is intercepted, and under which key.
//!
//! A request URL is reduced to four canonical forms, most specific first:
//!
//! 1. the full URL, `http://host/path?query`
//! 2. the request-target as sent on the wire, `/path?query`
//! 3. the decoded path, `?`, then the query re-encoded with keys sorted
//! 4. the decoded path alone
//!
//! The first form present in the [`HookRegistry`] is the hook key. Scripts can
//! therefore register at whatever granularity is convenient.
//!
//! A request may name a different logical URL in the [`HOOK_HEADER`] header; when
//! the [`HookHeaderPolicy`] trusts the peer, that URL replaces the dialled one for
//! both matching and forwarding.

use std::net::SocketAddr;
use std::str::FromStr;

use url::Url;

use crate::hooks::HookRegistry;
use crate::http;

/// Header naming an alternate URL for matching and forwarding.
pub const HOOK_HEADER: &str = "X-HOOK";

/// Which peers may use [`HOOK_HEADER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookHeaderPolicy {
    /// The header is never honored.
    Ignore,
    /// Only peers on a loopback address are trusted.
    #[default]
    Loopback,
    /// Any peer is trusted.
    Any,
}

impl HookHeaderPolicy {
    /// Whether the override header from `peer` is honoured.
    pub fn trusts(self, peer: &SocketAddr) -> bool {
        match self {
            HookHeaderPolicy::Ignore => false,
            HookHeaderPolicy::Loopback => peer.ip().is_loopback(),
            HookHeaderPolicy::Any => true,
        }
    }
}

impl FromStr for HookHeaderPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Ok(HookHeaderPolicy::Ignore),
            "loopback" => Ok(HookHeaderPolicy::Loopback),
            "any" => Ok(HookHeaderPolicy::Any),
            other => Err(format!("expected ignore, loopback or any, got {other}")),
        }
    }
}

/// The logical URL of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUrl {
    url: Url,
    request_uri: String,
}

impl RequestUrl {
    /// Resolves the URL a request is for.
    ///
    /// Origin-form targets are resolved against the `Host` header, or `fallback_host`
    /// if there is none. Returns `None` if nothing parses.
    pub fn from_request(
        request: &http::Request,
        peer: &SocketAddr,
        policy: HookHeaderPolicy,
        fallback_host: &str,
    ) -> Option<RequestUrl> {
        if policy.trusts(peer)
            && let Some(overridden) = request.headers.get(HOOK_HEADER)
        {
            match Url::parse(overridden.trim()) {
                Ok(url) => return Some(RequestUrl::from_url(url)),
                Err(e) => logwise::warn_sync!(
                    "ignoring unparseable hook override {value}: {e}",
                    value = logwise::privacy::LogIt(&overridden),
                    e = logwise::privacy::LogIt(&e)
                ),
            }
        }
        let url = if request.target.starts_with('/') {
            let host = request
                .headers
                .get("Host")
                .filter(|h| !h.trim().is_empty())
                .unwrap_or(fallback_host);
            Url::parse(&format!("http://{}{}", host.trim(), request.target)).ok()?
        } else {
            Url::parse(&request.target).ok()?
        };
        Some(RequestUrl {
            url,
            request_uri: request.origin_form().to_string(),
        })
    }

    pub fn from_url(url: Url) -> RequestUrl {
        let request_uri = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        RequestUrl { url, request_uri }
    }

    /// The resolved URL, after any override.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Path and query, as they go on the wire.
    pub fn request_uri(&self) -> &str {
        &self.request_uri
    }

    /// The four canonical forms, most specific first.
    ///
    /// ```
    /// use autohook::matcher::RequestUrl;
    ///
    /// let url = url::Url::parse("http://localhost:8080/a%20b?z=2&a=1").unwrap();
    /// let forms = RequestUrl::from_url(url).canonical_forms();
    /// assert_eq!(forms, [
    ///     "http://localhost:8080/a%20b?z=2&a=1".to_string(),
    ///     "/a%20b?z=2&a=1".to_string(),
    ///     "/a b?a=1&z=2".to_string(),
    ///     "/a b".to_string(),
    /// ]);
    /// ```
    pub fn canonical_forms(&self) -> [String; 4] {
        let mut full = self.url.clone();
        full.set_fragment(None);
        let path = percent_decode(self.url.path());
        let mut pairs: Vec<(String, String)> = self.url.query_pairs().into_owned().collect();
        // stable, so repeated keys keep their order
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        [
            full.to_string(),
            self.request_uri.clone(),
            format!("{path}?{query}"),
            path,
        ]
    }

    /// The first canonical form registered in `hooks`.
    pub fn find_hook(&self, hooks: &HookRegistry) -> Option<String> {
        let forms = self.canonical_forms();
        hooks.first_match(forms.iter().map(String::as_str))
    }
}

/// Decodes `%XX` escapes; invalid escapes are kept literally and invalid UTF-8 is replaced.
pub fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(h), Some(l)) = (hex(bytes[i + 1]), hex(bytes[i + 2]))
        {
            out.push(h << 4 | l);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}
