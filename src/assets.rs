//! The bootstrap page, the browser runtime and the user script.
//!
//! All three are held in memory and stamped with the time the table was built,
//! which is what `Last-Modified` reports and what `If-Modified-Since` is
//! compared against.

use chrono::{DateTime, Utc};

use crate::http;

const INDEX_HTML: &str = include_str!("../assets/index.html");
const AUTO_JS: &str = include_str!("../assets/auto.js");

const HTML: &str = "text/html; charset=utf-8";
const JAVASCRIPT: &str = "text/javascript; charset=utf-8";

/// `IMF-fixdate`, as used by HTTP date headers.
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Debug)]
struct Asset {
    path: &'static str,
    content_type: &'static str,
    body: Vec<u8>,
}

/// The fixed table of locally served files.
#[derive(Debug)]
pub struct Assets {
    files: [Asset; 3],
    modified: DateTime<Utc>,
}

impl Assets {
    /// Builds the table with `script` served at `/script.js`.
    pub fn new(script: String) -> Self {
        let now = Utc::now();
        // HTTP dates carry whole seconds only
        let modified = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);
        Assets {
            files: [
                Asset {
                    path: "/",
                    content_type: HTML,
                    body: INDEX_HTML.as_bytes().to_vec(),
                },
                Asset {
                    path: "/auto.js",
                    content_type: JAVASCRIPT,
                    body: AUTO_JS.as_bytes().to_vec(),
                },
                Asset {
                    path: "/script.js",
                    content_type: JAVASCRIPT,
                    body: script.into_bytes(),
                },
            ],
            modified,
        }
    }

    /// The value sent as `Last-Modified`.
    pub fn last_modified(&self) -> String {
        self.modified.format(HTTP_DATE).to_string()
    }

    /// Whether `path` names one of the served files.
    pub fn contains(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.path == path)
    }

    /// Answers `request` if its path is one of the served files.
    ///
    /// ```
    /// use autohook::assets::Assets;
    /// use autohook::http::{Headers, Request};
    ///
    /// let assets = Assets::new("console.log(1)".to_string());
    /// let request = Request {
    ///     method: "GET".into(),
    ///     target: "/script.js".into(),
    ///     version: "HTTP/1.1".into(),
    ///     headers: Headers::new(),
    ///     body: Vec::new(),
    ///     trailers: Headers::new(),
    /// };
    /// let response = assets.respond(&request).unwrap();
    /// assert_eq!(response.status, 200);
    /// assert_eq!(response.body, b"console.log(1)");
    /// ```
    pub fn respond(&self, request: &http::Request) -> Option<http::Response> {
        let asset = self.files.iter().find(|f| f.path == request.path())?;
        if !matches!(request.method.as_str(), "GET" | "HEAD") {
            return Some(http::Response::text(405, "method not allowed").with_header("Allow", "GET, HEAD"));
        }
        let last_modified = self.last_modified();
        if let Some(since) = request.headers.get("If-Modified-Since")
            && let Ok(since) = DateTime::parse_from_rfc2822(since.trim())
            && self.modified <= since
        {
            return Some(http::Response::new(304).with_header("Last-Modified", last_modified));
        }
        Some(
            http::Response::new(200)
                .with_header("Content-Type", asset.content_type)
                .with_header("Last-Modified", last_modified)
                .with_body(asset.body.clone()),
        )
    }
}
