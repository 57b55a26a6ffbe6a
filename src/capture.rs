//! The values exchanged with the script when a hook fires.

use std::collections::BTreeMap;

use crate::http;

/// An intercepted request, as handed to the script.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CapturedRequest {
    pub url: String,
    pub method: String,
    /// Header values grouped under canonical names.
    pub headers: BTreeMap<String, Vec<String>>,
    /// The request body, lossily decoded as UTF-8.
    pub body: String,
}

impl CapturedRequest {
    /// Captures `request` as seen at `url`. Trailers are merged into the headers.
    pub fn new(request: &http::Request, url: &url::Url) -> Self {
        let mut headers = request.headers.clone();
        for (name, value) in request.trailers.iter() {
            headers.append(name, value);
        }
        CapturedRequest {
            url: url.to_string(),
            method: request.method.clone(),
            headers: headers.to_multimap(),
            body: String::from_utf8_lossy(&request.body).into_owned(),
        }
    }
}

/// The script's answer to a hook.
///
/// Header values may be given as a single string or a list of strings. A
/// `code` outside `200..=599` fails to decode, so the client gets a 500
/// instead of a malformed status line.
///
/// ```
/// use autohook::capture::CapturedResponse;
///
/// let r: CapturedResponse = serde_json::from_str(r#"{"headers":{"X-A":"1","X-B":["2","3"]},"body":"hi"}"#).unwrap();
/// assert_eq!(r.code, 200);
/// let response = r.into_response();
/// assert_eq!(response.headers.get_all("x-b").collect::<Vec<_>>(), vec!["2", "3"]);
/// assert_eq!(response.body, b"hi");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CapturedResponse {
    #[serde(default = "default_code", deserialize_with = "status_code")]
    pub code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, HeaderValues>,
    #[serde(default)]
    pub body: String,
}

fn default_code() -> u16 {
    200
}

fn status_code<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    let code = <u16 as serde::Deserialize>::deserialize(deserializer)?;
    if (200..=599).contains(&code) {
        Ok(code)
    } else {
        Err(serde::de::Error::custom(format!(
            "status code {code} is outside 200..=599"
        )))
    }
}

/// One header value or several.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    /// The values, in order.
    pub fn values(&self) -> &[String] {
        match self {
            HeaderValues::One(v) => std::slice::from_ref(v),
            HeaderValues::Many(v) => v,
        }
    }
}

impl CapturedResponse {
    /// Builds the HTTP response the client will see. Headers are copied as given;
    /// framing headers are recomputed when it is written.
    pub fn into_response(self) -> http::Response {
        let mut response = http::Response::new(self.code).with_body(self.body.into_bytes());
        for (name, values) in &self.headers {
            for value in values.values() {
                response.headers.append(name.as_str(), value.as_str());
            }
        }
        response
    }
}
