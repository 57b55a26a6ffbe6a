//! JSON-RPC envelope spoken on the control channel.
//!
//! The control channel is symmetric: the controlling script sends requests to the
//! proxy (commands such as `addHook` or `proxy`), and the proxy sends requests back
//! to the script (hook callbacks). Both directions use the same envelope, so a
//! single inbound frame is decoded into a [`Message`], which is either a
//! [`Request`] or a [`Response`].
//!
//! The envelope follows [JSON-RPC 2.0](https://www.jsonrpc.org/specification)
//! with one relaxation: the `jsonrpc` version member is emitted on everything we
//! send but is optional on everything we receive, since the browser runtime does
//! not always bother with it.
//!
//! # Error codes
//!
//! In addition to the standard codes, the proxy reports:
//!
//! * `-32001` - the `proxy` command was given a target that is not a usable URL
//! * `-32002` - an input command named a mouse button or key we don't know
//! * `-999` - used as the *id* of the single error frame sent to a control
//!   connection that was refused because another one is already admitted
//!
//! # Examples
//!
//! ```
//! use autohook::jrpc::{Message, Response, Error};
//! use serde_json::json;
//!
//! let inbound = r#"{"id": 7, "method": "addHook", "params": "/api/users"}"#;
//! match serde_json::from_str::<Message>(inbound).unwrap() {
//!     Message::Request(request) => {
//!         assert_eq!(request.method, "addHook");
//!         let response: Response<serde_json::Value> = Response::new(json!(null), request.id);
//!         let outbound = serde_json::to_string(&response).unwrap();
//!         assert!(outbound.contains("\"id\":7"));
//!     }
//!     Message::Response(_) => unreachable!(),
//! }
//!
//! let reply = r#"{"id": 3, "result": {"code": 201}}"#;
//! assert!(matches!(serde_json::from_str::<Message>(reply).unwrap(), Message::Response(_)));
//!
//! let refused: Response<serde_json::Value> = Response::err(Error::single_connection(), json!(Error::SINGLE_CONNECTION_ID));
//! assert_eq!(refused.error.unwrap().message, "only a single connection is allowed");
//! ```

use std::fmt::{Display, Formatter};

const VERSION: &str = "2.0";

fn version() -> String {
    VERSION.to_string()
}

/// A method call, in either direction.
///
/// `id` is echoed back verbatim in the matching [`Response`]. Requests that omit
/// it are answered with a `null` id.
///
/// ```
/// use autohook::jrpc::Request;
/// use serde_json::json;
///
/// let request = Request::new("getScreenSize".to_string(), None, json!(1));
/// let wire = serde_json::to_string(&request).unwrap();
/// assert!(wire.contains("\"jsonrpc\":\"2.0\""));
///
/// let relaxed: Request = serde_json::from_str(r#"{"method":"keyPress","params":"a","id":"k"}"#).unwrap();
/// assert_eq!(relaxed.id, json!("k"));
/// assert_eq!(relaxed.params, Some(json!("a")));
/// ```
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct Request {
    /// The JSON-RPC protocol version
    #[serde(default = "version")]
    pub jsonrpc: String,
    /// The name of the method to invoke
    pub method: String,
    /// Optional parameters for the method call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// Identifier echoed in the response
    #[serde(default)]
    pub id: serde_json::Value,
}

impl Request {
    pub fn new(method: String, params: Option<serde_json::Value>, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: version(),
            method,
            params,
            id,
        }
    }
}

/// The result of a method call.
///
/// Exactly one of `result` and `error` is meaningful. A `result` of JSON `null`
/// decodes as `None`, which is how a hook callback declines to answer.
///
/// ```
/// use autohook::jrpc::{Response, Error};
/// use serde_json::json;
///
/// let ok = Response::new(json!({"width": 1920, "height": 1080}), json!(4));
/// assert!(serde_json::to_string(&ok).unwrap().contains("\"result\""));
///
/// let failed: Response<serde_json::Value> = Response::err(Error::method_not_found(), json!(5));
/// let wire = serde_json::to_string(&failed).unwrap();
/// assert!(!wire.contains("\"result\""));
/// assert!(wire.contains("-32601"));
/// ```
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct Response<R> {
    /// The JSON-RPC protocol version
    #[serde(default = "version")]
    pub jsonrpc: String,
    /// The result of the method call (mutually exclusive with error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<R>,
    /// Error information if the method call failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    /// The identifier of the request being answered
    pub id: serde_json::Value,
}

impl<R> Response<R> {
    pub fn new(result: R, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: version(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn err(e: Error, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: version(),
            result: None,
            error: Some(e),
            id,
        }
    }
}

/// Any single frame received on the control channel.
///
/// Anything carrying a `method` member is a [`Request`]; everything else must be
/// a [`Response`] to one of our own calls.
#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response<serde_json::Value>),
}

/// A JSON-RPC error object.
///
/// ```
/// use autohook::jrpc::Error;
///
/// let error = Error::unknown_button("thumb");
/// assert_eq!(error.code, -32002);
/// assert_eq!(error.to_string(), "Error -32002: unknown mouse button: thumb");
/// ```
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Error {
    /// Error code
    pub code: i32,
    /// Human-readable error message
    pub message: String,
    /// Optional additional information about the error
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Error codes defined by JSON-RPC 2.0.
    pub const PARSE_ERROR: i32 = -32700;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The `proxy` command got a URL it cannot forward to.
    pub const INVALID_TARGET: i32 = -32001;
    /// An input command named a button or key that does not exist.
    pub const UNKNOWN_INPUT: i32 = -32002;

    /// The id carried by the refusal frame sent to a second control connection.
    pub const SINGLE_CONNECTION_ID: i64 = -999;

    pub fn new(code: i32, message: String, data: Option<serde_json::Value>) -> Self {
        Self {
            code,
            message,
            data,
        }
    }

    /// A frame that is not valid JSON-RPC.
    pub fn parse_error(detail: String) -> Self {
        Self::new(Self::PARSE_ERROR, "Parse error".to_string(), Some(detail.into()))
    }

    pub fn method_not_found() -> Self {
        Self::new(Self::METHOD_NOT_FOUND, "Method not found".to_string(), None)
    }

    /// ```
    /// use autohook::jrpc::Error;
    ///
    /// let error = Error::method_not_found_named("launchRockets");
    /// assert_eq!(error.code, -32601);
    /// assert_eq!(error.data, Some(serde_json::json!("launchRockets")));
    /// ```
    pub fn method_not_found_named(method: &str) -> Self {
        Self::new(
            Self::METHOD_NOT_FOUND,
            "Method not found".to_string(),
            Some(method.into()),
        )
    }

    /// Parameters that do not fit the method.
    pub fn invalid_params(detail: String) -> Self {
        Self::new(Self::INVALID_PARAMS, "Invalid params".to_string(), Some(detail.into()))
    }

    pub fn invalid_target(detail: String) -> Self {
        Self::new(
            Self::INVALID_TARGET,
            format!("invalid forward target: {detail}"),
            None,
        )
    }

    /// A mouse button name that is not recognized.
    pub fn unknown_button(name: &str) -> Self {
        Self::new(Self::UNKNOWN_INPUT, format!("unknown mouse button: {name}"), None)
    }

    /// A key name that is not recognized.
    pub fn unknown_key(name: &str) -> Self {
        Self::new(Self::UNKNOWN_INPUT, format!("unknown key: {name}"), None)
    }

    /// The error sent to a control connection refused because one is already admitted.
    pub fn single_connection() -> Self {
        Self::new(
            Self::INTERNAL_ERROR,
            "only a single connection is allowed".to_string(),
            None,
        )
    }

    pub fn from_error<E: std::error::Error>(error: E) -> Self {
        Self::new(Self::INTERNAL_ERROR, error.to_string(), None)
    }

    pub fn internal_error(message: String) -> Self {
        Self::new(Self::INTERNAL_ERROR, message, None)
    }
}
