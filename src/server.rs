//! The listener and per-connection routing.
//!
//! Every accepted connection gets its own thread. Requests on a connection are
//! routed in this order:
//!
//! 1. [`CONTROL_PATH`]: a WebSocket upgrade becomes a control connection.
//! 2. A WebSocket upgrade carrying a tunnel marker, while a controller is
//!    admitted, joins the session's tunnel table.
//! 3. A request matching a registered hook is offered to the script.
//! 4. With a forward target configured, the request is forwarded.
//! 5. Otherwise the bootstrap files are served, and anything else is a 404.
//!
//! Only the request head is read up front. A hooked request's body is read into
//! memory for the script; a forwarded one streams straight through.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crate::assets::Assets;
use crate::capture::CapturedRequest;
use crate::config::Config;
use crate::forward;
use crate::http;
use crate::input::InputDevice;
use crate::matcher::{HookHeaderPolicy, RequestUrl};
use crate::script::{self, ScriptSource};
use crate::session::Controller;
use crate::tunnel::TunnelRequest;
use crate::websocket::WebSocket;

/// Path of the control WebSocket.
pub const CONTROL_PATH: &str = "/socket";

/// Why a server could not start.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Script(#[from] script::Error),
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to do with a connection after answering a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

#[derive(Debug)]
struct Shared {
    controller: Controller,
    assets: Assets,
    hook_header: HookHeaderPolicy,
    local_addr: SocketAddr,
    stopping: AtomicBool,
}

/// A bound, not yet running server.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    /// Binds the listener and loads the script.
    pub fn bind(
        config: &Config,
        script: &dyn ScriptSource,
        input: Arc<dyn InputDevice>,
    ) -> Result<Server, Error> {
        let script = script.load()?;
        let addr = SocketAddr::new(config.bind, config.port);
        let listener = TcpListener::bind(addr).map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        logwise::info_sync!("listening on {addr}", addr = logwise::privacy::LogIt(&local_addr));
        Ok(Server {
            listener,
            shared: Arc::new(Shared {
                controller: Controller::new(input, config.hook_timeout),
                assets: Assets::new(script),
                hook_header: config.hook_header,
                local_addr,
                stopping: AtomicBool::new(false),
            }),
        })
    }

    /// The address actually bound, with the ephemeral port resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// The address a browser should open.
    pub fn url(&self) -> String {
        format!("http://{}/", self.shared.local_addr)
    }

    /// The control-session state shared with every connection.
    pub fn controller(&self) -> &Controller {
        &self.shared.controller
    }

    /// Accepts connections on the calling thread until shut down.
    pub fn run(self) {
        accept_loop(&self.listener, &self.shared);
    }

    /// Accepts connections on a background thread.
    pub fn spawn(self) -> Result<ServerHandle, Error> {
        let shared = self.shared.clone();
        let listener = self.listener;
        let thread = std::thread::Builder::new()
            .name("autohook::Server".to_string())
            .spawn(move || accept_loop(&listener, &shared))?;
        Ok(ServerHandle {
            shared: self.shared,
            thread: Some(thread),
        })
    }
}

/// A running server. Dropping it shuts the listener down.
#[derive(Debug)]
pub struct ServerHandle {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// See [`Server::local_addr`].
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// See [`Server::url`].
    pub fn url(&self) -> String {
        format!("http://{}/", self.shared.local_addr)
    }

    /// See [`Server::controller`].
    pub fn controller(&self) -> &Controller {
        &self.shared.controller
    }

    /// Stops accepting connections. Connections already open run to completion.
    pub fn shutdown(&mut self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        // wake the blocked accept
        let _ = TcpStream::connect(self.shared.local_addr);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        logwise::info_sync!("listener closed");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: &TcpListener, shared: &Arc<Shared>) {
    for stream in listener.incoming() {
        if shared.stopping.load(Ordering::Acquire) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                logwise::warn_sync!("accept failed: {e}", e = logwise::privacy::LogIt(&e));
                continue;
            }
        };
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(_) => continue,
        };
        logwise::info_sync!("accepted connection from {peer}", peer = logwise::privacy::LogIt(&peer));
        let shared = shared.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("autohook::connection-{peer}"))
            .spawn(move || shared.serve_connection(stream, peer));
        if let Err(e) = spawned {
            logwise::error_sync!(
                "could not start connection thread: {e}",
                e = logwise::privacy::LogIt(&e)
            );
        }
    }
}

impl Shared {
    fn serve_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        let mut reader = match stream.try_clone() {
            Ok(read_half) => http::Reader::new(read_half),
            Err(_) => return,
        };
        loop {
            let (request, framing) = match reader.read_request_head() {
                Ok(Some(head)) => head,
                Ok(None) | Err(http::Error::Io(_)) | Err(http::Error::UnexpectedEof) => return,
                Err(e) => {
                    let _ = http::Response::text(400, e.to_string()).write_to(&mut stream, false, false);
                    return;
                }
            };
            if self.route(&mut stream, &mut reader, request, framing, peer) == Flow::Close {
                return;
            }
        }
    }

    fn route(
        &self,
        stream: &mut TcpStream,
        reader: &mut http::Reader<TcpStream>,
        mut request: http::Request,
        framing: http::Framing,
        peer: SocketAddr,
    ) -> Flow {
        let head_only = request.method == "HEAD";
        let keep_alive = request.keep_alive();

        if request.path() == CONTROL_PATH {
            if !request.is_websocket_upgrade() {
                return reply(stream, http::Response::text(400, "expected a WebSocket upgrade"), head_only, keep_alive);
            }
            let leftover = reader.take_buffered();
            if let Some(ws) = upgrade(stream, &request, &leftover, None) {
                self.controller.serve_control(ws);
            }
            return Flow::Close;
        }

        let session = self.controller.session();

        if let Some(session) = &session
            && request.is_websocket_upgrade()
            && let Some(tunnel) = tunnel_request(&request)
        {
            let leftover = reader.take_buffered();
            if let Some(ws) = upgrade(stream, &request, &leftover, Some(&tunnel.protocol)) {
                session.tunnels.serve(&tunnel.token, ws);
            }
            return Flow::Close;
        }

        let fallback_host = self.local_addr.to_string();
        let Some(url) = RequestUrl::from_request(&request, &peer, self.hook_header, &fallback_host) else {
            return reply(stream, http::Response::text(400, "unresolvable request target"), head_only, false);
        };

        let mut body = forward::Body::Unread(framing);
        if let Some(session) = &session
            && let Some(key) = url.find_hook(&session.hooks)
        {
            if let Err(e) = reader.read_body(framing, &mut request) {
                let status = if matches!(e, http::Error::BodyTooLarge) { 413 } else { 400 };
                return reply(stream, http::Response::text(status, e.to_string()), head_only, false);
            }
            body = forward::Body::Read;
            let captured = CapturedRequest::new(&request, url.url());
            match session.call_hook(&key, &captured) {
                Ok(Some(response)) => {
                    logwise::info_sync!(
                        "hook {key} answered with {status}",
                        key = logwise::privacy::LogIt(&key),
                        status = logwise::privacy::LogIt(&response.code)
                    );
                    return reply(stream, response.into_response(), head_only, keep_alive);
                }
                Ok(None) => {}
                Err(e) => {
                    logwise::warn_sync!(
                        "hook {key} failed: {e}",
                        key = logwise::privacy::LogIt(&key),
                        e = logwise::privacy::LogIt(&e)
                    );
                    return reply(stream, http::Response::text(500, e.to_string()), head_only, keep_alive);
                }
            }
        }

        if let Some(target) = self.controller.target().load() {
            return match forward::forward(stream, reader, &request, body, url.request_uri(), peer, &target) {
                Ok(()) => Flow::Close,
                Err(e) => {
                    logwise::warn_sync!(
                        "forwarding to {target} failed: {e}",
                        target = logwise::privacy::LogIt(&target),
                        e = logwise::privacy::LogIt(&e)
                    );
                    // the request body may be half consumed
                    reply(stream, http::Response::text(502, e.to_string()), head_only, false)
                }
            };
        }

        // nothing local reads a body; drop it so the next request lines up
        let keep_alive = keep_alive
            && match body {
                forward::Body::Read => true,
                forward::Body::Unread(framing) => reader.copy_body(framing, &mut std::io::sink()).is_ok(),
            };
        match self.assets.respond(&request) {
            Some(response) => reply(stream, response, head_only, keep_alive),
            None => reply(stream, http::Response::text(404, "no forward target configured"), head_only, keep_alive),
        }
    }
}

fn reply(stream: &mut TcpStream, response: http::Response, head_only: bool, keep_alive: bool) -> Flow {
    match response.write_to(stream, head_only, keep_alive) {
        Ok(()) if keep_alive => Flow::Continue,
        _ => Flow::Close,
    }
}

/// Completes a WebSocket handshake on a second handle to `stream`.
fn upgrade(
    stream: &TcpStream,
    request: &http::Request,
    leftover: &[u8],
    protocol: Option<&str>,
) -> Option<WebSocket> {
    let handle = match stream.try_clone() {
        Ok(handle) => handle,
        Err(e) => {
            logwise::warn_sync!("could not clone stream: {e}", e = logwise::privacy::LogIt(&e));
            return None;
        }
    };
    match WebSocket::accept(handle, request, leftover, protocol) {
        Ok(ws) => Some(ws),
        Err(e) => {
            logwise::warn_sync!("WebSocket handshake failed: {e}", e = logwise::privacy::LogIt(&e));
            None
        }
    }
}

fn tunnel_request(request: &http::Request) -> Option<TunnelRequest> {
    let offered = request
        .headers
        .get_all("Sec-WebSocket-Protocol")
        .collect::<Vec<_>>()
        .join(", ");
    TunnelRequest::parse(&offered)
}
