//! Single-controller admission and the control connection lifecycle.
//!
//! At most one control connection is admitted at a time. Admission creates a fresh
//! [`Session`] (empty hook registry, empty tunnel table, new RPC channel); when the
//! connection ends, everything the session configured is torn down, including the
//! forward target, and the slot is free for the next script.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::capture::{CapturedRequest, CapturedResponse};
use crate::channel::{CallError, RpcChannel};
use crate::commands::{self, Context};
use crate::hooks::HookRegistry;
use crate::input::InputDevice;
use crate::jrpc::{self, Message};
use crate::target::ForwardTarget;
use crate::tunnel::TunnelTable;
use crate::websocket::{self, WebSocket};

/// State owned by the admitted control connection.
#[derive(Debug)]
pub struct Session {
    /// Keys the script asked to intercept.
    pub hooks: HookRegistry,
    /// Tunnel peers waiting for their partner.
    pub tunnels: TunnelTable,
    channel: RpcChannel,
}

impl Session {
    /// Asks the script to answer an intercepted request.
    ///
    /// `Ok(None)` means the script observed the request but left it to the forwarder.
    pub fn call_hook(
        &self,
        key: &str,
        request: &CapturedRequest,
    ) -> Result<Option<CapturedResponse>, CallError> {
        self.channel.call(key, request)
    }
}

/// Gatekeeper for the control connection, and owner of the state that
/// outlives any one session: the forward target and the input device.
///
/// Shared by every connection thread of a server.
#[derive(Debug)]
pub struct Controller {
    admitted: AtomicBool,
    current: RwLock<Option<Arc<Session>>>,
    target: ForwardTarget,
    input: Arc<dyn InputDevice>,
    hook_timeout: Option<Duration>,
}

/// Held for as long as a control connection is admitted; releases the slot on drop.
struct Admission<'a> {
    controller: &'a Controller,
    session: Arc<Session>,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.session.channel.close();
        self.session.tunnels.clear();
        self.session.hooks.clear();
        self.controller.target.clear();
        // anyone who sees the session gone must also see the slot free
        let mut current = self
            .controller
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *current = None;
        self.controller.admitted.store(false, Ordering::Release);
        drop(current);
        logwise::info_sync!("control session released");
    }
}

impl Controller {
    /// Creates a controller with no session admitted and no forward target.
    ///
    /// `hook_timeout` bounds every hook call of the sessions it admits.
    pub fn new(input: Arc<dyn InputDevice>, hook_timeout: Option<Duration>) -> Self {
        Controller {
            admitted: AtomicBool::new(false),
            current: RwLock::new(None),
            target: ForwardTarget::new(),
            input,
            hook_timeout,
        }
    }

    /// The admitted session, if any.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Where unintercepted requests go. Cleared when a session ends.
    pub fn target(&self) -> &ForwardTarget {
        &self.target
    }

    /// The device input commands drive.
    pub fn input(&self) -> &dyn InputDevice {
        self.input.as_ref()
    }

    fn admit(&self, writer: websocket::Writer) -> Option<std::io::Result<Admission<'_>>> {
        if self
            .admitted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let channel = match RpcChannel::new(writer, self.hook_timeout) {
            Ok(channel) => channel,
            Err(e) => {
                self.admitted.store(false, Ordering::Release);
                return Some(Err(e));
            }
        };
        let session = Arc::new(Session {
            hooks: HookRegistry::new(),
            tunnels: TunnelTable::new(),
            channel,
        });
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Some(Ok(Admission {
            controller: self,
            session,
        }))
    }

    /// Runs a control connection until it closes.
    ///
    /// If another connection is already admitted, this one receives a single
    /// error frame and is closed.
    pub fn serve_control(&self, mut ws: WebSocket) {
        let admission = match self.admit(ws.writer()) {
            None => {
                logwise::warn_sync!("refusing second control connection");
                let refusal: jrpc::Response<serde_json::Value> = jrpc::Response::err(
                    jrpc::Error::single_connection(),
                    jrpc::Error::SINGLE_CONNECTION_ID.into(),
                );
                if let Ok(frame) = serde_json::to_string(&refusal) {
                    let _ = ws.writer().send_text(&frame);
                }
                ws.writer().close();
                return;
            }
            Some(Err(e)) => {
                logwise::error_sync!(
                    "could not start control channel: {e}",
                    e = logwise::privacy::LogIt(&e)
                );
                ws.writer().close();
                return;
            }
            Some(Ok(admission)) => admission,
        };
        logwise::info_sync!("control session admitted");
        let session = admission.session.clone();
        loop {
            match ws.read_message() {
                Ok(websocket::Message::Text(text)) => self.on_frame(&session, text.as_bytes()),
                Ok(websocket::Message::Binary(data)) => self.on_frame(&session, &data),
                Ok(websocket::Message::Close(reason)) => {
                    logwise::info_sync!(
                        "controller closed the session: {reason}",
                        reason = logwise::privacy::LogIt(&reason)
                    );
                    break;
                }
                Err(websocket::Error::Closed) => {
                    logwise::info_sync!("controller disconnected");
                    break;
                }
                Err(e) => {
                    logwise::warn_sync!(
                        "control connection failed: {e}",
                        e = logwise::privacy::LogIt(&e)
                    );
                    break;
                }
            }
        }
        ws.writer().shutdown();
        drop(admission);
    }

    fn on_frame(&self, session: &Session, frame: &[u8]) {
        let response = match serde_json::from_slice::<Message>(frame) {
            Ok(Message::Response(response)) => {
                if !session.channel.resolve(response) {
                    logwise::warn_sync!("dropping response to a call nobody is waiting on");
                }
                return;
            }
            Ok(Message::Request(request)) => {
                let ctx = Context {
                    target: &self.target,
                    hooks: &session.hooks,
                    input: self.input.as_ref(),
                };
                match commands::dispatch(&ctx, &request.method, request.params) {
                    Ok(result) => jrpc::Response::new(result, request.id),
                    Err(e) => {
                        logwise::info_sync!(
                            "command {method} failed: {e}",
                            method = logwise::privacy::LogIt(&request.method),
                            e = logwise::privacy::LogIt(&e)
                        );
                        jrpc::Response::err(e.into_rpc(), request.id)
                    }
                }
            }
            Err(e) => jrpc::Response::err(jrpc::Error::parse_error(e.to_string()), serde_json::Value::Null),
        };
        if let Err(e) = session.channel.respond(&response) {
            logwise::warn_sync!("could not send response: {e}", e = logwise::privacy::LogIt(&e));
        }
    }
}
