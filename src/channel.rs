//! The proxy's half of the bidirectional RPC link with the controlling script.
//!
//! Outbound frames are queued on an mpsc channel and written by a dedicated
//! background thread, so callers never block on a slow socket. Calls made *to* the
//! script are assigned ids from a monotonic counter and parked in a pending table
//! until the matching response arrives, the optional deadline passes, or the
//! channel closes. Closing fails every pending call at once.
//!
//! # Example
//!
//! ```no_run
//! # fn demo(channel: &autohook::channel::RpcChannel) -> Result<(), autohook::channel::CallError> {
//! let answer: Option<serde_json::Value> = channel.call("hook", &serde_json::json!({"url": "/"}))?;
//! # Ok(()) }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::jrpc;
use crate::websocket;

type Waiter = SyncSender<Result<serde_json::Value, CallError>>;

/// Why a call to the controlling script did not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("controlling script disconnected")]
    Disconnected,
    #[error("script returned an error: {0}")]
    Remote(jrpc::Error),
    #[error("script did not answer within {0:?}")]
    TimedOut(Duration),
    #[error("could not encode call: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("could not decode script answer: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Both directions of the JSON-RPC link over one control WebSocket.
#[derive(Debug)]
pub struct RpcChannel {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, Waiter>>,
    outgoing: Mutex<Option<Sender<String>>>,
    timeout: Option<Duration>,
}

impl RpcChannel {
    /// Creates a channel writing through `writer`, and starts its writer thread.
    ///
    /// `timeout` bounds how long [`call`](Self::call) waits; `None` waits until the
    /// channel closes.
    pub fn new(writer: websocket::Writer, timeout: Option<Duration>) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        std::thread::Builder::new()
            .name("autohook::RpcChannel".to_string())
            .spawn(move || write_loop(writer, receiver))?;
        Ok(RpcChannel {
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(Some(sender)),
            timeout,
        })
    }

    fn enqueue(&self, frame: String) -> Result<(), CallError> {
        let outgoing = self.outgoing.lock().unwrap_or_else(PoisonError::into_inner);
        match outgoing.as_ref() {
            Some(sender) => sender.send(frame).map_err(|_| CallError::Disconnected),
            None => Err(CallError::Disconnected),
        }
    }

    /// Sends a response to a request the script made.
    pub fn respond(&self, response: &jrpc::Response<serde_json::Value>) -> Result<(), CallError> {
        let frame = serde_json::to_string(response).map_err(CallError::Encode)?;
        self.enqueue(frame)
    }

    /// Calls `method` on the script and blocks for its answer.
    ///
    /// A JSON `null` result decodes into `R` as usual, so `Option<_>` results see it as `None`.
    pub fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<R, CallError> {
        let params = serde_json::to_value(params).map_err(CallError::Encode)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = jrpc::Request::new(method.to_string(), Some(params), id.into());
        let frame = serde_json::to_string(&request).map_err(CallError::Encode)?;

        let (waiter, answer) = mpsc::sync_channel(1);
        self.pending_table().insert(id, waiter);
        if let Err(e) = self.enqueue(frame) {
            self.pending_table().remove(&id);
            return Err(e);
        }

        let outcome = match self.timeout {
            Some(timeout) => match answer.recv_timeout(timeout) {
                Ok(outcome) => outcome,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    self.pending_table().remove(&id);
                    Err(CallError::TimedOut(timeout))
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(CallError::Disconnected),
            },
            None => answer.recv().unwrap_or(Err(CallError::Disconnected)),
        };
        serde_json::from_value(outcome?).map_err(CallError::Decode)
    }

    /// Routes a response from the script to the call waiting on it.
    ///
    /// Returns `false` if no call with that id is pending.
    pub fn resolve(&self, response: jrpc::Response<serde_json::Value>) -> bool {
        let id = match &response.id {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        };
        let Some(waiter) = id.and_then(|id| self.pending_table().remove(&id)) else {
            return false;
        };
        let outcome = match response.error {
            Some(e) => Err(CallError::Remote(e)),
            None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
        };
        let _ = waiter.send(outcome);
        true
    }

    /// Stops the writer thread and fails every pending call with [`CallError::Disconnected`].
    pub fn close(&self) {
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let drained: Vec<Waiter> = self.pending_table().drain().map(|(_, w)| w).collect();
        for waiter in drained {
            let _ = waiter.send(Err(CallError::Disconnected));
        }
    }

    /// Number of calls still waiting for an answer.
    pub fn pending_calls(&self) -> usize {
        self.pending_table().len()
    }

    fn pending_table(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Waiter>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_loop(writer: websocket::Writer, frames: Receiver<String>) {
    for frame in frames {
        if let Err(e) = writer.send_text(&frame) {
            logwise::warn_sync!(
                "control channel write failed: {e}",
                e = logwise::privacy::LogIt(&e)
            );
            // wake the reader so the session ends
            writer.shutdown();
            return;
        }
    }
}
