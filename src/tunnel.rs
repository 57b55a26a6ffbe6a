//! Pairing two WebSocket upgrades that carry the same tunnel token.
//!
//! The browser page opens a WebSocket whose `Sec-WebSocket-Protocol` starts with
//! [`TUNNEL_MARKER`] followed by a token; the script opens a second one with the same
//! token. The first arrival parks in the [`TunnelTable`] and the second completes
//! the pair, after which every message is relayed verbatim (text stays text,
//! binary stays binary) until either side goes away.
//!
//! The first peer keeps reading its own socket while it waits. Messages it sends
//! before its partner shows up are buffered, up to [`MAX_EARLY_BYTES`], and
//! delivered once the pair forms; past that limit the peer is closed. The
//! arrival that completes the pair hands its writer over through the waiting
//! peer's slot, so the waiting side starts relaying with its very next message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::websocket::{self, Message, WebSocket, Writer};

/// Prefix of a subprotocol entry that requests tunnel pairing.
pub const TUNNEL_MARKER: &str = "X-HOOK-WS-";

/// A parsed tunnel request from a `Sec-WebSocket-Protocol` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub token: String,
    /// The protocol to echo in the 101 response.
    pub protocol: String,
}

impl TunnelRequest {
    /// Recognizes `<marker><token>[, <real-subprotocol>...]`.
    ///
    /// The token runs to the first comma. The echoed protocol is the first real
    /// subprotocol if one was offered, otherwise the marker entry itself, since a
    /// browser fails the handshake if the server picks something it did not offer.
    ///
    /// ```
    /// use autohook::tunnel::TunnelRequest;
    ///
    /// let t = TunnelRequest::parse("X-HOOK-WS-abc123, graphql-ws").unwrap();
    /// assert_eq!(t.token, "abc123");
    /// assert_eq!(t.protocol, "graphql-ws");
    ///
    /// let t = TunnelRequest::parse("X-HOOK-WS-abc123").unwrap();
    /// assert_eq!(t.protocol, "X-HOOK-WS-abc123");
    ///
    /// assert!(TunnelRequest::parse("graphql-ws").is_none());
    /// assert!(TunnelRequest::parse("X-HOOK-WS-").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<TunnelRequest> {
        let mut entries = header.split(',').map(str::trim);
        let first = entries.next()?;
        let token = first.strip_prefix(TUNNEL_MARKER)?;
        if token.is_empty() {
            return None;
        }
        let protocol = entries
            .find(|e| !e.is_empty())
            .unwrap_or(first)
            .to_string();
        Some(TunnelRequest {
            token: token.to_string(),
            protocol,
        })
    }
}

/// Most bytes a waiting peer may send before its partner arrives.
pub const MAX_EARLY_BYTES: usize = 1024 * 1024;

/// Where a waiting peer's messages go.
enum Slot {
    /// No partner yet; messages are held here in arrival order.
    Waiting { early: Vec<Message>, bytes: usize },
    /// The partner's writer. Set once, by the peer that completed the pair.
    Paired(Writer),
    /// The waiting peer left, overflowed, or was dropped with its session.
    Gone,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_gone(slot: &Mutex<Slot>) -> bool {
    matches!(*lock(slot), Slot::Gone)
}

struct Waiting {
    ticket: u64,
    writer: Writer,
    slot: Arc<Mutex<Slot>>,
}

/// What [`TunnelTable::join`] found.
enum Join {
    /// Nobody was waiting under this token; we are now the waiting peer.
    Waiting(Pending),
    /// A peer was waiting; we have to complete the pair.
    Paired(Partner),
}

/// A parked peer's side of the rendezvous.
struct Pending {
    token: String,
    ticket: u64,
    slot: Arc<Mutex<Slot>>,
}

/// The waiting peer, as seen by the arrival that pairs with it.
struct Partner {
    writer: Writer,
    slot: Arc<Mutex<Slot>>,
}

impl Partner {
    /// Hands the waiting peer our writer, after delivering what it buffered.
    ///
    /// Returns `false` if the waiting peer is already gone.
    fn complete(&self, ours: &Writer) -> bool {
        let mut slot = lock(&self.slot);
        match std::mem::replace(&mut *slot, Slot::Paired(ours.clone())) {
            Slot::Waiting { early, .. } => {
                // still under the lock, so later messages queue behind these
                for message in &early {
                    if ours.send(message).is_err() {
                        break;
                    }
                }
                true
            }
            Slot::Paired(_) | Slot::Gone => {
                *slot = Slot::Gone;
                false
            }
        }
    }
}

/// Token to waiting-peer map for one control session.
#[derive(Default)]
pub struct TunnelTable {
    waiting: Mutex<HashMap<String, Waiting>>,
    next_ticket: AtomicU64,
}

impl std::fmt::Debug for TunnelTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelTable")
            .field("waiting", &self.waiting())
            .finish()
    }
}

impl TunnelTable {
    /// A table with nobody waiting.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer under `token`, or claims the peer already waiting there.
    ///
    /// After a pairing completes the token is free again, so a third arrival
    /// starts a new pair.
    fn join(&self, token: &str, writer: Writer) -> Join {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(first) = waiting.remove(token)
            && !is_gone(&first.slot)
        {
            return Join::Paired(Partner {
                writer: first.writer,
                slot: first.slot,
            });
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Mutex::new(Slot::Waiting {
            early: Vec::new(),
            bytes: 0,
        }));
        waiting.insert(
            token.to_string(),
            Waiting {
                ticket,
                writer,
                slot: slot.clone(),
            },
        );
        Join::Waiting(Pending {
            token: token.to_string(),
            ticket,
            slot,
        })
    }

    /// Removes our entry if it is still ours.
    fn abandon(&self, pending: &Pending) {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        if waiting
            .get(&pending.token)
            .is_some_and(|entry| entry.ticket == pending.ticket)
        {
            waiting.remove(&pending.token);
        }
    }

    /// Drops every waiting peer and closes their sockets.
    pub fn clear(&self) {
        let dropped: Vec<Waiting> = self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in dropped {
            *lock(&entry.slot) = Slot::Gone;
            entry.writer.close();
        }
    }

    /// Number of peers waiting for a partner.
    pub fn waiting(&self) -> usize {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Runs one tunnel peer to completion on the calling thread.
    pub fn serve(&self, token: &str, mut ws: WebSocket) {
        match self.join(token, ws.writer()) {
            Join::Paired(partner) => {
                if !partner.complete(&ws.writer()) {
                    logwise::info_sync!(
                        "tunnel {token} partner left before pairing",
                        token = logwise::privacy::LogIt(&token)
                    );
                    ws.writer().close();
                    return;
                }
                logwise::info_sync!("tunnel {token} paired", token = logwise::privacy::LogIt(&token));
                relay(&mut ws, &partner.writer);
            }
            Join::Waiting(pending) => {
                logwise::info_sync!(
                    "tunnel {token} waiting for partner",
                    token = logwise::privacy::LogIt(&token)
                );
                self.wait(pending, ws);
            }
        }
    }

    /// Reads the waiting peer's socket, buffering until a partner fills the slot
    /// and relaying after.
    fn wait(&self, pending: Pending, mut ws: WebSocket) {
        loop {
            let message = match ws.read_message() {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(message) => message,
            };
            let partner = {
                let mut slot = lock(&pending.slot);
                match &mut *slot {
                    Slot::Paired(partner) => partner.clone(),
                    Slot::Waiting { early, bytes } => {
                        *bytes += payload_len(&message);
                        if *bytes > MAX_EARLY_BYTES {
                            *slot = Slot::Gone;
                            drop(slot);
                            self.abandon(&pending);
                            logwise::warn_sync!(
                                "tunnel {token} buffered too much before pairing",
                                token = logwise::privacy::LogIt(&pending.token)
                            );
                            let _ = ws.writer().send_close(Some((1009, "tunnel buffer full")));
                            ws.writer().shutdown();
                            return;
                        }
                        early.push(message);
                        continue;
                    }
                    Slot::Gone => break,
                }
            };
            if partner.send(&message).is_err() {
                break;
            }
        }
        let state = std::mem::replace(&mut *lock(&pending.slot), Slot::Gone);
        match state {
            Slot::Paired(partner) => partner.close(),
            Slot::Waiting { .. } | Slot::Gone => {
                self.abandon(&pending);
                logwise::info_sync!(
                    "tunnel {token} dropped before pairing",
                    token = logwise::privacy::LogIt(&pending.token)
                );
            }
        }
        ws.writer().shutdown();
    }
}

fn payload_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        Message::Close(_) => 0,
    }
}

/// Copies messages from `ws` to `partner` until either side fails, then tears both down.
fn relay(ws: &mut WebSocket, partner: &Writer) {
    loop {
        match ws.read_message() {
            Ok(Message::Close(_)) => break,
            Ok(message) => {
                if partner.send(&message).is_err() {
                    break;
                }
            }
            Err(websocket::Error::Closed) => break,
            Err(e) => {
                logwise::info_sync!("tunnel read ended: {e}", e = logwise::privacy::LogIt(&e));
                break;
            }
        }
    }
    partner.close();
    ws.writer().shutdown();
}
