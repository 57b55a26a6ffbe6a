//! RFC 6455 WebSocket server side, over a blocking [`TcpStream`].
//!
//! A [`WebSocket`] owns the read half and hands out cloneable [`Writer`]s for the
//! write half, so one thread can block on reads while any number of others send
//! frames. Every frame is written under a lock, which keeps frames from
//! interleaving on the wire.
//!
//! Ping frames are answered automatically, fragmented messages are reassembled and
//! a close frame is echoed before it is surfaced as [`Message::Close`].

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::http;

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
/// Largest reassembled message we accept.
const MAX_MESSAGE: usize = 64 * 1024 * 1024;

/// Why a WebSocket operation failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("message exceeds {MAX_MESSAGE} bytes")]
    TooLarge,
    #[error("bad handshake: {0}")]
    Handshake(String),
}

/// Computes the `Sec-WebSocket-Accept` value for a client key.
///
/// ```
/// // the example from RFC 6455 section 1.3
/// assert_eq!(
///     autohook::websocket::accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_key(key: &str) -> String {
    //https://datatracker.ietf.org/doc/html/rfc6455#section-1.3
    use base64::Engine;
    use sha1::Digest;
    let mut hasher = sha1::Sha1::default();
    hasher.update(key.trim().as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    base64::prelude::BASE64_STANDARD.encode(hasher.finalize())
}

/// Frame opcodes from RFC 6455.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            _ => return None,
        })
    }

    fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// A single frame, unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Frame {
            fin: true,
            opcode,
            payload,
        }
    }

    /// Encodes the frame. Frames sent by a client must carry a `mask`; frames
    /// sent by a server must not.
    pub fn to_bytes(&self, mask: Option<[u8; 4]>) -> Vec<u8> {
        //https://datatracker.ietf.org/doc/html/rfc6455#section-5.2
        let mut frame = Vec::with_capacity(self.payload.len() + 14);
        let fin = if self.fin { 0b1000_0000 } else { 0 };
        frame.push(fin | self.opcode.bits());
        let mask_bit = if mask.is_some() { 0b1000_0000 } else { 0 };
        let len = self.payload.len();
        if len <= 125 {
            frame.push(len as u8 | mask_bit);
        } else if len <= 65535 {
            frame.push(126 | mask_bit);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            frame.push(127 | mask_bit);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
        match mask {
            Some(key) => {
                frame.extend_from_slice(&key);
                frame.extend(self.payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
            }
            None => frame.extend_from_slice(&self.payload),
        }
        frame
    }
}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct FrameParser {
    unparsed: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the socket.
    pub fn push(&mut self, data: &[u8]) {
        self.unparsed.extend_from_slice(data);
    }

    /// Pops the next complete frame, or `None` if more bytes are needed.
    pub fn pop(&mut self) -> Result<Option<Frame>, Error> {
        let buf = &self.unparsed;
        if buf.len() < 2 {
            return Ok(None);
        }
        let fin = buf[0] & 0b1000_0000 != 0;
        if buf[0] & 0b0111_0000 != 0 {
            return Err(Error::Protocol("reserved bits set".to_string()));
        }
        let opcode = Opcode::from_bits(buf[0] & 0b0000_1111)
            .ok_or_else(|| Error::Protocol(format!("unknown opcode {:#x}", buf[0] & 0x0f)))?;
        let masked = buf[1] & 0b1000_0000 != 0;
        let short_len = buf[1] & 0b0111_1111;
        let (len, mask_begin) = match short_len {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(len), 10)
            }
            n => (n as u64, 2),
        };
        if len > MAX_MESSAGE as u64 {
            return Err(Error::TooLarge);
        }
        let len = len as usize;
        if opcode.is_control() && (len > 125 || !fin) {
            return Err(Error::Protocol("invalid control frame".to_string()));
        }
        let data_begin = mask_begin + if masked { 4 } else { 0 };
        if buf.len() < data_begin + len {
            return Ok(None);
        }
        let mut payload = buf[data_begin..data_begin + len].to_vec();
        if masked {
            let key = &buf[mask_begin..mask_begin + 4];
            for (i, b) in payload.iter_mut().enumerate() {
                *b ^= key[i % 4];
            }
        }
        self.unparsed.drain(..data_begin + len);
        Ok(Some(Frame { fin, opcode, payload }))
    }
}

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    /// The peer closed the connection, with an optional status code and reason.
    Close(Option<(u16, String)>),
}

/// The write half of a WebSocket. Cloning yields another handle to the same socket.
#[derive(Debug, Clone)]
pub struct Writer {
    stream: Arc<Mutex<TcpStream>>,
    mask: bool,
}

impl Writer {
    fn new(stream: TcpStream, mask: bool) -> Self {
        Writer {
            stream: Arc::new(Mutex::new(stream)),
            mask,
        }
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<(), Error> {
        let mask = self.mask.then(next_mask);
        let bytes = frame.to_bytes(mask);
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.write_all(&bytes)?;
        stream.flush()?;
        Ok(())
    }

    /// Sends a single text frame.
    pub fn send_text(&self, text: &str) -> Result<(), Error> {
        self.send_frame(&Frame::new(Opcode::Text, text.as_bytes().to_vec()))
    }

    /// Sends a single binary frame.
    pub fn send_binary(&self, data: &[u8]) -> Result<(), Error> {
        self.send_frame(&Frame::new(Opcode::Binary, data.to_vec()))
    }

    /// Sends `message` with the frame kind it came in as.
    pub fn send(&self, message: &Message) -> Result<(), Error> {
        match message {
            Message::Text(text) => self.send_text(text),
            Message::Binary(data) => self.send_binary(data),
            Message::Close(reason) => self.send_close(reason.as_ref().map(|(c, r)| (*c, r.as_str()))),
        }
    }

    /// Sends a close frame. The socket stays open.
    pub fn send_close(&self, reason: Option<(u16, &str)>) -> Result<(), Error> {
        let payload = match reason {
            Some((code, text)) => {
                let mut p = code.to_be_bytes().to_vec();
                p.extend_from_slice(text.as_bytes());
                p.truncate(125);
                p
            }
            None => Vec::new(),
        };
        self.send_frame(&Frame::new(Opcode::Close, payload))
    }

    /// Shuts the socket down in both directions, waking any blocked reader.
    pub fn shutdown(&self) {
        let stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = stream.shutdown(Shutdown::Both);
    }

    /// Sends a close frame (ignoring failures) and shuts the socket down.
    pub fn close(&self) {
        let _ = self.send_close(None);
        self.shutdown();
    }
}

// Masking only has to defeat naive intermediaries, not attackers.
fn next_mask() -> [u8; 4] {
    use std::hash::{BuildHasher, Hasher};
    let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default(),
    );
    (hasher.finish() as u32).to_be_bytes()
}

/// An established WebSocket connection.
#[derive(Debug)]
pub struct WebSocket {
    stream: TcpStream,
    parser: FrameParser,
    writer: Writer,
    partial: Option<(Opcode, Vec<u8>)>,
    close_sent: bool,
}

impl WebSocket {
    fn from_stream(stream: TcpStream, leftover: &[u8], mask: bool) -> Result<Self, Error> {
        let writer = Writer::new(stream.try_clone()?, mask);
        let mut parser = FrameParser::new();
        parser.push(leftover);
        Ok(WebSocket {
            stream,
            parser,
            writer,
            partial: None,
            close_sent: false,
        })
    }

    /// Completes the server side of the opening handshake for `request`.
    ///
    /// `leftover` holds bytes the HTTP reader consumed past the request. If
    /// `protocol` is set it is echoed as the negotiated subprotocol.
    pub fn accept(
        mut stream: TcpStream,
        request: &http::Request,
        leftover: &[u8],
        protocol: Option<&str>,
    ) -> Result<Self, Error> {
        let key = match request.headers.get("Sec-WebSocket-Key") {
            Some(key) if !key.trim().is_empty() => key,
            _ => {
                let _ = http::Response::text(400, "missing Sec-WebSocket-Key")
                    .write_to(&mut stream, false, false);
                return Err(Error::Handshake("missing Sec-WebSocket-Key".to_string()));
            }
        };
        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n",
            accept_key(key)
        );
        if let Some(protocol) = protocol {
            response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
        }
        response.push_str("\r\n");
        stream.write_all(response.as_bytes())?;
        stream.flush()?;
        Self::from_stream(stream, leftover, false)
    }

    /// Performs the client side of the opening handshake against `host` at `path`.
    pub fn connect(
        mut stream: TcpStream,
        host: &str,
        path: &str,
        protocols: &[&str],
    ) -> Result<(Self, http::ResponseHead), Error> {
        use base64::Engine;
        let key = base64::prelude::BASE64_STANDARD.encode(next_mask().repeat(4));
        let mut request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n"
        );
        if !protocols.is_empty() {
            request.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocols.join(", ")));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes())?;
        let mut reader = http::Reader::new(stream.try_clone()?);
        let head = reader.read_response_head().map_err(|e| Error::Handshake(e.to_string()))?;
        if head.status != 101 {
            return Err(Error::Handshake(format!("status {}", head.status)));
        }
        if head.headers.get("Sec-WebSocket-Accept") != Some(accept_key(&key).as_str()) {
            return Err(Error::Handshake("bad Sec-WebSocket-Accept".to_string()));
        }
        let leftover = reader.take_buffered();
        Ok((Self::from_stream(stream, &leftover, true)?, head))
    }

    /// A handle for sending on this connection from any thread.
    pub fn writer(&self) -> Writer {
        self.writer.clone()
    }

    /// Blocks until a complete message arrives.
    pub fn read_message(&mut self) -> Result<Message, Error> {
        self.stream.set_read_timeout(None)?;
        loop {
            if let Some(message) = self.poll()? {
                return Ok(message);
            }
        }
    }

    /// Waits up to `timeout` for a complete message. A timeout returns `Ok(None)`
    /// and keeps any partially received frame for the next call.
    pub fn read_message_timeout(&mut self, timeout: Duration) -> Result<Option<Message>, Error> {
        self.stream.set_read_timeout(Some(timeout))?;
        let result = self.poll();
        self.stream.set_read_timeout(None)?;
        result
    }

    /// Processes buffered frames, reading from the socket at most once.
    fn poll(&mut self) -> Result<Option<Message>, Error> {
        if let Some(message) = self.drain_frames()? {
            return Ok(Some(message));
        }
        let mut chunk = [0u8; 4096];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(Error::Closed),
            Ok(n) => {
                self.parser.push(&chunk[..n]);
                self.drain_frames()
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn drain_frames(&mut self) -> Result<Option<Message>, Error> {
        while let Some(frame) = self.parser.pop()? {
            match frame.opcode {
                Opcode::Ping => self.writer.send_frame(&Frame::new(Opcode::Pong, frame.payload))?,
                Opcode::Pong => {}
                Opcode::Close => {
                    let reason = (frame.payload.len() >= 2).then(|| {
                        (
                            u16::from_be_bytes([frame.payload[0], frame.payload[1]]),
                            String::from_utf8_lossy(&frame.payload[2..]).into_owned(),
                        )
                    });
                    if !self.close_sent {
                        self.close_sent = true;
                        let _ = self.writer.send_close(reason.as_ref().map(|(c, _)| (*c, "")));
                    }
                    return Ok(Some(Message::Close(reason)));
                }
                Opcode::Text | Opcode::Binary => {
                    if self.partial.is_some() {
                        return Err(Error::Protocol("new message inside a fragmented one".to_string()));
                    }
                    if frame.fin {
                        return finish(frame.opcode, frame.payload).map(Some);
                    }
                    self.partial = Some((frame.opcode, frame.payload));
                }
                Opcode::Continuation => {
                    let Some((opcode, mut data)) = self.partial.take() else {
                        return Err(Error::Protocol("continuation without a message".to_string()));
                    };
                    if data.len() + frame.payload.len() > MAX_MESSAGE {
                        return Err(Error::TooLarge);
                    }
                    data.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return finish(opcode, data).map(Some);
                    }
                    self.partial = Some((opcode, data));
                }
            }
        }
        Ok(None)
    }
}

fn finish(opcode: Opcode, data: Vec<u8>) -> Result<Message, Error> {
    match opcode {
        Opcode::Text => String::from_utf8(data)
            .map(Message::Text)
            .map_err(|_| Error::Protocol("text message is not UTF-8".to_string())),
        _ => Ok(Message::Binary(data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_handles_masked_and_split_input() {
        let bytes = Frame::new(Opcode::Text, b"hello world".to_vec()).to_bytes(Some([1, 2, 3, 4]));
        let mut parser = FrameParser::new();
        parser.push(&bytes[..3]);
        assert_eq!(parser.pop().unwrap(), None);
        parser.push(&bytes[3..]);
        let frame = parser.pop().unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"hello world");
        assert_eq!(parser.pop().unwrap(), None);
    }

    #[test]
    fn extended_lengths() {
        for len in [125usize, 126, 65535, 65536] {
            let bytes = Frame::new(Opcode::Binary, vec![7; len]).to_bytes(None);
            let mut parser = FrameParser::new();
            parser.push(&bytes);
            assert_eq!(parser.pop().unwrap().unwrap().payload.len(), len);
        }
    }

    #[test]
    fn rejects_unknown_opcode_and_long_control_frames() {
        let mut parser = FrameParser::new();
        parser.push(&[0x83, 0x00]);
        assert!(matches!(parser.pop(), Err(Error::Protocol(_))));

        let mut parser = FrameParser::new();
        parser.push(&Frame::new(Opcode::Ping, vec![0; 126]).to_bytes(None));
        assert!(matches!(parser.pop(), Err(Error::Protocol(_))));
    }

    #[test]
    fn socket_reassembles_fragments_and_answers_pings() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let stream = TcpStream::connect(addr).unwrap();
            let (mut ws, _) = WebSocket::connect(stream, "localhost", "/", &[]).unwrap();
            let w = ws.writer();
            w.send_frame(&Frame { fin: false, opcode: Opcode::Text, payload: b"hel".to_vec() }).unwrap();
            w.send_frame(&Frame::new(Opcode::Ping, b"p".to_vec())).unwrap();
            w.send_frame(&Frame { fin: true, opcode: Opcode::Continuation, payload: b"lo".to_vec() }).unwrap();
            // the pong is swallowed by our own reader; the echo comes after it
            let echoed = ws.read_message().unwrap();
            w.send_close(Some((1000, "bye"))).unwrap();
            echoed
        });

        let (stream, _) = listener.accept().unwrap();
        let mut reader = http::Reader::new(stream.try_clone().unwrap());
        let request = reader.read_request().unwrap().unwrap();
        let leftover = reader.take_buffered();
        let mut ws = WebSocket::accept(stream, &request, &leftover, None).unwrap();
        assert_eq!(ws.read_message().unwrap(), Message::Text("hello".to_string()));
        ws.writer().send_text("echo").unwrap();
        assert_eq!(
            ws.read_message().unwrap(),
            Message::Close(Some((1000, "bye".to_string())))
        );
        assert_eq!(client.join().unwrap(), Message::Text("echo".to_string()));
    }

    #[test]
    fn timeout_keeps_partial_frames() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let request = format!(
                "GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\n\r\n",
                "dGhlIHNhbXBsZSBub25jZQ=="
            );
            stream.write_all(request.as_bytes()).unwrap();
            let frame = Frame::new(Opcode::Binary, vec![1, 2, 3]).to_bytes(Some([9, 9, 9, 9]));
            stream.write_all(&frame[..4]).unwrap();
            done_rx.recv().unwrap();
            stream.write_all(&frame[4..]).unwrap();
            stream
        });

        let (stream, _) = listener.accept().unwrap();
        let mut reader = http::Reader::new(stream.try_clone().unwrap());
        let request = reader.read_request().unwrap().unwrap();
        let leftover = reader.take_buffered();
        let mut ws = WebSocket::accept(stream, &request, &leftover, Some("chat")).unwrap();
        let mut timed_out = false;
        for _ in 0..3 {
            match ws.read_message_timeout(Duration::from_millis(20)).unwrap() {
                None => timed_out = true,
                Some(m) => panic!("unexpected {m:?}"),
            }
        }
        assert!(timed_out);
        done_tx.send(()).unwrap();
        assert_eq!(ws.read_message().unwrap(), Message::Binary(vec![1, 2, 3]));
        drop(client.join().unwrap());
    }
}
