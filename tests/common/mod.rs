#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use autohook::config::Config;
use autohook::http;
use autohook::input::VirtualInput;
use autohook::script::InlineScript;
use autohook::server::{Server, ServerHandle};
use autohook::websocket::{Message, WebSocket};
use serde_json::{Value, json};

const DEADLINE: Duration = Duration::from_secs(5);

pub struct Harness {
    pub server: ServerHandle,
    pub input: Arc<VirtualInput>,
}

impl Harness {
    pub fn start() -> Harness {
        Harness::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Harness {
        let input = Arc::new(VirtualInput::new(config.screen));
        let script = InlineScript::new("import auto from \"/auto.js\";");
        let server = Server::bind(&config, &script, input.clone())
            .unwrap()
            .spawn()
            .unwrap();
        Harness { server, input }
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn control(&self) -> Control {
        Control::connect(self.addr())
    }

    /// Sends `raw` and reads until the server closes the connection.
    pub fn send(&self, raw: &str) -> Reply {
        send(self.addr(), raw)
    }

    pub fn get(&self, target: &str) -> Reply {
        self.send(&format!(
            "GET {target} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.addr()
        ))
    }

    pub fn wait_for_release(&self) {
        wait_until(|| self.server.controller().session().is_none());
    }
}

#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub head: String,
    pub body: String,
}

pub fn send(addr: SocketAddr, raw: &str) -> Reply {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(DEADLINE)).unwrap();
    stream.write_all(raw.as_bytes()).unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    let (head, body) = out.split_once("\r\n\r\n").unwrap();
    let status = head.split(' ').nth(1).unwrap().parse().unwrap();
    Reply {
        status,
        head: head.to_string(),
        body: body.to_string(),
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < DEADLINE, "condition not met in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Opens a WebSocket to the server offering `protocols`.
pub fn open_ws(addr: SocketAddr, path: &str, protocols: &[&str]) -> (WebSocket, http::ResponseHead) {
    let stream = TcpStream::connect(addr).unwrap();
    WebSocket::connect(stream, &addr.to_string(), path, protocols).unwrap()
}

pub fn next_message(ws: &mut WebSocket) -> Message {
    let start = Instant::now();
    loop {
        if let Some(message) = ws.read_message_timeout(Duration::from_millis(50)).unwrap() {
            return message;
        }
        assert!(start.elapsed() < DEADLINE, "no message in time");
    }
}

/// A test-side controlling script.
pub struct Control {
    pub ws: WebSocket,
    next_id: i64,
}

impl Control {
    pub fn connect(addr: SocketAddr) -> Control {
        let (ws, _) = open_ws(addr, "/socket", &[]);
        Control { ws, next_id: 1 }
    }

    pub fn next_frame(&mut self) -> Value {
        match next_message(&mut self.ws) {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// Calls a command and returns the whole response object.
    pub fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.ws.writer().send_text(&request.to_string()).unwrap();
        let response = self.next_frame();
        assert_eq!(response["id"], json!(id), "{response}");
        assert!(response.get("method").is_none(), "{response}");
        response
    }

    /// Calls a command that must succeed and returns its result.
    pub fn ok(&mut self, method: &str, params: Value) -> Value {
        let response = self.call(method, params);
        assert!(response.get("error").is_none(), "{response}");
        response["result"].clone()
    }

    /// Calls a command that must fail and returns its error code.
    pub fn fails(&mut self, method: &str, params: Value) -> i64 {
        let response = self.call(method, params);
        response["error"]["code"].as_i64().unwrap()
    }

    /// Waits for the server to call a hook.
    pub fn expect_hook(&mut self) -> Value {
        let request = self.next_frame();
        assert!(request.get("method").is_some(), "{request}");
        request
    }

    pub fn answer(&mut self, id: &Value, result: Value) {
        let response = json!({"id": id, "result": result});
        self.ws.writer().send_text(&response.to_string()).unwrap();
    }
}

/// A plain upstream server answering every request with `upstream <method> <target>`.
pub fn upstream() -> (SocketAddr, Receiver<http::Request>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut reader = http::Reader::new(stream.try_clone().unwrap());
            let Ok(Some(request)) = reader.read_request() else { continue };
            let body = format!("upstream {} {}", request.method, request.target);
            let _ = write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            if tx.send(request).is_err() {
                break;
            }
        }
    });
    (addr, rx)
}
