mod common;

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use autohook::config::Config;
use autohook::http;
use autohook::matcher::HookHeaderPolicy;
use common::{Harness, upstream};
use serde_json::json;

#[test]
fn serves_bootstrap_files_without_a_target() {
    let harness = Harness::start();
    let index = harness.get("/");
    assert_eq!(index.status, 200);
    assert!(index.head.contains("Content-Type: text/html"));
    assert!(index.head.contains("Last-Modified: "));
    assert!(index.body.contains("/script.js"));

    let script = harness.get("/script.js");
    assert_eq!(script.body, "import auto from \"/auto.js\";");

    let missing = harness.get("/app/page");
    assert_eq!(missing.status, 404);
    assert_eq!(missing.body, "no forward target configured");
}

#[test]
fn control_path_needs_an_upgrade() {
    let harness = Harness::start();
    assert_eq!(harness.get("/socket").status, 400);
}

#[test]
fn forwards_to_target() {
    let (up, seen) = upstream();
    let harness = Harness::start();
    let mut control = harness.control();
    control.ok("proxy", json!(format!("http://{up}/base?k=1")));

    let reply = harness.get("/page?x=2");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "upstream GET /base/page?k=1&x=2");
    let request = seen.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(request.headers.get("X-Forwarded-For"), Some("127.0.0.1"));

    // the target now shadows the bootstrap files
    assert!(harness.get("/").body.starts_with("upstream GET /base/"));
}

#[test]
fn unreachable_target_is_a_502() {
    let closed = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);
    let harness = Harness::start();
    let mut control = harness.control();
    control.ok("proxy", json!(format!("http://{addr}/")));
    assert_eq!(harness.get("/").status, 502);
}

#[test]
fn hook_answers_the_request() {
    let harness = Harness::start();
    let mut control = harness.control();
    control.ok("addHook", json!("/api/user"));

    let addr = harness.addr();
    let client = std::thread::spawn(move || {
        common::send(
            addr,
            &format!(
                "POST /api/user?id=7 HTTP/1.1\r\nHost: {addr}\r\nCookie: a=1\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello"
            ),
        )
    });

    let call = control.expect_hook();
    assert_eq!(call["method"], json!("/api/user"));
    let params = &call["params"];
    assert_eq!(params["url"], json!(format!("http://{addr}/api/user?id=7")));
    assert_eq!(params["method"], json!("POST"));
    assert_eq!(params["headers"]["Cookie"], json!(["a=1"]));
    assert_eq!(params["body"], json!("hello"));
    control.answer(
        &call["id"],
        json!({"code": 201, "headers": {"X-From": "script", "Set-Cookie": ["b=2", "c=3"]}, "body": "created"}),
    );

    let reply = client.join().unwrap();
    assert_eq!(reply.status, 201);
    assert!(reply.head.contains("X-From: script"));
    assert!(reply.head.contains("Set-Cookie: b=2"));
    assert!(reply.head.contains("Set-Cookie: c=3"));
    assert_eq!(reply.body, "created");
}

#[test]
fn null_answer_falls_through() {
    let (up, _seen) = upstream();
    let harness = Harness::start();
    let mut control = harness.control();
    control.ok("proxy", json!(format!("http://{up}")));
    control.ok("addHook", json!("/watched"));

    let addr = harness.addr();
    let client = std::thread::spawn(move || {
        common::send(addr, &format!("GET /watched HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"))
    });
    let call = control.expect_hook();
    control.answer(&call["id"], json!(null));
    assert_eq!(client.join().unwrap().body, "upstream GET /watched");

    control.ok("removeHook", json!("/watched"));
    assert_eq!(harness.get("/watched").body, "upstream GET /watched");
}

#[test]
fn unanswered_hook_without_target_is_a_404() {
    let harness = Harness::start();
    let mut control = harness.control();
    control.ok("addHook", json!("/nothing"));
    let addr = harness.addr();
    let client = std::thread::spawn(move || {
        common::send(addr, &format!("GET /nothing HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"))
    });
    let call = control.expect_hook();
    control.answer(&call["id"], json!(null));
    assert_eq!(client.join().unwrap().status, 404);
}

#[test]
fn script_errors_become_500() {
    let harness = Harness::start();
    let mut control = harness.control();
    control.ok("addHook", json!("/boom"));
    let addr = harness.addr();
    let client = std::thread::spawn(move || {
        common::send(addr, &format!("GET /boom HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"))
    });
    let call = control.expect_hook();
    let error = json!({"id": call["id"], "error": {"code": -32000, "message": "handler threw"}});
    control.ws.writer().send_text(&error.to_string()).unwrap();
    let reply = client.join().unwrap();
    assert_eq!(reply.status, 500);
    assert!(reply.body.contains("handler threw"));
}

#[test]
fn concurrent_hooks_are_answered_out_of_order() {
    let harness = Harness::start();
    let mut control = harness.control();
    control.ok("addHook", json!("/a"));
    control.ok("addHook", json!("/b"));
    let addr = harness.addr();
    let request = move |path: &'static str| {
        std::thread::spawn(move || {
            common::send(addr, &format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"))
        })
    };
    let a = request("/a");
    let b = request("/b");

    let first = control.expect_hook();
    let second = control.expect_hook();
    assert_ne!(first["id"], second["id"]);
    // the later call is answered first
    for call in [&second, &first] {
        let answer = match call["method"].as_str() {
            Some("/a") => json!({"code": 201, "body": "A"}),
            _ => json!({"code": 202, "body": "B"}),
        };
        control.answer(&call["id"], answer);
    }

    let a = a.join().unwrap();
    assert_eq!((a.status, a.body.as_str()), (201, "A"));
    let b = b.join().unwrap();
    assert_eq!((b.status, b.body.as_str()), (202, "B"));
}

#[test]
fn invalid_status_code_is_a_500() {
    let harness = Harness::start();
    let mut control = harness.control();
    control.ok("addHook", json!("/odd"));
    let addr = harness.addr();
    let client = std::thread::spawn(move || {
        common::send(addr, &format!("GET /odd HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"))
    });
    let call = control.expect_hook();
    control.answer(&call["id"], json!({"code": 0, "body": "x"}));
    let reply = client.join().unwrap();
    assert_eq!(reply.status, 500);
    assert!(reply.body.contains("outside 200..=599"), "{}", reply.body);
}

/// Counts what is written to it.
struct Counter(usize);

impl Write for Counter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn large_unhooked_upload_streams_to_the_target() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let up = listener.local_addr().unwrap();
    let upstream = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reader = http::Reader::new(stream.try_clone().unwrap());
        let (_, framing) = reader.read_request_head().unwrap().unwrap();
        let mut counted = Counter(0);
        reader.copy_body(framing, &mut counted).unwrap();
        let body = counted.0.to_string();
        write!(stream, "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}", body.len()).unwrap();
    });
    let harness = Harness::start();
    let mut control = harness.control();
    control.ok("proxy", json!(format!("http://{up}")));

    let len = http::MAX_BODY + 1;
    let mut stream = TcpStream::connect(harness.addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
    write!(
        stream,
        "POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n"
    )
    .unwrap();
    let chunk = vec![b'z'; 1 << 20];
    let mut left = len;
    while left > 0 {
        let n = left.min(chunk.len());
        stream.write_all(&chunk[..n]).unwrap();
        left -= n;
    }
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
    assert!(out.ends_with(&format!("\r\n\r\n{len}")), "{out}");
    upstream.join().unwrap();
}

#[test]
fn pending_hook_fails_when_controller_leaves() {
    let harness = Harness::start();
    let mut control = harness.control();
    control.ok("addHook", json!("/slow"));
    let addr = harness.addr();
    let client = std::thread::spawn(move || {
        common::send(addr, &format!("GET /slow HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"))
    });
    control.expect_hook();
    drop(control);
    assert_eq!(client.join().unwrap().status, 500);
}

#[test]
fn hook_timeout_is_a_500() {
    let harness = Harness::with_config(Config {
        hook_timeout: Some(Duration::from_millis(200)),
        ..Config::default()
    });
    let mut control = harness.control();
    control.ok("addHook", json!("/late"));
    let reply = harness.get("/late");
    assert_eq!(reply.status, 500);
    let call = control.expect_hook();
    // a late answer is dropped without disturbing the session
    control.answer(&call["id"], json!({"body": "too late"}));
    control.ok("getScreenSize", json!(null));
}

#[test]
fn session_end_clears_everything() {
    let (up, _seen) = upstream();
    let harness = Harness::start();
    let mut control = harness.control();
    control.ok("proxy", json!(format!("http://{up}")));
    control.ok("addHook", json!("/x"));
    assert!(harness.server.controller().target().load().is_some());
    drop(control);
    harness.wait_for_release();

    assert!(harness.server.controller().target().load().is_none());
    assert_eq!(harness.get("/x").status, 404);

    let mut next = harness.control();
    next.ok("getScreenSize", json!(null));
    let session = harness.server.controller().session().unwrap();
    assert!(session.hooks.is_empty());
}

#[test]
fn hook_header_names_the_url_to_match() {
    let harness = Harness::start();
    let mut control = harness.control();
    control.ok("addHook", json!("http://app.test/api/feed"));
    let addr = harness.addr();
    let client = std::thread::spawn(move || {
        common::send(
            addr,
            &format!(
                "GET / HTTP/1.1\r\nHost: {addr}\r\nX-HOOK: http://app.test/api/feed\r\nConnection: close\r\n\r\n"
            ),
        )
    });
    let call = control.expect_hook();
    assert_eq!(call["params"]["url"], json!("http://app.test/api/feed"));
    control.answer(&call["id"], json!({"body": "[]"}));
    assert_eq!(client.join().unwrap().body, "[]");
}

#[test]
fn ignored_hook_header_matches_the_real_url() {
    let harness = Harness::with_config(Config {
        hook_header: HookHeaderPolicy::Ignore,
        ..Config::default()
    });
    let mut control = harness.control();
    control.ok("addHook", json!("http://app.test/api/feed"));
    let addr = harness.addr();
    let reply = common::send(
        addr,
        &format!("GET /nope HTTP/1.1\r\nHost: {addr}\r\nX-HOOK: http://app.test/api/feed\r\nConnection: close\r\n\r\n"),
    );
    assert_eq!(reply.status, 404);
}

#[test]
fn keep_alive_serves_several_requests() {
    let harness = Harness::start();
    let mut stream = TcpStream::connect(harness.addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"GET /script.js HTTP/1.1\r\nHost: x\r\n\r\nGET /missing HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("HTTP/1.1 404 Not Found\r\n"));
}
