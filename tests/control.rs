mod common;

use std::sync::{Arc, Barrier};
use std::time::Duration;

use autohook::input::{InputEvent, MouseButton, Point};
use autohook::websocket::Message;
use common::{Control, Harness, next_message};
use serde_json::json;

#[test]
fn second_controller_is_refused() {
    let harness = Harness::start();
    let mut first = harness.control();
    assert_eq!(first.ok("getScreenSize", json!(null)), json!({"width": 1920, "height": 1080}));

    let mut second = Control::connect(harness.addr());
    let refusal = second.next_frame();
    assert_eq!(refusal["id"], json!(-999));
    assert_eq!(refusal["error"]["message"], json!("only a single connection is allowed"));
    loop {
        match second.ws.read_message() {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(other) => panic!("unexpected {other:?}"),
        }
    }

    // the admitted controller is unaffected
    first.ok("addHook", json!("/still-here"));
    let session = harness.server.controller().session().unwrap();
    assert!(session.hooks.contains("/still-here"));
}

#[test]
fn slot_frees_when_controller_leaves() {
    let harness = Harness::start();
    for _ in 0..50 {
        let mut controller = harness.control();
        assert_eq!(controller.ok("getMouseCoords", json!(null)), json!({"x": 0, "y": 0}));
        drop(controller);
        harness.wait_for_release();
    }
}

#[test]
fn concurrent_admission_admits_exactly_one() {
    for _ in 0..5 {
        let harness = Harness::start();
        let addr = harness.addr();
        let barrier = Arc::new(Barrier::new(2));
        let attempts: Vec<_> = (0..2)
            .map(|_| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let mut control = Control::connect(addr);
                    barrier.wait();
                    // only the refused connection is sent anything unprompted
                    let admitted = match control.ws.read_message_timeout(Duration::from_millis(500)) {
                        Ok(None) => true,
                        Ok(Some(Message::Text(text))) => {
                            assert!(text.contains("-999"), "{text}");
                            false
                        }
                        Ok(Some(_)) | Err(_) => false,
                    };
                    if admitted {
                        control.ok("getScreenSize", json!(null));
                    }
                    // hold the slot until both know where they stand
                    barrier.wait();
                    admitted
                })
            })
            .collect();
        let admitted = attempts
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 1);
    }
}

#[test]
fn input_commands() {
    let harness = Harness::start();
    let mut control = harness.control();
    assert_eq!(control.ok("jumpMouse", json!([100, 200])), json!(null));
    control.ok("moveMouse", json!([5000, -3]));
    assert_eq!(control.ok("getMouseCoords", json!(null)), json!({"x": 1919, "y": 0}));
    control.ok("clickMouse", json!("left"));
    control.ok("mouseDown", json!("centre"));
    control.ok("mouseUp", json!("middle"));
    control.ok("keyPress", json!("a"));

    let events = harness.input.events();
    assert_eq!(events[0], InputEvent::Jump(Point { x: 100, y: 200 }));
    assert_eq!(events[1], InputEvent::Move(Point { x: 1919, y: 0 }));
    assert_eq!(
        events[2],
        InputEvent::Click {
            button: MouseButton::Left,
            double: false
        }
    );
    assert!(harness.input.pressed_buttons().is_empty());
}

#[test]
fn command_errors() {
    let harness = Harness::start();
    let mut control = harness.control();
    assert_eq!(control.fails("teleport", json!(null)), -32601);
    assert_eq!(control.fails("jumpMouse", json!("here")), -32602);
    assert_eq!(control.fails("clickMouse", json!("thumb")), -32002);
    assert_eq!(control.fails("keyDown", json!("hyper")), -32002);
    assert_eq!(control.fails("proxy", json!("not a url")), -32001);

    // malformed frames get a parse error with a null id
    control.ws.writer().send_text("{not json").unwrap();
    let response = control.next_frame();
    assert_eq!(response["error"]["code"], json!(-32700));
    assert_eq!(response["id"], json!(null));

    // and the session survives all of it
    control.ok("getScreenSize", json!(null));
}

#[test]
fn binary_frames_are_accepted() {
    let harness = Harness::start();
    let mut control = harness.control();
    let request = json!({"id": 1, "method": "getScreenSize"});
    control
        .ws
        .writer()
        .send_binary(request.to_string().as_bytes())
        .unwrap();
    match next_message(&mut control.ws) {
        Message::Text(text) => assert!(text.contains("\"width\":1920")),
        other => panic!("unexpected {other:?}"),
    }
}
