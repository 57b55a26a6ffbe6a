/*!
A scriptable interception proxy for driving a web application from a browser script.

autohook serves a small bootstrap page and a browser runtime, accepts a single
controlling script over a WebSocket at `/socket`, and then sits in front of the
application under test as a reverse proxy. The script can:

- point the proxy at the application (`proxy`),
- intercept requests by URL and answer them itself (`addHook` / `removeHook`),
- splice itself into the page's WebSockets through paired tunnels,
- move and click a (virtual) mouse and press keys.

# Overview

Everything runs on plain threads: one per accepted connection and one writer per
control connection. There is no async runtime.

Control traffic is JSON-RPC 2.0 in both directions over one WebSocket. The script
calls commands on the server; the server calls the script back when a hooked request
arrives, with the hook key as the method name and the captured request as params.
The script's answer is written to the waiting client, or `null` lets the request
continue to the forward target.

Only one controller is admitted at a time. A second one receives a single error
frame (id `-999`) and is closed. When the controller goes away its hooks, tunnels
and forward target go with it, and any client waiting on a hook is answered with
a 500.

# Quick Start

```no_run
use std::sync::Arc;
use autohook::config::Config;
use autohook::input::VirtualInput;
use autohook::script::InlineScript;
use autohook::server::Server;

let config = Config::default();
let input = Arc::new(VirtualInput::new(config.screen));
let script = InlineScript::new(r#"
    import auto from "/auto.js";
    auto("http://127.0.0.1:8000/", async c => {
        await c.hook("http://127.0.0.1:8000/api/user", () => ({"body": "{}"}));
        await c.load("/");
    });
"#);
let server = Server::bind(&config, &script, input).unwrap();
println!("open {}", server.url());
server.run();
```

# Matching

A request matches a hook key if any of its canonical forms equals the key exactly:

1. the full URL without fragment, e.g. `http://site.test/a%20b?y=2&x=1`
2. the request URI as sent, e.g. `/a%20b?y=2&x=1`
3. the decoded path with the query re-encoded in sorted key order, e.g. `/a b?x=1&y=2`
4. the decoded path alone, e.g. `/a b`

Forms are tried in that order. A request from a loopback peer may name the URL to
match with the `X-HOOK` header, which is how the browser runtime routes patched
`fetch` and `XMLHttpRequest` calls.

# Module Organization

- [`server`] - listener, routing and [`server::ServerHandle`]
- [`session`] - single-controller admission and the control loop
- [`commands`] - the command table
- [`channel`] - outgoing calls to the script and their replies
- [`matcher`], [`hooks`] - request URLs and the hook registry
- [`forward`], [`target`] - reverse forwarding
- [`tunnel`] - WebSocket tunnel pairing
- [`http`], [`websocket`], [`jrpc`] - wire formats
- [`assets`], [`script`] - the files served to the browser
- [`input`] - the input device interface and a virtual implementation
- [`launcher`] - starting the browser
*/
pub mod assets;
pub mod capture;
pub mod channel;
pub mod commands;
pub mod config;
pub mod forward;
pub mod hooks;
pub mod http;
pub mod input;
pub mod jrpc;
pub mod launcher;
pub mod matcher;
pub mod script;
pub mod server;
pub mod session;
pub mod target;
pub mod tunnel;
pub mod websocket;
