//! The closed table of commands a controlling script may invoke.

use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::hooks::HookRegistry;
use crate::input::{self, InputDevice, Key, MouseButton, Point};
use crate::jrpc;
use crate::target::ForwardTarget;

/// Why a command from the script failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("invalid params: {0}")]
    InvalidParams(#[source] serde_json::Error),
    #[error("invalid forward target: {0}")]
    InvalidTarget(String),
    #[error("unknown mouse button: {0}")]
    UnknownButton(String),
    #[error("unknown key: {0}")]
    UnknownKey(String),
    #[error(transparent)]
    Input(#[from] input::Error),
    #[error("could not encode result: {0}")]
    Encode(#[source] serde_json::Error),
}

impl Error {
    /// The JSON-RPC error object sent back to the script.
    pub fn into_rpc(self) -> jrpc::Error {
        match self {
            Error::UnknownMethod(m) => jrpc::Error::method_not_found_named(&m),
            Error::InvalidParams(e) => jrpc::Error::invalid_params(e.to_string()),
            Error::InvalidTarget(t) => jrpc::Error::invalid_target(t),
            Error::UnknownButton(b) => jrpc::Error::unknown_button(&b),
            Error::UnknownKey(k) => jrpc::Error::unknown_key(&k),
            e @ (Error::Input(_) | Error::Encode(_)) => jrpc::Error::from_error(e),
        }
    }
}

/// The commands a script may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GetScreenSize,
    Proxy,
    AddHook,
    RemoveHook,
    GetMouseCoords,
    JumpMouse,
    MoveMouse,
    ClickMouse,
    DblClickMouse,
    MouseDown,
    MouseUp,
    KeyPress,
    KeyDown,
    KeyUp,
}

impl Command {
    /// Every command, in the order the runtime lists them.
    pub const ALL: [Command; 14] = [
        Command::GetScreenSize,
        Command::Proxy,
        Command::AddHook,
        Command::RemoveHook,
        Command::GetMouseCoords,
        Command::JumpMouse,
        Command::MoveMouse,
        Command::ClickMouse,
        Command::DblClickMouse,
        Command::MouseDown,
        Command::MouseUp,
        Command::KeyPress,
        Command::KeyDown,
        Command::KeyUp,
    ];

    /// The method name on the wire.
    pub fn name(self) -> &'static str {
        match self {
            Command::GetScreenSize => "getScreenSize",
            Command::Proxy => "proxy",
            Command::AddHook => "addHook",
            Command::RemoveHook => "removeHook",
            Command::GetMouseCoords => "getMouseCoords",
            Command::JumpMouse => "jumpMouse",
            Command::MoveMouse => "moveMouse",
            Command::ClickMouse => "clickMouse",
            Command::DblClickMouse => "dblClickMouse",
            Command::MouseDown => "mouseDown",
            Command::MouseUp => "mouseUp",
            Command::KeyPress => "keyPress",
            Command::KeyDown => "keyDown",
            Command::KeyUp => "keyUp",
        }
    }

    /// ```
    /// use autohook::commands::Command;
    /// assert_eq!(Command::from_name("addHook"), Some(Command::AddHook));
    /// assert_eq!(Command::from_name("addhook"), None);
    /// ```
    pub fn from_name(name: &str) -> Option<Command> {
        Command::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// What a command may touch.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub target: &'a ForwardTarget,
    pub hooks: &'a HookRegistry,
    pub input: &'a dyn InputDevice,
}

/// Runs one command and returns its JSON result.
pub fn dispatch(
    ctx: &Context<'_>,
    method: &str,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, Error> {
    let command = Command::from_name(method).ok_or_else(|| Error::UnknownMethod(method.to_string()))?;
    match command {
        Command::GetScreenSize => encode(ctx.input.screen_size()?),
        Command::GetMouseCoords => encode(ctx.input.mouse_location()?),
        Command::Proxy => handle(params, |target: String| proxy(ctx.target, &target)),
        Command::AddHook => handle(params, |key: String| {
            ctx.hooks.add(&key);
            Ok(())
        }),
        Command::RemoveHook => handle(params, |key: String| {
            ctx.hooks.remove(&key);
            Ok(())
        }),
        Command::JumpMouse => handle(params, |(x, y): (i32, i32)| {
            Ok(ctx.input.jump_mouse(Point { x, y })?)
        }),
        Command::MoveMouse => handle(params, |(x, y): (i32, i32)| {
            Ok(ctx.input.move_mouse(Point { x, y })?)
        }),
        Command::ClickMouse => handle(params, |b: String| Ok(ctx.input.click(button(&b)?, false)?)),
        Command::DblClickMouse => handle(params, |b: String| Ok(ctx.input.click(button(&b)?, true)?)),
        Command::MouseDown => handle(params, |b: String| Ok(ctx.input.mouse_down(button(&b)?)?)),
        Command::MouseUp => handle(params, |b: String| Ok(ctx.input.mouse_up(button(&b)?)?)),
        Command::KeyPress => handle(params, |k: String| Ok(ctx.input.key_press(key(&k)?)?)),
        Command::KeyDown => handle(params, |k: String| Ok(ctx.input.key_down(key(&k)?)?)),
        Command::KeyUp => handle(params, |k: String| Ok(ctx.input.key_up(key(&k)?)?)),
    }
}

fn handle<T, R, F>(params: Option<serde_json::Value>, f: F) -> Result<serde_json::Value, Error>
where
    T: DeserializeOwned,
    R: Serialize,
    F: FnOnce(T) -> Result<R, Error>,
{
    let value = serde_json::from_value(params.unwrap_or(serde_json::Value::Null))
        .map_err(Error::InvalidParams)?;
    encode(f(value)?)
}

fn encode<R: Serialize>(result: R) -> Result<serde_json::Value, Error> {
    serde_json::to_value(result).map_err(Error::Encode)
}

fn button(name: &str) -> Result<MouseButton, Error> {
    name.parse().map_err(|_| Error::UnknownButton(name.to_string()))
}

fn key(name: &str) -> Result<Key, Error> {
    name.parse().map_err(|_| Error::UnknownKey(name.to_string()))
}

fn proxy(target: &ForwardTarget, raw: &str) -> Result<(), Error> {
    let url = Url::parse(raw).map_err(|e| Error::InvalidTarget(format!("{raw}: {e}")))?;
    if url.scheme() != "http" {
        return Err(Error::InvalidTarget(format!(
            "{raw}: only http targets are supported"
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::InvalidTarget(format!("{raw}: missing host")));
    }
    logwise::info_sync!("forward target set to {url}", url = logwise::privacy::LogIt(&url));
    target.store(url);
    Ok(())
}
