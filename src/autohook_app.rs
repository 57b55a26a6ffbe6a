//! The `autohook` command line.
//!
//! Serves a script to a browser and proxies the application under test.
//!
//! ```bash
//! autohook -s script.js -b '["firefox", "--new-window"]'
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use autohook::config::Config;
use autohook::input::{ScreenSize, VirtualInput};
use autohook::launcher::{self, Browser};
use autohook::matcher::HookHeaderPolicy;
use autohook::script::FileScript;
use autohook::server::Server;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "autohook")]
#[command(about = "Scriptable interception proxy driven from a browser script")]
struct Args {
    /// Port for the server to listen on (0 picks a free one)
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// Script to serve at /script.js
    #[arg(short, long)]
    script: PathBuf,

    /// Browser to launch: a path, or a JSON array of the command parts
    #[arg(short, long)]
    browser: Option<Browser>,

    /// Keep serving after the browser exits; stop on interrupt
    #[arg(short, long)]
    keep_alive: bool,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Screen size reported to scripts, as WIDTHxHEIGHT
    #[arg(long, default_value = "1920x1080")]
    screen: ScreenSize,

    /// Seconds to wait for a hook callback before answering 500
    #[arg(long)]
    hook_timeout: Option<f64>,

    /// Which peers may use the X-HOOK header: ignore, loopback or any
    #[arg(long, default_value = "loopback")]
    hook_header: HookHeaderPolicy,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let hook_timeout = match args.hook_timeout {
        Some(secs) => Some(Duration::try_from_secs_f64(secs)?),
        None => None,
    };
    let config = Config {
        bind: args.bind,
        port: args.port,
        hook_header: args.hook_header,
        hook_timeout,
        screen: args.screen,
    };
    let input = Arc::new(VirtualInput::new(config.screen));
    let server = Server::bind(&config, &FileScript::new(args.script), input)?;
    let handle = server.spawn()?;
    let status = launcher::run(handle, args.browser.as_ref(), args.keep_alive)?;
    Ok(match status {
        Some(status) if !status.success() => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}
