//! Starting the browser and tying process lifetime to it.

use std::process::{Child, Command, ExitStatus};
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::server::ServerHandle;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why the browser could not be run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("empty browser command")]
    EmptyCommand,
    #[error("could not start browser {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
    #[error("browser I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A browser command line; the server URL is appended as the last argument.
///
/// Parsed from either a JSON array of command parts or a plain program path.
///
/// ```
/// use autohook::launcher::Browser;
///
/// let b: Browser = r#"["firefox", "--new-window"]"#.parse().unwrap();
/// assert_eq!(b.parts(), ["firefox", "--new-window"]);
///
/// let b: Browser = "/usr/bin/chromium".parse().unwrap();
/// assert_eq!(b.parts(), ["/usr/bin/chromium"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Browser(Vec<String>);

impl FromStr for Browser {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = match serde_json::from_str::<Vec<String>>(s) {
            Ok(parts) => parts,
            Err(_) => vec![s.to_string()],
        };
        if parts.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(Error::EmptyCommand);
        }
        Ok(Browser(parts))
    }
}

impl Browser {
    /// The program followed by its arguments.
    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// The command that opens `url`.
    pub fn command(&self, url: &str) -> Result<Command, Error> {
        let (program, args) = self.0.split_first().ok_or(Error::EmptyCommand)?;
        let mut command = Command::new(program);
        command.args(args).arg(url);
        Ok(command)
    }

    /// Starts the browser on `url`.
    pub fn launch(&self, url: &str) -> Result<Child, Error> {
        let program = self.0.first().ok_or(Error::EmptyCommand)?;
        let child = self.command(url)?.spawn().map_err(|source| Error::Spawn {
            program: program.clone(),
            source,
        })?;
        logwise::info_sync!(
            "launched browser {program} on {url}",
            program = logwise::privacy::LogIt(program),
            url = logwise::privacy::LogIt(&url)
        );
        Ok(child)
    }
}

/// Serves until the browser exits or the process is interrupted.
///
/// Without `keep_alive` the browser exiting ends the run. With it, serving goes on
/// until an interrupt. The first interrupt stops the listener and kills the
/// browser, with or without `keep_alive`. Returns the browser's exit status if
/// it exited on its own.
pub fn run(
    server: ServerHandle,
    browser: Option<&Browser>,
    keep_alive: bool,
) -> Result<Option<ExitStatus>, Error> {
    serve_until(server, browser, keep_alive, &watch_signals()?)
}

fn serve_until(
    mut server: ServerHandle,
    browser: Option<&Browser>,
    keep_alive: bool,
    signals: &Receiver<i32>,
) -> Result<Option<ExitStatus>, Error> {
    let url = server.url();
    let mut child = browser.map(|b| b.launch(&url)).transpose()?;
    if child.is_none() {
        logwise::info_sync!("serving on {url}", url = logwise::privacy::LogIt(&url));
    }
    let mut status = None;
    loop {
        match signals.recv_timeout(POLL_INTERVAL) {
            Ok(signal) => {
                logwise::info_sync!("interrupted by signal {signal}", signal = logwise::privacy::LogIt(&signal));
                server.shutdown();
                if let Some(child) = &mut child
                    && status.is_none()
                {
                    let _ = child.kill();
                    child.wait()?;
                }
                return Ok(status);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => std::thread::sleep(POLL_INTERVAL),
        }
        if status.is_none()
            && let Some(child) = &mut child
            && let Some(exited) = child.try_wait()?
        {
            logwise::info_sync!("browser exited with {exited}", exited = logwise::privacy::LogIt(&exited));
            status = Some(exited);
            if !keep_alive {
                server.shutdown();
                return Ok(status);
            }
        }
    }
}

#[cfg(unix)]
fn watch_signals() -> Result<Receiver<i32>, Error> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(Error::Signals)?;
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("autohook::launcher::signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                if tx.send(signal).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

#[cfg(not(unix))]
fn watch_signals() -> Result<Receiver<i32>, Error> {
    let (_, rx) = mpsc::channel();
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_is_the_last_argument() {
        let b: Browser = r#"["browser", "--kiosk"]"#.parse().unwrap();
        let command = b.command("http://127.0.0.1:1/").unwrap();
        assert_eq!(command.get_program(), "browser");
        let args: Vec<_> = command.get_args().collect();
        assert_eq!(args, ["--kiosk", "http://127.0.0.1:1/"]);
    }

    #[test]
    fn malformed_json_is_a_path() {
        let b: Browser = "[not json".parse().unwrap();
        assert_eq!(b.parts(), ["[not json"]);
        assert!(matches!("[]".parse::<Browser>(), Err(Error::EmptyCommand)));
        assert!(matches!("".parse::<Browser>(), Err(Error::EmptyCommand)));
    }

    #[cfg(unix)]
    #[test]
    fn first_interrupt_ends_a_keep_alive_run() {
        use std::net::TcpStream;
        use std::sync::Arc;

        use crate::config::Config;
        use crate::input::VirtualInput;
        use crate::script::InlineScript;
        use crate::server::Server;

        let config = Config::default();
        let input = Arc::new(VirtualInput::new(config.screen));
        let server = Server::bind(&config, &InlineScript::new(""), input)
            .unwrap()
            .spawn()
            .unwrap();
        let addr = server.local_addr();
        let browser: Browser = r#"["sh", "-c", "exec sleep 30"]"#.parse().unwrap();
        let (interrupt, signals) = mpsc::channel();
        let serving = std::thread::spawn(move || serve_until(server, Some(&browser), true, &signals));

        interrupt.send(signal_hook::consts::SIGINT).unwrap();
        // the browser was still running, so it was killed and has no status to report
        assert!(serving.join().unwrap().unwrap().is_none());
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn missing_program_fails_to_launch() {
        let b: Browser = r#"["/nonexistent/autohook-browser"]"#.parse().unwrap();
        assert!(matches!(b.launch("http://127.0.0.1:1/"), Err(Error::Spawn { .. })));
    }
}
