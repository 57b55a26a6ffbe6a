//! Server settings.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::input::ScreenSize;
use crate::matcher::HookHeaderPolicy;

/// Everything a [`Server`](crate::server::Server) needs to start.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: IpAddr,
    /// `0` picks an ephemeral port.
    pub port: u16,
    pub hook_header: HookHeaderPolicy,
    /// How long a hook callback may take; `None` waits until the controller disconnects.
    pub hook_timeout: Option<Duration>,
    /// Screen reported by the virtual input device.
    pub screen: ScreenSize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            hook_header: HookHeaderPolicy::default(),
            hook_timeout: None,
            screen: ScreenSize::default(),
        }
    }
}
