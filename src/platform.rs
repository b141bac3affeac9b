//! Host capability report for the trading-terminal integration.

use serde::Serialize;
use std::fmt;

/// Whether the desktop trading terminal could be driven from this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TerminalSupport {
    /// The terminal only ships for Windows.
    Unavailable(String),
    /// Windows host, but the terminal bridge is not part of this build.
    NotBundled,
}

impl TerminalSupport {
    pub fn detect() -> Self {
        Self::for_os(std::env::consts::OS)
    }

    fn for_os(os: &str) -> Self {
        if os == "windows" {
            TerminalSupport::NotBundled
        } else {
            TerminalSupport::Unavailable(format!(
                "trading terminal requires Windows; host is {os}"
            ))
        }
    }
}

impl fmt::Display for TerminalSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalSupport::Unavailable(reason) => write!(f, "unavailable ({reason})"),
            TerminalSupport::NotBundled => write!(f, "not bundled"),
        }
    }
}
