//! Server settings: command-line flags with environment fallbacks.

use std::net::SocketAddr;

use clap::Parser;

/// WebSocket-to-PTY shell bridge.
#[derive(Debug, Clone, Parser)]
#[command(name = "webshell-host", version, about)]
pub struct Settings {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Base URI prefix the app is mounted under (e.g. "/pun"). Matched as
    /// literal text, never as a pattern.
    #[arg(long, env = "BASE_URI", default_value = "")]
    pub base_uri: String,

    /// Host used when the route names the literal "default".
    #[arg(long, env = "DEFAULT_SSHHOST", default_value = "localhost")]
    pub default_host: String,

    /// Command spawned to reach the remote shell.
    #[arg(long, env = "SSH_COMMAND", default_value = "ssh")]
    pub ssh_command: String,

    /// Terminal type advertised to the spawned process.
    #[arg(long, default_value = "xterm-256color")]
    pub term: String,

    /// Locale forced on each spawned process; must be a UTF-8 locale or
    /// multi-byte output will be corrupted in the browser.
    #[arg(long, env = "SHELL_LANG", default_value = "en_US.UTF-8")]
    pub lang: String,

    /// End a session after this many seconds without bytes flowing in
    /// either direction. 0 disables the timeout.
    #[arg(long, default_value_t = 0)]
    pub idle_timeout_secs: u64,
}

impl Settings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_uri.is_empty() {
            return Ok(());
        }
        if !self.base_uri.starts_with('/') {
            anyhow::bail!("base URI must start with '/': {:?}", self.base_uri);
        }
        if self.base_uri.ends_with('/') {
            anyhow::bail!("base URI must not end with '/': {:?}", self.base_uri);
        }
        Ok(())
    }
}
