//! Normalized configuration accepted by the adapters.
//!
//! Parsing a configuration file is somebody else's job; what arrives
//! here is the structured form of it.  The structs deserialize with
//! `serde`, so a front-end can map its file format straight onto them.

use std::path::PathBuf;

use serde::Deserialize;

/// Configuration for a client adapter and the tunnels it exposes.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct ClientConfig {
    /// Command line of the transport executable.
    pub exec: Vec<String>,
    /// State directory.  `None` means a temporary directory owned by
    /// the adapter.
    #[serde(default)]
    pub state: Option<PathBuf>,
    /// Upstream proxy URI, if the transport should dial through one.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Whether closing the transport's stdin asks it to exit.
    #[serde(default = "default_true")]
    pub exit_on_stdin_close: bool,
    /// The tunnels to expose.
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

impl ClientConfig {
    /// Configuration running `exec`, with no tunnels yet.
    pub fn new(exec: Vec<String>) -> Self {
        ClientConfig {
            exec,
            state: None,
            proxy: None,
            exit_on_stdin_close: true,
            tunnels: Vec::new(),
        }
    }
}

/// One client tunnel: a local listener and where its traffic should
/// emerge.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct TunnelConfig {
    /// Name of the transport to tunnel through.
    pub transport: String,
    /// Local address to listen on, as `host:port`.
    pub listen: String,
    /// Destination the transport should reach, as `host:port`.
    pub remote: String,
    /// Per-connection arguments passed to the transport.
    #[serde(default)]
    pub args: Vec<(String, String)>,
}

impl TunnelConfig {
    /// A tunnel with no per-connection arguments.
    pub fn new(
        transport: impl Into<String>,
        listen: impl Into<String>,
        remote: impl Into<String>,
    ) -> Self {
        TunnelConfig {
            transport: transport.into(),
            listen: listen.into(),
            remote: remote.into(),
            args: Vec::new(),
        }
    }
}

/// Configuration for a plain server adapter.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct ServerConfig {
    /// Command line of the transport executable.
    pub exec: Vec<String>,
    /// State directory.  `None` means a temporary directory owned by
    /// the adapter.  Servers usually want a persistent one.
    #[serde(default)]
    pub state: Option<PathBuf>,
    /// Where the transport forwards plaintext traffic, as `host:port`.
    pub forward: String,
    /// Whether closing the transport's stdin asks it to exit.
    #[serde(default = "default_true")]
    pub exit_on_stdin_close: bool,
    /// The server transports to enable.
    #[serde(default)]
    pub transports: Vec<ServerTransportConfig>,
}

impl ServerConfig {
    /// Configuration running `exec` and forwarding to `forward`, with
    /// no transports yet.
    pub fn new(exec: Vec<String>, forward: impl Into<String>) -> Self {
        ServerConfig {
            exec,
            state: None,
            forward: forward.into(),
            exit_on_stdin_close: true,
            transports: Vec::new(),
        }
    }
}

/// One enabled server transport.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct ServerTransportConfig {
    /// Transport name.
    pub name: String,
    /// Requested bind address as `host:port`, where the host must be an
    /// IP literal.  Without one, the transport picks its own port.
    #[serde(default)]
    pub bind: Option<String>,
    /// Per-transport options.
    #[serde(default)]
    pub options: Vec<(String, String)>,
}

impl ServerTransportConfig {
    /// A transport with no requested bind address and no options.
    pub fn new(name: impl Into<String>) -> Self {
        ServerTransportConfig {
            name: name.into(),
            bind: None,
            options: Vec::new(),
        }
    }
}

/// Serde default helper.
fn default_true() -> bool {
    true
}
