//! Declare error types for the ptadapter crate.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::socks::{Socks4Reply, Socks5Reply};

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error returned by a pluggable-transport adapter.
///
/// Errors of this type are either configuration problems reported
/// synchronously, invalid-state errors, or fatal conditions that take the
/// whole adapter down.  Problems that affect only a single proxied
/// connection are reported as [`ConnectError`] instead.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A transport name did not follow the identifier rules.
    #[error("invalid transport name {0:?}")]
    InvalidTransportName(String),

    /// A `host:port` string could not be parsed.
    #[error("invalid host:port string {0:?}")]
    InvalidHostPort(String),

    /// A `key=value` argument list could not be parsed.
    #[error("malformed key=value arguments: {0}")]
    MalformedArgs(String),

    /// An adapter was built with an empty command line.
    #[error("pluggable transport command line is empty")]
    EmptyCommandLine,

    /// An operation that requires a started adapter was invoked too early.
    #[error("pluggable transport has not been started")]
    NotStarted,

    /// `start()` was invoked a second time.
    #[error("pluggable transport has already been started")]
    AlreadyStarted,

    /// An operation was invoked on an adapter that is stopping, has
    /// stopped, or has failed.
    #[error("pluggable transport is stopping or has stopped")]
    NotRunning,

    /// The pluggable transport binary could not be executed.
    #[error("could not execute pluggable transport {exe:?}")]
    Spawn {
        /// The program we tried to run.
        exe: String,
        /// What happened when we tried to run it.
        #[source]
        cause: Arc<io::Error>,
    },

    /// Waiting for the pluggable transport process failed.
    #[error("could not wait for the pluggable transport to exit")]
    Wait(#[source] Arc<io::Error>),

    /// A state directory could not be created or resolved.
    #[error("could not set up the state directory")]
    StateDir(#[source] Arc<io::Error>),

    /// The ExtOrPort authentication cookie file could not be written.
    #[error("could not write the ExtOrPort auth cookie file")]
    CookieFile(#[source] Arc<io::Error>),

    /// The ExtOrPort listener could not be bound.
    #[error("could not bind the ExtOrPort listener")]
    ExtOrPortBind(#[source] Arc<io::Error>),

    /// A tunnel listener could not be bound.
    #[error("could not bind listener on {addr}")]
    TunnelBind {
        /// The address we tried to listen on.
        addr: String,
        /// What happened when we tried to bind it.
        #[source]
        cause: Arc<io::Error>,
    },

    /// The pluggable transport rejected every version we offered.
    #[error("pluggable transport reported VERSION-ERROR: {0}")]
    VersionError(String),

    /// The pluggable transport rejected its environment.
    #[error("pluggable transport reported ENV-ERROR: {0}")]
    EnvError(String),

    /// The pluggable transport could not use the configured upstream proxy.
    #[error("pluggable transport reported PROXY-ERROR: {0}")]
    ProxyError(String),

    /// The pluggable transport wrote something on stdout that violates the
    /// managed-proxy protocol.
    #[error("pluggable transport protocol violation: {0}")]
    Protocol(String),

    /// The pluggable transport closed its stdout before it finished
    /// initializing.
    #[error("pluggable transport closed stdout before finishing initialization")]
    StdoutClosed,

    /// A transport name was looked up that was never configured on this
    /// adapter.
    #[error("transport {0:?} was not configured on this adapter")]
    NoSuchTransport(String),

    /// A transport was looked up before the pluggable transport reported
    /// on it.
    #[error("transport {0:?} has not finished initializing")]
    TransportPending(String),

    /// The pluggable transport reported an error initializing a transport.
    #[error("transport {name:?} failed to initialize: {message}")]
    TransportFailed {
        /// The transport that failed.
        name: String,
        /// The error message from the CMETHOD-ERROR or SMETHOD-ERROR line.
        message: String,
    },

    /// The pluggable transport finished initializing without mentioning a
    /// transport we asked for.
    #[error("transport {0:?} was ignored by the pluggable transport")]
    TransportIgnored(String),
}

/// An error from a single proxied connection attempt.
///
/// These errors never affect the adapter that produced them: other
/// connections, and the pluggable transport itself, carry on.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ConnectError {
    /// The adapter could not supply a usable transport.
    #[error(transparent)]
    Adapter(#[from] Error),

    /// We could not open a TCP connection to the transport's proxy port.
    #[error("could not connect to the transport's proxy port")]
    ProxyConnect(#[source] Arc<io::Error>),

    /// Connecting to the transport's proxy port took too long.
    #[error("timed out connecting to the transport's proxy port")]
    ConnectTimeout,

    /// An I/O problem while negotiating with the transport's proxy port.
    #[error("problem communicating with the transport's proxy port")]
    ProxyIo(#[source] Arc<io::Error>),

    /// The transport announced a proxy scheme we cannot speak.
    #[error("transport uses unsupported proxy scheme {0:?}")]
    UnsupportedScheme(String),

    /// The proxy answered with something that is not valid SOCKS.
    #[error("proxy spoke the SOCKS protocol incorrectly: {0}")]
    SocksProto(String),

    /// The SOCKS5 proxy refused our CONNECT request.
    #[error("SOCKS5 proxy rejected the connection: {0}")]
    Socks5Rejected(Socks5Reply),

    /// The SOCKS4 proxy refused our CONNECT request.
    #[error("SOCKS4 proxy rejected the connection: {0}")]
    Socks4Rejected(Socks4Reply),

    /// The encoded per-connection arguments exceed what SOCKS5
    /// username/password fields can carry.
    #[error("encoded per-connection arguments are too long")]
    ArgsTooLong,

    /// A SOCKS4 transport was asked to reach a non-IPv4 destination.
    #[error("SOCKS4 supports only IPv4 destination addresses")]
    NotIpv4,

    /// The destination hostname could not be IDNA-encoded.
    #[error("destination hostname {0:?} could not be encoded")]
    BadHostname(String),

    /// The destination hostname is over 255 bytes once encoded.
    #[error("destination hostname is too long")]
    HostnameTooLong,
}

impl From<io::Error> for ConnectError {
    fn from(e: io::Error) -> Self {
        ConnectError::ProxyIo(Arc::new(e))
    }
}
