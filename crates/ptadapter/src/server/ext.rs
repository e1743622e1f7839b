//! Run a pluggable transport as a server, receiving the plaintext
//! ourselves over an authenticated ExtOrPort.
//!
//! Instead of forwarding de-obfuscated traffic to a fixed address, the
//! transport connects back to a local listener we bind before it
//! starts.  Each such connection authenticates with SafeCookie, then
//! describes the real client (USERADDR/TRANSPORT) before we accept it
//! and hand the stream to the embedding application.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::argstr;
use crate::err::{Error, Result};
use crate::extor::{self, ExtOrCommand, ExtOrReply, SafeCookieAuthenticator};
use crate::ipc::{AdapterStatus, ENV_AUTH_COOKIE_FILE, ENV_EXTENDED_SERVER_PORT, PtTimeouts};
use crate::server::{ServerCommon, ServerTransport};

/// File name used for the cookie inside an adapter-owned directory.
const AUTH_COOKIE_FILENAME: &str = "auth_cookie";

/// Address-family restriction for the ExtOrPort listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum IpFamily {
    /// Bind an IPv4 address only.
    V4,
    /// Bind an IPv6 address only.
    V6,
}

/// What we know about a client connecting through a server transport.
///
/// Transports normally report all of this, but the ExtOrPort spec does
/// not force them to, so every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct ExtOrClientInfo {
    /// Name of the transport the client used.
    pub transport: Option<String>,
    /// IP address of the client.
    pub host: Option<IpAddr>,
    /// Port number of the client.
    pub port: Option<u16>,
}

/// Async callback receiving each accepted client stream.
///
/// The callback owns the stream from then on; the adapter keeps no way
/// to reach it other than aborting the task it runs in at `stop()`.
pub type ClientConnectedFn =
    Box<dyn Fn(TcpStream, ExtOrClientInfo) -> BoxFuture<'static, ()> + Send + Sync>;

/// Async callback that may reject a client before it is accepted.
pub type PreconnectFn = Box<dyn Fn(ExtOrClientInfo) -> BoxFuture<'static, bool> + Send + Sync>;

/// The pair of callbacks shared with every connection handler.
struct Callbacks {
    /// Invoked with each accepted stream.
    connected: ClientConnectedFn,
    /// Optional gate consulted before replying OKAY.
    preconnect: Option<PreconnectFn>,
}

/// Run a pluggable transport as a server with an ExtOrPort.
pub struct ExtServerAdapter {
    /// The shared server core.
    common: ServerCommon,
    /// SafeCookie secret for this adapter's lifetime.
    authenticator: Arc<SafeCookieAuthenticator>,
    /// Caller-supplied cookie file path, if any.
    cookie_file: Option<PathBuf>,
    /// Adapter-owned cookie directory, when no path was supplied.
    cookie_dir: Option<tempfile::TempDir>,
    /// Where the cookie was actually written; set at start.
    cookie_path: Option<PathBuf>,
    /// Requested ExtOrPort host.  Loopback unless you know better.
    ext_host: String,
    /// Requested ExtOrPort port; 0 means an ephemeral one.
    ext_port: u16,
    /// Optional address-family restriction for the listener.
    ext_family: Option<IpFamily>,
    /// The listener's actual bound address; set at start.
    ext_addr: Option<SocketAddr>,
    /// The connected callback, until start() moves it into the listener.
    connected_cb: Option<ClientConnectedFn>,
    /// The preconnect callback, until start() moves it into the listener.
    preconnect_cb: Option<PreconnectFn>,
    /// The listener task (which owns the per-connection tasks).
    tasks: JoinSet<()>,
}

impl ExtServerAdapter {
    /// Create an adapter that will run `exec` and call
    /// `client_connected` with each accepted client stream.
    pub fn new<F, Fut>(
        exec: Vec<String>,
        state: Option<PathBuf>,
        client_connected: F,
    ) -> Result<Self>
    where
        F: Fn(TcpStream, ExtOrClientInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let connected: ClientConnectedFn =
            Box::new(move |stream, info| Box::pin(client_connected(stream, info)));
        Ok(ExtServerAdapter {
            common: ServerCommon::new(exec, state)?,
            authenticator: Arc::new(SafeCookieAuthenticator::new()),
            cookie_file: None,
            cookie_dir: None,
            cookie_path: None,
            ext_host: "localhost".to_string(),
            ext_port: 0,
            ext_family: None,
            ext_addr: None,
            connected_cb: Some(connected),
            preconnect_cb: None,
            tasks: JoinSet::new(),
        })
    }

    /// Install a gate that can reject clients before they are accepted.
    /// Must be called before `start()`.
    pub fn set_preconnect<F, Fut>(&mut self, preconnect: F)
    where
        F: Fn(ExtOrClientInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.preconnect_cb = Some(Box::new(move |info| Box::pin(preconnect(info))));
    }

    /// Configure where the ExtOrPort listener binds.
    ///
    /// The ExtOrPort is internal between us and the transport, so
    /// `host` should stay a loopback name or address.  Port 0 picks an
    /// ephemeral port.  Must be called before `start()`.
    pub fn set_ext_bind(&mut self, host: impl Into<String>, port: u16, family: Option<IpFamily>) {
        self.ext_host = host.into();
        self.ext_port = port;
        self.ext_family = family;
    }

    /// Use `path` for the auth cookie file instead of a temporary
    /// directory.  The location should not be readable by other users.
    /// Must be called before `start()`.
    pub fn set_auth_cookie_file(&mut self, path: PathBuf) {
        self.cookie_file = Some(path);
    }

    /// Add (or replace) a server transport: one tunnel per transport,
    /// bind address optional, only before `start()`.
    pub fn add_transport(
        &mut self,
        name: &str,
        bind: Option<SocketAddr>,
        options: Vec<(String, String)>,
    ) -> Result<()> {
        self.common.add_transport(name, bind, options)
    }

    /// The adapter's lifecycle state.
    pub fn status(&self) -> AdapterStatus {
        self.common.sup.status()
    }

    /// The state directory, if it exists yet.
    pub fn state_dir(&self) -> Option<PathBuf> {
        self.common.sup.state_dir()
    }

    /// The ExtOrPort listener's bound address, once started.
    pub fn ext_or_port(&self) -> Option<SocketAddr> {
        self.ext_addr
    }

    /// The auth cookie file path, once started.
    pub fn auth_cookie_file(&self) -> Option<PathBuf> {
        self.cookie_path.clone()
    }

    /// Replace the adapter's timeouts.  Only affects future operations.
    pub fn set_timeouts(&mut self, timeouts: PtTimeouts) {
        self.common.sup.set_timeouts(timeouts);
    }

    /// Configure whether closing the child's stdin asks it to exit.
    /// Must be called before `start()`.
    pub fn set_exit_on_stdin_close(&mut self, exit: bool) {
        self.common.sup.set_exit_on_stdin_close(exit);
    }

    /// Write the cookie, bind the ExtOrPort, start the transport, and
    /// wait until every transport has been reported on.
    pub async fn start(&mut self) -> Result<()> {
        self.common.sup.check_not_started()?;

        let cookie_path = match &self.cookie_file {
            Some(path) => {
                std::path::absolute(path).map_err(|e| Error::CookieFile(Arc::new(e)))?
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("ptadapter-authcookie-")
                    .tempdir()
                    .map_err(|e| Error::CookieFile(Arc::new(e)))?;
                let path = dir.path().join(AUTH_COOKIE_FILENAME);
                self.cookie_dir = Some(dir);
                path
            }
        };
        self.authenticator
            .write_cookie_file(&cookie_path)
            .map_err(|e| Error::CookieFile(Arc::new(e)))?;
        self.cookie_path = Some(cookie_path.clone());

        // The listener must exist before the child starts, since its
        // address goes into the child's environment.
        let listener = bind_ext_listener(&self.ext_host, self.ext_port, self.ext_family).await?;
        let ext_addr = listener
            .local_addr()
            .map_err(|e| Error::ExtOrPortBind(Arc::new(e)))?;
        self.ext_addr = Some(ext_addr);
        debug!("ExtOrPort listening on {}", ext_addr);

        let callbacks = Arc::new(Callbacks {
            connected: self.connected_cb.take().ok_or(Error::AlreadyStarted)?,
            preconnect: self.preconnect_cb.take(),
        });
        let authenticator = Arc::clone(&self.authenticator);
        self.tasks
            .spawn(run_ext_listener(listener, authenticator, callbacks));

        let ext_addr_var = ext_addr.to_string();
        let cookie_var = cookie_path.to_string_lossy().into_owned();
        let started = self
            .common
            .start_with(move |env| {
                env.set(ENV_EXTENDED_SERVER_PORT, ext_addr_var);
                env.set(ENV_AUTH_COOKIE_FILE, cookie_var);
            })
            .await;
        if let Err(e) = started {
            // The supervisor already ran the shutdown ladder; tear down
            // the listener and the cookie as well.
            self.tasks.shutdown().await;
            self.cleanup_cookie();
            return Err(e);
        }
        Ok(())
    }

    /// Stop the adapter: close the ExtOrPort listener, abort the
    /// connection handlers, run the shutdown ladder, then remove the
    /// cookie.
    pub async fn stop(&mut self) -> Result<()> {
        self.common.sup.check_running()?;
        self.tasks.shutdown().await;
        let stopped = self.common.sup.stop().await;
        self.cleanup_cookie();
        stopped
    }

    /// Block until the transport process exits on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.common.sup.wait().await
    }

    /// Look up an initialized transport.
    pub fn get_transport(&self, name: &str) -> Result<ServerTransport> {
        self.common.get_transport(name)
    }

    /// Best-effort removal of the cookie file and its directory.
    fn cleanup_cookie(&mut self) {
        if let Some(path) = self.cookie_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!("could not remove cookie file {:?}: {}", path, e);
            }
        }
        if let Some(dir) = self.cookie_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("could not remove cookie directory {:?}: {}", path, e);
            }
        }
    }
}

/// Bind the ExtOrPort listener, honoring the family restriction.
async fn bind_ext_listener(
    host: &str,
    port: u16,
    family: Option<IpFamily>,
) -> Result<TcpListener> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::ExtOrPortBind(Arc::new(e)))?;
    let mut last_err = None;
    for addr in addrs {
        let usable = match family {
            None => true,
            Some(IpFamily::V4) => addr.is_ipv4(),
            Some(IpFamily::V6) => addr.is_ipv6(),
        };
        if !usable {
            continue;
        }
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    Err(Error::ExtOrPortBind(Arc::new(last_err.unwrap_or_else(
        || io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable address"),
    ))))
}

/// Accept ExtOrPort connections until the task is aborted.
///
/// Each connection gets its own task in a local [`JoinSet`]; when this
/// task is aborted at `stop()`, dropping the set aborts them all.
async fn run_ext_listener(
    listener: TcpListener,
    authenticator: Arc<SafeCookieAuthenticator>,
    callbacks: Arc<Callbacks>,
) {
    let mut conns: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("ExtOrPort connection from {}", peer);
                    conns.spawn(handle_ext_connection(
                        stream,
                        Arc::clone(&authenticator),
                        Arc::clone(&callbacks),
                    ));
                }
                Err(e) => warn!("ExtOrPort accept failed: {}", e),
            },
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }
}

/// Drive one incoming ExtOrPort connection from authentication to
/// callback hand-off.
///
/// Failures here are connection-local: log and drop.
async fn handle_ext_connection(
    mut stream: TcpStream,
    authenticator: Arc<SafeCookieAuthenticator>,
    callbacks: Arc<Callbacks>,
) {
    match authenticator.authenticate(&mut stream).await {
        Ok(true) => {}
        Ok(false) => {
            warn!("ExtOrPort SafeCookie authentication failed");
            return;
        }
        Err(e) => {
            warn!("error during ExtOrPort SafeCookie authentication: {}", e);
            return;
        }
    }

    let client_info = match read_client_info(&mut stream).await {
        Ok(client_info) => client_info,
        Err(e) => {
            warn!("error in ExtOrPort client-info phase: {}", e);
            return;
        }
    };

    let accept = match &callbacks.preconnect {
        Some(preconnect) => preconnect(client_info.clone()).await,
        None => true,
    };
    let reply = if accept {
        ExtOrReply::OKAY
    } else {
        ExtOrReply::DENY
    };
    if let Err(e) = extor::write_reply(&mut stream, reply, b"").await {
        warn!("error writing ExtOrPort reply: {}", e);
        return;
    }
    if !accept {
        info!("ExtOrPort connection denied: {:?}", client_info);
        return;
    }

    (callbacks.connected)(stream, client_info).await;
}

/// Consume USERADDR/TRANSPORT commands until DONE.
async fn read_client_info(stream: &mut TcpStream) -> io::Result<ExtOrClientInfo> {
    let mut client_info = ExtOrClientInfo::default();
    loop {
        let (command, body) = extor::read_message(stream).await?;
        match command {
            ExtOrCommand::DONE => break,
            ExtOrCommand::USERADDR => {
                let body = String::from_utf8(body)
                    .map_err(|_| io::Error::other("non-ASCII USERADDR body"))?;
                let (host, port) = argstr::parse_hostport(&body)
                    .map_err(|e| io::Error::other(format!("bad USERADDR: {}", e)))?;
                let host: IpAddr = host
                    .parse()
                    .map_err(|_| io::Error::other("USERADDR host is not an IP address"))?;
                client_info.host = Some(host);
                client_info.port = Some(port);
            }
            ExtOrCommand::TRANSPORT => {
                let body = String::from_utf8(body)
                    .map_err(|_| io::Error::other("non-ASCII TRANSPORT body"))?;
                argstr::validate_transport_name(&body)
                    .map_err(|e| io::Error::other(format!("bad TRANSPORT: {}", e)))?;
                client_info.transport = Some(body);
            }
            other => {
                info!("unknown ExtOrPort command {}, body {:?}", other, body);
            }
        }
    }
    Ok(client_info)
}
