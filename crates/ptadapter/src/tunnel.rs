//! Local TCP listeners that tunnel plaintext through a client transport.
//!
//! This is the convenience layer that turns a [`ClientAdapter`] into a
//! standalone tunnel: each configured tunnel binds a local listener,
//! and every accepted plaintext stream is paired with a negotiated
//! transport connection and handed to the relay.

use std::net::SocketAddr;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::argstr;
use crate::client::{ClientAdapter, ClientTransport, open_proxied_connection};
use crate::config::ClientConfig;
use crate::err::{Error, Result};
use crate::ipc::{AdapterStatus, PtTimeouts};
use crate::relay::relay;

/// One tunnel, validated and ready to run.
struct ParsedTunnel {
    /// Transport to tunnel through.
    transport: String,
    /// Local listen host and port.
    listen: (String, u16),
    /// Destination host and port.
    remote: (String, u16),
    /// Per-connection arguments.
    args: Vec<(String, String)>,
}

/// The per-tunnel state an accept loop needs, independent of the
/// adapter that created it.
struct ActiveTunnel {
    /// The transport's resolved proxy endpoint.
    info: ClientTransport,
    /// Destination host and port.
    remote: (String, u16),
    /// Per-connection arguments.
    args: Vec<(String, String)>,
    /// Timeout for dialing the transport's proxy port.
    connect_timeout: Duration,
}

/// Run a client transport and expose it as local TCP tunnels.
///
/// Built from a [`ClientConfig`]; `start()` brings up the transport and
/// the listeners, `stop()` closes the listeners, aborts every in-flight
/// connection, and then winds the transport down.
pub struct ListeningClientAdapter {
    /// The underlying client adapter.
    client: ClientAdapter,
    /// The configured tunnels.
    tunnels: Vec<ParsedTunnel>,
    /// Accept-loop tasks; each owns its connections.
    listeners: JoinSet<()>,
    /// Actual bound listener addresses, in tunnel order; set at start.
    bound: Vec<SocketAddr>,
}

impl ListeningClientAdapter {
    /// Validate `config` and build the adapter.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let mut transports = Vec::new();
        let mut tunnels = Vec::new();
        for tunnel in &config.tunnels {
            if !transports.contains(&tunnel.transport) {
                transports.push(tunnel.transport.clone());
            }
            tunnels.push(ParsedTunnel {
                transport: tunnel.transport.clone(),
                listen: argstr::parse_hostport(&tunnel.listen)?,
                remote: argstr::parse_hostport(&tunnel.remote)?,
                args: tunnel.args.clone(),
            });
        }
        let mut client =
            ClientAdapter::new(config.exec, config.state, transports, config.proxy)?;
        client.set_exit_on_stdin_close(config.exit_on_stdin_close);
        Ok(ListeningClientAdapter {
            client,
            tunnels,
            listeners: JoinSet::new(),
            bound: Vec::new(),
        })
    }

    /// The adapter's lifecycle state.
    pub fn status(&self) -> AdapterStatus {
        self.client.status()
    }

    /// The underlying client adapter.
    pub fn client(&self) -> &ClientAdapter {
        &self.client
    }

    /// Replace the adapter's timeouts.  Only affects future operations.
    pub fn set_timeouts(&mut self, timeouts: PtTimeouts) {
        self.client.set_timeouts(timeouts);
    }

    /// The bound listener addresses, in tunnel order.  Useful when a
    /// tunnel was configured with port 0.
    pub fn listen_addrs(&self) -> &[SocketAddr] {
        &self.bound
    }

    /// Start the transport, then bring up one listener per tunnel.
    pub async fn start(&mut self) -> Result<()> {
        self.client.start().await?;
        for tunnel in &self.tunnels {
            let info = match self.client.get_transport(&tunnel.transport) {
                Ok(info) => info,
                Err(e) => {
                    return Self::fail_start(&mut self.client, &mut self.listeners, e).await;
                }
            };
            let listener =
                match TcpListener::bind((tunnel.listen.0.as_str(), tunnel.listen.1)).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        let e = Error::TunnelBind {
                            addr: argstr::join_hostport(&tunnel.listen.0, tunnel.listen.1),
                            cause: Arc::new(e),
                        };
                        return Self::fail_start(&mut self.client, &mut self.listeners, e).await;
                    }
                };
            let bound = match listener.local_addr() {
                Ok(bound) => bound,
                Err(e) => {
                    let e = Error::TunnelBind {
                        addr: argstr::join_hostport(&tunnel.listen.0, tunnel.listen.1),
                        cause: Arc::new(e),
                    };
                    return Self::fail_start(&mut self.client, &mut self.listeners, e).await;
                }
            };
            debug!(
                "tunnel {} -> {} via transport {:?}",
                bound,
                argstr::join_hostport(&tunnel.remote.0, tunnel.remote.1),
                tunnel.transport,
            );
            self.bound.push(bound);
            let active = Arc::new(ActiveTunnel {
                info,
                remote: tunnel.remote.clone(),
                args: tunnel.args.clone(),
                connect_timeout: self.client.timeouts().connect,
            });
            self.listeners.spawn(run_listener(listener, active));
        }
        Ok(())
    }

    /// Unwind a partially-started adapter and pass the error through.
    async fn fail_start(
        client: &mut ClientAdapter,
        listeners: &mut JoinSet<()>,
        e: Error,
    ) -> Result<()> {
        listeners.shutdown().await;
        if let Err(stop_err) = client.stop().await {
            debug!("error stopping transport after failed start: {}", stop_err);
        }
        Err(e)
    }

    /// Stop everything: close the listeners, abort in-flight
    /// negotiations and relays, then wind the transport down.
    pub async fn stop(&mut self) -> Result<()> {
        self.listeners.shutdown().await;
        self.bound.clear();
        self.client.stop().await
    }

    /// Block until the transport process exits on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.client.wait().await
    }
}

/// Accept plaintext connections for one tunnel until aborted.
///
/// Connections run in a local [`JoinSet`], so aborting this task at
/// `stop()` cancels their negotiations and relays too.
async fn run_listener(listener: TcpListener, tunnel: Arc<ActiveTunnel>) {
    let mut conns: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    conns.spawn(run_connection(stream, peer, Arc::clone(&tunnel)));
                }
                Err(e) => warn!("tunnel accept failed: {}", e),
            },
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }
}

/// Tunnel one plaintext connection: negotiate, then relay.
async fn run_connection(plaintext: TcpStream, peer: SocketAddr, tunnel: Arc<ActiveTunnel>) {
    let proxied = match open_proxied_connection(
        &tunnel.info,
        &tunnel.remote.0,
        tunnel.remote.1,
        &tunnel.args,
        tunnel.connect_timeout,
    )
    .await
    {
        Ok(proxied) => proxied,
        Err(e) => {
            warn!("could not open transport connection for {}: {}", peer, e);
            return;
        }
    };
    match relay(plaintext, proxied).await {
        Ok((up, down)) => {
            debug!("relay for {} done: {} bytes up, {} bytes down", peer, up, down);
        }
        Err(e) => info!("relay for {} ended with error: {}", peer, e),
    }
}
