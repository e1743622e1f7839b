//! Run a pluggable transport as a server.
//!
//! A server transport listens for obfuscated traffic and forwards the
//! plaintext somewhere.  In the plain [`ServerAdapter`] that somewhere
//! is a configured `host:port` (the ORPort); the
//! [`ExtServerAdapter`](ext::ExtServerAdapter) variant instead receives
//! the plaintext itself over an authenticated ExtOrPort.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use crate::argstr;
use crate::config::ServerConfig;
use crate::err::{Error, Result};
use crate::ipc::{
    AdapterStatus, CommonState, ENV_EXTENDED_SERVER_PORT, ENV_ORPORT, ENV_SERVER_BINDADDR,
    ENV_SERVER_TRANSPORT_OPTIONS, ENV_SERVER_TRANSPORTS, Flow, PtDispatcher, PtEnv, PtMessage,
    PtTimeouts, Supervisor,
};
use crate::slot::{Slot, TransportMap};

pub mod ext;

/// An initialized server transport method.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ServerTransport {
    /// The address the transport listens on for obfuscated traffic.
    pub host: String,
    /// The port the transport listens on.
    pub port: u16,
    /// The options field from the SMETHOD line, verbatim, if present.
    pub options: Option<String>,
}

impl ServerTransport {
    /// Parse the `ARGS:` option in the options field into key/value
    /// pairs.
    ///
    /// These are the arguments clients must present to use this
    /// transport (an obfs4 certificate, say).  Returns an empty list
    /// when there is no options field or no `ARGS:` option in it.
    pub fn parse_args(&self) -> Result<Vec<(String, String)>> {
        let Some(options) = &self.options else {
            return Ok(Vec::new());
        };
        for token in options.split(' ') {
            if let Some(body) = token.strip_prefix("ARGS:") {
                return argstr::parse_smethod_args(body);
            }
        }
        Ok(Vec::new())
    }
}

/// One transport requested from the server-side binary.
#[derive(Debug, Clone)]
struct RequestedTransport {
    /// Transport name.
    name: String,
    /// Requested bind address.  Optional: without one, the transport
    /// picks its own port.
    bind: Option<SocketAddr>,
    /// Per-transport options.
    options: Vec<(String, String)>,
}

/// Stdout dispatch for server adapters: the SMETHOD family.
struct ServerDispatcher {
    /// Shared VERSION/readiness bookkeeping.
    common: CommonState,
    /// The per-transport slots this dispatcher resolves.
    slots: Arc<TransportMap<ServerTransport>>,
}

impl PtDispatcher for ServerDispatcher {
    fn dispatch(&mut self, msg: PtMessage) -> Result<Flow> {
        match msg {
            PtMessage::ServerMethod {
                transport,
                host,
                port,
                options,
            } => {
                self.slots.resolve(
                    &transport,
                    Slot::Ready(ServerTransport {
                        host,
                        port,
                        options,
                    }),
                )?;
                Ok(Flow::Continue)
            }
            PtMessage::ServerMethodError { transport, message } => {
                self.slots.resolve(&transport, Slot::Failed(message))?;
                Ok(Flow::Continue)
            }
            PtMessage::ServerMethodsDone => {
                self.slots.finish_pending();
                self.common.mark_ready("SMETHODS DONE")
            }
            other => self.common.handle(other),
        }
    }
}

/// The server-side core shared by [`ServerAdapter`] and
/// [`ExtServerAdapter`](ext::ExtServerAdapter): the requested-transport
/// table, the server half of the environment, and SMETHOD dispatch.
struct ServerCommon {
    /// Process supervision and lifecycle state.
    sup: Supervisor,
    /// Requested transports, in configuration order.
    requested: Vec<RequestedTransport>,
    /// Per-transport results, shared with the stdout task.  Replaced
    /// with a fresh map when the adapter starts.
    slots: Arc<TransportMap<ServerTransport>>,
}

impl ServerCommon {
    /// Create the core for `exec` with state in `state`.
    fn new(exec: Vec<String>, state: Option<PathBuf>) -> Result<Self> {
        Ok(ServerCommon {
            sup: Supervisor::new(exec, state)?,
            requested: Vec::new(),
            slots: Arc::new(TransportMap::new([])),
        })
    }

    /// Add (or replace) a requested server transport.
    ///
    /// Server transports support one tunnel each, so adding a name a
    /// second time overwrites the previous entry.  Only valid before
    /// the adapter starts.
    fn add_transport(
        &mut self,
        name: &str,
        bind: Option<SocketAddr>,
        options: Vec<(String, String)>,
    ) -> Result<()> {
        self.sup.check_not_started()?;
        argstr::validate_transport_name(name)?;
        let entry = RequestedTransport {
            name: name.to_string(),
            bind,
            options,
        };
        match self.requested.iter_mut().find(|t| t.name == name) {
            Some(existing) => *existing = entry,
            None => self.requested.push(entry),
        }
        Ok(())
    }

    /// Start the transport, letting `extra_env` add the variables that
    /// distinguish plain from ExtOrPort operation.
    async fn start_with(&mut self, extra_env: impl FnOnce(&mut PtEnv)) -> Result<()> {
        let state = self.sup.begin_start()?;
        self.slots = Arc::new(TransportMap::new(
            self.requested.iter().map(|t| t.name.clone()),
        ));

        let mut env = PtEnv::new(&state, self.sup.exit_on_stdin_close());
        let names: Vec<&str> = self.requested.iter().map(|t| t.name.as_str()).collect();
        env.set(ENV_SERVER_TRANSPORTS, names.join(","));

        let bindaddrs: Vec<String> = self
            .requested
            .iter()
            .filter_map(|t| t.bind.map(|bind| format!("{}-{}", t.name, bind)))
            .collect();
        env.set(ENV_SERVER_BINDADDR, bindaddrs.join(","));

        let mut options = Vec::new();
        for t in &self.requested {
            for (key, value) in &t.options {
                options.push(format!(
                    "{}:{}={}",
                    t.name,
                    argstr::escape_server_option(key),
                    argstr::escape_server_option(value),
                ));
            }
        }
        env.set(ENV_SERVER_TRANSPORT_OPTIONS, options.join(";"));

        extra_env(&mut env);

        let dispatcher = ServerDispatcher {
            common: CommonState::default(),
            slots: Arc::clone(&self.slots),
        };
        self.sup.launch(env, dispatcher).await
    }

    /// Look up an initialized transport.
    fn get_transport(&self, name: &str) -> Result<ServerTransport> {
        self.sup.check_running()?;
        self.slots.get(name)
    }
}

/// Run a pluggable transport as a plain server.
///
/// The transport forwards de-obfuscated traffic straight to the
/// configured forwarding address; no traffic flows through this process
/// at all.
pub struct ServerAdapter {
    /// The shared server core.
    common: ServerCommon,
    /// Plaintext forwarding destination (`TOR_PT_ORPORT`).
    forward_host: String,
    /// Plaintext forwarding port.
    forward_port: u16,
}

impl ServerAdapter {
    /// Create an adapter that will run `exec` and have it forward
    /// plaintext traffic to `forward_host:forward_port`.
    pub fn new(
        exec: Vec<String>,
        state: Option<PathBuf>,
        forward_host: String,
        forward_port: u16,
    ) -> Result<Self> {
        Ok(ServerAdapter {
            common: ServerCommon::new(exec, state)?,
            forward_host,
            forward_port,
        })
    }

    /// Validate `config` and build the adapter.
    pub fn from_config(config: ServerConfig) -> Result<Self> {
        let (forward_host, forward_port) = argstr::parse_hostport(&config.forward)?;
        let mut adapter =
            ServerAdapter::new(config.exec, config.state, forward_host, forward_port)?;
        adapter.set_exit_on_stdin_close(config.exit_on_stdin_close);
        for transport in &config.transports {
            let bind = match &transport.bind {
                Some(bind) => {
                    let (host, port) = argstr::parse_hostport(bind)?;
                    // Bind addresses go to the transport verbatim, so a
                    // host name would just break it later; require an IP.
                    let ip: IpAddr = host
                        .parse()
                        .map_err(|_| Error::InvalidHostPort(bind.clone()))?;
                    Some(SocketAddr::new(ip, port))
                }
                None => None,
            };
            adapter.add_transport(&transport.name, bind, transport.options.clone())?;
        }
        Ok(adapter)
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

    /// Replace the adapter's timeouts.  Only affects future operations.
    pub fn set_timeouts(&mut self, timeouts: PtTimeouts) {
        self.common.sup.set_timeouts(timeouts);
    }

    /// Configure whether closing the child's stdin asks it to exit.
    /// Must be called before `start()`.
    pub fn set_exit_on_stdin_close(&mut self, exit: bool) {
        self.common.sup.set_exit_on_stdin_close(exit);
    }

    /// Start the transport and wait until every transport has been
    /// reported on.
    pub async fn start(&mut self) -> Result<()> {
        let orport = argstr::join_hostport(&self.forward_host, self.forward_port);
        self.common
            .start_with(move |env| {
                env.set(ENV_ORPORT, orport);
                // We don't support the ExtOrPort protocol here, and the
                // spec requires saying so explicitly.
                env.set(ENV_EXTENDED_SERVER_PORT, "");
            })
            .await
    }

    /// Stop the transport via the shutdown ladder.
    pub async fn stop(&mut self) -> Result<()> {
        self.common.sup.stop().await
    }

    /// Block until the transport process exits on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.common.sup.wait().await
    }

    /// Look up an initialized transport, e.g. to learn the actual bound
    /// endpoint when no bind address was requested.
    pub fn get_transport(&self, name: &str) -> Result<ServerTransport> {
        self.common.get_transport(name)
    }
}
