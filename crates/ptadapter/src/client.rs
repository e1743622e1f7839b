//! Run a pluggable transport as a client.
//!
//! For each requested transport, the child process opens a local proxy
//! port speaking SOCKS4 or SOCKS5; [`ClientAdapter`] tracks those ports
//! and opens tunnelled connections through them.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::argstr;
use crate::err::{ConnectError, Error, Result};
use crate::ipc::{
    AdapterStatus, CommonState, ENV_CLIENT_TRANSPORTS, ENV_PROXY, Flow, PtDispatcher, PtEnv,
    PtMessage, PtTimeouts, Supervisor,
};
use crate::slot::{Slot, TransportMap};
use crate::socks;

/// An initialized client transport method.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ClientTransport {
    /// The proxy protocol spoken on the port, normally `"socks4"` or
    /// `"socks5"`.
    ///
    /// This is kept verbatim from the transport's report; an
    /// unrecognized scheme is only rejected when a connection is
    /// attempted through it.
    pub scheme: String,
    /// Proxy host.
    pub host: String,
    /// Proxy port.
    pub port: u16,
}

/// Stdout dispatch for client adapters: the CMETHOD family plus
/// upstream-proxy acknowledgements.
struct ClientDispatcher {
    /// Shared VERSION/readiness bookkeeping.
    common: CommonState,
    /// The per-transport slots this dispatcher resolves.
    slots: Arc<TransportMap<ClientTransport>>,
}

impl PtDispatcher for ClientDispatcher {
    fn dispatch(&mut self, msg: PtMessage) -> Result<Flow> {
        match msg {
            PtMessage::ClientMethod {
                transport,
                scheme,
                host,
                port,
            } => {
                self.slots
                    .resolve(&transport, Slot::Ready(ClientTransport { scheme, host, port }))?;
                Ok(Flow::Continue)
            }
            PtMessage::ClientMethodError { transport, message } => {
                self.slots.resolve(&transport, Slot::Failed(message))?;
                Ok(Flow::Continue)
            }
            PtMessage::ClientMethodsDone => {
                self.slots.finish_pending();
                self.common.mark_ready("CMETHODS DONE")
            }
            PtMessage::ProxyDone => {
                debug!("PT upstream proxy accepted");
                Ok(Flow::Continue)
            }
            PtMessage::ProxyError(message) => Err(Error::ProxyError(message)),
            other => self.common.handle(other),
        }
    }
}

/// Run a pluggable transport as a client and connect through it.
///
/// The usual lifecycle is [`new`](Self::new), [`start`](Self::start),
/// any number of [`open_transport_connection`](Self::open_transport_connection)
/// calls, then [`stop`](Self::stop).
pub struct ClientAdapter {
    /// Process supervision and lifecycle state.
    sup: Supervisor,
    /// Requested transport names, in configuration order.
    transports: Vec<String>,
    /// Upstream proxy URI, if one is configured.
    proxy: Option<String>,
    /// Per-transport results, shared with the stdout task.
    slots: Arc<TransportMap<ClientTransport>>,
}

impl ClientAdapter {
    /// Create an adapter that will run `exec` with the given transports
    /// enabled.
    ///
    /// `state` is the transport's state directory; passing `None` uses
    /// a temporary directory that is removed again at `stop()`.
    /// `proxy`, if given, is an upstream proxy URI in the
    /// `scheme://[user[:pass]@]host:port` form of pt-spec.txt §3.4.
    pub fn new(
        exec: Vec<String>,
        state: Option<PathBuf>,
        transports: Vec<String>,
        proxy: Option<String>,
    ) -> Result<Self> {
        for name in &transports {
            argstr::validate_transport_name(name)?;
        }
        let slots = Arc::new(TransportMap::new(transports.iter().cloned()));
        Ok(ClientAdapter {
            sup: Supervisor::new(exec, state)?,
            transports,
            proxy,
            slots,
        })
    }

    /// The adapter's lifecycle state.
    pub fn status(&self) -> AdapterStatus {
        self.sup.status()
    }

    /// The state directory, if it exists yet.
    pub fn state_dir(&self) -> Option<PathBuf> {
        self.sup.state_dir()
    }

    /// The configured timeouts.
    pub fn timeouts(&self) -> &PtTimeouts {
        self.sup.timeouts()
    }

    /// Replace the adapter's timeouts.  Only affects future operations.
    pub fn set_timeouts(&mut self, timeouts: PtTimeouts) {
        self.sup.set_timeouts(timeouts);
    }

    /// Configure whether closing the child's stdin asks it to exit.
    /// Must be called before `start()`.
    pub fn set_exit_on_stdin_close(&mut self, exit: bool) {
        self.sup.set_exit_on_stdin_close(exit);
    }

    /// Start the transport and wait until every transport has been
    /// reported on.
    pub async fn start(&mut self) -> Result<()> {
        let state = self.sup.begin_start()?;
        let mut env = PtEnv::new(&state, self.sup.exit_on_stdin_close());
        env.set(ENV_CLIENT_TRANSPORTS, self.transports.join(","));
        if let Some(proxy) = &self.proxy {
            env.set(ENV_PROXY, proxy.clone());
        }
        let dispatcher = ClientDispatcher {
            common: CommonState::default(),
            slots: Arc::clone(&self.slots),
        };
        self.sup.launch(env, dispatcher).await
    }

    /// Stop the transport via the shutdown ladder.
    pub async fn stop(&mut self) -> Result<()> {
        self.sup.stop().await
    }

    /// Block until the transport process exits on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.sup.wait().await
    }

    /// Look up an initialized transport.
    pub fn get_transport(&self, transport: &str) -> Result<ClientTransport> {
        self.sup.check_running()?;
        self.slots.get(transport)
    }

    /// Open a connection to `host:port` through `transport`.
    ///
    /// On success the SOCKS negotiation has completed and the returned
    /// stream carries the tunnelled connection.  `args` are the
    /// per-connection arguments delivered to the transport in the SOCKS
    /// auth fields.
    pub async fn open_transport_connection(
        &self,
        transport: &str,
        host: &str,
        port: u16,
        args: &[(String, String)],
    ) -> std::result::Result<TcpStream, ConnectError> {
        let info = self.get_transport(transport)?;
        open_proxied_connection(&info, host, port, args, self.sup.timeouts().connect).await
    }
}

/// Dial a transport's proxy port and negotiate one connection through it.
///
/// Factored out of [`ClientAdapter`] so listeners holding a resolved
/// [`ClientTransport`] can open connections without going back through
/// the adapter.
pub(crate) async fn open_proxied_connection(
    info: &ClientTransport,
    host: &str,
    port: u16,
    args: &[(String, String)],
    connect_timeout: Duration,
) -> std::result::Result<TcpStream, ConnectError> {
    let dial = TcpStream::connect((info.host.as_str(), info.port));
    let mut stream = match timeout(connect_timeout, dial).await {
        Err(_) => return Err(ConnectError::ConnectTimeout),
        Ok(Err(e)) => return Err(ConnectError::ProxyConnect(Arc::new(e))),
        Ok(Ok(stream)) => stream,
    };
    match info.scheme.as_str() {
        "socks5" => socks::negotiate_socks5(&mut stream, host, port, args).await?,
        "socks4" => socks::negotiate_socks4(&mut stream, host, port, args).await?,
        other => return Err(ConnectError::UnsupportedScheme(other.to_string())),
    }
    Ok(stream)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn dispatcher() -> (ClientDispatcher, Arc<TransportMap<ClientTransport>>) {
        let slots = Arc::new(TransportMap::new(
            ["obfs4".to_string(), "meek".to_string()],
        ));
        (
            ClientDispatcher {
                common: CommonState::default(),
                slots: Arc::clone(&slots),
            },
            slots,
        )
    }

    fn feed(d: &mut ClientDispatcher, line: &str) -> Result<Flow> {
        d.dispatch(PtMessage::parse(line).unwrap())
    }

    #[test]
    fn cmethod_lifecycle() {
        let (mut d, slots) = dispatcher();
        assert!(matches!(feed(&mut d, "VERSION 1"), Ok(Flow::Continue)));
        assert!(matches!(
            feed(&mut d, "CMETHOD obfs4 socks5 127.0.0.1:54321"),
            Ok(Flow::Continue)
        ));
        assert!(matches!(feed(&mut d, "CMETHODS DONE"), Ok(Flow::Ready)));

        let obfs4 = slots.get("obfs4").unwrap();
        assert_eq!(obfs4.scheme, "socks5");
        assert_eq!(obfs4.host, "127.0.0.1");
        assert_eq!(obfs4.port, 54321);

        // "meek" was never mentioned: resolved as ignored.
        assert!(matches!(slots.get("meek"), Err(Error::TransportIgnored(_))));
    }

    #[test]
    fn cmethod_error_is_local_to_the_transport() {
        let (mut d, slots) = dispatcher();
        feed(&mut d, "VERSION 1").unwrap();
        feed(&mut d, "CMETHOD-ERROR obfs4 no such transport").unwrap();
        feed(&mut d, "CMETHOD meek socks4 127.0.0.1:2000").unwrap();
        assert!(matches!(feed(&mut d, "CMETHODS DONE"), Ok(Flow::Ready)));

        match slots.get("obfs4") {
            Err(Error::TransportFailed { message, .. }) => {
                assert!(message.contains("no such transport"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(slots.get("meek").unwrap().scheme, "socks4");
    }

    #[test]
    fn unrequested_cmethod_is_fatal() {
        let (mut d, _slots) = dispatcher();
        assert!(feed(&mut d, "CMETHOD snowflake socks5 127.0.0.1:1").is_err());
    }

    #[test]
    fn proxy_lines() {
        let (mut d, _slots) = dispatcher();
        assert!(matches!(feed(&mut d, "PROXY DONE"), Ok(Flow::Continue)));
        assert!(matches!(
            feed(&mut d, "PROXY-ERROR bad proxy URI"),
            Err(Error::ProxyError(_))
        ));
    }

    #[test]
    fn smethod_on_a_client_is_only_logged() {
        let (mut d, _slots) = dispatcher();
        assert!(matches!(
            feed(&mut d, "SMETHOD obfs4 0.0.0.0:443"),
            Ok(Flow::Continue)
        ));
    }

    #[test]
    fn invalid_transport_name_rejected_up_front() {
        let result = ClientAdapter::new(
            vec!["pt".to_string()],
            None,
            vec!["bad name".to_string()],
            None,
        );
        assert!(matches!(result, Err(Error::InvalidTransportName(_))));
    }
}
