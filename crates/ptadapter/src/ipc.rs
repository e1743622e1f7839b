//! Managed-proxy plumbing shared by every adapter.
//!
//! This module owns the three mechanical layers of the managed-proxy
//! protocol (pt-spec.txt §3): assembling the `TOR_PT_*` environment,
//! parsing the line-oriented reports the transport writes on stdout,
//! and supervising the child process itself, including the bounded
//! shutdown ladder.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use oneshot_fused_workaround as oneshot;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::argstr;
use crate::err::{Error, Result};

/// Version negotiation variable; always set to "1".
pub(crate) const ENV_MANAGED_TRANSPORT_VER: &str = "TOR_PT_MANAGED_TRANSPORT_VER";
/// Absolute path of the transport's state directory.
pub(crate) const ENV_STATE_LOCATION: &str = "TOR_PT_STATE_LOCATION";
/// Whether the transport should exit when its stdin reaches EOF.
pub(crate) const ENV_EXIT_ON_STDIN_CLOSE: &str = "TOR_PT_EXIT_ON_STDIN_CLOSE";
/// Comma-joined client transport names.
pub(crate) const ENV_CLIENT_TRANSPORTS: &str = "TOR_PT_CLIENT_TRANSPORTS";
/// Upstream proxy URI for client transports.
pub(crate) const ENV_PROXY: &str = "TOR_PT_PROXY";
/// Comma-joined server transport names.
pub(crate) const ENV_SERVER_TRANSPORTS: &str = "TOR_PT_SERVER_TRANSPORTS";
/// Requested `name-host:port` bind addresses for server transports.
pub(crate) const ENV_SERVER_BINDADDR: &str = "TOR_PT_SERVER_BINDADDR";
/// Escaped `name:key=value` options for server transports.
pub(crate) const ENV_SERVER_TRANSPORT_OPTIONS: &str = "TOR_PT_SERVER_TRANSPORT_OPTIONS";
/// Plaintext forwarding destination for a plain server transport.
pub(crate) const ENV_ORPORT: &str = "TOR_PT_ORPORT";
/// Our ExtOrPort listener address, or empty when ExtOrPort is unused.
pub(crate) const ENV_EXTENDED_SERVER_PORT: &str = "TOR_PT_EXTENDED_SERVER_PORT";
/// Path of the ExtOrPort auth cookie file.
pub(crate) const ENV_AUTH_COOKIE_FILE: &str = "TOR_PT_AUTH_COOKIE_FILE";

/// Every variable this crate manages.
///
/// All of these are scrubbed from the child's environment before the
/// per-run values are applied, so a transport can never see a stale
/// setting inherited from our own environment.
const ALL_MANAGED_ENV: &[&str] = &[
    ENV_MANAGED_TRANSPORT_VER,
    ENV_STATE_LOCATION,
    ENV_EXIT_ON_STDIN_CLOSE,
    ENV_CLIENT_TRANSPORTS,
    ENV_PROXY,
    ENV_SERVER_TRANSPORTS,
    ENV_SERVER_BINDADDR,
    ENV_SERVER_TRANSPORT_OPTIONS,
    ENV_ORPORT,
    ENV_EXTENDED_SERVER_PORT,
    ENV_AUTH_COOKIE_FILE,
];

/// The set of `TOR_PT_*` variables for one run of a transport.
///
/// The rest of the parent environment (PATH, loader variables, and so
/// on) is inherited unchanged.
pub(crate) struct PtEnv {
    /// Variables to set, in insertion order.
    vars: Vec<(&'static str, String)>,
}

impl PtEnv {
    /// Build the environment every adapter needs.
    pub(crate) fn new(state_dir: &Path, exit_on_stdin_close: bool) -> Self {
        let mut env = PtEnv { vars: Vec::new() };
        env.set(ENV_MANAGED_TRANSPORT_VER, "1");
        env.set(ENV_STATE_LOCATION, state_dir.to_string_lossy());
        env.set(
            ENV_EXIT_ON_STDIN_CLOSE,
            if exit_on_stdin_close { "1" } else { "0" },
        );
        env
    }

    /// Add one variable.
    pub(crate) fn set(&mut self, key: &'static str, value: impl Into<String>) {
        self.vars.push((key, value.into()));
    }
}

/// One parsed line of transport stdout.
///
/// The line grammar is `KEYWORD (SP OPTARG)*`; we recognize exactly the
/// keywords of pt-spec.txt §3.3 and report everything else as
/// [`Unknown`](PtMessage::Unknown).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PtMessage {
    /// `VERSION`: the negotiated managed-proxy version.
    Version(String),
    /// `VERSION-ERROR`: no offered version was usable.
    VersionError(String),
    /// `ENV-ERROR`: the environment we built was rejected.
    EnvError(String),
    /// `PROXY DONE`: the upstream proxy was accepted.
    ProxyDone,
    /// `PROXY-ERROR`: the upstream proxy was rejected.
    ProxyError(String),
    /// `CMETHOD`: a client transport is listening.
    ClientMethod {
        /// Transport name.
        transport: String,
        /// Proxy protocol spoken on the port, e.g. "socks5".
        scheme: String,
        /// Listening host.
        host: String,
        /// Listening port.
        port: u16,
    },
    /// `CMETHOD-ERROR`: a client transport failed to initialize.
    ClientMethodError {
        /// Transport name.
        transport: String,
        /// Error message, verbatim.
        message: String,
    },
    /// `CMETHODS DONE`: client initialization finished.
    ClientMethodsDone,
    /// `SMETHOD`: a server transport is listening.
    ServerMethod {
        /// Transport name.
        transport: String,
        /// Listening host.
        host: String,
        /// Listening port.
        port: u16,
        /// Any options, e.g. an `ARGS:` list, verbatim.
        options: Option<String>,
    },
    /// `SMETHOD-ERROR`: a server transport failed to initialize.
    ServerMethodError {
        /// Transport name.
        transport: String,
        /// Error message, verbatim.
        message: String,
    },
    /// `SMETHODS DONE`: server initialization finished.
    ServerMethodsDone,
    /// A keyword we do not consume.
    Unknown {
        /// The keyword.
        keyword: String,
        /// The rest of the line.
        args: String,
    },
}

impl PtMessage {
    /// Parse one stdout line (already stripped of its newline).
    pub(crate) fn parse(line: &str) -> Result<PtMessage> {
        if line.contains('\0') {
            return Err(Error::Protocol(format!(
                "NUL byte in PT stdout line {:?}",
                line
            )));
        }
        let (keyword, args) = match line.split_once(' ') {
            Some((keyword, args)) => (keyword, args),
            None => (line, ""),
        };
        if keyword.is_empty()
            || !keyword
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(Error::Protocol(format!(
                "invalid keyword in PT stdout line {:?}",
                line
            )));
        }
        let bad_line = || Error::Protocol(format!("malformed {} line: {:?}", keyword, line));
        Ok(match keyword {
            "VERSION" => PtMessage::Version(args.to_string()),
            "VERSION-ERROR" => PtMessage::VersionError(args.to_string()),
            "ENV-ERROR" => PtMessage::EnvError(args.to_string()),
            "PROXY" => {
                if args == "DONE" {
                    PtMessage::ProxyDone
                } else {
                    return Err(bad_line());
                }
            }
            "PROXY-ERROR" => PtMessage::ProxyError(args.to_string()),
            "CMETHOD" => {
                let mut parts = args.splitn(3, ' ');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(transport), Some(scheme), Some(hostport))
                        if !transport.is_empty() && !scheme.is_empty() =>
                    {
                        let (host, port) =
                            argstr::parse_hostport(hostport).map_err(|_| bad_line())?;
                        PtMessage::ClientMethod {
                            transport: transport.to_string(),
                            scheme: scheme.to_string(),
                            host,
                            port,
                        }
                    }
                    _ => return Err(bad_line()),
                }
            }
            "CMETHOD-ERROR" => {
                let (transport, message) = args.split_once(' ').unwrap_or((args, ""));
                PtMessage::ClientMethodError {
                    transport: transport.to_string(),
                    message: message.to_string(),
                }
            }
            "CMETHODS" => {
                if args == "DONE" {
                    PtMessage::ClientMethodsDone
                } else {
                    return Err(bad_line());
                }
            }
            "SMETHOD" => {
                let mut parts = args.splitn(3, ' ');
                match (parts.next(), parts.next()) {
                    (Some(transport), Some(hostport)) if !transport.is_empty() => {
                        let (host, port) =
                            argstr::parse_hostport(hostport).map_err(|_| bad_line())?;
                        let options = parts
                            .next()
                            .filter(|options| !options.is_empty())
                            .map(str::to_string);
                        PtMessage::ServerMethod {
                            transport: transport.to_string(),
                            host,
                            port,
                            options,
                        }
                    }
                    _ => return Err(bad_line()),
                }
            }
            "SMETHOD-ERROR" => {
                let (transport, message) = args.split_once(' ').unwrap_or((args, ""));
                PtMessage::ServerMethodError {
                    transport: transport.to_string(),
                    message: message.to_string(),
                }
            }
            "SMETHODS" => {
                if args == "DONE" {
                    PtMessage::ServerMethodsDone
                } else {
                    return Err(bad_line());
                }
            }
            _ => PtMessage::Unknown {
                keyword: keyword.to_string(),
                args: args.to_string(),
            },
        })
    }
}

/// What the stdout loop should do after a message has been handled.
pub(crate) enum Flow {
    /// Keep reading.
    Continue,
    /// Initialization is complete; release anyone waiting on readiness.
    Ready,
}

/// Per-adapter handling of parsed stdout messages.
///
/// A fatal condition is reported by returning an error; the stdout loop
/// keeps reading afterwards (later lines may still be worth logging),
/// but the adapter's readiness is resolved with the failure.
pub(crate) trait PtDispatcher: Send + 'static {
    /// Handle one message.
    fn dispatch(&mut self, msg: PtMessage) -> Result<Flow>;
}

/// Dispatch state every adapter shares.
#[derive(Default)]
pub(crate) struct CommonState {
    /// The version the transport accepted, if any yet.
    accepted_version: Option<String>,
    /// Whether a `*METHODS DONE` line has been seen.
    ready_seen: bool,
}

impl CommonState {
    /// Handle the messages that mean the same thing to every adapter.
    pub(crate) fn handle(&mut self, msg: PtMessage) -> Result<Flow> {
        match msg {
            PtMessage::Version(version) => {
                if self.accepted_version.is_some() {
                    return Err(Error::Protocol("PT sent VERSION twice".to_string()));
                }
                debug!("PT accepted version {:?}", version);
                self.accepted_version = Some(version);
                Ok(Flow::Continue)
            }
            PtMessage::VersionError(message) => Err(Error::VersionError(message)),
            PtMessage::EnvError(message) => Err(Error::EnvError(message)),
            PtMessage::Unknown { keyword, args } => {
                info!("PT stdout unknown keyword {:?}, args {:?}", keyword, args);
                Ok(Flow::Continue)
            }
            other => {
                // A recognized keyword that makes no sense for this kind
                // of adapter, e.g. SMETHOD from a client transport.
                info!("PT stdout unexpected message {:?}", other);
                Ok(Flow::Continue)
            }
        }
    }

    /// Record a `*METHODS DONE` line; `what` names it for error messages.
    pub(crate) fn mark_ready(&mut self, what: &str) -> Result<Flow> {
        if self.ready_seen {
            return Err(Error::Protocol(format!("PT sent {} twice", what)));
        }
        self.ready_seen = true;
        debug!("PT initialization complete");
        Ok(Flow::Ready)
    }
}

/// Read and dispatch transport stdout until EOF.
///
/// Lines are decoded as ASCII with lossy fallback.  The first `Ready`
/// outcome or failure resolves `ready_tx`; anything after that is only
/// logged.  Stdout EOF before readiness is itself a failure.
pub(crate) async fn run_stdout_loop<D: PtDispatcher>(
    stdout: ChildStdout,
    mut dispatcher: D,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let mut reader = BufReader::new(stdout);
    let mut ready_tx = Some(ready_tx);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = match reader.read_until(b'\n', &mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!("error reading PT stdout: {}", e);
                0
            }
        };
        if n == 0 {
            break;
        }
        let decoded = String::from_utf8_lossy(&buf);
        let line = decoded.trim();
        debug!("PT stdout: {:?}", line);
        if line.is_empty() {
            continue;
        }
        match PtMessage::parse(line).and_then(|msg| dispatcher.dispatch(msg)) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Ready) => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Err(e) => {
                error!("error processing PT stdout line {:?}: {}", line, e);
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(e));
                }
            }
        }
    }
    debug!("PT stdout at EOF");
    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(Err(Error::StdoutClosed));
    }
}

/// Timeouts used by an adapter.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PtTimeouts {
    /// How long to wait for the transport to exit after closing its stdin.
    pub stdin_close: Duration,
    /// How long to wait for the transport to exit after asking it to
    /// terminate.
    pub terminate: Duration,
    /// How long to wait for a TCP connection to a transport's proxy port.
    pub connect: Duration,
}

impl Default for PtTimeouts {
    fn default() -> Self {
        PtTimeouts {
            stdin_close: Duration::from_secs(2),
            terminate: Duration::from_secs(2),
            connect: Duration::from_secs(3),
        }
    }
}

/// The lifecycle state of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AdapterStatus {
    /// Built, not yet started.
    Created,
    /// `start()` is underway.
    Starting,
    /// The transport finished initializing.
    Ready,
    /// `stop()` is underway.
    Stopping,
    /// `stop()` finished.
    Stopped,
    /// A fatal error took the adapter down.
    Failed,
}

/// Where the transport keeps its state.
pub(crate) enum StateDir {
    /// A caller-owned path; never deleted by us.
    Caller(PathBuf),
    /// An adapter-owned temporary directory, allocated at start and
    /// removed at stop.
    Temp(Option<tempfile::TempDir>),
}

impl StateDir {
    /// Wrap an optional caller-supplied path.
    pub(crate) fn new(path: Option<PathBuf>) -> Self {
        match path {
            Some(path) => StateDir::Caller(path),
            None => StateDir::Temp(None),
        }
    }

    /// Make the directory usable and return its absolute path.
    ///
    /// A caller-supplied path is only absolutized; the transport itself
    /// creates it on demand.
    pub(crate) fn prepare(&mut self) -> Result<PathBuf> {
        match self {
            StateDir::Caller(path) => {
                let abs = std::path::absolute(&*path)
                    .map_err(|e| Error::StateDir(Arc::new(e)))?;
                *path = abs.clone();
                Ok(abs)
            }
            StateDir::Temp(dir) => {
                if dir.is_none() {
                    let created = tempfile::Builder::new()
                        .prefix("ptadapter-state-")
                        .tempdir()
                        .map_err(|e| Error::StateDir(Arc::new(e)))?;
                    debug!("created temporary state directory {:?}", created.path());
                    *dir = Some(created);
                }
                Ok(dir
                    .as_ref()
                    .expect("just created the tempdir")
                    .path()
                    .to_path_buf())
            }
        }
    }

    /// The current path, if there is one.
    pub(crate) fn path(&self) -> Option<PathBuf> {
        match self {
            StateDir::Caller(path) => Some(path.clone()),
            StateDir::Temp(dir) => dir.as_ref().map(|d| d.path().to_path_buf()),
        }
    }

    /// Delete an adapter-owned temporary directory, if one exists.
    pub(crate) fn cleanup(&mut self) {
        if let StateDir::Temp(dir) = self {
            if let Some(dir) = dir.take() {
                let path = dir.path().to_path_buf();
                if let Err(e) = dir.close() {
                    warn!("could not remove state directory {:?}: {}", path, e);
                }
            }
        }
    }
}

/// A running pluggable-transport child process.
pub(crate) struct PtProcess {
    /// The child itself.
    child: Child,
    /// Its stdin, held open so that closing it is meaningful.
    stdin: Option<ChildStdin>,
    /// Whether closing stdin asks the child to exit.
    exit_on_stdin_close: bool,
}

impl PtProcess {
    /// Spawn `exec` with the given environment.
    ///
    /// Stdin and stdout are piped (the stdout end is returned for the
    /// reader task); stderr is inherited so transport diagnostics land
    /// with ours.
    pub(crate) fn spawn(
        exec: &[String],
        env: &PtEnv,
        exit_on_stdin_close: bool,
    ) -> Result<(PtProcess, ChildStdout)> {
        let (program, args) = exec.split_first().ok_or(Error::EmptyCommandLine)?;
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for var in ALL_MANAGED_ENV {
            command.env_remove(var);
        }
        for (key, value) in &env.vars {
            command.env(key, value);
        }
        debug!("starting PT subprocess {:?}", exec);
        let mut child = command.spawn().map_err(|e| Error::Spawn {
            exe: program.clone(),
            cause: Arc::new(e),
        })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().expect("stdout was piped");
        Ok((
            PtProcess {
                child,
                stdin,
                exit_on_stdin_close,
            },
            stdout,
        ))
    }

    /// Block until the child exits.
    pub(crate) async fn wait(&mut self) -> Result<ExitStatus> {
        self.child
            .wait()
            .await
            .map_err(|e| Error::Wait(Arc::new(e)))
    }

    /// Run the shutdown ladder: close stdin, terminate, kill.
    ///
    /// Each of the first two rungs waits up to its configured timeout;
    /// the final kill waits unbounded (nothing survives SIGKILL).
    pub(crate) async fn shutdown(&mut self, timeouts: &PtTimeouts) {
        if self.exit_on_stdin_close {
            debug!("closing PT stdin");
            drop(self.stdin.take());
            if wait_with_timeout(&mut self.child, timeouts.stdin_close).await {
                debug!("PT exited after stdin close");
                return;
            }
        }
        debug!("asking PT to terminate");
        self.terminate();
        if wait_with_timeout(&mut self.child, timeouts.terminate).await {
            debug!("PT exited after terminate");
            return;
        }
        warn!("killing PT");
        if let Err(e) = self.child.start_kill() {
            debug!("could not kill PT (already exited?): {}", e);
        }
        match self.child.wait().await {
            Ok(status) => debug!("PT exited with {}", status),
            Err(e) => warn!("error waiting for killed PT: {}", e),
        }
    }

    /// Politely ask the child to exit.
    ///
    /// On Unix this is SIGTERM; elsewhere there is no polite signal, so
    /// it falls through to a hard kill.
    fn terminate(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: plain syscall on a pid we own; no memory involved.
            let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            return;
        }
        if let Err(e) = self.child.start_kill() {
            debug!("could not kill PT (already exited?): {}", e);
        }
    }
}

/// Wait up to `limit` for `child` to exit.
async fn wait_with_timeout(child: &mut Child, limit: Duration) -> bool {
    matches!(timeout(limit, child.wait()).await, Ok(Ok(_)))
}

/// The supervisor at the base of every adapter.
///
/// Owns the child process, the stdout task and the state directory, and
/// tracks the adapter lifecycle.  The adapters wrap this with their own
/// environment assembly and message dispatch.
pub(crate) struct Supervisor {
    /// Command line of the transport executable.
    exec: Vec<String>,
    /// Where the transport keeps its state.
    state: StateDir,
    /// Whether closing the child's stdin asks it to exit.
    exit_on_stdin_close: bool,
    /// Configurable timeouts.
    timeouts: PtTimeouts,
    /// Current lifecycle state.
    status: AdapterStatus,
    /// The running child, if any.
    process: Option<PtProcess>,
    /// The stdout-reading task, if any.
    stdout_task: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Create a supervisor for `exec`, storing state in `state` (or a
    /// temporary directory if `None`).
    pub(crate) fn new(exec: Vec<String>, state: Option<PathBuf>) -> Result<Self> {
        if exec.is_empty() {
            return Err(Error::EmptyCommandLine);
        }
        Ok(Supervisor {
            exec,
            state: StateDir::new(state),
            exit_on_stdin_close: true,
            timeouts: PtTimeouts::default(),
            status: AdapterStatus::Created,
            process: None,
            stdout_task: None,
        })
    }

    /// The adapter's lifecycle state.
    pub(crate) fn status(&self) -> AdapterStatus {
        self.status
    }

    /// The configured timeouts.
    pub(crate) fn timeouts(&self) -> &PtTimeouts {
        &self.timeouts
    }

    /// Replace the configured timeouts.  Only affects future operations.
    pub(crate) fn set_timeouts(&mut self, timeouts: PtTimeouts) {
        self.timeouts = timeouts;
    }

    /// Whether closing the child's stdin asks it to exit.
    pub(crate) fn exit_on_stdin_close(&self) -> bool {
        self.exit_on_stdin_close
    }

    /// Configure whether closing the child's stdin asks it to exit.
    /// Must be set before `start()`.
    pub(crate) fn set_exit_on_stdin_close(&mut self, exit: bool) {
        self.exit_on_stdin_close = exit;
    }

    /// The state directory, if it exists yet.
    pub(crate) fn state_dir(&self) -> Option<PathBuf> {
        self.state.path()
    }

    /// Fail unless the adapter has never been started.
    pub(crate) fn check_not_started(&self) -> Result<()> {
        match self.status {
            AdapterStatus::Created => Ok(()),
            _ => Err(Error::AlreadyStarted),
        }
    }

    /// Fail unless the adapter is starting or ready.
    pub(crate) fn check_running(&self) -> Result<()> {
        match self.status {
            AdapterStatus::Created => Err(Error::NotStarted),
            AdapterStatus::Starting | AdapterStatus::Ready => Ok(()),
            AdapterStatus::Stopping | AdapterStatus::Stopped | AdapterStatus::Failed => {
                Err(Error::NotRunning)
            }
        }
    }

    /// Flip `Created` into `Starting` and hand back the state path.
    pub(crate) fn begin_start(&mut self) -> Result<PathBuf> {
        self.check_not_started()?;
        self.status = AdapterStatus::Starting;
        match self.state.prepare() {
            Ok(path) => Ok(path),
            Err(e) => {
                self.status = AdapterStatus::Failed;
                Err(e)
            }
        }
    }

    /// Spawn the child and drive it to readiness.
    ///
    /// Returns once the transport has reported `*METHODS DONE`, or with
    /// the fatal error otherwise; in the failure case the shutdown
    /// ladder has already run.
    pub(crate) async fn launch<D: PtDispatcher>(
        &mut self,
        env: PtEnv,
        dispatcher: D,
    ) -> Result<()> {
        debug_assert_eq!(self.status, AdapterStatus::Starting);
        let (process, stdout) =
            match PtProcess::spawn(&self.exec, &env, self.exit_on_stdin_close) {
                Ok(spawned) => spawned,
                Err(e) => {
                    self.status = AdapterStatus::Failed;
                    self.state.cleanup();
                    return Err(e);
                }
            };
        self.process = Some(process);
        let (ready_tx, ready_rx) = oneshot::channel();
        self.stdout_task = Some(tokio::spawn(run_stdout_loop(stdout, dispatcher, ready_tx)));
        let ready = match ready_rx.await {
            Ok(result) => result,
            // The stdout task never drops its sender without resolving
            // it, so this only happens if that task panicked.
            Err(_) => Err(Error::StdoutClosed),
        };
        match ready {
            Ok(()) => {
                self.status = AdapterStatus::Ready;
                Ok(())
            }
            Err(e) => {
                self.shutdown_process().await;
                self.state.cleanup();
                self.status = AdapterStatus::Failed;
                Err(e)
            }
        }
    }

    /// Run the shutdown ladder and reap the stdout task.
    async fn shutdown_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.shutdown(&self.timeouts).await;
        }
        if let Some(task) = self.stdout_task.take() {
            // The task finishes on its own once the child is gone and
            // stdout reaches EOF.
            let _ = task.await;
        }
    }

    /// Stop the transport.
    pub(crate) async fn stop(&mut self) -> Result<()> {
        self.check_running()?;
        self.status = AdapterStatus::Stopping;
        self.shutdown_process().await;
        self.state.cleanup();
        self.status = AdapterStatus::Stopped;
        Ok(())
    }

    /// Block until the transport process exits.
    pub(crate) async fn wait(&mut self) -> Result<ExitStatus> {
        if matches!(self.status, AdapterStatus::Created) {
            return Err(Error::NotStarted);
        }
        match self.process.as_mut() {
            Some(process) => process.wait().await,
            None => Err(Error::NotRunning),
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn parse_lifecycle_lines() {
        assert_eq!(
            PtMessage::parse("VERSION 1").unwrap(),
            PtMessage::Version("1".to_string())
        );
        assert_eq!(
            PtMessage::parse("VERSION-ERROR no-version").unwrap(),
            PtMessage::VersionError("no-version".to_string())
        );
        assert_eq!(
            PtMessage::parse("ENV-ERROR missing TOR_PT_STATE_LOCATION").unwrap(),
            PtMessage::EnvError("missing TOR_PT_STATE_LOCATION".to_string())
        );
        assert_eq!(PtMessage::parse("PROXY DONE").unwrap(), PtMessage::ProxyDone);
        assert!(PtMessage::parse("PROXY HALF-DONE").is_err());
    }

    #[test]
    fn parse_cmethod_lines() {
        assert_eq!(
            PtMessage::parse("CMETHOD obfs4 socks5 127.0.0.1:54321").unwrap(),
            PtMessage::ClientMethod {
                transport: "obfs4".to_string(),
                scheme: "socks5".to_string(),
                host: "127.0.0.1".to_string(),
                port: 54321,
            }
        );
        assert_eq!(
            PtMessage::parse("CMETHOD-ERROR obfs4 no such transport").unwrap(),
            PtMessage::ClientMethodError {
                transport: "obfs4".to_string(),
                message: "no such transport".to_string(),
            }
        );
        assert_eq!(
            PtMessage::parse("CMETHODS DONE").unwrap(),
            PtMessage::ClientMethodsDone
        );
        assert!(PtMessage::parse("CMETHOD obfs4 socks5").is_err());
        assert!(PtMessage::parse("CMETHOD obfs4 socks5 nonsense").is_err());
        assert!(PtMessage::parse("CMETHODS NOT-DONE").is_err());
    }

    #[test]
    fn parse_smethod_lines() {
        assert_eq!(
            PtMessage::parse("SMETHOD obfs4 0.0.0.0:443").unwrap(),
            PtMessage::ServerMethod {
                transport: "obfs4".to_string(),
                host: "0.0.0.0".to_string(),
                port: 443,
                options: None,
            }
        );
        assert_eq!(
            PtMessage::parse(r"SMETHOD obfs4 0.0.0.0:443 ARGS:cert=abc\,def,iat-mode=0")
                .unwrap(),
            PtMessage::ServerMethod {
                transport: "obfs4".to_string(),
                host: "0.0.0.0".to_string(),
                port: 443,
                options: Some(r"ARGS:cert=abc\,def,iat-mode=0".to_string()),
            }
        );
        assert_eq!(
            PtMessage::parse("SMETHODS DONE").unwrap(),
            PtMessage::ServerMethodsDone
        );
        assert!(PtMessage::parse("SMETHOD obfs4").is_err());
    }

    #[test]
    fn parse_rejects_garbage() {
        // Keyword characters are restricted.
        assert!(PtMessage::parse("CMÉTHOD x").is_err());
        assert!(PtMessage::parse("CMETHOD: x").is_err());
        // NUL bytes are rejected outright.
        assert!(PtMessage::parse("VERSION 1\0").is_err());
        // Unknown keywords are fine.
        assert_eq!(
            PtMessage::parse("LOG SEVERITY=debug MESSAGE=hi").unwrap(),
            PtMessage::Unknown {
                keyword: "LOG".to_string(),
                args: "SEVERITY=debug MESSAGE=hi".to_string(),
            }
        );
    }

    #[test]
    fn common_state_version_handling() {
        let mut common = CommonState::default();
        assert!(matches!(
            common.handle(PtMessage::Version("1".to_string())),
            Ok(Flow::Continue)
        ));
        assert!(common.handle(PtMessage::Version("1".to_string())).is_err());
        assert!(common
            .handle(PtMessage::VersionError("nope".to_string()))
            .is_err());
    }

    #[test]
    fn ready_only_once() {
        let mut common = CommonState::default();
        assert!(matches!(common.mark_ready("CMETHODS DONE"), Ok(Flow::Ready)));
        assert!(common.mark_ready("CMETHODS DONE").is_err());
    }
}
