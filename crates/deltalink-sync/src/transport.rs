//! Line transport over TCP.
//!
//! One serialized delta per `\n`-terminated UTF-8 line. The listener side
//! writes its endpoint's outgoing deltas to the single peer it accepts;
//! the connector side reads lines and submits them to its endpoint. With
//! [`TransportConfig::duplex`] both sides read and write.
//!
//! The link lives at most once: when the connection ends the transport
//! threads exit and nothing reconnects.

use std::fmt;
use std::io::{self, BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::endpoint::DeltaEndpoint;
use crate::error::{Result, SyncError};

/// Well-known port of the replication link.
pub const DEFAULT_PORT: u16 = 55055;

/// Address a listener binds by default: every interface.
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Bound on the connection that wakes a listener blocked in `accept`.
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Which end of the link this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Listens, accepts one peer and sends deltas.
    Server,
    /// Connects to the listener and receives deltas.
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }

    /// Parse an optional configured role; absence is an error.
    pub fn from_config(value: Option<&str>) -> Result<Self> {
        value
            .ok_or_else(|| SyncError::InvalidRole("<unset>".into()))?
            .parse()
    }
}

impl FromStr for Role {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            other => Err(SyncError::InvalidRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub role: Role,
    /// Address a client connects to.
    pub host: String,
    /// Address a server listens on.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    pub port: u16,
    /// Pause before listening or connecting.
    pub startup_delay: Duration,
    /// Connection attempts before giving up on a refused connection.
    pub connect_attempts: u32,
    /// Pause between connection attempts.
    pub retry_interval: Duration,
    /// Send and receive on both ends.
    pub duplex: bool,
}

impl TransportConfig {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            host: "localhost".to_string(),
            bind_host: default_bind_host(),
            port: DEFAULT_PORT,
            startup_delay: Duration::from_secs(1),
            connect_attempts: 1,
            retry_interval: Duration::from_millis(250),
            duplex: false,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_duplex(mut self, duplex: bool) -> Self {
        self.duplex = duplex;
        self
    }

    /// The address a client connects to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_bind_host() -> String {
    DEFAULT_BIND_HOST.to_string()
}

/// Line and byte counters of one link.
#[derive(Debug, Default)]
pub struct LinkStats {
    lines_in: AtomicU64,
    lines_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl LinkStats {
    pub fn lines_in(&self) -> u64 {
        self.lines_in.load(Ordering::Relaxed)
    }

    pub fn lines_out(&self) -> u64 {
        self.lines_out.load(Ordering::Relaxed)
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    fn record_in(&self, line: &str) {
        self.lines_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(line.len() as u64, Ordering::Relaxed);
    }

    fn record_out(&self, line: &str) {
        self.lines_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(line.len() as u64, Ordering::Relaxed);
    }
}

/// State shared between the handle and the transport threads.
struct Link {
    name: String,
    endpoint: Arc<dyn DeltaEndpoint>,
    shutdown: AtomicBool,
    /// Disconnected when the link stops.
    cancel: Receiver<()>,
    cancel_tx: Mutex<Option<Sender<()>>>,
    /// Set while the listener may still be blocked in `accept`.
    listener: Mutex<Option<SocketAddr>>,
    socket: Mutex<Option<TcpStream>>,
    stats: LinkStats,
}

impl Link {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`; false if shutdown was requested meanwhile.
    fn pause(&self, duration: Duration) -> bool {
        match self.cancel.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => !self.is_shutdown(),
            _ => false,
        }
    }

    /// Stop every blocked wait of this link: pauses, the outgoing pull,
    /// socket reads and a pending `accept`.
    fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cancel_tx.lock().take();
        self.close_socket();
        self.wake_listener();
    }

    fn wake_listener(&self) {
        let Some(mut addr) = self.listener.lock().take() else {
            return;
        };
        if addr.ip().is_unspecified() {
            match addr {
                SocketAddr::V4(_) => addr.set_ip(Ipv4Addr::LOCALHOST.into()),
                SocketAddr::V6(_) => addr.set_ip(Ipv6Addr::LOCALHOST.into()),
            }
        }
        if let Err(e) = TcpStream::connect_timeout(&addr, WAKE_TIMEOUT) {
            debug!(endpoint = %self.name, %addr, error = %e, "listener not woken");
        }
    }

    fn close_socket(&self) {
        if let Some(socket) = self.socket.lock().as_ref() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    /// Remember the connected socket; false if shutdown already started.
    fn attach(&self, stream: &TcpStream) -> io::Result<bool> {
        *self.socket.lock() = Some(stream.try_clone()?);
        if self.is_shutdown() {
            self.close_socket();
            return Ok(false);
        }
        Ok(true)
    }
}

/// Starts the line transport for one role.
pub struct TcpTransport {
    config: TransportConfig,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Start the transport thread for the configured role.
    ///
    /// The listener socket is bound before this returns, so
    /// [`TransportHandle::local_addr`] is known even with port 0.
    pub fn start<E>(self, endpoint: Arc<E>) -> Result<TransportHandle>
    where
        E: DeltaEndpoint + 'static,
    {
        let config = self.config;
        let role = config.role;
        let (cancel_tx, cancel_rx) = channel::bounded(0);
        let link = Arc::new(Link {
            name: endpoint.name().to_string(),
            endpoint,
            shutdown: AtomicBool::new(false),
            cancel: cancel_rx,
            cancel_tx: Mutex::new(Some(cancel_tx)),
            listener: Mutex::new(None),
            socket: Mutex::new(None),
            stats: LinkStats::default(),
        });

        let (thread_name, local_addr, run): (_, _, Box<dyn FnOnce() -> Result<()> + Send>) =
            match config.role {
                Role::Server => {
                    let listener = TcpListener::bind((config.bind_host.as_str(), config.port))?;
                    let local_addr = listener.local_addr()?;
                    *link.listener.lock() = Some(local_addr);
                    info!(endpoint = %link.name, %local_addr, "listening");
                    let link = Arc::clone(&link);
                    let config = config.clone();
                    (
                        "deltalink-server",
                        Some(local_addr),
                        Box::new(move || run_server(&link, &config, listener)),
                    )
                }
                Role::Client => {
                    let link = Arc::clone(&link);
                    let config = config.clone();
                    (
                        "deltalink-client",
                        None,
                        Box::new(move || run_client(&link, &config)),
                    )
                }
            };

        let thread_link = Arc::clone(&link);
        let join = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                let result = run();
                thread_link.stop();
                match &result {
                    Ok(()) => debug!(endpoint = %thread_link.name, %role, "transport finished"),
                    Err(SyncError::ConnectionRefused(addr)) => {
                        info!(endpoint = %thread_link.name, %addr, "no listener, transport not started")
                    }
                    Err(e) => error!(endpoint = %thread_link.name, %role, error = %e, "transport failed"),
                }
                result
            })?;

        Ok(TransportHandle {
            role,
            local_addr,
            link,
            join: Mutex::new(Some(join)),
        })
    }
}

/// Handle to a running transport.
pub struct TransportHandle {
    role: Role,
    local_addr: Option<SocketAddr>,
    link: Arc<Link>,
    join: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl TransportHandle {
    pub fn role(&self) -> Role {
        self.role
    }

    /// Bound address of a listener; `None` for a connector.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> &LinkStats {
        &self.link.stats
    }

    /// The transport thread has exited.
    pub fn is_finished(&self) -> bool {
        self.join
            .lock()
            .as_ref()
            .map_or(true, |join| join.is_finished())
    }

    /// Stop the transport and close its socket. Does not wait.
    pub fn shutdown(&self) {
        debug!(endpoint = %self.link.name, role = %self.role, "transport shutdown requested");
        self.link.stop();
    }

    /// Wait for the transport thread and return how it ended.
    pub fn join(&self) -> Result<()> {
        let join = self.join.lock().take();
        match join {
            Some(join) => join
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("transport thread panicked").into())),
            None => Ok(()),
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("role", &self.role)
            .field("local_addr", &self.local_addr)
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

fn run_server(link: &Arc<Link>, config: &TransportConfig, listener: TcpListener) -> Result<()> {
    if !link.pause(config.startup_delay) {
        return Ok(());
    }

    let accepted = listener.accept();
    link.listener.lock().take();
    drop(listener);
    if link.is_shutdown() {
        return Ok(());
    }
    let (stream, peer) = accepted?;
    info!(endpoint = %link.name, %peer, "peer connected");
    serve(link, config, stream, Direction::Write)
}

fn run_client(link: &Arc<Link>, config: &TransportConfig) -> Result<()> {
    if !link.pause(config.startup_delay) {
        return Ok(());
    }

    let address = config.address();
    let attempts = config.connect_attempts.max(1);
    let mut attempt = 1;
    let stream = loop {
        match TcpStream::connect((config.host.as_str(), config.port)) {
            Ok(stream) => break stream,
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                if attempt >= attempts {
                    return Err(SyncError::ConnectionRefused(address));
                }
                debug!(endpoint = %link.name, %address, attempt, "connection refused, retrying");
                attempt += 1;
                if !link.pause(config.retry_interval) {
                    return Ok(());
                }
            }
            Err(e) => return Err(e.into()),
        }
    };
    info!(endpoint = %link.name, %address, "connected");
    serve(link, config, stream, Direction::Read)
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Read,
    Write,
}

/// Run the primary direction on this thread and, for a duplex link, the
/// other direction on a helper thread.
fn serve(
    link: &Arc<Link>,
    config: &TransportConfig,
    stream: TcpStream,
    primary: Direction,
) -> Result<()> {
    if !link.attach(&stream)? {
        return Ok(());
    }

    let helper = if config.duplex {
        let secondary = match primary {
            Direction::Read => Direction::Write,
            Direction::Write => Direction::Read,
        };
        let helper_link = Arc::clone(link);
        let helper_stream = stream.try_clone()?;
        let name = format!("deltalink-{}-{secondary:?}", config.role).to_lowercase();
        Some(thread::Builder::new().name(name).spawn(move || {
            let result = pump(&helper_link, helper_stream, secondary);
            helper_link.stop();
            result
        })?)
    } else {
        None
    };

    let result = pump(link, stream, primary);
    link.stop();

    let helper_result = match helper {
        Some(helper) => helper
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("transport helper panicked").into())),
        None => Ok(()),
    };
    result.and(helper_result)
}

fn pump(link: &Link, stream: TcpStream, direction: Direction) -> Result<()> {
    let result = match direction {
        Direction::Read => read_lines(link, stream),
        Direction::Write => write_lines(link, stream),
    };
    match result {
        Err(SyncError::Io(e)) if link.is_shutdown() => {
            debug!(endpoint = %link.name, error = %e, "socket closed during shutdown");
            Ok(())
        }
        other => other,
    }
}

fn read_lines(link: &Link, stream: TcpStream) -> Result<()> {
    for line in BufReader::new(stream).lines() {
        let line = line?;
        link.stats.record_in(&line);
        link.endpoint.submit_incoming(line)?;
    }
    debug!(endpoint = %link.name, "peer closed the connection");
    Ok(())
}

fn write_lines(link: &Link, stream: TcpStream) -> Result<()> {
    let mut out = BufWriter::new(stream);
    loop {
        let line = match link.endpoint.pull_next_outgoing_or_cancel(&link.cancel) {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(SyncError::OutgoingClosed) => {
                debug!(endpoint = %link.name, "outgoing queue closed");
                break;
            }
            Err(e) => return Err(e),
        };
        if line.contains('\n') {
            warn!(endpoint = %link.name, "dropping delta with embedded newline");
            continue;
        }
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()?;
        link.stats.record_out(&line);
    }
    Ok(())
}

/// An in-process link for tests and demos.
///
/// Pumps serialized deltas between endpoints on background threads, the
/// way the TCP transport would, without sockets.
pub mod memory {
    use super::*;

    /// Options for a [`MemoryLink`].
    #[derive(Debug, Clone, Default)]
    pub struct MemoryLinkConfig {
        /// Simulated latency added before each delivery.
        pub delay: Option<Duration>,
    }

    /// Background pumps between endpoints.
    pub struct MemoryLink {
        /// Dropped to stop the pumps.
        cancel: Option<Sender<()>>,
        pumps: Vec<JoinHandle<()>>,
    }

    impl MemoryLink {
        /// Deliver `from`'s outgoing deltas to `to`.
        pub fn one_way(
            from: Arc<dyn DeltaEndpoint>,
            to: Arc<dyn DeltaEndpoint>,
            config: MemoryLinkConfig,
        ) -> Result<Self> {
            let (cancel, cancelled) = channel::bounded(0);
            let pump = spawn_pump(from, to, config.delay, cancelled)?;
            Ok(Self {
                cancel: Some(cancel),
                pumps: vec![pump],
            })
        }

        /// Deliver in both directions.
        pub fn pair(
            a: Arc<dyn DeltaEndpoint>,
            b: Arc<dyn DeltaEndpoint>,
            config: MemoryLinkConfig,
        ) -> Result<Self> {
            let (cancel, cancelled) = channel::bounded(0);
            let pumps = vec![
                spawn_pump(Arc::clone(&a), Arc::clone(&b), config.delay, cancelled.clone())?,
                spawn_pump(b, a, config.delay, cancelled)?,
            ];
            Ok(Self {
                cancel: Some(cancel),
                pumps,
            })
        }

        /// Every pump has exited.
        pub fn is_finished(&self) -> bool {
            self.pumps.iter().all(|pump| pump.is_finished())
        }

        /// Stop pumping and wait for the pump threads.
        pub fn shutdown(mut self) {
            self.cancel.take();
            for pump in self.pumps.drain(..) {
                let _ = pump.join();
            }
        }
    }

    impl Drop for MemoryLink {
        fn drop(&mut self) {
            self.cancel.take();
        }
    }

    fn spawn_pump(
        from: Arc<dyn DeltaEndpoint>,
        to: Arc<dyn DeltaEndpoint>,
        delay: Option<Duration>,
        cancelled: Receiver<()>,
    ) -> Result<JoinHandle<()>> {
        let name = format!("pump-{}-{}", from.name(), to.name());
        let handle = thread::Builder::new().name(name).spawn(move || loop {
            let text = match from.pull_next_outgoing_or_cancel(&cancelled) {
                Ok(Some(text)) => text,
                Ok(None) => break,
                Err(e) => {
                    debug!(from = %from.name(), error = %e, "pump source closed");
                    break;
                }
            };
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
            if let Err(e) = to.submit_incoming(text) {
                warn!(to = %to.name(), error = %e, "pump target rejected delta");
                break;
            }
        })?;
        Ok(handle)
    }
}
