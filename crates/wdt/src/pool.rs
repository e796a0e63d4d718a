/// Connection establishment with per-port retry and timeout policy.
///
/// Receivers bind their ports up front and accept on each with
/// `accept_timeout_millis` × `max_accept_retries`; senders dial each port with
/// `connect_timeout_millis` × `max_retries`, sleeping `sleep_millis` between
/// attempts. Ports are independent: one port running out of attempts never
/// aborts another. Every established stream is tuned and registered so the
/// session can shut all of them down when it is aborted or dropped.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::error::{Result, WdtError};
use crate::options::WdtOptions;

/// Longest sleep between nonblocking accept polls.
const ACCEPT_POLL: Duration = Duration::from_millis(2);

const LISTEN_BACKLOG: i32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Connecting,
    Accepting,
    Active,
    Closed,
    Failed,
}

/// Lifecycle state of every port in a session.
#[derive(Debug, Default)]
pub struct PortStates {
    states: Mutex<Vec<(u16, ConnectionState)>>,
}

impl PortStates {
    pub fn new(ports: &[u16]) -> Self {
        PortStates {
            states: Mutex::new(ports.iter().map(|p| (*p, ConnectionState::Pending)).collect()),
        }
    }

    pub fn set(&self, port: u16, state: ConnectionState) {
        let mut states = self.states.lock();
        match states.iter_mut().find(|(p, _)| *p == port) {
            Some(entry) => entry.1 = state,
            None => states.push((port, state)),
        }
    }

    pub fn get(&self, port: u16) -> Option<ConnectionState> {
        self.states.lock().iter().find(|(p, _)| *p == port).map(|(_, s)| *s)
    }

    pub fn snapshot(&self) -> Vec<(u16, ConnectionState)> {
        self.states.lock().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    /// Total attempts, never less than one.
    pub max_attempts: u32,
    /// Sleep between failed attempts.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn for_accept(opts: &WdtOptions) -> Self {
        RetryPolicy {
            attempt_timeout: opts.accept_timeout(),
            max_attempts: opts.max_accept_retries.max(1),
            backoff: Duration::ZERO,
        }
    }

    pub fn for_dial(opts: &WdtOptions) -> Self {
        RetryPolicy {
            attempt_timeout: opts.connect_timeout(),
            max_attempts: opts.max_retries.max(1),
            backoff: Duration::from_millis(opts.sleep_millis),
        }
    }
}

/// Socket settings applied to every established stream.
#[derive(Debug, Clone, Copy)]
struct StreamTuning {
    socket_buffer_size: usize,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl StreamTuning {
    fn from_options(opts: &WdtOptions) -> Self {
        StreamTuning {
            socket_buffer_size: opts.socket_buffer_size,
            read_timeout: opts.read_timeout(),
            write_timeout: opts.write_timeout(),
        }
    }

    fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        // Accepted sockets may inherit the listener's nonblocking mode.
        stream.set_nonblocking(false)?;
        let sock_ref = SockRef::from(stream);
        sock_ref.set_nodelay(true)?;
        sock_ref.set_send_buffer_size(self.socket_buffer_size)?;
        sock_ref.set_recv_buffer_size(self.socket_buffer_size)?;
        stream.set_read_timeout(self.read_timeout)?;
        stream.set_write_timeout(self.write_timeout)?;
        Ok(())
    }
}

/// Result of establishing one port.
#[derive(Debug)]
pub struct ConnectionOutcome {
    pub port: u16,
    pub attempts_used: u32,
    pub result: Result<TcpStream>,
}

impl ConnectionOutcome {
    pub fn state(&self) -> ConnectionState {
        match self.result {
            Ok(_) => ConnectionState::Active,
            Err(_) => ConnectionState::Failed,
        }
    }
}

pub struct ConnectionPool {
    policy: RetryPolicy,
    tuning: StreamTuning,
    abort: Arc<AtomicBool>,
    streams: Mutex<Vec<(u16, TcpStream)>>,
}

impl ConnectionPool {
    pub fn for_accept(opts: &WdtOptions, abort: Arc<AtomicBool>) -> Self {
        Self::new(RetryPolicy::for_accept(opts), opts, abort)
    }

    pub fn for_dial(opts: &WdtOptions, abort: Arc<AtomicBool>) -> Self {
        Self::new(RetryPolicy::for_dial(opts), opts, abort)
    }

    fn new(policy: RetryPolicy, opts: &WdtOptions, abort: Arc<AtomicBool>) -> Self {
        ConnectionPool {
            policy,
            tuning: StreamTuning::from_options(opts),
            abort,
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Accept one connection on `listener`, which must be nonblocking.
    /// `stop` is polled between accept attempts; when it returns true the
    /// port gives up early with `Aborted`.
    pub fn accept(&self, listener: &TcpListener, port: u16, stop: impl Fn() -> bool) -> ConnectionOutcome {
        let mut attempts = 0;
        while attempts < self.policy.max_attempts {
            if self.is_aborted() || stop() {
                return self.outcome(port, attempts, Err(WdtError::Aborted));
            }
            attempts += 1;
            let deadline = Instant::now() + self.policy.attempt_timeout;
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        tracing::debug!(port, %peer, attempts, "accepted connection");
                        return self.established(port, attempts, stream);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        if self.is_aborted() || stop() {
                            return self.outcome(port, attempts, Err(WdtError::Aborted));
                        }
                        std::thread::sleep(ACCEPT_POLL.min(deadline - now));
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        tracing::debug!(port, attempt = attempts, "accept failed: {}", e);
                        break;
                    }
                }
            }
            if !self.policy.backoff.is_zero() && attempts < self.policy.max_attempts {
                std::thread::sleep(self.policy.backoff);
            }
        }
        self.outcome(port, attempts, Err(WdtError::ConnectionFailed { port, attempts }))
    }

    /// Dial `host:port`, trying every resolved address on each attempt.
    pub fn dial(&self, host: &str, port: u16) -> ConnectionOutcome {
        let mut attempts = 0;
        while attempts < self.policy.max_attempts {
            if self.is_aborted() {
                return self.outcome(port, attempts, Err(WdtError::Aborted));
            }
            attempts += 1;
            match connect_once(host, port, self.policy.attempt_timeout) {
                Ok(stream) => {
                    tracing::debug!(host, port, attempts, "connected");
                    return self.established(port, attempts, stream);
                }
                Err(e) => {
                    tracing::debug!(host, port, attempt = attempts, "connect failed: {}", e);
                }
            }
            if attempts < self.policy.max_attempts {
                std::thread::sleep(self.policy.backoff);
            }
        }
        self.outcome(port, attempts, Err(WdtError::ConnectionFailed { port, attempts }))
    }

    fn established(&self, port: u16, attempts: u32, stream: TcpStream) -> ConnectionOutcome {
        if let Err(e) = self.tuning.apply(&stream) {
            tracing::debug!(port, "socket tuning failed: {}", e);
            let _ = stream.shutdown(Shutdown::Both);
            return self.outcome(port, attempts, Err(WdtError::SocketRead(e)));
        }
        if let Err(e) = self.register(port, &stream) {
            let _ = stream.shutdown(Shutdown::Both);
            return self.outcome(port, attempts, Err(e));
        }
        self.outcome(port, attempts, Ok(stream))
    }

    fn outcome(&self, port: u16, attempts_used: u32, result: Result<TcpStream>) -> ConnectionOutcome {
        if let Err(e) = &result {
            tracing::debug!(port, attempts_used, "port not established: {}", e);
        }
        ConnectionOutcome {
            port,
            attempts_used,
            result,
        }
    }

    /// Track a stream so `shutdown_all` can reach it. A stream registered
    /// after the pool was aborted is refused.
    pub fn register(&self, port: u16, stream: &TcpStream) -> Result<()> {
        let handle = stream.try_clone().map_err(WdtError::SocketRead)?;
        let mut streams = self.streams.lock();
        if self.is_aborted() {
            return Err(WdtError::Aborted);
        }
        streams.push((port, handle));
        Ok(())
    }

    /// Shut down and forget the stream registered for `port`.
    pub fn close(&self, port: u16) {
        let mut streams = self.streams.lock();
        streams.retain(|(p, s)| {
            if *p == port {
                let _ = s.shutdown(Shutdown::Both);
                false
            } else {
                true
            }
        });
    }

    pub fn active(&self) -> usize {
        self.streams.lock().len()
    }

    /// Set the abort flag and shut every registered stream down. Blocked
    /// reads and writes on those streams return immediately.
    pub fn shutdown_all(&self) {
        self.abort.store(true, Ordering::Release);
        for (_, stream) in self.streams.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        for (_, stream) in self.streams.get_mut().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn connect_once(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("{} resolved to no addresses", host))
    }))
}

/// Bind `num_ports` nonblocking listeners. `start_port` 0 gives every
/// listener its own ephemeral port, otherwise ports are consecutive from
/// `start_port`. Any bind failure releases what was bound and fails.
pub fn bind_listeners(start_port: u16, num_ports: u16) -> Result<Vec<(u16, TcpListener)>> {
    let mut bound = Vec::with_capacity(num_ports as usize);
    for i in 0..num_ports {
        let wanted = if start_port == 0 {
            0
        } else {
            start_port.checked_add(i).ok_or_else(|| WdtError::Bind {
                port: start_port,
                source: io::Error::new(io::ErrorKind::InvalidInput, "port range overflows"),
            })?
        };
        let listener = bind_one(wanted).map_err(|source| WdtError::Bind { port: wanted, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| WdtError::Bind { port: wanted, source })?
            .port();
        bound.push((port, listener));
    }
    Ok(bound)
}

fn bind_one(port: u16) -> io::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
