//! Single-threaded connection multiplexer

use std::io::ErrorKind;
use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use mio::{net::UnixListener, Events, Interest, Poll, Token, Waker};
use nix::sys::signal::{SigSet, Signal};

use crate::{
    config::ProxyConfig,
    error::{ProxyError, Result},
    hardware::Hardware,
    protocol::{dispatch, MAX_IOCTL_SIZE, WORD},
    state::ProxyState,
};

use super::{connection::Connection, listener::bind_listener};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CLIENT: usize = 2;

const EVENT_CAPACITY: usize = 128;

/// Makes a running [`Server::run`] return
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Request shutdown and wake the event loop
    pub fn shutdown(&self) -> Result<()> {
        self.requested.store(true, Ordering::SeqCst);
        self.waker.wake()?;
        Ok(())
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Request shutdown through `handle` when one of `signals` arrives
///
/// The signals are blocked on the calling thread, and so on every thread
/// it spawns afterwards; call this before starting other threads. A
/// dedicated thread waits for them.
pub fn shutdown_on_signals(handle: ShutdownHandle, signals: &[Signal]) -> Result<JoinHandle<()>> {
    let mut mask = SigSet::empty();
    for signal in signals {
        mask.add(*signal);
    }
    mask.thread_block()?;

    let waiter = thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || match mask.wait() {
            Ok(signal) => {
                info!("received {:?}, shutting down", signal);
                if let Err(e) = handle.shutdown() {
                    warn!("shutdown request failed: {}", e);
                }
            }
            Err(e) => warn!("waiting for signals failed: {}", e),
        })?;
    Ok(waiter)
}

/// The proxy server: listener, connection table and device state
///
/// Everything runs on the thread calling [`Server::run`]. Each readiness
/// pass accepts pending clients, reads what each ready connection has sent
/// and services at most one complete command per connection.
#[derive(Debug)]
pub struct Server {
    poll: Poll,
    events: Events,
    listener: UnixListener,
    shutdown: ShutdownHandle,
    connections: Vec<Connection>,
    next_token: usize,
    state: ProxyState,
    config: ProxyConfig,
}

impl Server {
    /// Discover the device's windows and start listening
    ///
    /// Window discovery failures are returned before the socket is created.
    pub fn bind(config: ProxyConfig, hardware: Box<dyn Hardware>) -> Result<Self> {
        config.validate()?;
        let state = ProxyState::new(hardware, &config)?;

        let poll = Poll::new()?;
        let mut listener = bind_listener(&config.socket_path, config.listen_backlog)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        info!(
            "listening on {} (max {} connections)",
            config.socket_path.display(),
            config.max_connections
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener,
            shutdown: ShutdownHandle {
                waker: Arc::new(waker),
                requested: Arc::new(AtomicBool::new(false)),
            },
            connections: Vec::new(),
            next_token: FIRST_CLIENT,
            state,
            config,
        })
    }

    /// Path of the listening socket
    pub fn local_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Device state, for inspection
    pub fn state(&self) -> &ProxyState {
        &self.state
    }

    /// Number of open client connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Handle that stops [`Server::run`] from another thread
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serve clients until shutdown is requested
    pub fn run(&mut self) -> Result<()> {
        while !self.shutdown.is_requested() {
            let timeout = if self.has_pending_work() {
                Some(Duration::ZERO)
            } else {
                None
            };
            self.run_once(timeout)?;
        }
        info!("shutting down with {} connections open", self.connections.len());
        Ok(())
    }

    fn has_pending_work(&self) -> bool {
        self.connections.iter().any(Connection::has_pending_work)
    }

    /// One readiness pass: wait up to `timeout`, then accept, read,
    /// service and reap
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(ProxyError::from_io(e, "Readiness wait failed"));
        }

        let mut accept = false;
        for event in self.events.iter() {
            match event.token() {
                LISTENER => accept = true,
                WAKER => {}
                token => {
                    if let Some(conn) = self.connections.iter_mut().find(|c| c.token == token) {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            conn.readable = true;
                        }
                    }
                }
            }
        }

        if accept {
            self.accept_all();
        }

        let cap = self.config.max_transfer as usize + MAX_IOCTL_SIZE + 3 * WORD;
        for conn in self.connections.iter_mut() {
            let result = Self::service(conn, &mut self.state, cap);
            Self::settle(conn, result);
        }

        self.reap();

        let registry = self.poll.registry();
        for conn in self.connections.iter_mut() {
            let result = conn.update_interest(registry);
            Self::settle(conn, result);
        }
        self.reap();
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _)) => {
                    if self.connections.len() >= self.config.max_connections {
                        warn!(
                            "connection table full ({}), refusing client",
                            self.config.max_connections
                        );
                        continue;
                    }

                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!("failed to register client: {}", e);
                        continue;
                    }

                    let conn = Connection::new(token.0 as u64, token, stream);
                    debug!("connection {} accepted", conn.id);
                    self.connections.push(conn);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Flush, read and run at most one command on `conn`
    fn service(conn: &mut Connection, state: &mut ProxyState, cap: usize) -> Result<()> {
        conn.flush()?;
        if conn.readable {
            conn.fill(cap)?;
        }

        if let Some(command) = conn.next_command(state.max_transfer)? {
            let owner = conn.id;
            dispatch(state, owner, command, conn.outbound_mut());
            conn.flush()?;
        }

        if conn.peer_closed() && !conn.has_pending_work() && !conn.has_outbound() {
            debug!("connection {} closed by peer", conn.id);
            conn.closed = true;
        }
        Ok(())
    }

    /// Close `conn` if `result` failed in a way the connection cannot survive
    fn settle(conn: &mut Connection, result: Result<()>) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_connection_fatal() => {
                warn!("closing connection {}: {}", conn.id, e);
                conn.closed = true;
            }
            Err(e) => debug!("connection {}: {}", conn.id, e),
        }
    }

    /// Drop closed connections, releasing everything they held
    fn reap(&mut self) {
        let registry = self.poll.registry();
        for conn in self.connections.iter_mut().filter(|c| c.closed) {
            if let Err(e) = registry.deregister(conn.stream_mut()) {
                debug!("connection {}: deregister failed: {}", conn.id, e);
            }
            let released = self.state.areas.release_owner(&mut self.state.windows, conn.id);
            debug!("connection {} closed, {} areas released", conn.id, released);
        }
        self.connections.retain(|c| !c.closed);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
            debug!("failed to remove {}: {}", self.config.socket_path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpp::{encode_offset, target, CppId, ACTION_RW};
    use crate::hardware::SimulatedDevice;
    use crate::protocol::Command;
    use nix::sys::pthread::pthread_kill;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream as StdUnixStream;
    use std::os::unix::thread::JoinHandleExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_bind_reports_path() {
        let dir = TempDir::new().unwrap();
        let path: PathBuf = dir.path().join("proxy.sock");
        let config = ProxyConfig::new(&path);
        let server = Server::bind(config, Box::new(SimulatedDevice::nfp6000())).unwrap();
        assert_eq!(server.local_path(), path.as_path());
        assert_eq!(server.connection_count(), 0);
        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn test_discovery_failure_creates_no_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("proxy.sock");
        let device = SimulatedDevice::nfp6000()
            .with_unwired(0)
            .with_unwired(1)
            .with_unwired(2);
        assert!(Server::bind(ProxyConfig::new(&path), Box::new(device)).is_err());
        assert!(!path.exists());
    }

    fn bind_test_server(dir: &TempDir) -> Server {
        let config = ProxyConfig::new(dir.path().join("proxy.sock")).with_max_transfer(4096);
        Server::bind(config, Box::new(SimulatedDevice::nfp6000())).unwrap()
    }

    #[test]
    fn test_unread_replies_do_not_busy_loop() {
        let dir = TempDir::new().unwrap();
        let mut server = bind_test_server(&dir);
        let mut client = StdUnixStream::connect(server.local_path()).unwrap();

        // Replies far exceed what the socket buffers while the client never reads
        let id = CppId::new(target::MU, ACTION_RW, 0);
        let frame = Command::Read {
            count: 4096,
            offset: encode_offset(id, 0) as i64,
        }
        .to_bytes();
        for _ in 0..537 {
            client.write_all(&frame).unwrap();
        }

        let mut stalled = false;
        for _ in 0..10_000 {
            server.run_once(Some(Duration::from_millis(10))).unwrap();
            if server.connection_count() == 1 && !server.has_pending_work() {
                stalled = true;
                break;
            }
        }
        assert!(stalled, "server kept finding work for a client that never reads");
        assert!(server.connections[0].has_outbound());

        server.run_once(Some(Duration::from_millis(10))).unwrap();
        assert!(!server.has_pending_work());
        assert_eq!(server.connection_count(), 1);
    }

    #[test]
    fn test_protocol_error_closes_connection() {
        let dir = TempDir::new().unwrap();
        let mut server = bind_test_server(&dir);
        let mut client = StdUnixStream::connect(server.local_path()).unwrap();
        client.write_all(&0x99u64.to_le_bytes()).unwrap();

        client.set_nonblocking(true).unwrap();

        let mut closed = false;
        for _ in 0..1_000 {
            server.run_once(Some(Duration::from_millis(10))).unwrap();
            if let Ok(0) = client.read(&mut [0u8; WORD]) {
                closed = true;
                break;
            }
        }
        assert!(closed);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_signal_requests_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut server = bind_test_server(&dir);
        let handle = server.shutdown_handle();

        let waiter = shutdown_on_signals(handle.clone(), &[Signal::SIGUSR2]).unwrap();
        pthread_kill(waiter.as_pthread_t(), Signal::SIGUSR2).unwrap();
        waiter.join().unwrap();

        assert!(handle.is_requested());
        server.run().unwrap();
    }

    #[test]
    fn test_shutdown_handle_stops_run() {
        let dir = TempDir::new().unwrap();
        let config = ProxyConfig::new(dir.path().join("proxy.sock"));
        let mut server = Server::bind(config, Box::new(SimulatedDevice::nfp6000())).unwrap();
        server.shutdown_handle().shutdown().unwrap();
        server.run().unwrap();
    }
}
