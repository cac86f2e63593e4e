//! Connection multiplexer
//!
//! A single-threaded `mio` reactor owns the listener and every client
//! socket. Each iteration polls for readiness, services ready connections,
//! applies control commands, drains device completions and periodically
//! sweeps idle connections.
//!
//! # Architecture
//!
//! ```text
//! ReactorHandle (tokio side) ──Control──┐
//!                                        ├──> mio::Waker ──> Reactor thread
//! device executors ──CompletionQueue─────┘                     ├─> slots[i]: Connection + Session
//!                                                              └─> listener (after link-up)
//! ```
//!
//! Tokens: `0` is the listener, `1` the waker, `i + 2` connection slot `i`.

use super::connection::{Connection, ConnectionError};
use super::session::Session;
use crate::device::DeviceProvider;
use async_channel::{Receiver, Sender, TryRecvError, unbounded};
use common::{CompletionQueue, CompletionReceiver, SessionId, Wake, completion_queue};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_SLOT: usize = 2;

const EVENT_CAPACITY: usize = 256;

/// Reactor limits and timers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorConfig {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// Bytes read from a socket per read call
    pub read_chunk_size: usize,
    /// Largest CMD_SUBMIT buffer forwarded to a device
    pub max_transfer_buffer: u32,
    /// Unsent bytes at which a connection stops reading
    pub max_send_buffer: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3240)),
            max_connections: 64,
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            read_chunk_size: 1536,
            max_transfer_buffer: protocol::MAX_TRANSFER_BUFFER_LENGTH,
            max_send_buffer: 4 * 1024 * 1024,
        }
    }
}

/// Reactor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactorStats {
    /// Connections accepted into a slot
    pub accepted: u64,
    /// Connections closed right after accept because every slot was taken
    pub rejected: u64,
    /// Connections closed by the idle sweep
    pub closed_idle: u64,
    /// Connections closed by a protocol or I/O error
    pub closed_error: u64,
    /// Connections currently open
    pub active: usize,
}

enum Control {
    LinkUp(oneshot::Sender<io::Result<SocketAddr>>),
    LinkDown(oneshot::Sender<()>),
    Stats(oneshot::Sender<ReactorStats>),
    Shutdown,
}

/// Control-plane handle to a running reactor
#[derive(Clone)]
pub struct ReactorHandle {
    tx: Sender<Control>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Bind the listener and start accepting; returns the bound address
    ///
    /// Idempotent: a second call returns the address already bound.
    pub async fn link_up(&self) -> io::Result<SocketAddr> {
        let (tx, rx) = oneshot::channel();
        self.send(Control::LinkUp(tx))?;
        rx.await.map_err(|_| stopped())?
    }

    /// Close every connection and the listener
    pub async fn link_down(&self) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Control::LinkDown(tx))?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn stats(&self) -> io::Result<ReactorStats> {
        let (tx, rx) = oneshot::channel();
        self.send(Control::Stats(tx))?;
        rx.await.map_err(|_| stopped())
    }

    /// Ask the reactor thread to close everything and exit
    pub fn shutdown(&self) -> io::Result<()> {
        self.send(Control::Shutdown)
    }

    fn send(&self, control: Control) -> io::Result<()> {
        self.tx.try_send(control).map_err(|_| stopped())?;
        self.waker.wake()
    }
}

fn stopped() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "reactor stopped")
}

/// Start a reactor on a thread named `usbip-reactor`
pub fn spawn(
    config: ReactorConfig,
    provider: Arc<DeviceProvider>,
) -> io::Result<(ReactorHandle, JoinHandle<()>)> {
    let (reactor, handle) = Reactor::new(config, provider)?;
    let thread = std::thread::Builder::new()
        .name("usbip-reactor".to_string())
        .spawn(move || reactor.run())?;
    Ok((handle, thread))
}

/// Single-threaded readiness loop
pub struct Reactor {
    poll: Poll,
    config: ReactorConfig,
    provider: Arc<DeviceProvider>,
    control: Receiver<Control>,
    queue: CompletionQueue,
    completions: CompletionReceiver,
    listener: Option<TcpListener>,
    slots: Vec<Option<Connection>>,
    sessions: HashMap<SessionId, usize>,
    scratch: Vec<u8>,
    dirty: Vec<usize>,
    stats: ReactorStats,
    running: bool,
}

impl Reactor {
    pub fn new(
        config: ReactorConfig,
        provider: Arc<DeviceProvider>,
    ) -> io::Result<(Self, ReactorHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let completion_waker = Arc::clone(&waker);
        let wake: Arc<dyn Wake> = Arc::new(move || completion_waker.wake());
        let (queue, completions) = completion_queue(wake);

        let (tx, control) = unbounded();
        let slots = (0..config.max_connections).map(|_| None).collect();

        let reactor = Self {
            poll,
            scratch: vec![0; config.read_chunk_size.max(1)],
            config,
            provider,
            control,
            queue,
            completions,
            listener: None,
            slots,
            sessions: HashMap::new(),
            dirty: Vec::new(),
            stats: ReactorStats::default(),
            running: true,
        };
        Ok((reactor, ReactorHandle { tx, waker }))
    }

    /// Run until shutdown or until every handle is dropped
    pub fn run(mut self) {
        info!(
            "Reactor started ({} slots, idle timeout {:?})",
            self.config.max_connections, self.config.idle_timeout
        );

        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let mut next_sweep = Instant::now() + self.config.sweep_interval;

        while self.running {
            let timeout = next_sweep.saturating_duration_since(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("Poll failed: {}", e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_all(),
                    WAKER => trace!("Woken"),
                    Token(token) => self.service(token - FIRST_SLOT),
                }
            }

            self.apply_control();
            self.drain_completions();

            let now = Instant::now();
            if now >= next_sweep {
                self.sweep(now);
                next_sweep = now + self.config.sweep_interval;
            }
        }

        self.link_down();
        info!("Reactor stopped");
    }

    fn apply_control(&mut self) {
        loop {
            match self.control.try_recv() {
                Ok(Control::LinkUp(reply)) => {
                    let _ = reply.send(self.link_up());
                }
                Ok(Control::LinkDown(reply)) => {
                    self.link_down();
                    let _ = reply.send(());
                }
                Ok(Control::Stats(reply)) => {
                    let _ = reply.send(self.stats());
                }
                Ok(Control::Shutdown) => {
                    info!("Reactor shutdown requested");
                    self.running = false;
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Closed) => {
                    debug!("All reactor handles dropped");
                    self.running = false;
                    return;
                }
            }
        }
    }

    fn link_up(&mut self) -> io::Result<SocketAddr> {
        if let Some(listener) = &self.listener {
            return listener.local_addr();
        }

        let mut listener = TcpListener::bind(self.config.bind_addr)?;
        self.poll
            .registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);

        info!("Link up: listening on {}", addr);
        Ok(addr)
    }

    fn link_down(&mut self) {
        let open = self.active();
        for slot in 0..self.slots.len() {
            if let Some(conn) = self.slots[slot].take() {
                self.release(conn);
            }
        }

        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.poll.registry().deregister(&mut listener) {
                debug!("Deregistering listener: {}", e);
            }
            info!("Link down: closed listener and {} connections", open);
        }
    }

    fn stats(&self) -> ReactorStats {
        ReactorStats {
            active: self.active(),
            ..self.stats
        }
    }

    fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn accept_all(&mut self) {
        loop {
            let Some(listener) = &self.listener else {
                return;
            };
            let (mut stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    return;
                }
            };

            let Some(slot) = self.slots.iter().position(Option::is_none) else {
                self.stats.rejected += 1;
                warn!(
                    "Rejecting {}: all {} slots in use",
                    peer, self.config.max_connections
                );
                drop(stream);
                continue;
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("{}: TCP_NODELAY: {}", peer, e);
            }
            if let Err(e) = register(self.poll.registry(), &mut stream, Token(slot + FIRST_SLOT)) {
                warn!("Failed to register {}: {}", peer, e);
                continue;
            }

            let session = Session::new(
                Arc::clone(&self.provider),
                self.queue.sender(SessionId::next()),
                self.config.max_transfer_buffer,
            );
            info!("{}: accepted {} in slot {}", session.id(), peer, slot);

            self.sessions.insert(session.id(), slot);
            self.slots[slot] = Some(Connection::new(
                stream,
                peer,
                session,
                self.config.max_send_buffer,
            ));
            self.stats.accepted += 1;
        }
    }

    fn service(&mut self, slot: usize) {
        let Some(conn) = self.slots.get_mut(slot).and_then(Option::as_mut) else {
            return;
        };
        if let Err(e) = conn.pump(&mut self.scratch) {
            self.close(slot, e);
        }
    }

    fn drain_completions(&mut self) {
        while let Some(event) = self.completions.try_recv() {
            let Some(&slot) = self.sessions.get(&event.session) else {
                debug!(
                    "Discarding completion of URB {} for closed {}",
                    event.completion.seq_num, event.session
                );
                continue;
            };
            let Some(conn) = self.slots[slot].as_mut() else {
                continue;
            };
            match conn.deliver(event.completion) {
                Ok(true) => self.dirty.push(slot),
                Ok(false) => {}
                Err(e) => self.close(slot, e),
            }
        }

        self.dirty.sort_unstable();
        self.dirty.dedup();
        for slot in std::mem::take(&mut self.dirty) {
            self.service(slot);
        }
    }

    fn sweep(&mut self, now: Instant) {
        for slot in 0..self.slots.len() {
            let idle = self.slots[slot]
                .as_ref()
                .is_some_and(|c| c.is_idle(now, self.config.idle_timeout));
            if idle && let Some(conn) = self.slots[slot].take() {
                info!(
                    "{}: closing idle connection from {}",
                    conn.session_id(),
                    conn.peer()
                );
                self.stats.closed_idle += 1;
                self.release(conn);
            }
        }
    }

    fn close(&mut self, slot: usize, reason: ConnectionError) {
        let Some(conn) = self.slots[slot].take() else {
            return;
        };
        match &reason {
            ConnectionError::PeerClosed => {
                info!("{}: {} disconnected", conn.session_id(), conn.peer())
            }
            _ => {
                warn!("{}: closing {}: {}", conn.session_id(), conn.peer(), reason);
                self.stats.closed_error += 1;
            }
        }
        self.release(conn);
    }

    fn release(&mut self, mut conn: Connection) {
        self.sessions.remove(&conn.session_id());
        if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
            debug!("Deregistering {}: {}", conn.peer(), e);
        }
        conn.close();
    }
}

/// Edge-triggered read and write readiness for a client socket
fn register(registry: &Registry, stream: &mut TcpStream, token: Token) -> io::Result<()> {
    registry.register(stream, token, Interest::READABLE | Interest::WRITABLE)
}
