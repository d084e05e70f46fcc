//! Reactor worker: the per-thread event loop that owns connections.
//!
//! Each worker runs a mio Poll with its own SO_REUSEPORT listener, a slab of
//! connections, and a completion channel through which the store's write
//! workers post results. Connections never migrate between workers.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, error, info, trace, warn};

use crate::ascii::AsciiHandler;
use crate::config::Config;
use crate::connection::{BufferOptions, Connection, State};
use crate::event::{ConnId, Direction, Event, Verdict};
use crate::metrics::{
    CloseReason, BYTES_RECEIVED, BYTES_SENT, CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE,
};
use crate::store::{BtreeStore, CompletionSink, StoreReply};

const LISTENER: Token = Token(1 << 30);
const WAKER: Token = Token((1 << 30) + 1);

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Per-worker settings extracted from the server config.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub address: SocketAddr,
    pub backlog: u32,
    pub buffers: BufferOptions,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            address: config.listener.address,
            backlog: config.listener.backlog,
            buffers: BufferOptions {
                recv_capacity: config.buffers.recv_buffer_size,
                link_capacity: config.buffers.send_link_size,
            },
        }
    }
}

/// One reactor thread's state.
pub struct Worker {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: Slab<Connection<TcpStream, AsciiHandler>>,
    generations: Vec<u32>,
    completions_rx: Receiver<(ConnId, StoreReply)>,
    completions: CompletionSink,
    store: BtreeStore,
    shutdown: Arc<AtomicBool>,
    buffers: BufferOptions,
}

impl Worker {
    pub fn new(
        config: &WorkerConfig,
        store: BtreeStore,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;

        let std_listener = bind_reuseport(config.address, config.backlog)?;
        let mut listener = TcpListener::from_std(std_listener);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = crossbeam_channel::unbounded();
        let completions = CompletionSink::new(tx, waker);

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            listener,
            connections: Slab::with_capacity(1024),
            generations: Vec::new(),
            completions_rx: rx,
            completions,
            store,
            shutdown,
            buffers: config.buffers,
        })
    }

    /// The address this worker's listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the event loop until the shutdown flag is set.
    pub fn run(&mut self) -> io::Result<()> {
        // Collected up front each iteration so event dispatch can borrow
        // the worker mutably.
        let mut scratch: Vec<(Token, bool, bool, bool)> = Vec::with_capacity(1024);

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            scratch.clear();
            scratch.extend(self.events.iter().map(|e| {
                (
                    e.token(),
                    e.is_readable(),
                    e.is_writable(),
                    e.is_read_closed() || e.is_write_closed(),
                )
            }));

            for &(token, readable, writable, closed) in &scratch {
                match token {
                    LISTENER => self.accept_pending(),
                    WAKER => self.drain_completions(),
                    Token(slot) => self.socket_event(slot, readable, writable, closed),
                }
            }
        }

        self.drain_all();
        Ok(())
    }

    /// Accept every pending connection on the listener.
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let entry = self.connections.vacant_entry();
                    let slot = entry.key();
                    if slot >= self.generations.len() {
                        self.generations.resize(slot + 1, 0);
                    }

                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(slot),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(error = %e, "failed to register accepted connection");
                        continue;
                    }

                    let id = ConnId::new(slot, self.generations[slot]);
                    let handler =
                        AsciiHandler::new(self.store.clone(), id, self.completions.clone());
                    entry.insert(Connection::new(stream, handler, self.buffers));

                    CONNECTIONS_ACCEPTED.increment();
                    CONNECTIONS_ACTIVE.increment();
                    debug!(slot, peer = %addr, "accepted connection");

                    // The stream may already be readable; edge-triggered
                    // registration will not repeat that notification.
                    self.drive(slot, Event::Socket(Direction::Read));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "listener accept failed");
                    break;
                }
            }
        }
    }

    /// Route completions posted by the store's write workers, dropping any
    /// addressed to a connection that no longer exists.
    fn drain_completions(&mut self) {
        while let Ok((conn_id, reply)) = self.completions_rx.try_recv() {
            let slot = conn_id.slot();
            let live = self.generations.get(slot).copied() == Some(conn_id.generation())
                && self.connections.contains(slot);
            if !live {
                trace!(?conn_id, "dropping completion for dead connection");
                continue;
            }
            self.drive(slot, Event::RequestComplete(reply));
        }
    }

    fn socket_event(&mut self, slot: usize, readable: bool, writable: bool, closed: bool) {
        let conn = match self.connections.get(slot) {
            Some(c) => c,
            None => return,
        };

        let dir = match (readable || closed, writable) {
            (true, true) => Direction::ReadWrite,
            (true, false) => Direction::Read,
            (false, true) => Direction::Write,
            (false, false) => return,
        };

        // A readable-only event while a flush is pending would be a contract
        // violation for the state machine; the kernel keeps the data and the
        // post-flush drain picks it up.
        if conn.state() == State::SendIncomplete && !dir.writable() {
            return;
        }

        self.drive(slot, Event::Socket(dir));
    }

    /// Step the connection, then keep synthesizing read events while the
    /// drain loop is pulling kernel-buffered bytes. Edge-triggered delivery
    /// will not re-report data we have not read yet.
    fn drive(&mut self, slot: usize, event: Event<StoreReply>) {
        let mut event = Some(event);
        loop {
            let conn = match self.connections.get_mut(slot) {
                Some(c) => c,
                None => return,
            };
            let before_rx = conn.bytes_rx();
            let before_tx = conn.bytes_tx();

            let result = conn
                .step(event.take().unwrap_or(Event::Socket(Direction::Read)));

            BYTES_RECEIVED.add(conn.bytes_rx() - before_rx);
            BYTES_SENT.add(conn.bytes_tx() - before_tx);
            let progressed = conn.bytes_rx() > before_rx;
            let state = conn.state();

            match result {
                Ok(Verdict::Ok) => {
                    if state == State::OutstandingData && progressed {
                        continue;
                    }
                    return;
                }
                Ok(Verdict::Quit) => {
                    self.destroy(slot, CloseReason::Quit);
                    return;
                }
                Ok(Verdict::NoData) => {
                    self.destroy(slot, CloseReason::NoData);
                    return;
                }
                Ok(Verdict::Shutdown) => {
                    info!(slot, "client requested server shutdown");
                    self.shutdown.store(true, Ordering::SeqCst);
                    self.destroy(slot, CloseReason::Shutdown);
                    return;
                }
                Ok(Verdict::Invalid) => {
                    error!(slot, "event violated connection state machine contract");
                    self.destroy(slot, CloseReason::Invalid);
                    return;
                }
                Err(e) => {
                    warn!(slot, error = %e, "connection failed");
                    self.destroy(slot, CloseReason::Fatal);
                    return;
                }
            }
        }
    }

    fn destroy(&mut self, slot: usize, reason: CloseReason) {
        if !self.connections.contains(slot) {
            return;
        }
        let mut conn = self.connections.remove(slot);
        let _ = self.poll.registry().deregister(conn.stream_mut());
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        CONNECTIONS_ACTIVE.decrement();
        debug!(slot, ?reason, "connection closed");
    }

    /// Tear down every connection at shutdown.
    fn drain_all(&mut self) {
        let slots: Vec<usize> = self.connections.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            if let Some(conn) = self.connections.get_mut(slot) {
                let _ = conn.step(Event::Shutdown);
            }
            self.destroy(slot, CloseReason::Shutdown);
        }
    }
}

/// Build a non-blocking SO_REUSEPORT listener so every worker can bind the
/// same address and let the kernel balance accepts.
fn bind_reuseport(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    Ok(socket.into())
}

/// Spawn the configured number of reactor threads.
pub fn spawn_workers(
    config: &Config,
    store: &BtreeStore,
    shutdown: &Arc<AtomicBool>,
) -> io::Result<Vec<JoinHandle<()>>> {
    let worker_config = WorkerConfig::from_config(config);
    let num_workers = config.threads();

    let mut handles = Vec::with_capacity(num_workers);
    for worker_id in 0..num_workers {
        let mut worker = Worker::new(&worker_config, store.clone(), shutdown.clone())?;
        let handle = std::thread::Builder::new()
            .name(format!("worker-{}", worker_id))
            .spawn(move || {
                if let Err(e) = worker.run() {
                    error!(worker_id, error = %e, "worker exited with error");
                }
            })
            .expect("failed to spawn worker thread");
        handles.push(handle);
    }

    info!(
        workers = num_workers,
        address = %worker_config.address,
        "server listening"
    );
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_reuseport_allows_shared_address() {
        let a = bind_reuseport("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = a.local_addr().unwrap();
        // A second listener on the same address must succeed.
        let b = bind_reuseport(addr, 16).unwrap();
        assert_eq!(b.local_addr().unwrap(), addr);
    }

    #[test]
    fn worker_binds_ephemeral_port() {
        let config = WorkerConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            backlog: 16,
            buffers: BufferOptions::default(),
        };
        let (store, _pool) = BtreeStore::spawn(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = Worker::new(&config, store, shutdown).unwrap();
        assert_ne!(worker.local_addr().unwrap().port(), 0);
    }
}
