//! Per-connection protocol state machine.
//!
//! A [`Connection`] ties three event streams together: socket readiness,
//! back-end completions, and control events. It owns the receive buffer, the
//! send chain, and the request handler for its whole lifetime, and is driven
//! by a single reactor thread: [`Connection::step`] never blocks and is
//! never re-entered for the same connection.

use std::io::{Read, Write};

use tracing::trace;

use crate::buffer::{Fill, Flush, ReceiveBuffer, SendChain};
use crate::error::Error;
use crate::event::{Event, Verdict};
use crate::handler::{ParseVerdict, RequestHandler};

/// Connection state between events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Clean and idle: no outstanding work, buffers may be unallocated.
    SocketConnected,
    /// The parser saw an incomplete request and is waiting for more bytes.
    RecvIncomplete,
    /// A flush came up short; waiting for the socket to become writable.
    SendIncomplete,
    /// A back-end operation is in flight; no new input is accepted.
    BtreeIncomplete,
    /// The receive buffer holds unparsed bytes ready for the parser.
    OutstandingData,
}

/// Buffer sizing for a connection.
#[derive(Debug, Clone, Copy)]
pub struct BufferOptions {
    /// Receive buffer capacity. A request plus arguments must fit.
    pub recv_capacity: usize,
    /// Capacity of each send chain link.
    pub link_capacity: usize,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            recv_capacity: 4096,
            link_capacity: 4096,
        }
    }
}

/// One client socket session.
///
/// Field order is load-bearing: teardown drops the stream, then the handler,
/// then the send chain, then the receive buffer.
pub struct Connection<S, H: RequestHandler> {
    stream: S,
    handler: H,
    sbuf: Option<SendChain>,
    rbuf: Option<ReceiveBuffer>,
    state: State,
    corked: bool,
    opts: BufferOptions,
    bytes_rx: u64,
    bytes_tx: u64,
}

impl<S: Read + Write, H: RequestHandler> Connection<S, H> {
    pub fn new(stream: S, handler: H, opts: BufferOptions) -> Self {
        Self {
            stream,
            handler,
            sbuf: None,
            rbuf: None,
            state: State::SocketConnected,
            corked: false,
            opts,
            bytes_rx: 0,
            bytes_tx: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    /// Total bytes read from the socket over the connection's life.
    #[inline]
    pub fn bytes_rx(&self) -> u64 {
        self.bytes_rx
    }

    /// Total bytes written to the socket over the connection's life.
    #[inline]
    pub fn bytes_tx(&self) -> u64 {
        self.bytes_tx
    }

    /// Whether the connection has dropped its buffers (clean idle).
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.rbuf.is_none() && self.sbuf.is_none()
    }

    #[inline]
    pub fn stream(&self) -> &S {
        &self.stream
    }

    #[inline]
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Suppress or re-enable outbound flushes. Uncorking flushes anything
    /// staged while the cork was set.
    pub fn set_cork(&mut self, corked: bool) -> Result<(), Error> {
        self.corked = corked;
        if !corked && self.sbuf.as_ref().is_some_and(|s| s.outstanding()) {
            self.send_msg_to_client()?;
        }
        Ok(())
    }

    /// Single entry point: dispatch one event against the current state, then
    /// drain any pipelined requests left in the receive buffer.
    ///
    /// Never blocks. Yields back to the reactor in `RecvIncomplete` (awaiting
    /// readable), `SendIncomplete` (awaiting writable), or `BtreeIncomplete`
    /// (awaiting a completion). `Err` means the connection is unrecoverable
    /// and must be destroyed.
    pub fn step(&mut self, event: Event<H::Completion>) -> Result<Verdict, Error> {
        if matches!(event, Event::Shutdown) {
            self.reset();
            return Ok(Verdict::Shutdown);
        }

        let verdict = match self.state {
            State::SocketConnected | State::RecvIncomplete => match event {
                Event::Socket(_) => self.fill_rbuf()?,
                _ => return Ok(Verdict::Invalid),
            },
            State::SendIncomplete => match event {
                Event::Socket(dir) if dir.writable() => {
                    self.send_msg_to_client()?;
                    Verdict::Ok
                }
                _ => return Ok(Verdict::Invalid),
            },
            State::BtreeIncomplete => match event {
                // Single-inflight back-pressure: the socket is not even read
                // while a back-end op is outstanding.
                Event::Socket(_) => return Ok(Verdict::Ok),
                Event::RequestComplete(completion) => {
                    let link_capacity = self.opts.link_capacity;
                    let sbuf = self
                        .sbuf
                        .get_or_insert_with(|| SendChain::new(link_capacity));
                    self.handler.complete_request(completion, sbuf)?;
                    self.state = State::OutstandingData;
                    self.send_msg_to_client()?;
                    Verdict::Ok
                }
                Event::Shutdown => unreachable!("handled above"),
            },
            State::OutstandingData => match event {
                Event::Socket(_) => Verdict::Ok,
                _ => return Ok(Verdict::Invalid),
            },
        };

        if matches!(verdict, Verdict::Quit | Verdict::NoData) {
            self.reset();
            return Ok(verdict);
        }

        self.drain()
    }

    /// One non-blocking read, with the idle-release rule: a would-block on an
    /// empty buffer from a clean `SocketConnected` drops both buffers. A
    /// connection parked in `OutstandingData` keeps its buffers.
    fn fill_rbuf(&mut self) -> Result<Verdict, Error> {
        let recv_capacity = self.opts.recv_capacity;
        let rbuf = self
            .rbuf
            .get_or_insert_with(|| ReceiveBuffer::with_capacity(recv_capacity));

        match rbuf.fill(&mut self.stream)? {
            Fill::Bytes(n) => {
                trace!(bytes = n, "filled receive buffer");
                self.bytes_rx += n as u64;
                if self.state != State::RecvIncomplete {
                    self.state = State::OutstandingData;
                }
                Ok(Verdict::Ok)
            }
            Fill::WouldBlock => {
                if rbuf.is_empty() && self.state == State::SocketConnected {
                    self.release_buffers();
                }
                Ok(Verdict::Ok)
            }
            Fill::Eof => Ok(if self.state == State::RecvIncomplete {
                Verdict::NoData
            } else {
                Verdict::Quit
            }),
        }
    }

    /// Drain loop: feed the parser until the receive buffer is exhausted or
    /// the state machine suspends.
    fn drain(&mut self) -> Result<Verdict, Error> {
        // Opportunistic fill: an event may land here with the buffer already
        // consumed (or never allocated) while bytes wait in the kernel.
        if self.state == State::OutstandingData
            && self.rbuf.as_ref().map_or(true, |r| r.is_empty())
        {
            let verdict = self.fill_rbuf()?;
            if verdict != Verdict::Ok {
                self.reset();
                return Ok(verdict);
            }
            if self.state != State::OutstandingData {
                return Ok(Verdict::Ok);
            }
        }

        loop {
            match self.state {
                State::OutstandingData | State::RecvIncomplete => {}
                _ => return Ok(Verdict::Ok),
            }

            let opts = self.opts;
            let rbuf = self
                .rbuf
                .get_or_insert_with(|| ReceiveBuffer::with_capacity(opts.recv_capacity));
            if self.state == State::OutstandingData && rbuf.is_empty() {
                return Ok(Verdict::Ok);
            }
            let rbuf_full = rbuf.is_full();
            let sbuf = self
                .sbuf
                .get_or_insert_with(|| SendChain::new(opts.link_capacity));

            match self.handler.parse_request(rbuf, sbuf)? {
                ParseVerdict::Malformed => {
                    // The handler already staged its error response; the next
                    // pipelined request may be valid.
                    self.state = State::OutstandingData;
                    self.send_msg_to_client()?;
                }
                ParseVerdict::Partial => {
                    if rbuf_full {
                        return Err(Error::RequestTooLarge);
                    }
                    self.state = State::RecvIncomplete;
                    match self.fill_once()? {
                        Fill::Bytes(_) => {}
                        Fill::WouldBlock => return Ok(Verdict::Ok),
                        Fill::Eof => {
                            self.reset();
                            return Ok(Verdict::NoData);
                        }
                    }
                }
                ParseVerdict::Quit => {
                    self.reset();
                    return Ok(Verdict::Quit);
                }
                ParseVerdict::Shutdown => {
                    self.reset();
                    return Ok(Verdict::Shutdown);
                }
                ParseVerdict::Complex => {
                    self.state = State::BtreeIncomplete;
                    return Ok(Verdict::Ok);
                }
                ParseVerdict::Parallel => {
                    self.state = State::OutstandingData;
                }
                ParseVerdict::SendNow => {
                    self.state = State::OutstandingData;
                    self.send_msg_to_client()?;
                }
            }
        }
    }

    /// Flush staged responses unless corked. Sets `SendIncomplete` on a short
    /// write, `OutstandingData` on a complete drain.
    fn send_msg_to_client(&mut self) -> Result<(), Error> {
        if self.corked {
            return Ok(());
        }
        let sbuf = match self.sbuf.as_mut() {
            Some(s) => s,
            None => return Ok(()),
        };
        let before = sbuf.pending();
        let result = sbuf.flush(&mut self.stream)?;
        self.bytes_tx += (before - sbuf.pending()) as u64;
        sbuf.collect();
        self.state = match result {
            Flush::Drained => State::OutstandingData,
            Flush::Outstanding => State::SendIncomplete,
        };
        Ok(())
    }

    /// One fill with no idle-release side effects, used mid-parse when the
    /// parser reports a partial request.
    fn fill_once(&mut self) -> Result<Fill, Error> {
        let recv_capacity = self.opts.recv_capacity;
        let rbuf = self
            .rbuf
            .get_or_insert_with(|| ReceiveBuffer::with_capacity(recv_capacity));
        let fill = rbuf.fill(&mut self.stream)?;
        if let Fill::Bytes(n) = fill {
            self.bytes_rx += n as u64;
        }
        Ok(fill)
    }

    fn release_buffers(&mut self) {
        self.rbuf = None;
        self.sbuf = None;
    }

    /// Return to a clean state ahead of teardown. Buffers are released here;
    /// the stream and handler are released when the connection is dropped.
    fn reset(&mut self) {
        self.release_buffers();
        self.corked = false;
        self.state = State::SocketConnected;
    }
}
