//! Connection I/O buffers.
//!
//! [`ReceiveBuffer`] is a fixed-capacity scratch area holding a prefix of a
//! possibly-pipelined byte stream; parsed prefixes are consumed in place.
//!
//! [`SendChain`] is an append-only chain of fixed-size links flushed
//! incrementally with non-blocking writes. Responses can be staged while a
//! previous response is still leaving the socket without reallocating or
//! shifting large buffers; under normal load the chain stays at one link.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};

use crate::error::Error;

/// Upper bound for one `append_fmt` staging. Exceeding it is fatal to the
/// connection.
pub const MAX_MESSAGE_SIZE: usize = 500;

/// Outcome of one non-blocking read into a [`ReceiveBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Read `n` bytes (`n > 0`).
    Bytes(usize),
    /// The socket has no data right now (or the buffer has no free space).
    WouldBlock,
    /// The peer performed an orderly shutdown.
    Eof,
}

/// Outcome of one [`SendChain::flush`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Every link was fully drained.
    Drained,
    /// At least one link still holds unsent bytes.
    Outstanding,
}

/// Fixed-capacity receive buffer with a used-length cursor.
pub struct ReceiveBuffer {
    buf: Box<[u8]>,
    used: usize,
}

impl ReceiveBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            used: 0,
        }
    }

    /// The bytes available to the parser: `[0, used)`.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.used]
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.used == self.buf.len()
    }

    /// One non-blocking read into the free tail region.
    ///
    /// A full buffer reports `WouldBlock` without touching the socket; a
    /// zero-length read would be indistinguishable from EOF.
    pub fn fill<S: Read>(&mut self, stream: &mut S) -> io::Result<Fill> {
        if self.is_full() {
            return Ok(Fill::WouldBlock);
        }
        match stream.read(&mut self.buf[self.used..]) {
            Ok(0) => Ok(Fill::Eof),
            Ok(n) => {
                self.used += n;
                Ok(Fill::Bytes(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Fill::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Fill::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Remove the first `n` bytes, shifting the remainder down.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the used length.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.used, "consume past end of receive buffer");
        self.buf.copy_within(n..self.used, 0);
        self.used -= n;
    }
}

/// One fixed-size node in the send chain.
struct Link {
    buf: Box<[u8]>,
    /// Bytes written into this link.
    filled: usize,
    /// Bytes of `filled` already transmitted.
    sent: usize,
}

impl Link {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
            sent: 0,
        }
    }

    #[inline]
    fn free(&self) -> usize {
        self.buf.len() - self.filled
    }

    /// Filled to capacity and fully transmitted, eligible for removal when
    /// not the tail.
    #[inline]
    fn drained(&self) -> bool {
        self.filled == self.buf.len() && self.sent == self.filled
    }
}

/// Append-only chain of fixed-size links with incremental non-blocking flush.
///
/// The chain is never empty; an empty head link is the idle representation.
/// Only the tail link is appendable. Bytes appended between two flushes are
/// emitted in append order.
pub struct SendChain {
    links: VecDeque<Link>,
    link_capacity: usize,
}

impl SendChain {
    pub fn new(link_capacity: usize) -> Self {
        let mut links = VecDeque::with_capacity(2);
        links.push_back(Link::new(link_capacity));
        Self {
            links,
            link_capacity,
        }
    }

    /// Copy `input` into the tail, growing the chain as needed. Never fails
    /// for lack of space.
    pub fn append(&mut self, mut input: &[u8]) {
        while !input.is_empty() {
            let tail = self
                .links
                .back_mut()
                .expect("send chain is never empty");
            let n = input.len().min(tail.free());
            if n > 0 {
                tail.buf[tail.filled..tail.filled + n].copy_from_slice(&input[..n]);
                tail.filled += n;
                input = &input[n..];
            }
            if !input.is_empty() {
                let cap = self.link_capacity;
                self.links.push_back(Link::new(cap));
            }
        }
    }

    /// Stage a formatted message through a bounded scratch buffer.
    pub fn append_fmt(&mut self, args: fmt::Arguments) -> Result<(), Error> {
        let mut scratch = Scratch::default();
        fmt::Write::write_fmt(&mut scratch, args).map_err(|_| Error::MessageTooLarge)?;
        self.append(scratch.as_bytes());
        Ok(())
    }

    /// Whether any link still holds unsent bytes.
    pub fn outstanding(&self) -> bool {
        self.links.iter().any(|l| l.sent < l.filled)
    }

    /// Total unsent bytes across the chain.
    pub fn pending(&self) -> usize {
        self.links.iter().map(|l| l.filled - l.sent).sum()
    }

    /// Write the unsent range of each link in order, one non-blocking write
    /// per link, stopping at the first link that cannot be fully drained.
    ///
    /// After every successful write on the tail link the remainder is
    /// compacted to the start and the counters reset, so appends keep landing
    /// in the same link instead of growing the chain.
    ///
    /// Would-block is not an error; any other write error is fatal and
    /// surfaces as `Err`.
    pub fn flush<S: Write>(&mut self, stream: &mut S) -> io::Result<Flush> {
        let count = self.links.len();
        for idx in 0..count {
            let is_tail = idx == count - 1;
            let link = &mut self.links[idx];
            if link.sent == link.filled {
                continue;
            }
            let wanted = link.filled - link.sent;
            match stream.write(&link.buf[link.sent..link.filled]) {
                Ok(n) => {
                    link.sent += n;
                    if is_tail {
                        // Slide the remainder down so the tail stays
                        // appendable without allocating a new link.
                        link.buf.copy_within(link.sent..link.filled, 0);
                        link.filled -= link.sent;
                        link.sent = 0;
                        if n < wanted {
                            return Ok(Flush::Outstanding);
                        }
                    } else if n < wanted {
                        return Ok(Flush::Outstanding);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Flush::Outstanding);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    return Ok(Flush::Outstanding);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Flush::Drained)
    }

    /// Unlink fully drained non-tail links from the head.
    pub fn collect(&mut self) {
        while self.links.len() > 1 {
            let front = self.links.front().expect("len checked above");
            if front.drained() {
                self.links.pop_front();
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn link_count(&self) -> usize {
        self.links.len()
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        for (i, link) in self.links.iter().enumerate() {
            assert!(link.sent <= link.filled);
            assert!(link.filled <= link.buf.len());
            if i + 1 < self.links.len() {
                assert_eq!(link.filled, link.buf.len(), "non-tail link not full");
            }
        }
    }
}

/// Bounded scratch buffer backing `append_fmt`.
struct Scratch {
    buf: [u8; MAX_MESSAGE_SIZE],
    len: usize,
}

impl Default for Scratch {
    fn default() -> Self {
        Self {
            buf: [0u8; MAX_MESSAGE_SIZE],
            len: 0,
        }
    }
}

impl Scratch {
    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for Scratch {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        if self.len + bytes.len() > MAX_MESSAGE_SIZE {
            return Err(fmt::Error);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }
}
