//! ASCII memcached request handler.
//!
//! Bridges parsed commands to the storage engine and stages responses into
//! the connection's send chain. Reads are satisfied inline; mutations are
//! handed to the store's write workers and complete asynchronously unless
//! the client asked for `noreply`.

use bytes::Bytes;

use crate::buffer::{ReceiveBuffer, SendChain};
use crate::error::Error;
use crate::event::ConnId;
use crate::handler::{ParseVerdict, RequestHandler};
use crate::metrics::{DELETES, GETS, HITS, MISSES, PROTOCOL_ERRORS, SETS};
use crate::protocol::{Command, ParseError, StorePolicy};
use crate::store::{BtreeStore, CompletionSink, StoreReply, WriteOp};

/// One ASCII protocol handler, bound to a single connection.
pub struct AsciiHandler {
    store: BtreeStore,
    conn: ConnId,
    completions: CompletionSink,
}

impl AsciiHandler {
    pub fn new(store: BtreeStore, conn: ConnId, completions: CompletionSink) -> Self {
        Self {
            store,
            conn,
            completions,
        }
    }

    fn execute(&mut self, cmd: &Command, sbuf: &mut SendChain) -> Result<ParseVerdict, Error> {
        match cmd {
            Command::Get { keys } => {
                for key in keys {
                    GETS.increment();
                    match self.store.get(key) {
                        Some(entry) => {
                            HITS.increment();
                            sbuf.append_fmt(format_args!(
                                "VALUE {} {} {}\r\n",
                                String::from_utf8_lossy(key),
                                entry.flags,
                                entry.value.len()
                            ))?;
                            sbuf.append(&entry.value);
                            sbuf.append(b"\r\n");
                        }
                        None => {
                            MISSES.increment();
                        }
                    }
                }
                sbuf.append(b"END\r\n");
                Ok(ParseVerdict::SendNow)
            }
            Command::Store {
                policy,
                key,
                flags,
                value,
                noreply,
                ..
            } => {
                SETS.increment();
                let key = key.to_vec();
                let value = Bytes::copy_from_slice(value);
                let op = match policy {
                    StorePolicy::Set => WriteOp::Set {
                        key,
                        flags: *flags,
                        value,
                    },
                    StorePolicy::Add => WriteOp::Add {
                        key,
                        flags: *flags,
                        value,
                    },
                    StorePolicy::Replace => WriteOp::Replace {
                        key,
                        flags: *flags,
                        value,
                    },
                };
                Ok(self.dispatch(op, *noreply))
            }
            Command::Delete { key, noreply } => {
                DELETES.increment();
                let op = WriteOp::Delete { key: key.to_vec() };
                Ok(self.dispatch(op, *noreply))
            }
            Command::Incr { key, delta, noreply } => {
                let op = WriteOp::Incr {
                    key: key.to_vec(),
                    delta: *delta,
                };
                Ok(self.dispatch(op, *noreply))
            }
            Command::Decr { key, delta, noreply } => {
                let op = WriteOp::Decr {
                    key: key.to_vec(),
                    delta: *delta,
                };
                Ok(self.dispatch(op, *noreply))
            }
            Command::Version => {
                sbuf.append_fmt(format_args!("VERSION {}\r\n", env!("CARGO_PKG_VERSION")))?;
                Ok(ParseVerdict::SendNow)
            }
            Command::Quit => Ok(ParseVerdict::Quit),
            Command::Shutdown => Ok(ParseVerdict::Shutdown),
        }
    }

    /// Hand a mutation to the write workers. `noreply` ops carry no sink, so
    /// no completion can ever be posted for them.
    fn dispatch(&self, op: WriteOp, noreply: bool) -> ParseVerdict {
        if noreply {
            self.store.dispatch(self.conn, op, None);
            ParseVerdict::Parallel
        } else {
            self.store
                .dispatch(self.conn, op, Some(self.completions.clone()));
            ParseVerdict::Complex
        }
    }
}

impl RequestHandler for AsciiHandler {
    type Completion = StoreReply;

    fn parse_request(
        &mut self,
        rbuf: &mut ReceiveBuffer,
        sbuf: &mut SendChain,
    ) -> Result<ParseVerdict, Error> {
        let (verdict, consumed) = match Command::parse(rbuf.data()) {
            Ok((cmd, consumed)) => (self.execute(&cmd, sbuf)?, consumed),
            Err(ParseError::Incomplete) => return Ok(ParseVerdict::Partial),
            Err(ParseError::UnknownCommand { consumed }) => {
                PROTOCOL_ERRORS.increment();
                sbuf.append(b"ERROR\r\n");
                (ParseVerdict::Malformed, consumed)
            }
            Err(ParseError::Protocol { reason, consumed }) => {
                PROTOCOL_ERRORS.increment();
                sbuf.append(b"CLIENT_ERROR ");
                sbuf.append(reason.as_bytes());
                sbuf.append(b"\r\n");
                (ParseVerdict::Malformed, consumed)
            }
        };
        rbuf.consume(consumed);
        Ok(verdict)
    }

    fn complete_request(
        &mut self,
        completion: StoreReply,
        sbuf: &mut SendChain,
    ) -> Result<(), Error> {
        match completion {
            StoreReply::Stored => sbuf.append(b"STORED\r\n"),
            StoreReply::NotStored => sbuf.append(b"NOT_STORED\r\n"),
            StoreReply::Deleted => sbuf.append(b"DELETED\r\n"),
            StoreReply::NotFound => sbuf.append(b"NOT_FOUND\r\n"),
            StoreReply::Counter(n) => {
                let mut buf = itoa::Buffer::new();
                sbuf.append(buf.format(n).as_bytes());
                sbuf.append(b"\r\n");
            }
            StoreReply::Error(reason) => {
                sbuf.append(b"CLIENT_ERROR ");
                sbuf.append(reason.as_bytes());
                sbuf.append(b"\r\n");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Flush;
    use mio::{Poll, Token, Waker};
    use std::sync::Arc;

    fn handler() -> (AsciiHandler, crossbeam_channel::Receiver<(ConnId, StoreReply)>) {
        let (store, _pool) = BtreeStore::spawn(1);
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = CompletionSink::new(tx, waker);
        (
            AsciiHandler::new(store, ConnId::new(0, 0), sink),
            rx,
        )
    }

    fn drain(sbuf: &mut SendChain) -> Vec<u8> {
        let mut out = Vec::new();
        while sbuf.flush(&mut out).unwrap() == Flush::Outstanding {}
        out
    }

    #[test]
    fn get_miss_stages_end_only() {
        let (mut h, _rx) = handler();
        let mut rbuf = ReceiveBuffer::with_capacity(256);
        let mut sbuf = SendChain::new(256);
        let mut input: &[u8] = b"get missing\r\n";
        rbuf.fill(&mut input).unwrap();

        let v = h.parse_request(&mut rbuf, &mut sbuf).unwrap();
        assert_eq!(v, ParseVerdict::SendNow);
        assert!(rbuf.is_empty());
        assert_eq!(drain(&mut sbuf), b"END\r\n");
    }

    #[test]
    fn set_returns_complex_and_posts_completion() {
        let (mut h, rx) = handler();
        let mut rbuf = ReceiveBuffer::with_capacity(256);
        let mut sbuf = SendChain::new(256);
        let mut input: &[u8] = b"set k 3 0 5\r\nhello\r\n";
        rbuf.fill(&mut input).unwrap();

        let v = h.parse_request(&mut rbuf, &mut sbuf).unwrap();
        assert_eq!(v, ParseVerdict::Complex);
        assert!(rbuf.is_empty());

        let (conn, reply) = rx
            .recv_timeout(std::time::Duration::from_secs(1))
            .unwrap();
        assert_eq!(conn, ConnId::new(0, 0));
        assert_eq!(reply, StoreReply::Stored);

        h.complete_request(reply, &mut sbuf).unwrap();
        assert_eq!(drain(&mut sbuf), b"STORED\r\n");

        // The stored value is now visible to inline reads.
        let mut input: &[u8] = b"get k\r\n";
        rbuf.fill(&mut input).unwrap();
        let v = h.parse_request(&mut rbuf, &mut sbuf).unwrap();
        assert_eq!(v, ParseVerdict::SendNow);
        assert_eq!(drain(&mut sbuf), b"VALUE k 3 5\r\nhello\r\nEND\r\n");
    }

    #[test]
    fn noreply_set_is_parallel() {
        let (mut h, rx) = handler();
        let mut rbuf = ReceiveBuffer::with_capacity(256);
        let mut sbuf = SendChain::new(256);
        let mut input: &[u8] = b"set k 0 0 1 noreply\r\nx\r\n";
        rbuf.fill(&mut input).unwrap();

        let v = h.parse_request(&mut rbuf, &mut sbuf).unwrap();
        assert_eq!(v, ParseVerdict::Parallel);
        assert!(rx
            .recv_timeout(std::time::Duration::from_millis(200))
            .is_err());
    }

    #[test]
    fn partial_consumes_nothing() {
        let (mut h, _rx) = handler();
        let mut rbuf = ReceiveBuffer::with_capacity(256);
        let mut sbuf = SendChain::new(256);
        let mut input: &[u8] = b"set k 0 0 100\r\npartial-value";
        rbuf.fill(&mut input).unwrap();
        let before = rbuf.used();

        let v = h.parse_request(&mut rbuf, &mut sbuf).unwrap();
        assert_eq!(v, ParseVerdict::Partial);
        assert_eq!(rbuf.used(), before);
    }

    #[test]
    fn unknown_command_stages_error() {
        let (mut h, _rx) = handler();
        let mut rbuf = ReceiveBuffer::with_capacity(256);
        let mut sbuf = SendChain::new(256);
        let mut input: &[u8] = b"bogus\r\n";
        rbuf.fill(&mut input).unwrap();

        let v = h.parse_request(&mut rbuf, &mut sbuf).unwrap();
        assert_eq!(v, ParseVerdict::Malformed);
        assert!(rbuf.is_empty());
        assert_eq!(drain(&mut sbuf), b"ERROR\r\n");
    }

    #[test]
    fn quit_and_shutdown_verdicts() {
        let (mut h, _rx) = handler();
        let mut rbuf = ReceiveBuffer::with_capacity(256);
        let mut sbuf = SendChain::new(256);

        let mut input: &[u8] = b"quit\r\n";
        rbuf.fill(&mut input).unwrap();
        assert_eq!(
            h.parse_request(&mut rbuf, &mut sbuf).unwrap(),
            ParseVerdict::Quit
        );

        let mut input: &[u8] = b"shutdown\r\n";
        rbuf.fill(&mut input).unwrap();
        assert_eq!(
            h.parse_request(&mut rbuf, &mut sbuf).unwrap(),
            ParseVerdict::Shutdown
        );
    }

    #[test]
    fn counter_completion_formats_number() {
        let (mut h, _rx) = handler();
        let mut sbuf = SendChain::new(256);
        h.complete_request(StoreReply::Counter(42), &mut sbuf).unwrap();
        assert_eq!(drain(&mut sbuf), b"42\r\n");
    }
}
