//! ASCII memcached command parsing.
//!
//! `Command::parse` interprets a prefix of the receive buffer without
//! copying. It either returns a command plus the number of bytes it spans,
//! reports that the buffered bytes are incomplete, or reports a protocol
//! error carrying the byte count to skip so the connection can recover at
//! the next request boundary.

const CRLF: &[u8] = b"\r\n";

/// Maximum key length accepted, matching memcached.
pub const MAX_KEY_LEN: usize = 250;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    /// A complete request is not yet buffered.
    #[error("incomplete request")]
    Incomplete,
    /// The command name is not recognized. Skip `consumed` bytes to recover.
    #[error("unknown command")]
    UnknownCommand { consumed: usize },
    /// The command was recognized but its arguments or data block are bad.
    /// Skip `consumed` bytes to recover.
    #[error("protocol error: {reason}")]
    Protocol {
        reason: &'static str,
        consumed: usize,
    },
}

/// Which storage semantics a set-family command requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePolicy {
    /// Unconditional store.
    Set,
    /// Store only if the key is absent.
    Add,
    /// Store only if the key is present.
    Replace,
}

/// One parsed request, borrowing from the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Get {
        keys: Vec<&'a [u8]>,
    },
    Store {
        policy: StorePolicy,
        key: &'a [u8],
        flags: u32,
        exptime: u32,
        value: &'a [u8],
        noreply: bool,
    },
    Delete {
        key: &'a [u8],
        noreply: bool,
    },
    Incr {
        key: &'a [u8],
        delta: u64,
        noreply: bool,
    },
    Decr {
        key: &'a [u8],
        delta: u64,
        noreply: bool,
    },
    Version,
    Quit,
    Shutdown,
}

impl<'a> Command<'a> {
    /// Parse one command from the front of `buf`.
    ///
    /// On success returns the command and the total bytes it spans (command
    /// line plus any data block, terminators included).
    pub fn parse(buf: &'a [u8]) -> Result<(Command<'a>, usize), ParseError> {
        let line_end = match find_crlf(buf) {
            Some(pos) => pos,
            None => return Err(ParseError::Incomplete),
        };
        let line = &buf[..line_end];
        let line_len = line_end + CRLF.len();

        let mut fields = line.split(|b| *b == b' ').filter(|f| !f.is_empty());
        let name = fields.next().unwrap_or(b"");

        match name {
            b"get" | b"gets" => {
                let keys: Vec<&[u8]> = fields.collect();
                if keys.is_empty() {
                    return Err(ParseError::Protocol {
                        reason: "bad command line format",
                        consumed: line_len,
                    });
                }
                for key in &keys {
                    if key.len() > MAX_KEY_LEN {
                        return Err(ParseError::Protocol {
                            reason: "key too long",
                            consumed: line_len,
                        });
                    }
                }
                Ok((Command::Get { keys }, line_len))
            }
            b"set" | b"add" | b"replace" => {
                let policy = match name {
                    b"set" => StorePolicy::Set,
                    b"add" => StorePolicy::Add,
                    _ => StorePolicy::Replace,
                };
                parse_store(buf, line_len, fields, policy)
            }
            b"delete" => {
                let key = match fields.next() {
                    Some(k) if k.len() <= MAX_KEY_LEN => k,
                    _ => {
                        return Err(ParseError::Protocol {
                            reason: "bad command line format",
                            consumed: line_len,
                        });
                    }
                };
                let noreply = parse_noreply(fields, line_len)?;
                Ok((Command::Delete { key, noreply }, line_len))
            }
            b"incr" | b"decr" => {
                let key = match fields.next() {
                    Some(k) if k.len() <= MAX_KEY_LEN => k,
                    _ => {
                        return Err(ParseError::Protocol {
                            reason: "bad command line format",
                            consumed: line_len,
                        });
                    }
                };
                let delta = parse_number::<u64>(fields.next()).ok_or(ParseError::Protocol {
                    reason: "invalid numeric delta argument",
                    consumed: line_len,
                })?;
                let noreply = parse_noreply(fields, line_len)?;
                let cmd = if name == b"incr" {
                    Command::Incr { key, delta, noreply }
                } else {
                    Command::Decr { key, delta, noreply }
                };
                Ok((cmd, line_len))
            }
            b"version" => Ok((Command::Version, line_len)),
            b"quit" => Ok((Command::Quit, line_len)),
            b"shutdown" => Ok((Command::Shutdown, line_len)),
            _ => Err(ParseError::UnknownCommand { consumed: line_len }),
        }
    }
}

/// Parse the tail of a set/add/replace: arguments, then the data block.
fn parse_store<'a>(
    buf: &'a [u8],
    line_len: usize,
    mut fields: impl Iterator<Item = &'a [u8]>,
    policy: StorePolicy,
) -> Result<(Command<'a>, usize), ParseError> {
    let bad = |reason| ParseError::Protocol {
        reason,
        consumed: line_len,
    };

    let key = fields.next().ok_or(bad("bad command line format"))?;
    if key.len() > MAX_KEY_LEN {
        return Err(bad("key too long"));
    }
    let flags = parse_number::<u32>(fields.next()).ok_or(bad("bad command line format"))?;
    let exptime = parse_number::<u32>(fields.next()).ok_or(bad("bad command line format"))?;
    let bytes = parse_number::<usize>(fields.next()).ok_or(bad("bad command line format"))?;
    let noreply = parse_noreply(fields, line_len)?;

    // The data block: <bytes> octets followed by CRLF.
    let total = line_len + bytes + CRLF.len();
    if buf.len() < total {
        return Err(ParseError::Incomplete);
    }
    let value = &buf[line_len..line_len + bytes];
    if &buf[line_len + bytes..total] != CRLF {
        return Err(ParseError::Protocol {
            reason: "bad data chunk",
            consumed: total,
        });
    }

    Ok((
        Command::Store {
            policy,
            key,
            flags,
            exptime,
            value,
            noreply,
        },
        total,
    ))
}

fn parse_noreply<'a>(
    mut fields: impl Iterator<Item = &'a [u8]>,
    line_len: usize,
) -> Result<bool, ParseError> {
    match fields.next() {
        None => Ok(false),
        Some(b"noreply") => Ok(true),
        Some(_) => Err(ParseError::Protocol {
            reason: "bad command line format",
            consumed: line_len,
        }),
    }
}

fn parse_number<T: std::str::FromStr>(field: Option<&[u8]>) -> Option<T> {
    std::str::from_utf8(field?).ok()?.parse().ok()
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}
