//! The contract between the connection state machine and the request
//! handler that parses and executes requests.

use crate::buffer::{ReceiveBuffer, SendChain};
use crate::error::Error;

/// What one parse attempt produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseVerdict {
    /// The request was unparseable. The handler has already staged its error
    /// response and consumed the offending bytes; the connection continues
    /// with the next request.
    Malformed,
    /// The buffered bytes do not yet hold a complete request. Nothing was
    /// consumed.
    Partial,
    /// The client asked to close this connection.
    Quit,
    /// The client asked to shut the server down.
    Shutdown,
    /// Asynchronous back-end work was started. Exactly one completion will be
    /// delivered to this connection.
    Complex,
    /// The request was satisfied inline, or work was dispatched that needs no
    /// completion. No completion event may be delivered for it.
    Parallel,
    /// The response is fully staged in the send chain; flush it.
    SendNow,
}

/// A request parser/executor bound to one connection.
///
/// The state machine delivers exactly one `parse_request` call per attempt to
/// make progress on the receive buffer. The handler reads from the buffer
/// view, consumes exactly the bytes it has committed to interpreting
/// (possibly zero on [`ParseVerdict::Partial`]), appends response bytes to
/// the send chain, and returns a verdict.
///
/// The `Complex`/`Parallel` split is a strict obligation: a handler returning
/// `Complex` must cause exactly one completion to reach the owning
/// connection; one returning `Parallel` must not.
pub trait RequestHandler {
    /// The back-end's result payload for a complex request.
    type Completion;

    fn parse_request(
        &mut self,
        rbuf: &mut ReceiveBuffer,
        sbuf: &mut SendChain,
    ) -> Result<ParseVerdict, Error>;

    /// Stage the response for a completed complex request. The state machine
    /// flushes afterwards.
    fn complete_request(
        &mut self,
        completion: Self::Completion,
        sbuf: &mut SendChain,
    ) -> Result<(), Error>;
}
