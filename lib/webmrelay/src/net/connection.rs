//! Per-socket resumable state. Each connection is a suspension-based
//! state machine: a handler consumes whatever the kernel has buffered and
//! either completes, suspends by leaving its state tag behind, or fails.

use crate::logging;
use crate::net::buffer::{BufferList, NodeId};
use crate::net::stream::StreamId;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use mio::net::TcpStream;
use mio::Ready;
use std::borrow::Cow;
use std::io::{Read, Write};

/// Slab index into the endpoint's connection registry.
pub type ConnId = usize;

/// Initial ingest accumulator size; doubles when full.
pub const SCRATCH_INITIAL_SIZE: usize = 64 * 1024;
/// Hard cap on the accumulator. A publisher that manages to queue this
/// much without producing a complete element is not speaking WebM.
pub const SCRATCH_MAX_SIZE: usize = 64 * 1024 * 1024;

/// Resumption point after the most recent poll wait.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnState {
    /// Waiting for the complete HTTP request line.
    RequestLine,
    /// Consuming header lines until the blank terminator, then dispatch.
    Headers,
    /// Publisher: accumulating bytes until the container header through
    /// Tracks is complete.
    IngestHeader,
    /// Publisher: framing Clusters out of the accumulator.
    IngestClusters,
    /// Viewer: draining stream buffers.
    Egress,
    /// One-shot response (status document, 404), then disconnect.
    SendAndClose,
}

pub struct Connection {
    sock: Option<TcpStream>,

    pub state: ConnState,

    // Poll interest and progress flags
    pub poll_read: bool,
    pub poll_write: bool,
    pub stalled: bool,
    pub is_post: bool,

    // Scratch space: unconsumed request bytes, then the ingest
    // accumulator. `scratch` is kept at its allocated size; `filled`
    // marks the end of valid data.
    scratch: Vec<u8>,
    filled: usize,

    // One-shot response for SendAndClose
    pub response: Cow<'static, [u8]>,
    pub response_pos: usize,

    pub method: String,
    pub resource: String,

    /// The stream this connection publishes to or views, resolved via
    /// the endpoint's registry. The registry owns the stream.
    pub stream: Option<StreamId>,

    /// Viewer cursor into the stream's buffer list, plus the write
    /// offset inside that buffer.
    pub cursor: Option<NodeId>,
    pub cursor_pos: usize,

    pub log: logging::Logger,
}

impl Connection {
    pub fn new(log: logging::Logger) -> Connection {
        Connection {
            sock: None,
            state: ConnState::RequestLine,
            poll_read: true,
            poll_write: false,
            stalled: false,
            is_post: false,
            scratch: Vec::new(),
            filled: 0,
            response: Cow::Borrowed(&[]),
            response_pos: 0,
            method: String::new(),
            resource: String::new(),
            stream: None,
            cursor: None,
            cursor_pos: 0,
            log,
        }
    }

    /// Attaches the accepted socket. Sockets accepted through mio are
    /// already nonblocking.
    pub fn open(&mut self, sock: TcpStream) {
        self.sock = Some(sock);
    }

    #[inline]
    pub fn socket(&self) -> &TcpStream {
        self.sock.as_ref().expect("connection must have a socket")
    }

    #[inline]
    pub fn socket_opt(&self) -> Option<&TcpStream> {
        self.sock.as_ref()
    }

    #[inline]
    pub fn take_socket(&mut self) -> Option<TcpStream> {
        self.sock.take()
    }

    /// Poll interest derived from the connection flags. A stalled viewer
    /// has an empty mask and is woken only by fan-out (or HUP/ERROR,
    /// which poll reports regardless).
    pub fn interest(&self) -> Ready {
        let mut ready = Ready::empty();
        if self.poll_read {
            ready |= Ready::readable();
        }
        if self.poll_write {
            ready |= Ready::writable();
        }
        ready
    }

    /// Drains the socket into the scratch buffer until `WouldBlock`,
    /// doubling the buffer whenever it fills up. EOF is
    /// `Fatal(Closed)`; the bytes read before it remain in scratch.
    pub fn read_available(&mut self) -> NetworkResult<usize> {
        let mut total = 0;

        loop {
            if self.filled == self.scratch.len() {
                let grown = (self.scratch.len() * 2).max(SCRATCH_INITIAL_SIZE);
                if grown > SCRATCH_MAX_SIZE {
                    return Err(NetworkError::Fatal(ErrorType::ScratchOverflow));
                }
                self.scratch.resize(grown, 0);
            }

            let mut sock = self.sock.as_ref().expect("connection must have a socket");
            match sock.read(&mut self.scratch[self.filled..]) {
                Ok(0) => return Err(NetworkError::Fatal(ErrorType::Closed)),
                Ok(count) => {
                    self.filled += count;
                    total += count;
                }
                Err(err) => {
                    let err: NetworkError = err.into();
                    match err {
                        NetworkError::Wait => return Ok(total),
                        fatal => return Err(fatal),
                    }
                }
            }
        }
    }

    /// One nonblocking write. `Wait` suspends, a zero-length write or
    /// hard error is fatal.
    pub fn write_some(&self, data: &[u8]) -> NetworkResult<usize> {
        let mut sock = self.socket();
        match sock.write(data) {
            Ok(0) => Err(NetworkError::Fatal(ErrorType::Io)),
            Ok(count) => Ok(count),
            Err(err) => Err(err.into()),
        }
    }

    #[inline]
    pub fn scratch_data(&self) -> &[u8] {
        &self.scratch[..self.filled]
    }

    #[inline]
    pub fn scratch_data_mut(&mut self) -> &mut [u8] {
        &mut self.scratch[..self.filled]
    }

    /// Splices `count` consumed bytes off the front of the scratch.
    pub fn consume_scratch(&mut self, count: usize) {
        self.scratch.copy_within(count..self.filled, 0);
        self.filled -= count;
    }

    /// Releases the scratch once the request phase (or a viewer
    /// dispatch) no longer needs it.
    pub fn drop_scratch(&mut self) {
        self.scratch = Vec::new();
        self.filled = 0;
    }

    /// Removes and returns the first complete line (terminated by `\n`,
    /// terminator included) from the scratch.
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let length = crate::net::http::first_line_length(self.scratch_data())?;
        let line = self.scratch[..length].to_vec();
        self.consume_scratch(length);
        Some(line)
    }

    /// Fan-out notification: a new cluster buffer was linked at the tail
    /// of this connection's stream. Stalled viewers are rewired to it and
    /// re-admitted to the write poll set; viewers already on the list
    /// will flow into it and just take their reference now. Viewers still
    /// draining their private prefix chain cannot reach the new buffer
    /// and take no reference. Returns true if the poll interest changed.
    pub fn observe_new_tail(&mut self, buffers: &mut BufferList, node: NodeId) -> bool {
        if self.stalled {
            buffers.ref_buffer(node);
            self.cursor = Some(node);
            self.cursor_pos = 0;
            self.stalled = false;
            self.poll_write = true;
            logging::trace!(self.log, "viewer unstalled");
            return true;
        }

        if let Some(cursor) = self.cursor {
            if !buffers.is_private(cursor) {
                buffers.ref_buffer(node);
            }
        }
        false
    }

    /// Disconnect cleanup for a viewer: drop the reference on every
    /// buffer this connection would still have received.
    pub fn release_buffers(&mut self, buffers: &mut BufferList) {
        let mut cursor = self.cursor.take();
        while let Some(node) = cursor {
            cursor = buffers.next(node);
            buffers.unref_buffer(node);
        }
        self.cursor_pos = 0;
    }
}
