//! The poll loop and the two registries. A single thread owns the
//! listener, the signal and timer sources, every connection, and every
//! stream; handlers run between poll wakeups and never block.

use crate::logging;
use crate::net::buffer::{Content, NodeId};
use crate::net::connection::{ConnId, ConnState, Connection};
use crate::net::http;
use crate::net::stream::{self, Stream, StreamId};
use crate::net::support::{ErrorType, ErrorUtils, NetworkError, NetworkResult};
use crate::time::{time_now, Usec, USEC_PER_SEC};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use mio::net::TcpListener;
use mio::unix::UnixReady;
use mio::{Events, Poll, PollOpt, Ready, Token};
use mio_extras::timer::{self, Timer};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v0_6::Signals;
use std::borrow::Cow;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;

pub const SERVER_TOKEN: &str = concat!("webmrelay v", env!("CARGO_PKG_VERSION"));

// Fixed poll sources; connection tokens start after them.
const TOKEN_SIGNALS: Token = Token(0);
const TOKEN_LISTENER: Token = Token(1);
const TOKEN_TIMER: Token = Token(2);
const FIRST_CONN_TOKEN: usize = 3;

const GC_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// A viewer whose next buffer is this far behind the live tail is cut
/// off so it can reconnect onto a fresh intro.
const STALE_VIEWER_CUTOFF: Usec = 30 * USEC_PER_SEC;

lazy_static! {
    static ref STREAM_PREAMBLE: String = format!(
        "HTTP/1.1 200 OK\r\n\
         Server: {}\r\n\
         Transfer-Encoding: chunked\r\n\
         Connection: close\r\n\
         Cache-Control: no-cache\r\n\
         Content-Type: video/webm\r\n\
         \r\n",
        SERVER_TOKEN
    );
    static ref NOT_FOUND: String = format!(
        "HTTP/1.0 404 Not Found\r\n\
         Server: {}\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         Found nothing to serve to you. Sorry about that.\r\n",
        SERVER_TOKEN
    );
}

fn stream_preamble() -> &'static [u8] {
    STREAM_PREAMBLE.as_bytes()
}

fn not_found_response() -> &'static [u8] {
    NOT_FOUND.as_bytes()
}

#[inline]
fn conn_token(cid: ConnId) -> Token {
    Token(FIRST_CONN_TOKEN + cid)
}

/// Wall-clock lag check for the egress path: the next buffer's append
/// time against the stream's live tail.
#[inline]
fn viewer_is_stale(buffer_timecode: Usec, latest_cluster_received_at: Usec) -> bool {
    buffer_timecode + STALE_VIEWER_CUTOFF < latest_cluster_received_at
}

/// Handles all connection management, ingest parsing and fan-out.
pub struct Endpoint {
    listener: TcpListener,

    poll: Poll,
    events: Events,
    signals: Signals,
    timer: Timer<()>,

    conns: Vec<Option<Connection>>,
    free_conns: Vec<ConnId>,

    streams: Vec<Option<Stream>>,
    free_streams: Vec<StreamId>,
    paths: HashMap<String, StreamId>,

    stream_timeout: Duration,

    log: logging::Logger,
}

impl Endpoint {
    /// Binds the listener and registers the fixed poll sources. The
    /// address is `<ip>:<port>`.
    pub fn new(
        address: &str,
        stream_timeout: Duration,
        log: logging::Logger,
    ) -> io::Result<Endpoint> {
        let address: SocketAddr = address.parse().map_err(|err| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("bad bind address: {}", err))
        })?;

        let listener = TcpListener::bind(&address)?;
        let poll = Poll::new()?;
        let signals = Signals::new(&[SIGINT, SIGTERM])?;
        let mut timer = timer::Builder::default().build();
        timer.set_timeout(GC_TICK_INTERVAL, ());

        poll.register(&signals, TOKEN_SIGNALS, Ready::readable(), PollOpt::level())?;
        poll.register(&listener, TOKEN_LISTENER, Ready::readable(), PollOpt::level())?;
        poll.register(&timer, TOKEN_TIMER, Ready::readable(), PollOpt::edge())?;

        Ok(Endpoint {
            listener,
            poll,
            events: Events::with_capacity(1024),
            signals,
            timer,
            conns: Vec::new(),
            free_conns: Vec::new(),
            streams: Vec::new(),
            free_streams: Vec::new(),
            paths: HashMap::new(),
            stream_timeout,
            log,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the poll loop until SIGINT or SIGTERM arrives. Shutdown does
    /// not drain connections.
    pub fn run(&mut self) -> io::Result<()> {
        let address = self.local_addr()?;
        logging::info!(self.log, "serving"; "address" => %address);

        loop {
            self.poll.poll(&mut self.events, None)?;

            let ready: Vec<(Token, Ready)> =
                self.events.iter().map(|event| (event.token(), event.readiness())).collect();

            // Shutdown breaks the loop before any connection handling.
            if ready.iter().any(|&(token, _)| token == TOKEN_SIGNALS) && self.drain_signals() {
                logging::info!(self.log, "shutdown signal received");
                return Ok(());
            }

            let mut accept_pending = false;
            for (token, readiness) in ready {
                match token {
                    TOKEN_SIGNALS => {}
                    TOKEN_LISTENER => accept_pending = true,
                    TOKEN_TIMER => self.on_timer(),
                    token => self.on_connection_event(token.0 - FIRST_CONN_TOKEN, readiness),
                }
            }

            // New connections are admitted only after the per-connection
            // pass: an event pass never touches a connection it did not
            // poll for.
            if accept_pending {
                self.accept_clients();
            }
        }
    }

    fn drain_signals(&mut self) -> bool {
        let mut shutdown = false;
        for signal in self.signals.pending() {
            if signal == SIGINT || signal == SIGTERM {
                shutdown = true;
            }
        }
        shutdown
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((sock, address)) => {
                    let cid = match self.free_conns.pop() {
                        Some(cid) => cid,
                        None => {
                            self.conns.push(None);
                            self.conns.len() - 1
                        }
                    };

                    let mut conn = Connection::new(self.log.new(logging::o!("client" => cid)));
                    conn.open(sock);

                    self.poll
                        .register(
                            conn.socket(),
                            conn_token(cid),
                            conn.interest(),
                            PollOpt::level(),
                        )
                        .expect("connection registration failed");

                    logging::debug!(conn.log, "client connected"; "address" => %address);
                    self.conns[cid] = Some(conn);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    logging::error!(self.log, "accept failed"; "error" => %err);
                    return;
                }
            }
        }
    }

    fn on_connection_event(&mut self, cid: ConnId, readiness: Ready) {
        // The connection may have been torn down earlier in this pass.
        if self.conns.get(cid).map_or(true, |slot| slot.is_none()) {
            return;
        }

        if readiness.is_readable() && self.conn(cid).poll_read {
            self.on_readable(cid);
        }

        if let Some(Some(conn)) = self.conns.get(cid) {
            if readiness.is_writable() && conn.poll_write {
                self.on_writable(cid);
            }
        }

        // Errored or hung-up sockets are torn down once any buffered
        // input has been consumed above.
        let unix = UnixReady::from(readiness);
        if unix.is_hup() || unix.is_error() {
            self.disconnect(cid);
            return;
        }

        self.refresh_interest(cid);
    }

    fn on_readable(&mut self, cid: ConnId) {
        let result = match self.conn(cid).state {
            ConnState::RequestLine | ConnState::Headers => self.pump_request(cid),
            ConnState::IngestHeader | ConnState::IngestClusters => self.pump_ingest(cid),
            _ => Ok(()),
        };

        if result.has_failed() {
            self.disconnect(cid);
        }
    }

    fn on_writable(&mut self, cid: ConnId) {
        let result = match self.conn(cid).state {
            ConnState::Egress => self.pump_egress(cid),
            ConnState::SendAndClose => self.pump_send_and_close(cid),
            _ => Ok(()),
        };

        if result.has_failed() {
            self.disconnect(cid);
        }
    }

    /// Request-phase pump: consume whole lines out of the scratch, parse
    /// the request line and headers, dispatch on the blank terminator.
    /// A request that arrives together with EOF is still dispatched; the
    /// read error only counts if the connection is left mid-request.
    fn pump_request(&mut self, cid: ConnId) -> NetworkResult<()> {
        let read_result = self.conn_mut(cid).read_available();
        self.drain_request_scratch(cid)?;

        match self.conn(cid).state {
            ConnState::RequestLine | ConnState::Headers => read_result.map(|_| ()),
            _ => Ok(()),
        }
    }

    fn drain_request_scratch(&mut self, cid: ConnId) -> NetworkResult<()> {
        loop {
            match self.conn(cid).state {
                ConnState::RequestLine => {
                    let line = match self.conn_mut(cid).take_line() {
                        Some(line) => line,
                        None => return Ok(()),
                    };

                    let text = String::from_utf8_lossy(&line).into_owned();
                    let conn = self.conn_mut(cid);
                    match http::parse_request_line(&text) {
                        Some((method, resource)) => {
                            logging::debug!(conn.log, "request";
                                "method" => &method, "resource" => &resource);
                            conn.is_post = method == "POST";
                            conn.method = method;
                            conn.resource = resource;
                            conn.state = ConnState::Headers;
                        }
                        None => {
                            logging::warn!(conn.log, "malformed request line");
                            return Err(NetworkError::Fatal(ErrorType::BadRequest));
                        }
                    }
                }
                ConnState::Headers => {
                    let line = match self.conn_mut(cid).take_line() {
                        Some(line) => line,
                        None => return Ok(()),
                    };

                    if http::is_blank_line(&line) {
                        self.dispatch(cid)?;
                        continue;
                    }

                    let text = String::from_utf8_lossy(&line).into_owned();
                    if let Some((name, value)) = http::parse_header_line(&text) {
                        logging::trace!(self.conn(cid).log, "header";
                            "name" => &name, "value" => &value);
                    }
                }
                // Dispatch moved the connection on; its own pump takes
                // over from the next readiness event.
                _ => return Ok(()),
            }
        }
    }

    /// Decides what to do with a complete request.
    fn dispatch(&mut self, cid: ConnId) -> NetworkResult<()> {
        let resource = self.conn(cid).resource.clone();
        let is_post = self.conn(cid).is_post;

        if resource == "/" || resource == "/index.json" {
            return self.begin_status(cid);
        }

        let (path, query) = http::split_resource(&resource);

        if is_post {
            return self.begin_ingest(cid, path, query);
        }

        match self.paths.get(path).copied() {
            Some(sid) => self.begin_egress(cid, sid),
            None => {
                logging::debug!(self.conn(cid).log, "nothing to serve"; "path" => path);
                self.begin_send_and_close(cid, Cow::Borrowed(not_found_response()));
                Ok(())
            }
        }
    }

    fn begin_status(&mut self, cid: ConnId) -> NetworkResult<()> {
        let document = self.status_document();
        let response = format!(
            "HTTP/1.0 200 OK\r\n\
             Server: {}\r\n\
             Content-Type: application/json\r\n\
             \r\n\
             {}",
            SERVER_TOKEN, document
        );

        self.begin_send_and_close(cid, Cow::Owned(response.into_bytes()));
        Ok(())
    }

    fn begin_send_and_close(&mut self, cid: ConnId, response: Cow<'static, [u8]>) {
        let conn = self.conn_mut(cid);
        conn.response = response;
        conn.response_pos = 0;
        conn.state = ConnState::SendAndClose;
        conn.poll_write = true;
        conn.poll_read = false;
        conn.drop_scratch();
    }

    /// Publisher attach: create or resume the stream at `path`, record
    /// its query parameters, and start parsing the body already sitting
    /// in the request scratch.
    fn begin_ingest(&mut self, cid: ConnId, path: &str, query: &str) -> NetworkResult<()> {
        let sid = match self.paths.get(path).copied() {
            Some(sid) => {
                self.stream_mut(sid).publisher_attached();
                logging::info!(self.log, "continuing stream"; "path" => path);
                sid
            }
            None => {
                let sid = self.alloc_stream(Stream::new(path.to_string()));
                self.paths.insert(path.to_string(), sid);
                logging::info!(self.log, "new stream"; "path" => path);
                sid
            }
        };
        self.stream_mut(sid).record_params(query);

        let conn = self.conn_mut(cid);
        conn.stream = Some(sid);
        conn.state = ConnState::IngestHeader;
        conn.poll_read = true;
        conn.poll_write = false;

        self.drain_ingest_scratch(cid)
    }

    /// Viewer attach: three private buffers (HTTP preamble, shared video
    /// header, intro snapshot), then stall until fan-out rewires us.
    fn begin_egress(&mut self, cid: ConnId, sid: StreamId) -> NetworkResult<()> {
        let now = time_now();

        let (header, intro) = {
            let stream = self.stream(sid);
            (stream.header(), stream.intro_image().to_vec())
        };

        let first = {
            let buffers = &mut self.stream_mut(sid).buffers;

            let first = buffers.new_private(Content::Static(stream_preamble()), now);
            let mut tail = first;

            if let Some(header) = header {
                let node = buffers.new_private(Content::Shared(header), now);
                buffers.chain(tail, node);
                tail = node;
            }

            // An empty chunk would terminate the response, so a viewer
            // arriving before the first keyframe gets no intro buffer.
            if !intro.is_empty() {
                let node = buffers.new_private_chunked(&intro, now);
                buffers.chain(tail, node);
            }

            first
        };

        let conn = self.conn_mut(cid);
        conn.stream = Some(sid);
        conn.state = ConnState::Egress;
        conn.cursor = Some(first);
        conn.cursor_pos = 0;
        conn.poll_write = true;
        conn.poll_read = false;
        conn.drop_scratch();
        logging::info!(conn.log, "viewer attached");

        Ok(())
    }

    /// Ingest pump: drain the socket, then frame and dispatch whatever
    /// is complete in the accumulator. Read errors surface only after
    /// buffered input has been processed.
    fn pump_ingest(&mut self, cid: ConnId) -> NetworkResult<()> {
        let read_result = self.conn_mut(cid).read_available();
        self.drain_ingest_scratch(cid)?;

        match read_result {
            Ok(_) => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn drain_ingest_scratch(&mut self, cid: ConnId) -> NetworkResult<()> {
        loop {
            match self.conn(cid).state {
                ConnState::IngestHeader => {
                    let header = {
                        let conn = self.conn_mut(cid);
                        match stream::try_extract_header(conn.scratch_data_mut()) {
                            Some(length) => {
                                let header = conn.scratch_data()[..length].to_vec();
                                conn.consume_scratch(length);
                                Some(header)
                            }
                            None => None,
                        }
                    };

                    match header {
                        Some(header) => {
                            let sid = self.conn(cid).stream.expect("publisher not bound");
                            self.stream_mut(sid).set_header(&header);

                            let conn = self.conn_mut(cid);
                            conn.state = ConnState::IngestClusters;
                            logging::info!(conn.log, "extracted video header";
                                "bytes" => header.len());
                        }
                        None => return Ok(()),
                    }
                }
                ConnState::IngestClusters => {
                    let span = stream::try_extract_cluster(self.conn(cid).scratch_data())?;
                    match span {
                        Some(span) => {
                            let cluster =
                                self.conn(cid).scratch_data()[span.start..span.end].to_vec();
                            self.conn_mut(cid).consume_scratch(span.end);

                            let sid = self.conn(cid).stream.expect("publisher not bound");
                            let node = self.stream_mut(sid).ingest_cluster(&cluster, time_now());
                            logging::debug!(self.conn(cid).log, "received cluster";
                                "bytes" => cluster.len());

                            self.fan_out(sid, node, cid);
                        }
                        None => return Ok(()),
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Fan-out trigger: after a Cluster lands at the list tail, every
    /// other connection bound to the stream takes its reference; stalled
    /// viewers are rewired to the tail and re-admitted to the write set.
    /// The pipeline then drops its own temporary reference.
    fn fan_out(&mut self, sid: StreamId, node: NodeId, publisher: ConnId) {
        let mut rewired: Vec<ConnId> = Vec::new();

        {
            let Endpoint { conns, streams, .. } = self;
            let stream = streams[sid].as_mut().expect("stream slot empty");
            let buffers = &mut stream.buffers;

            for (cid, slot) in conns.iter_mut().enumerate() {
                if cid == publisher {
                    continue;
                }
                let conn = match slot {
                    Some(conn) if conn.stream == Some(sid) => conn,
                    _ => continue,
                };

                if conn.observe_new_tail(buffers, node) {
                    rewired.push(cid);
                }
            }

            // Only the viewers need the buffer now.
            buffers.unref_buffer(node);
        }

        for cid in rewired {
            self.refresh_interest(cid);
        }
    }

    /// Egress pump: drain the current buffer into the socket, advance
    /// along the list, unref what was finished, stall at the end.
    fn pump_egress(&mut self, cid: ConnId) -> NetworkResult<()> {
        loop {
            let (sid, node) = {
                let conn = self.conn(cid);
                let sid = conn.stream.expect("viewer not bound");
                match conn.cursor {
                    Some(node) => (sid, node),
                    None => return Ok(()),
                }
            };

            loop {
                let written = {
                    let conn = self.conn(cid);
                    let content = self.stream(sid).buffers.content(node);
                    if conn.cursor_pos >= content.len() {
                        break;
                    }
                    conn.write_some(&content[conn.cursor_pos..])?
                };
                self.conn_mut(cid).cursor_pos += written;
            }

            let next = self.stream(sid).buffers.next(node);
            self.stream_mut(sid).buffers.unref_buffer(node);

            match next {
                Some(next_node) => {
                    let stale = {
                        let stream = self.stream(sid);
                        viewer_is_stale(
                            stream.buffers.timecode(next_node),
                            stream.latest_cluster_received_at,
                        )
                    };

                    let conn = self.conn_mut(cid);
                    conn.cursor = Some(next_node);
                    conn.cursor_pos = 0;

                    if stale {
                        // Too far behind live; let the client reconnect
                        // onto a fresh intro. Cleanup releases the
                        // remaining buffers from the cursor onwards.
                        logging::debug!(conn.log, "viewer too far behind, disconnecting");
                        return Err(NetworkError::Fatal(ErrorType::Closed));
                    }
                }
                None => {
                    let conn = self.conn_mut(cid);
                    conn.cursor = None;
                    conn.cursor_pos = 0;
                    conn.stalled = true;
                    conn.poll_write = false;
                    logging::trace!(conn.log, "viewer stalled");
                    return Ok(());
                }
            }
        }
    }

    fn pump_send_and_close(&mut self, cid: ConnId) -> NetworkResult<()> {
        loop {
            let written = {
                let conn = self.conn(cid);
                let data = &conn.response[conn.response_pos..];
                if data.is_empty() {
                    break;
                }
                conn.write_some(data)?
            };
            self.conn_mut(cid).response_pos += written;
        }

        self.disconnect(cid);
        Ok(())
    }

    /// Tears a connection down: runs the state machine's cleanup step,
    /// removes the poll registration, and releases the slot.
    fn disconnect(&mut self, cid: ConnId) {
        let mut conn = match self.conns.get_mut(cid).and_then(|slot| slot.take()) {
            Some(conn) => conn,
            None => return,
        };
        self.free_conns.push(cid);

        match conn.state {
            ConnState::IngestHeader | ConnState::IngestClusters => {
                // Publisher teardown: roll the observed timeline into
                // the offset for the next publisher of this path.
                let slot = conn.stream.and_then(|sid| self.streams.get_mut(sid));
                if let Some(stream) = slot.and_then(|slot| slot.as_mut()) {
                    stream.commit_publisher_offset(time_now());
                    logging::info!(conn.log, "publisher left";
                        "path" => &stream.path,
                        "offset" => stream.prev_sources_offset());
                }
            }
            ConnState::Egress => {
                let slot = conn.stream.and_then(|sid| self.streams.get_mut(sid));
                if let Some(stream) = slot.and_then(|slot| slot.as_mut()) {
                    conn.release_buffers(&mut stream.buffers);
                }
            }
            _ => {}
        }

        if let Some(sock) = conn.take_socket() {
            drop(self.poll.deregister(&sock));
            drop(sock.shutdown(Shutdown::Both));
        }

        logging::debug!(conn.log, "client disconnected");
    }

    /// Re-derives the poll registration from the connection's flags.
    fn refresh_interest(&self, cid: ConnId) {
        if let Some(Some(conn)) = self.conns.get(cid) {
            if let Some(sock) = conn.socket_opt() {
                self.poll
                    .reregister(sock, conn_token(cid), conn.interest(), PollOpt::level())
                    .expect("connection reregistration failed");
            }
        }
    }

    fn on_timer(&mut self) {
        while self.timer.poll().is_some() {}

        self.run_stream_gc(time_now());
        self.timer.set_timeout(GC_TICK_INTERVAL, ());
    }

    /// Deletes streams whose publisher has been gone longer than the
    /// configured timeout, disconnecting every viewer still bound.
    fn run_stream_gc(&mut self, now: Usec) {
        let timeout = self.stream_timeout.as_secs() as Usec * USEC_PER_SEC;

        let expired: Vec<StreamId> = self
            .streams
            .iter()
            .enumerate()
            .filter_map(|(sid, slot)| {
                let stream = slot.as_ref()?;
                match stream.last_disconnect_at {
                    Some(at) if now - at >= timeout => Some(sid),
                    _ => None,
                }
            })
            .collect();

        for sid in expired {
            self.destroy_stream(sid);
        }
    }

    fn destroy_stream(&mut self, sid: StreamId) {
        for cid in 0..self.conns.len() {
            let bound = self.conns[cid].as_ref().map_or(false, |conn| conn.stream == Some(sid));
            if bound {
                self.disconnect(cid);
            }
        }

        let stream = self.streams[sid].take().expect("stream slot empty");
        self.free_streams.push(sid);
        self.paths.remove(&stream.path);

        logging::info!(self.log, "idle stream deleted"; "path" => &stream.path);
    }

    /// Status document: every stream path with its recorded publisher
    /// parameters.
    fn status_document(&self) -> String {
        let mut root = serde_json::Map::new();

        for (path, &sid) in &self.paths {
            let mut params = serde_json::Map::new();
            for (name, value) in self.stream(sid).params() {
                let value = match value {
                    Some(value) => serde_json::Value::String(value.clone()),
                    None => serde_json::Value::Null,
                };
                params.insert(name.clone(), value);
            }
            root.insert(path.clone(), serde_json::Value::Object(params));
        }

        serde_json::Value::Object(root).to_string()
    }

    fn alloc_stream(&mut self, stream: Stream) -> StreamId {
        match self.free_streams.pop() {
            Some(sid) => {
                self.streams[sid] = Some(stream);
                sid
            }
            None => {
                self.streams.push(Some(stream));
                self.streams.len() - 1
            }
        }
    }

    #[inline]
    fn conn(&self, cid: ConnId) -> &Connection {
        self.conns[cid].as_ref().expect("connection slot empty")
    }

    #[inline]
    fn conn_mut(&mut self, cid: ConnId) -> &mut Connection {
        self.conns[cid].as_mut().expect("connection slot empty")
    }

    #[inline]
    fn stream(&self, sid: StreamId) -> &Stream {
        self.streams[sid].as_ref().expect("stream slot empty")
    }

    #[inline]
    fn stream_mut(&mut self, sid: StreamId) -> &mut Stream {
        self.streams[sid].as_mut().expect("stream slot empty")
    }
}
