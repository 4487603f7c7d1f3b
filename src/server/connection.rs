use crate::{
    errors::ErrorKind,
    http::{
        chunked::ChunkedDecoder,
        parser::{self, Parser},
        request::{BodySink, Request, RequestHead},
        response::{BodySource, Framing, Response},
        types::{Method, StatusCode, Version},
    },
    limits::{ConnLimits, ReqLimits, RespLimits},
    server::{
        handlers::{self, Handlers},
        server_impl::{AllLimits, Shared},
    },
    Error,
};
use std::{
    io::Write,
    net::SocketAddr,
    sync::{atomic::Ordering, Weak},
    time::Instant,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, trace, warn};

/// Position of a connection in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    AwaitingRequestLine,
    ParsingHeaders,
    AwaitingBody,
    DispatchingHandler,
    StreamingResponse,
    Done,
    Aborted,
}

/// Serves the requests of one socket at a time.
///
/// Owned by a worker and reused for every connection it picks up.
pub(crate) struct HttpConnection {
    handlers: Handlers,
    shared: Weak<Shared>,

    pub(crate) parser: Parser,
    out: Vec<u8>,
    chunk: Vec<u8>,

    pub(crate) connection: Connection,
    state: State,
    version: Version,

    json_errors: bool,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
}

impl HttpConnection {
    #[inline]
    pub(crate) fn new(handlers: Handlers, limits: &AllLimits, shared: Weak<Shared>) -> Self {
        let (server_limits, conn_limits, req_limits, resp_limits) = limits.clone();

        Self {
            handlers,
            shared,

            parser: Parser::new(&req_limits),
            out: Vec::with_capacity(resp_limits.default_capacity),
            chunk: vec![0; resp_limits.chunk_size.max(1)],

            connection: Connection::new(),
            state: State::Done,
            version: Version::Http11,

            json_errors: server_limits.json_errors,
            conn_limits,
            req_limits,
            resp_limits,
        }
    }

    #[inline]
    fn set_state(&mut self, state: State) {
        trace!(peer = %self.connection.peer, from = ?self.state, to = ?state, "connection state");
        self.state = state;
    }

    #[inline]
    fn reset_response_buffer(&mut self) {
        if self.out.capacity() > self.resp_limits.max_capacity {
            self.out = Vec::with_capacity(self.resp_limits.default_capacity);
        }
        self.out.clear();
    }
}

impl HttpConnection {
    /// Runs the connection until it closes. Never returns an error: failures
    /// are answered (when the protocol still allows it) and logged.
    pub(crate) async fn run<S>(&mut self, stream: &mut S, peer: SocketAddr, local: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.connection.reset(peer, local);
        self.parser.reset();
        let _active = ActiveGuard::enter(&self.shared);

        debug!(%peer, %local, "connection opened");

        match self.impl_run(stream).await {
            Ok(()) => self.set_state(State::Done),
            Err(err) => {
                self.set_state(State::Aborted);
                self.abort(stream, err).await;
            }
        }

        let _ = tokio::time::timeout(self.conn_limits.socket_write_timeout, stream.shutdown()).await;

        debug!(
            peer = %self.connection.peer,
            local = %self.connection.local,
            requests = self.connection.request_count,
            bytes_read = self.parser.bytes_read,
            bytes_written = self.connection.bytes_written,
            "connection closed"
        );
    }

    async fn impl_run<S>(&mut self, stream: &mut S) -> Result<(), ErrorKind>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let read_timeout = self.conn_limits.socket_read_timeout;

        loop {
            self.version = Version::Http11;
            self.set_state(State::AwaitingRequestLine);

            let Some(line) = self
                .parser
                .read_request_line(stream, &self.req_limits, read_timeout)
                .await?
            else {
                return Ok(());
            };
            self.version = line.version;

            self.set_state(State::ParsingHeaders);
            let headers = self
                .parser
                .read_headers(stream, &self.req_limits, read_timeout)
                .await?;
            let head = parser::build_head(line, headers, self.connection.peer)?;

            self.set_state(State::AwaitingBody);
            let keep_alive = self.serve(stream, head).await?;
            self.connection.request_count += 1;

            if !keep_alive {
                return Ok(());
            }
        }
    }

    /// Handles one parsed request. Returns whether the connection stays open.
    async fn serve<S>(&mut self, stream: &mut S, head: RequestHead) -> Result<bool, ErrorKind>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let snapshot = self.handlers.snapshot();

        let (response, request, force_close) = match handlers::resolve_in(&snapshot, &head) {
            Some((mut request, handler)) => {
                if head.has_body() {
                    if head.expects_continue() {
                        let mut line = StatusCode::Continue.into_first_line(Version::Http11).to_vec();
                        line.extend_from_slice(b"\r\n");
                        self.write(stream, &line).await?;
                    }

                    request.open().map_err(sink_error)?;
                    self.read_body(stream, &head, Some(&mut request)).await?;
                    request.close().map_err(sink_error)?;
                }

                self.set_state(State::DispatchingHandler);
                let (result, request) = handler.process(request).await;
                let response = result.unwrap_or_else(|err| {
                    error!(
                        peer = %head.peer_addr(),
                        method = %head.method(),
                        path = head.path(),
                        error = %err,
                        "processor failed"
                    );
                    Response::status_only(StatusCode::InternalServerError)
                });

                (response, Some(request), false)
            }
            None => {
                // A client waiting for `100 Continue` never gets to send its body
                let skip_body = head.has_body() && head.expects_continue();
                if head.has_body() && !skip_body {
                    self.read_body(stream, &head, None).await?;
                }

                self.set_state(State::DispatchingHandler);
                (Response::status_only(StatusCode::NotFound), None, skip_body)
            }
        };

        self.set_state(State::StreamingResponse);
        let keep_alive = self.write_response(stream, &head, response, force_close).await;

        // Body files live until the response is out
        drop(request);
        keep_alive
    }

    /// Moves the request body from the socket into `sink`, or discards it.
    async fn read_body<S>(
        &mut self,
        stream: &mut S,
        head: &RequestHead,
        mut sink: Option<&mut Request>,
    ) -> Result<(), ErrorKind>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let read_timeout = self.conn_limits.socket_read_timeout;

        if head.is_chunked() {
            let mut decoder = ChunkedDecoder::new();
            let mut decoded = Vec::new();

            while !decoder.is_done() {
                if self.parser.available().is_empty()
                    && self.parser.fill_buffer(stream, read_timeout).await? == 0
                {
                    return Err(ErrorKind::BodyFraming("chunked body ended early"));
                }

                decoded.clear();
                let used = decoder
                    .decode(self.parser.available(), &mut decoded)
                    .map_err(|err| {
                        debug!(peer = %head.peer_addr(), error = %err, "bad chunked body");
                        ErrorKind::BodyFraming("invalid chunked body")
                    })?;
                self.parser.consume(used);

                if let (Some(sink), false) = (sink.as_mut(), decoded.is_empty()) {
                    sink.write(&decoded).map_err(sink_error)?;
                }
            }
        } else {
            let mut remaining = head.content_length().unwrap_or(0);

            while remaining > 0 {
                if self.parser.available().is_empty()
                    && self.parser.fill_buffer(stream, read_timeout).await? == 0
                {
                    return Err(ErrorKind::BodyFraming("body shorter than Content-Length"));
                }

                let take = remaining.min(self.parser.available().len());
                if let Some(sink) = sink.as_mut() {
                    sink.write(&self.parser.available()[..take]).map_err(sink_error)?;
                }
                self.parser.consume(take);
                remaining -= take;
            }
        }

        Ok(())
    }

    async fn write_response<S>(
        &mut self,
        stream: &mut S,
        head: &RequestHead,
        mut response: Response,
        force_close: bool,
    ) -> Result<bool, ErrorKind>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let version = head.version();
        let mut framing = response.framing(version);
        let send_body = head.method() != Method::Head && framing != Framing::NoBody;

        if send_body {
            if let Err(err) = response.open() {
                error!(peer = %head.peer_addr(), path = head.path(), error = %err, "response body unavailable");
                response = Response::status_only(StatusCode::InternalServerError);
                framing = response.framing(version);
            }
        }

        let keep_alive = head.keep_alive()
            && !force_close
            && !response.closes_connection()
            && framing != Framing::UntilClose
            && self.may_continue();

        self.reset_response_buffer();
        response.write_head(&mut self.out, version, framing, keep_alive);
        let out = std::mem::take(&mut self.out);
        let written = self.write(stream, &out).await;
        self.out = out;
        written?;

        if send_body {
            let streamed = self.stream_body(stream, &mut response, framing).await;
            let _ = response.close();
            streamed?;
        }

        Ok(keep_alive)
    }

    async fn stream_body<S>(
        &mut self,
        stream: &mut S,
        response: &mut Response,
        framing: Framing,
    ) -> Result<(), ErrorKind>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut chunk = std::mem::take(&mut self.chunk);
        let result = self.copy_body(stream, response, framing, &mut chunk).await;
        self.chunk = chunk;
        result
    }

    async fn copy_body<S>(
        &mut self,
        stream: &mut S,
        response: &mut Response,
        framing: Framing,
        chunk: &mut [u8],
    ) -> Result<(), ErrorKind>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut sent = 0u64;

        loop {
            let mut n = response.read(chunk)?;
            if n == 0 {
                break;
            }

            match framing {
                Framing::Chunked => {
                    self.reset_response_buffer();
                    let _ = write!(self.out, "{n:x}\r\n");
                    self.out.extend_from_slice(&chunk[..n]);
                    self.out.extend_from_slice(b"\r\n");

                    let out = std::mem::take(&mut self.out);
                    let written = self.write(stream, &out).await;
                    self.out = out;
                    written?;
                }
                Framing::Length(len) => {
                    n = n.min((len - sent) as usize);
                    self.write(stream, &chunk[..n]).await?;
                }
                Framing::UntilClose => self.write(stream, &chunk[..n]).await?,
                Framing::NoBody => break,
            }
            sent += n as u64;

            if matches!(framing, Framing::Length(len) if sent == len) {
                break;
            }
        }

        match framing {
            Framing::Chunked => self.write(stream, b"0\r\n\r\n").await,
            Framing::Length(len) if sent < len => {
                Err(ErrorKind::BodyFraming("response body shorter than Content-Length"))
            }
            _ => Ok(()),
        }
    }

    async fn write<S>(&mut self, stream: &mut S, bytes: &[u8]) -> Result<(), ErrorKind>
    where
        S: AsyncWrite + Unpin,
    {
        writer::write_bytes(stream, bytes, self.conn_limits.socket_write_timeout).await?;
        self.connection.bytes_written += bytes.len() as u64;
        Ok(())
    }

    async fn abort<S>(&mut self, stream: &mut S, err: ErrorKind)
    where
        S: AsyncWrite + Unpin,
    {
        let peer = self.connection.peer;

        if err.is_respondable() {
            debug!(%peer, error = ?err, "request rejected");
            let response = err.as_http(self.version, self.json_errors);
            let _ = self.write(stream, response).await;
        } else {
            warn!(%peer, error = ?err, state = ?self.state, "connection aborted");
        }
    }

    /// Whether another request may follow the current one.
    #[inline]
    fn may_continue(&self) -> bool {
        self.connection.request_count + 1 < self.conn_limits.max_requests_per_connection
            && self.connection.created.elapsed() < self.conn_limits.connection_lifetime
            && !self.shared.upgrade().is_some_and(|shared| shared.is_stopping())
    }
}

fn sink_error(err: Error) -> ErrorKind {
    debug!(error = %err, "request body rejected");
    ErrorKind::BodyFraming("request body rejected")
}

pub(crate) mod writer {
    use std::io;
    use tokio::{
        io::{AsyncWrite, AsyncWriteExt},
        time::{timeout, Duration},
    };

    #[inline(always)]
    pub(crate) async fn write_bytes<S: AsyncWrite + Unpin>(
        stream: &mut S,
        bytes: &[u8],
        time: Duration,
    ) -> Result<(), io::Error> {
        timeout(time, stream.write_all(bytes)).await?
    }
}

/// Per-connection bookkeeping.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) peer: SocketAddr,
    pub(crate) local: SocketAddr,
    pub(crate) created: Instant,
    pub(crate) request_count: usize,
    pub(crate) bytes_written: u64,
}

impl Connection {
    #[inline(always)]
    pub(crate) fn new() -> Self {
        let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
        Self {
            peer: unspecified,
            local: unspecified,
            created: Instant::now(),
            request_count: 0,
            bytes_written: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self, peer: SocketAddr, local: SocketAddr) {
        self.peer = peer;
        self.local = local;
        self.created = Instant::now();
        self.request_count = 0;
        self.bytes_written = 0;
    }
}

/// Counts the connection as active while alive.
struct ActiveGuard(Weak<Shared>);

impl ActiveGuard {
    fn enter(shared: &Weak<Shared>) -> Self {
        if let Some(shared) = shared.upgrade() {
            shared.active.fetch_add(1, Ordering::Relaxed);
        }
        Self(shared.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.0.upgrade() {
            shared.active.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
