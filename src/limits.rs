//! Web server configuration limits and timeouts
//!
//! Every value here is a plain struct with a documented [`Default`]. The
//! structs are handed to [`ServerBuilder`](crate::ServerBuilder) once and then
//! passed down to each connection; nothing is read from global state.
//!
//! # Examples
//!
//! ```no_run
//! use kiln_web::{Handlers, Server, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kiln_web::Error> {
//!     let server = Server::builder()
//!         .handlers(Handlers::new())
//!         .server_limits(ServerLimits {
//!             max_connections: 500, // Higher concurrency
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(5),
//!             max_requests_per_connection: 10_000,
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 128, // More headers for complex APIs
//!             ..ReqLimits::default()
//!         })
//!         .bind("127.0.0.1:8080".parse().unwrap())
//!         .await?;
//!
//!     server.launch().await;
//!     Ok(())
//! }
//! ```

use std::time::Duration;

/// Controls server-level concurrency, queueing, and overload behavior.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  || TCP_STREAM
///                                  \/
/// [--------------]   Yes   /----------------\   No   [-------------]
/// [ Add to queue ] <====== | Is there room? | =====> [ Sending 503 ]
/// [--------------]         \----------------/        [-------------]
///        ||
///        \==================\\          //====================\
///                            V          V                    ||
/// [--------]   Yes   /-------------------------\   No    [------]
/// [ Worker ] <====== | Is there a free worker? | =====>  [ Wait ]
/// [--------]         \-------------------------/         [------]
/// ```
///
/// Workers are long-lived tasks created once by
/// [`Server::launch`](crate::Server::launch). Each one pulls a stream from the
/// queue, runs that connection to completion, and goes back to the queue.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of worker tasks, i.e. connections served at once (default: `100`).
    pub max_connections: usize,

    /// Accepted connections allowed to wait for a worker (default: `16`).
    ///
    /// Also used as the listen backlog when the server binds its own socket.
    /// Once the queue is full, new connections get an immediate `503`.
    pub max_pending_connections: usize,

    /// How idle workers wait for the queue to fill (default: `Sleep(50μs)`).
    pub wait_strategy: WaitStrategy,

    /// Tasks answering overflow connections with `503` (default: `1`).
    ///
    /// Set to 0 to drop overflow connections silently.
    pub count_503_handlers: usize,

    /// Format for error responses (default: `true`)
    ///
    /// # Examples
    /// If `true`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 55\r
    /// content-type: application/json\r
    /// \r
    /// {"error":"Invalid HTTP method","code":"INVALID_METHOD"}
    /// ```
    /// If `false`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 0\r
    /// \r
    /// ```
    pub json_errors: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 16,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            count_503_handlers: 1,
            json_errors: true,

            _priv: (),
        }
    }
}

/// Strategy for worker task waiting when no connections are available
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`]
    ///
    /// Keeps a core busy; only worth it for latency benchmarks.
    Yield,

    /// While waiting, uses [`tokio::time::sleep()`]
    Sleep(Duration),
}

impl WaitStrategy {
    #[inline]
    pub(crate) async fn wait(&self) {
        match self {
            WaitStrategy::Yield => tokio::task::yield_now().await,
            WaitStrategy::Sleep(time) => tokio::time::sleep(*time).await,
        }
    }
}

/// Connection-level limits and timeouts
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum duration of a single socket read (default: `2 seconds`)
    ///
    /// Applies while waiting for a request as well as while receiving its body.
    /// When it elapses the connection is aborted.
    pub socket_read_timeout: Duration,

    /// Maximum duration of a single socket write (default: `3 seconds`)
    pub socket_write_timeout: Duration,

    /// Requests served on one connection before it is closed (default: `100`)
    pub max_requests_per_connection: usize,

    /// Age after which a connection is not kept alive any more (default: `2 minutes`)
    ///
    /// Checked between requests, so a long upload is never cut off midway.
    pub connection_lifetime: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(2),
            socket_write_timeout: Duration::from_secs(3),
            connection_lifetime: Duration::from_secs(120),
            max_requests_per_connection: 100,

            _priv: (),
        }
    }
}

/// HTTP request head limits
///
/// Bodies are streamed into the matched request's sink and are not bounded
/// here; a handler that must cap uploads checks
/// [`Request::content_length`](crate::Request::content_length) in its matcher.
///
/// 🔧 **You MAY need to increase these if you see:**
/// - `414 URI Too Long` for normal API calls
/// - `431 Request Header Fields Too Large`
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum request target length in bytes (default: `4 KB`)
    ///
    /// The whole request line may be `url_size + 19` bytes long
    /// (`OPTIONS` + two spaces + `HTTP/1.1` + CRLF).
    pub url_size: usize,

    /// Maximum number of headers per request (default: `64`)
    pub header_count: usize,

    /// Maximum size of the header block in bytes, final empty line included
    /// (default: `16 KB`)
    pub header_block_size: usize,

    /// Initial capacity of the per-connection read buffer (default: `8 KB`)
    ///
    /// The buffer grows up to the head limits while a request head is being
    /// read and is reused across keep-alive requests.
    pub buffer_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            url_size: 4 * 1024,
            header_count: 64,
            header_block_size: 16 * 1024,
            buffer_size: 8 * 1024,

            _priv: (),
        }
    }
}

impl ReqLimits {
    // OPTIONS /url HTTP/1.1\r\n
    // |-----| |-| |------|
    //  Method URL  Version
    //
    // Formula: Method(7) + " " + URL + " " + Version(8) + "\r\n"
    #[inline(always)]
    pub(crate) const fn first_line(&self) -> usize {
        19 + self.url_size
    }
}

/// Configuration for response serialization.
///
/// # Buffer Management
///
/// Each connection keeps one output buffer for response heads and body
/// chunks. After a response is written it is reset like this:
/// ```rust
/// # use kiln_web::limits::RespLimits;
/// # let limits = RespLimits::default();
/// # let mut buffer: Vec<u8> = Vec::with_capacity(limits.default_capacity);
/// #
/// if buffer.capacity() > limits.max_capacity {
///     buffer = Vec::with_capacity(limits.default_capacity);
/// } else {
///     buffer.clear();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial buffer capacity allocated for responses (default: `1024 B`)
    pub default_capacity: usize,
    /// Capacity above which the buffer is reallocated (default: `64 KB`)
    pub max_capacity: usize,
    /// Bytes pulled from a response body per read (default: `16 KB`)
    pub chunk_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 64 * 1024,
            chunk_size: 16 * 1024,

            _priv: (),
        }
    }
}
