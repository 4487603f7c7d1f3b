use crate::{
    errors::ErrorKind,
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits, WaitStrategy},
    server::{connection::HttpConnection, handlers::Handlers},
    Error, Version,
};
use crossbeam::queue::SegQueue;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::watch,
    time::timeout,
};
use tracing::{debug, info, warn};

/// Announces the server on the local network.
///
/// Advertising is best effort: a failure is logged and the server keeps
/// serving. `()` is the no-op implementation used by default.
///
/// # Examples
///
/// ```
/// use kiln_web::Discovery;
/// use std::io;
///
/// struct LogOnly;
///
/// impl Discovery for LogOnly {
///     fn advertise(&self, port: u16, name: Option<&str>) -> io::Result<()> {
///         println!("would announce {name:?} on port {port}");
///         Ok(())
///     }
///
///     fn withdraw(&self) {}
/// }
/// ```
pub trait Discovery: Send + Sync + 'static {
    fn advertise(&self, port: u16, name: Option<&str>) -> io::Result<()>;

    fn withdraw(&self);
}

impl Discovery for () {
    #[inline(always)]
    fn advertise(&self, _: u16, _: Option<&str>) -> io::Result<()> {
        Ok(())
    }

    #[inline(always)]
    fn withdraw(&self) {}
}

/// State shared by the server, its handles and (weakly) its connections.
pub(crate) struct Shared {
    pub(crate) active: AtomicUsize,
    pub(crate) stopping: AtomicBool,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl Shared {
    #[inline]
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }
}

/// An HTTP server that processes incoming connections and requests.
///
/// Connections are served by a fixed pool of worker tasks fed from an
/// admission queue (see [`ServerLimits`]).
///
/// # Examples
///
/// ```no_run
/// use kiln_web::{BodyKind, Handlers, Method, Processor, Response, Server};
///
/// #[tokio::main]
/// async fn main() -> Result<(), kiln_web::Error> {
///     let handlers = Handlers::new();
///     handlers.add_default_handler(
///         Method::Get,
///         BodyKind::Data,
///         Processor::sync(|_| Ok(Response::text("Hello world!"))),
///     );
///
///     Server::builder()
///         .handlers(handlers)
///         .bind("127.0.0.1:8080".parse().unwrap())
///         .await?
///         .launch()
///         .await;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    handlers: Handlers,
    discovery: Box<dyn Discovery>,
    name: Option<String>,
    limits: AllLimits,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.shared.local_addr)
            .field("name", &self.name)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// A handle that can stop the server from another task.
    #[inline]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
        }
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// The handler chain; handlers may be added while the server runs.
    #[inline]
    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    /// Starts the workers and accepts connections until [`ServerHandle::stop`].
    ///
    /// ```no_run
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), kiln_web::Error> {
    /// use kiln_web::{Handlers, Server};
    /// use std::time::Duration;
    ///
    /// let server = Server::builder()
    ///     .handlers(Handlers::new())
    ///     .bind("127.0.0.1:0".parse().unwrap())
    ///     .await?;
    ///
    /// let handle = server.handle();
    /// tokio::spawn(async move {
    ///     tokio::time::sleep(Duration::from_secs(60)).await;
    ///     handle.stop();
    /// });
    ///
    /// server.launch().await;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn launch(self) {
        let stream_queue: TcpQueue = Arc::new(SegQueue::new());
        let error_queue: TcpQueue = Arc::new(SegQueue::new());
        let server_limits = &self.limits.0;

        for _ in 0..server_limits.max_connections {
            self.spawn_worker(&stream_queue);
        }
        if server_limits.count_503_handlers != 0 {
            for _ in 0..server_limits.count_503_handlers {
                self.spawn_alarmist(&error_queue);
            }
        } else {
            self.spawn_quiet_alarmist(&error_queue);
        }

        let addr = self.shared.local_addr;
        if let Err(err) = self.discovery.advertise(addr.port(), self.name.as_deref()) {
            warn!(%addr, error = %err, "service advertising failed");
        }
        info!(
            %addr,
            workers = server_limits.max_connections,
            name = self.name.as_deref().unwrap_or_default(),
            "listening"
        );

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;

                _ = stopped(&mut shutdown) => break,
                accepted = self.listener.accept() => {
                    let value = match accepted {
                        Ok(value) => value,
                        Err(err) => {
                            debug!(error = %err, "accept failed");
                            continue;
                        }
                    };

                    match stream_queue.len() < server_limits.max_pending_connections {
                        true => stream_queue.push(value),
                        false => error_queue.push(value),
                    }
                }
            }
        }

        self.discovery.withdraw();
        info!(%addr, active = self.shared.active.load(Ordering::Relaxed), "stopped");
    }

    fn spawn_worker(&self, queue: &TcpQueue) {
        let queue = queue.clone();
        let handlers = self.handlers.clone();
        let limits = self.limits.clone();
        let shared = Arc::downgrade(&self.shared);
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut conn = HttpConnection::new(handlers.clone(), &limits, shared.clone());

            loop {
                let (mut stream, peer) = tokio::select! {
                    biased;

                    _ = stopped(&mut shutdown) => break,
                    value = get_stream(&queue, &limits.0.wait_strategy) => value,
                };

                let Ok(local) = stream.local_addr() else {
                    continue;
                };

                // Runs in its own task so a panicking processor only loses this connection
                let task = tokio::spawn(async move {
                    conn.run(&mut stream, peer, local).await;
                    conn
                });

                conn = match task.await {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(%peer, error = %err, "connection task failed");
                        HttpConnection::new(handlers.clone(), &limits, shared.clone())
                    }
                };
            }
        });
    }

    fn spawn_alarmist(&self, queue: &TcpQueue) {
        let queue = queue.clone();
        let (server_limits, conn_limits, ..) = self.limits.clone();
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let response = ErrorKind::ServiceUnavailable.as_http(Version::Http11, server_limits.json_errors);

            loop {
                let (mut stream, peer) = tokio::select! {
                    biased;

                    _ = stopped(&mut shutdown) => break,
                    value = get_stream(&queue, &server_limits.wait_strategy) => value,
                };

                debug!(%peer, "admission queue full, answering 503");
                let _ = timeout(conn_limits.socket_write_timeout, async {
                    if stream.write_all(response).await.is_ok() {
                        let _ = stream.shutdown().await;
                    }
                })
                .await;
            }
        });
    }

    fn spawn_quiet_alarmist(&self, queue: &TcpQueue) {
        let queue = queue.clone();
        let wait_strategy = self.limits.0.wait_strategy.clone();
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    biased;

                    _ = stopped(&mut shutdown) => break,
                    value = get_stream(&queue, &wait_strategy) => value,
                };

                debug!(%peer, "admission queue full, dropping connection");
                drop(stream);
            }
        });
    }
}

#[inline]
async fn get_stream(queue: &TcpQueue, wait: &WaitStrategy) -> (TcpStream, SocketAddr) {
    loop {
        if let Some(value) = queue.pop() {
            return value;
        }

        wait.wait().await;
    }
}

/// Resolves once the server is asked to stop.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Stops a running [`Server`] from anywhere.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.shared.local_addr)
            .field("stopping", &self.shared.is_stopping())
            .finish()
    }
}

impl ServerHandle {
    /// Stops accepting connections and lets idle workers exit.
    ///
    /// Connections in progress finish their current request and then close.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Relaxed);
        let _ = self.shared.shutdown.send(true);
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Connections currently being served.
    #[inline]
    pub fn active_connections(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopping()
    }
}

/// Builder for configuring and creating [`Server`] instances.
#[derive(Default)]
pub struct ServerBuilder {
    listener: Option<TcpListener>,
    handlers: Option<Handlers>,
    discovery: Option<Box<dyn Discovery>>,
    name: Option<String>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("listener", &self.listener)
            .field("name", &self.name)
            .field("server_limits", &self.server_limits)
            .field("connection_limits", &self.connection_limits)
            .field("request_limits", &self.request_limits)
            .field("response_limits", &self.response_limits)
            .finish_non_exhaustive()
    }
}

impl ServerBuilder {
    /// Uses an already bound listener. Required by [`build`](Self::build),
    /// replaced by [`bind`](Self::bind).
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// The handler chain to serve; an empty chain answers `404` to everything.
    #[inline(always)]
    pub fn handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Announces the server on start and withdraws it on stop.
    #[inline(always)]
    pub fn discovery(mut self, discovery: impl Discovery) -> Self {
        self.discovery = Some(Box::new(discovery));
        self
    }

    /// Service name passed to [`Discovery::advertise`].
    #[inline(always)]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Configures worker and admission queue limits.
    ///
    /// ```no_run
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), kiln_web::Error> {
    /// use kiln_web::{Server, limits::ServerLimits};
    ///
    /// let server = Server::builder()
    ///     .server_limits(ServerLimits {
    ///         max_connections: 2500,
    ///         max_pending_connections: 10000,
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .bind("127.0.0.1:8080".parse().unwrap())
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures timeouts and keep-alive limits.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request head limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures response buffer sizes.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Constructs the [`Server`] around the configured listener.
    ///
    /// # Errors
    ///
    /// [`Error::MissingListener`] when [`listener`](Self::listener) was not called,
    /// [`Error::Io`] when the listener's address cannot be read.
    pub fn build(mut self) -> Result<Server, Error> {
        let listener = self.listener.take().ok_or(Error::MissingListener)?;
        self.finish(listener)
    }

    /// Binds `addr` and constructs the [`Server`].
    ///
    /// The listen backlog equals [`ServerLimits::max_pending_connections`].
    ///
    /// # Errors
    ///
    /// [`Error::Bind`] when the address cannot be bound.
    pub async fn bind(self, addr: SocketAddr) -> Result<Server, Error> {
        let backlog = self
            .server_limits
            .as_ref()
            .map_or(ServerLimits::default().max_pending_connections, |l| l.max_pending_connections);

        let listener =
            bind_listener(addr, backlog).map_err(|source| Error::Bind { addr, source })?;
        self.finish(listener)
    }

    fn finish(self, listener: TcpListener) -> Result<Server, Error> {
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown) = watch::channel(false);

        Ok(Server {
            listener,
            handlers: self.handlers.unwrap_or_default(),
            discovery: self.discovery.unwrap_or_else(|| Box::new(())),
            name: self.name,
            limits: (
                self.server_limits.unwrap_or_default(),
                self.connection_limits.unwrap_or_default(),
                self.request_limits.unwrap_or_default(),
                self.response_limits.unwrap_or_default(),
            ),
            shared: Arc::new(Shared {
                active: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                shutdown: shutdown_tx,
                local_addr,
            }),
            shutdown,
        })
    }
}

fn bind_listener(addr: SocketAddr, backlog: usize) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.clamp(1, i32::MAX as usize) as i32)?;

    TcpListener::from_std(socket.into())
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;
pub(crate) type AllLimits = (ServerLimits, ConnLimits, ReqLimits, RespLimits);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BodyKind, Method, Processor, Response};
    use std::{
        sync::Mutex,
        time::Duration,
    };
    use tokio::io::AsyncReadExt;

    async fn get(addr: SocketAddr, target: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {target} HTTP/1.1\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    fn hello() -> Handlers {
        let handlers = Handlers::new();
        handlers.add_path_handler(
            Method::Get,
            "/hello",
            BodyKind::Data,
            Processor::sync(|req| Ok(Response::text(format!("hello {}", req.peer_addr().ip())))),
        );
        handlers
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Discovery for Arc<Recorder> {
        fn advertise(&self, port: u16, name: Option<&str>) -> io::Result<()> {
            self.0.lock().unwrap().push(format!("up {port} {name:?}"));
            Err(io::Error::other("no multicast here"))
        }

        fn withdraw(&self) {
            self.0.lock().unwrap().push("down".to_string());
        }
    }

    #[tokio::test]
    async fn build_requires_listener() {
        assert!(matches!(Server::builder().build(), Err(Error::MissingListener)));
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        // `SO_REUSEADDR` does not allow two listeners on one port
        let result = Server::builder().bind(addr).await;
        assert!(matches!(result, Err(Error::Bind { addr: a, .. }) if a == addr));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serve_and_stop() {
        let recorder = Arc::new(Recorder::default());
        let server = Server::builder()
            .handlers(hello())
            .discovery(recorder.clone())
            .name("test")
            .server_limits(ServerLimits {
                max_connections: 4,
                ..ServerLimits::default()
            })
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let addr = server.local_addr();
        let handle = server.handle();
        let running = tokio::spawn(server.launch());

        let out = get(addr, "/hello").await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
        assert!(out.ends_with("hello 127.0.0.1"), "{out}");

        let out = get(addr, "/nope").await;
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{out}");

        handle.stop();
        assert!(handle.is_stopped());
        timeout(Duration::from_secs(5), running).await.unwrap().unwrap();

        assert_eq!(
            *recorder.0.lock().unwrap(),
            [format!("up {} Some(\"test\")", addr.port()), "down".to_string()]
        );
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overflow_gets_503() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::builder()
            .listener(listener)
            .handlers(hello())
            .server_limits(ServerLimits {
                max_connections: 0,
                max_pending_connections: 0,
                json_errors: false,
                ..ServerLimits::default()
            })
            .build()
            .unwrap();

        let addr = server.local_addr();
        let handle = server.handle();
        tokio::spawn(server.launch());

        // The request is never read, so none is sent
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(
            out,
            "HTTP/1.1 503 Service Unavailable\r\nconnection: close\r\ncontent-length: 0\r\n\r\n"
        );

        handle.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handlers_added_while_running() {
        let server = Server::builder()
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let addr = server.local_addr();
        let handle = server.handle();
        let handlers = server.handlers().clone();
        tokio::spawn(server.launch());

        assert!(get(addr, "/late").await.starts_with("HTTP/1.1 404"));

        handlers.add_path_handler(
            Method::Get,
            "/late",
            BodyKind::Data,
            Processor::sync(|_| Ok(Response::text("here"))),
        );
        assert!(get(addr, "/late").await.ends_with("here"));

        handle.stop();
    }
}
