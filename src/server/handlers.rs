//! The handler chain.
//!
//! A [`Handler`] pairs a matcher with a [`Processor`]. Matchers look only at
//! the [`RequestHead`] and either decline (`None`) or return a fresh
//! [`Request`] whose [`BodyKind`] decides how the body is stored. The first
//! matcher that accepts a request wins.
//!
//! # Examples
//!
//! ```
//! use kiln_web::{BodyKind, Handlers, Method, Processor, Response};
//!
//! let handlers = Handlers::new();
//!
//! handlers.add_path_handler(
//!     Method::Get,
//!     "/hello",
//!     BodyKind::Data,
//!     Processor::sync(|_| Ok(Response::text("Hello, world!"))),
//! );
//! handlers.add_regex_handler(
//!     Method::Post,
//!     r"^/items/\d+$",
//!     BodyKind::UrlEncodedForm,
//!     Processor::sync(|req| Ok(Response::text(format!("{:?}", req.arguments())))),
//! ).unwrap();
//!
//! assert_eq!(handlers.snapshot().len(), 2);
//! ```

use crate::{
    http::{
        request::{BodyKind, Request, RequestHead},
        response::Response,
        types::{Method, StatusCode},
    },
    Error, ProcessError,
};
use arc_swap::ArcSwap;
use regex::RegexBuilder;
use std::{
    fmt,
    fs,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::oneshot;
use tracing::error;

/// Accepts or declines a request by its head.
pub type Matcher = Box<dyn Fn(&RequestHead) -> Option<Request> + Send + Sync>;

type SyncFn = Box<dyn Fn(&Request) -> Result<Response, ProcessError> + Send + Sync>;
type DeferredFn = Box<dyn Fn(Arc<Request>, Responder) + Send + Sync>;

/// Produces the response for a fully received request.
pub enum Processor {
    /// Answers during the call.
    Sync(SyncFn),
    /// Answers later through the [`Responder`], from any thread or task.
    Deferred(DeferredFn),
}

impl Processor {
    /// A processor returning its response directly. An `Err` becomes a `500`.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Request) -> Result<Response, ProcessError> + Send + Sync + 'static,
    {
        Self::Sync(Box::new(f))
    }

    /// A processor that completes through a [`Responder`].
    ///
    /// The connection waits for the response without blocking other
    /// connections. A responder dropped without answering becomes a `500`.
    pub fn deferred<F>(f: F) -> Self
    where
        F: Fn(Arc<Request>, Responder) + Send + Sync + 'static,
    {
        Self::Deferred(Box::new(f))
    }

    /// A deferred processor driven by a future spawned on the runtime.
    ///
    /// ```
    /// use kiln_web::{Processor, Response};
    ///
    /// let processor = Processor::async_fn(|req| async move {
    ///     Ok(Response::text(format!("you asked for {}", req.path())))
    /// });
    /// ```
    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<Request>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, ProcessError>> + Send + 'static,
    {
        Self::deferred(move |request, responder| {
            let future = f(request);
            tokio::spawn(async move {
                let response = match future.await {
                    Ok(response) => response,
                    Err(err) => {
                        error!(error = %err, "async processor failed");
                        Response::status_only(StatusCode::InternalServerError)
                    }
                };
                responder.respond(response);
            });
        })
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Processor::Sync"),
            Self::Deferred(_) => f.write_str("Processor::Deferred"),
        }
    }
}

/// One-shot completion token of a deferred processor.
///
/// `respond` consumes it, so a request is answered at most once.
#[derive(Debug)]
pub struct Responder(oneshot::Sender<Response>);

impl Responder {
    pub fn respond(self, response: Response) {
        // The connection is gone when the receiver is dropped
        let _ = self.0.send(response);
    }
}

/// A matcher and its processor.
pub struct Handler {
    matcher: Matcher,
    processor: Processor,
}

impl Handler {
    pub fn new<M>(matcher: M, processor: Processor) -> Self
    where
        M: Fn(&RequestHead) -> Option<Request> + Send + Sync + 'static,
    {
        Self {
            matcher: Box::new(matcher),
            processor,
        }
    }

    #[inline]
    pub fn matches(&self, head: &RequestHead) -> Option<Request> {
        (self.matcher)(head)
    }

    #[inline]
    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    /// Runs the processor on a completely received request.
    ///
    /// The request is handed back so it outlives the response.
    pub(crate) async fn process(&self, request: Request) -> (Result<Response, ProcessError>, Arc<Request>) {
        let request = Arc::new(request);

        let result = match &self.processor {
            Processor::Sync(f) => f(&request),
            Processor::Deferred(f) => {
                let (tx, rx) = oneshot::channel();
                f(request.clone(), Responder(tx));
                rx.await
                    .map_err(|_| ProcessError::from("responder dropped without a response"))
            }
        };

        (result, request)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("processor", &self.processor)
            .finish_non_exhaustive()
    }
}

/// The registered handler chain, shared by every connection.
///
/// Cloning is cheap and all clones see the same chain. Each dispatch works
/// on a [`snapshot`](Handlers::snapshot), so changes made while a request is
/// being served only apply to the requests that follow.
#[derive(Clone)]
pub struct Handlers {
    list: Arc<ArcSwap<Vec<Arc<Handler>>>>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            list: Arc::new(ArcSwap::from_pointee(Vec::new())),
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("len", &self.list.load().len())
            .finish()
    }
}

impl Handlers {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler to the end of the chain.
    pub fn register<M>(&self, matcher: M, processor: Processor)
    where
        M: Fn(&RequestHead) -> Option<Request> + Send + Sync + 'static,
    {
        let handler = Arc::new(Handler::new(matcher, processor));
        self.list.rcu(|list| {
            let mut list = Vec::clone(list);
            list.push(handler.clone());
            list
        });
    }

    /// Removes every handler.
    pub fn clear(&self) {
        self.list.store(Arc::new(Vec::new()));
    }

    /// The current chain. Later changes do not affect the returned list.
    #[inline]
    pub fn snapshot(&self) -> Arc<Vec<Arc<Handler>>> {
        self.list.load_full()
    }

    /// The first handler accepting `head`, with the request it built.
    pub fn resolve(&self, head: &RequestHead) -> Option<(Request, Arc<Handler>)> {
        resolve_in(&self.snapshot(), head)
    }
}

pub(crate) fn resolve_in(list: &[Arc<Handler>], head: &RequestHead) -> Option<(Request, Arc<Handler>)> {
    list.iter()
        .find_map(|handler| Some((handler.matches(head)?, handler.clone())))
}

/// Registration helpers
impl Handlers {
    /// Handles every path requested with `method`.
    pub fn add_default_handler(&self, method: Method, kind: BodyKind, processor: Processor) {
        self.register(
            move |head| (head.method() == method).then(|| Request::new(head, kind)),
            processor,
        );
    }

    /// Handles one exact path, compared case-insensitively.
    pub fn add_path_handler(
        &self,
        method: Method,
        path: impl Into<String>,
        kind: BodyKind,
        processor: Processor,
    ) {
        let path = path.into();
        self.register(
            move |head| {
                (head.method() == method && head.path().eq_ignore_ascii_case(&path))
                    .then(|| Request::new(head, kind))
            },
            processor,
        );
    }

    /// Handles decoded paths matching `pattern`, case-insensitively.
    ///
    /// The query string never takes part in the match.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPattern`] if `pattern` does not compile.
    pub fn add_regex_handler(
        &self,
        method: Method,
        pattern: &str,
        kind: BodyKind,
        processor: Processor,
    ) -> Result<(), Error> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        self.register(
            move |head| {
                (head.method() == method && regex.is_match(head.path()))
                    .then(|| Request::new(head, kind))
            },
            processor,
        );
        Ok(())
    }

    /// Serves the files under `local_path` at `base_path`.
    ///
    /// `/static` and `/static/` both serve `/static/app.js`, never
    /// `/staticx`. A directory answers with `index_filename` when present and
    /// with a generated listing otherwise. Paths containing `..` get `403`,
    /// missing files `404`. Files are sent with `cache_max_age`.
    pub fn add_directory_handler(
        &self,
        base_path: &str,
        local_path: impl Into<PathBuf>,
        index_filename: Option<&str>,
        cache_max_age: u32,
    ) {
        let base = base_path.trim_end_matches('/').to_string();
        let local = local_path.into();
        let index = index_filename.map(str::to_string);
        let prefix = base.clone();

        self.register(
            move |head| {
                let path = head.path();
                let under_base = path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'));

                (head.method() == Method::Get && under_base)
                    .then(|| Request::new(head, BodyKind::Data))
            },
            Processor::sync(move |request| {
                let relative = &request.path()[base.len()..];
                serve_directory(request.path(), relative, &local, index.as_deref(), cache_max_age)
            }),
        );
    }
}

fn serve_directory(
    request_path: &str,
    relative: &str,
    local: &Path,
    index: Option<&str>,
    cache_max_age: u32,
) -> Result<Response, ProcessError> {
    let mut target = local.to_path_buf();
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        if segment == ".." || segment.contains('\\') {
            return Ok(Response::status_only(StatusCode::Forbidden));
        }
        target.push(segment);
    }

    if target.is_dir() {
        if let Some(response) = index.and_then(|name| Response::file(target.join(name))) {
            return Ok(response.with_cache_max_age(cache_max_age));
        }
        return Ok(Response::html(listing(request_path, &target)?));
    }

    Ok(match Response::file(&target) {
        Some(response) => response.with_cache_max_age(cache_max_age),
        None => Response::status_only(StatusCode::NotFound),
    })
}

fn listing(request_path: &str, dir: &Path) -> Result<String, ProcessError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            name.push('/');
        }
        entries.push(name);
    }
    entries.sort();

    let base = request_path.trim_end_matches('/');
    let title = escape_html(if request_path.is_empty() { "/" } else { request_path });

    let mut html = format!(
        "<!DOCTYPE html>\n<html><head><title>Index of {title}</title></head>\n\
         <body><h1>Index of {title}</h1><ul>\n"
    );
    for name in entries {
        let href = match name.strip_suffix('/') {
            Some(dir) => format!("{base}/{}/", urlencoding::encode(dir)),
            None => format!("{base}/{}", urlencoding::encode(&name)),
        };
        html.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>\n",
            escape_html(&href),
            escape_html(&name)
        ));
    }
    html.push_str("</ul></body></html>\n");

    Ok(html)
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::tests::head;

    fn ok(text: &'static str) -> Processor {
        Processor::sync(move |_| Ok(Response::text(text)))
    }

    #[test]
    fn first_match_wins() {
        let handlers = Handlers::new();
        handlers.add_path_handler(Method::Get, "/a", BodyKind::Data, ok("path"));
        handlers.add_default_handler(Method::Get, BodyKind::File, ok("default"));
        handlers.register(|_| panic!("never consulted"), ok("unreachable"));

        let (request, _) = handlers.resolve(&head(Method::Get, "/A", &[])).unwrap();
        assert_eq!(request.kind(), BodyKind::Data);

        let (request, _) = handlers.resolve(&head(Method::Get, "/other", &[])).unwrap();
        assert_eq!(request.kind(), BodyKind::File);
    }

    #[test]
    fn method_must_match() {
        let handlers = Handlers::new();
        handlers.add_path_handler(Method::Post, "/a", BodyKind::Data, ok("a"));

        assert!(handlers.resolve(&head(Method::Get, "/a", &[])).is_none());
        assert!(handlers.resolve(&head(Method::Post, "/a", &[])).is_some());
    }

    #[test]
    fn regex_matches_path_only() {
        let handlers = Handlers::new();
        handlers
            .add_regex_handler(Method::Get, r"^/items/\d+$", BodyKind::Data, ok("item"))
            .unwrap();

        #[rustfmt::skip]
        let cases = [
            ("/items/42",           true),
            ("/ITEMS/7",            true),
            ("/items/42?x=/items/1", true),
            ("/items/abc",          false),
            ("/other?p=/items/1",   false),
        ];

        for (target, expected) in cases {
            let got = handlers.resolve(&head(Method::Get, target, &[])).is_some();
            assert_eq!(got, expected, "{target}");
        }

        let result = handlers.add_regex_handler(Method::Get, "(", BodyKind::Data, ok("bad"));
        assert!(matches!(result, Err(Error::InvalidPattern(_))));
    }

    #[test]
    fn clear_and_snapshot() {
        let handlers = Handlers::new();
        handlers.add_default_handler(Method::Get, BodyKind::Data, ok("a"));

        let snapshot = handlers.snapshot();
        handlers.clear();
        handlers.add_default_handler(Method::Put, BodyKind::Data, ok("b"));

        assert_eq!(snapshot.len(), 1);
        assert!(resolve_in(&snapshot, &head(Method::Get, "/", &[])).is_some());
        assert!(handlers.resolve(&head(Method::Get, "/", &[])).is_none());
        assert!(handlers.resolve(&head(Method::Put, "/", &[])).is_some());
    }

    #[tokio::test]
    async fn processors() {
        let request = || Request::new(&head(Method::Get, "/", &[]), BodyKind::Data);

        let handler = Handler::new(|_| None, ok("sync"));
        let (result, _) = handler.process(request()).await;
        assert_eq!(result.unwrap().content_length(), Some(4));

        let handler = Handler::new(
            |_| None,
            Processor::sync(|_| Err(ProcessError::from("boom"))),
        );
        assert!(handler.process(request()).await.0.is_err());

        let handler = Handler::new(
            |_| None,
            Processor::deferred(|req, responder| {
                std::thread::spawn(move || {
                    responder.respond(Response::text(req.path().to_string()));
                });
            }),
        );
        let (result, processed) = handler.process(request()).await;
        assert_eq!(result.unwrap().content_length(), Some(1));
        assert_eq!(processed.path(), "/");

        let handler = Handler::new(|_| None, Processor::deferred(|_, responder| drop(responder)));
        assert!(handler.process(request()).await.0.is_err());

        let handler = Handler::new(
            |_| None,
            Processor::async_fn(|_| async { Err(ProcessError::from("nope")) }),
        );
        let response = handler.process(request()).await.0.unwrap();
        assert_eq!(response.status(), StatusCode::InternalServerError);
    }

    #[test]
    fn directory_handler() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.js"), "let x = 1;").unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/index.html"), "<p>docs</p>").unwrap();
        fs::create_dir(dir.path().join("empty dir")).unwrap();
        fs::write(dir.path().join("empty dir/a&b.txt"), "x").unwrap();

        let handlers = Handlers::new();
        handlers.add_directory_handler("/static/", dir.path(), Some("index.html"), 60);

        let serve = |method, target: &str| {
            let (request, handler) = handlers.resolve(&head(method, target, &[]))?;
            match handler.processor() {
                Processor::Sync(f) => f(&request).ok(),
                Processor::Deferred(_) => None,
            }
        };

        let response = serve(Method::Get, "/static/app.js").unwrap();
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.content_type(), Some("text/javascript; charset=utf-8"));
        assert_eq!(response.cache_max_age(), 60);

        let response = serve(Method::Get, "/static/docs").unwrap();
        assert_eq!(response.content_length(), Some(11));

        let response = serve(Method::Get, "/static/empty%20dir/").unwrap();
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.content_type(), Some("text/html; charset=utf-8"));

        #[rustfmt::skip]
        let cases = [
            ("/static/missing.js",          StatusCode::NotFound),
            ("/static/docs/../../etc",      StatusCode::Forbidden),
            ("/static/%2e%2e/secret",       StatusCode::Forbidden),
        ];
        for (target, status) in cases {
            assert_eq!(serve(Method::Get, target).unwrap().status(), status, "{target}");
        }

        assert!(serve(Method::Get, "/staticx/app.js").is_none());
        assert!(serve(Method::Post, "/static/app.js").is_none());
        assert!(serve(Method::Get, "/static").is_some());
    }

    #[test]
    fn listing_escapes_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a&b <c>.txt"), "x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let html = listing("/files/", dir.path()).unwrap();

        assert!(html.contains("<h1>Index of /files/</h1>"));
        assert!(html.contains("<a href=\"/files/a%26b%20%3Cc%3E.txt\">a&amp;b &lt;c&gt;.txt</a>"));
        assert!(html.contains("<a href=\"/files/sub/\">sub/</a>"));
    }
}
