//! Responses and response bodies.
//!
//! A processor returns a [`Response`] describing status, headers and a body
//! source. The connection serializes the head and then pulls the body
//! through [`BodySource`], chunk by chunk.

use crate::http::types::{HeaderMap, StatusCode, Version};
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    fs::File,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::SystemTime,
};

/// Value of the `Server` header.
pub(crate) const SERVER_NAME: &str = concat!("kiln_web/", env!("CARGO_PKG_VERSION"));

/// Producer of a response body.
///
/// Driven by the connection as `open`, `read` until it returns `0`, then `close`.
pub trait BodySource {
    fn open(&mut self) -> io::Result<()>;

    /// Fills `buf` with the next bytes; `Ok(0)` marks the end of the body.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn close(&mut self) -> io::Result<()>;
}

pub(crate) enum ResponseBody {
    Empty,
    Data {
        data: Vec<u8>,
        pos: usize,
    },
    File {
        path: PathBuf,
        file: Option<File>,
    },
    Stream {
        chunks: Box<dyn Iterator<Item = Vec<u8>> + Send>,
        pending: Vec<u8>,
        pos: usize,
    },
}

impl BodySource for ResponseBody {
    fn open(&mut self) -> io::Result<()> {
        if let Self::File { path, file } = self {
            *file = Some(File::open(path)?);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Empty => Ok(0),
            Self::Data { data, pos } => {
                let n = (data.len() - *pos).min(buf.len());
                buf[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            Self::File { file, .. } => match file {
                Some(file) => file.read(buf),
                None => Err(io::Error::other("file body read before open")),
            },
            Self::Stream {
                chunks,
                pending,
                pos,
            } => {
                while *pos == pending.len() {
                    match chunks.next() {
                        Some(chunk) => {
                            *pending = chunk;
                            *pos = 0;
                        }
                        None => return Ok(0),
                    }
                }

                let n = (pending.len() - *pos).min(buf.len());
                buf[..n].copy_from_slice(&pending[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if let Self::File { file, .. } = self {
            file.take();
        }
        Ok(())
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Data { data, .. } => f.debug_struct("Data").field("len", &data.len()).finish(),
            Self::File { path, .. } => f.debug_struct("File").field("path", path).finish(),
            Self::Stream { .. } => f.write_str("Stream"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Unopened,
    Open,
    Closed,
}

/// How the body length is communicated on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// Status forbids a body, no length header at all.
    NoBody,
    Length(u64),
    Chunked,
    /// HTTP/1.0 body of unknown length, ended by closing the connection.
    UntilClose,
}

/// HTTP response returned by processors.
///
/// # Examples
/// ```
/// use kiln_web::{Response, StatusCode};
///
/// let resp = Response::html("<h1>Created</h1>")
///     .with_status(StatusCode::Created)
///     .with_header("X-Request-Id", "42")
///     .with_cache_max_age(60);
///
/// assert_eq!(resp.status(), StatusCode::Created);
/// assert_eq!(resp.content_length(), Some(16));
/// ```
pub struct Response {
    status: StatusCode,
    content_type: Option<String>,
    content_length: Option<u64>,
    cache_max_age: u32,
    headers: HeaderMap,
    user_data: Option<Box<dyn Any + Send + Sync>>,
    close: bool,
    body: ResponseBody,
    state: SourceState,
}

impl Default for Response {
    fn default() -> Self {
        Self::status_only(StatusCode::Ok)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("cache_max_age", &self.cache_max_age)
            .field("headers", &self.headers)
            .field("close", &self.close)
            .field("body", &self.body)
            .finish()
    }
}

/// Constructors
impl Response {
    /// A response without a body.
    pub fn status_only(status: StatusCode) -> Self {
        Self {
            status,
            content_type: None,
            content_length: None,
            cache_max_age: 0,
            headers: HeaderMap::default(),
            user_data: None,
            close: false,
            body: ResponseBody::Empty,
            state: SourceState::Unopened,
        }
    }

    /// In-memory body with an explicit content type.
    pub fn data(data: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        let data = data.into();
        Self {
            content_type: Some(content_type.into()),
            content_length: Some(data.len() as u64),
            body: ResponseBody::Data { data, pos: 0 },
            ..Self::status_only(StatusCode::Ok)
        }
    }

    /// `text/plain; charset=utf-8` body.
    pub fn text(text: impl Into<String>) -> Self {
        Self::data(text.into(), "text/plain; charset=utf-8")
    }

    /// `text/html; charset=utf-8` body.
    pub fn html(html: impl Into<String>) -> Self {
        Self::data(html.into(), "text/html; charset=utf-8")
    }

    /// HTML read from `path` with every `%name%` replaced by `variables["name"]`.
    ///
    /// Placeholders without a variable are left as they are. `None` if the
    /// file cannot be read as UTF-8 text.
    pub fn html_template(path: impl AsRef<Path>, variables: &HashMap<String, String>) -> Option<Self> {
        let template = std::fs::read_to_string(path).ok()?;
        Some(Self::html(fill_template(&template, variables)))
    }

    /// Empty `302 Found` (or `301 Moved Permanently`) pointing at `location`.
    pub fn redirect(location: impl Into<String>, permanent: bool) -> Self {
        let status = match permanent {
            true => StatusCode::MovedPermanently,
            false => StatusCode::Found,
        };
        Self::status_only(status).with_header("Location", location)
    }

    /// Contents of the file at `path`, typed by its extension.
    ///
    /// `None` if `path` is not a readable regular file.
    pub fn file(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).ok()?;
        if !metadata.is_file() {
            return None;
        }

        Some(Self {
            content_type: Some(mime_for_path(path).to_string()),
            content_length: Some(metadata.len()),
            body: ResponseBody::File {
                path: path.to_path_buf(),
                file: None,
            },
            ..Self::status_only(StatusCode::Ok)
        })
    }

    /// Like [`Response::file`], offered to the client as a download.
    pub fn file_attachment(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let name = path.file_name()?.to_string_lossy().replace('"', "");

        Some(Self::file(path)?.with_header(
            "Content-Disposition",
            format!("attachment; filename=\"{name}\""),
        ))
    }

    /// Body of unknown length produced chunk by chunk.
    ///
    /// Sent with `Transfer-Encoding: chunked` to HTTP/1.1 clients and
    /// delimited by closing the connection for HTTP/1.0 clients.
    pub fn stream<I>(chunks: I, content_type: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            content_type: Some(content_type.into()),
            body: ResponseBody::Stream {
                chunks: Box::new(chunks.into_iter()),
                pending: Vec::new(),
                pos: 0,
            },
            ..Self::status_only(StatusCode::Ok)
        }
    }
}

/// Builder methods
impl Response {
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Sets an additional header, replacing a previous value of the same name.
    ///
    /// `Content-Length`, `Transfer-Encoding` and `Connection` are managed by
    /// the server and ignored here.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        if !is_managed_header(&name) {
            self.headers.insert(name, value);
        }
        self
    }

    /// `Cache-Control: max-age=N, public`; `0` (the default) sends `no-cache`.
    pub fn with_cache_max_age(mut self, seconds: u32) -> Self {
        self.cache_max_age = seconds;
        self
    }

    /// Opaque data kept with the response and never sent.
    pub fn with_user_data<T: Any + Send + Sync>(mut self, data: T) -> Self {
        self.user_data = Some(Box::new(data));
        self
    }

    /// Forces the connection to close after this response.
    pub fn with_close(mut self) -> Self {
        self.close = true;
        self
    }
}

/// Accessors
impl Response {
    #[inline(always)]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// `None` means the response has no body.
    #[inline(always)]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// `None` with a body means the length is not known in advance.
    #[inline(always)]
    pub const fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    #[inline(always)]
    pub const fn cache_max_age(&self) -> u32 {
        self.cache_max_age
    }

    #[inline(always)]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_ref()?.downcast_ref()
    }

    #[inline(always)]
    pub const fn closes_connection(&self) -> bool {
        self.close
    }

    #[inline(always)]
    pub fn has_body(&self) -> bool {
        self.content_type.is_some()
    }
}

// Serialization
impl Response {
    pub(crate) fn framing(&self, version: Version) -> Framing {
        match (self.status.allows_body(), self.has_body(), self.content_length) {
            (false, _, _) => Framing::NoBody,
            (true, false, _) => Framing::Length(0),
            (true, true, Some(len)) => Framing::Length(len),
            (true, true, None) => match version {
                Version::Http11 => Framing::Chunked,
                Version::Http10 => Framing::UntilClose,
            },
        }
    }

    /// Appends the status line and headers, final empty line included.
    pub(crate) fn write_head(&self, out: &mut Vec<u8>, version: Version, framing: Framing, keep_alive: bool) {
        out.extend_from_slice(self.status.into_first_line(version));

        // Additional headers set on the response replace the derived ones.
        if !self.headers.contains("date") {
            out.extend_from_slice(b"Date: ");
            out.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !self.headers.contains("server") {
            out.extend_from_slice(b"Server: ");
            out.extend_from_slice(SERVER_NAME.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !self.headers.contains("cache-control") {
            match self.cache_max_age {
                0 => out.extend_from_slice(b"Cache-Control: no-cache\r\n"),
                age => {
                    let _ = write!(out, "Cache-Control: max-age={age}, public\r\n");
                }
            }
        }

        if let (Some(content_type), true, false) = (
            &self.content_type,
            framing != Framing::NoBody,
            self.headers.contains("content-type"),
        ) {
            out.extend_from_slice(b"Content-Type: ");
            out.extend_from_slice(content_type.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        match framing {
            Framing::Length(len) => {
                let _ = write!(out, "Content-Length: {len}\r\n");
            }
            Framing::Chunked => out.extend_from_slice(b"Transfer-Encoding: chunked\r\n"),
            Framing::NoBody | Framing::UntilClose => {}
        }

        if let Some(value) = connection_header(version, keep_alive) {
            out.extend_from_slice(b"Connection: ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }

        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"\r\n");
    }
}

impl BodySource for Response {
    fn open(&mut self) -> io::Result<()> {
        if self.state != SourceState::Unopened {
            return Err(io::Error::other("response body opened twice"));
        }
        self.body.open()?;
        self.state = SourceState::Open;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.state {
            SourceState::Open => self.body.read(buf),
            SourceState::Unopened | SourceState::Closed => {
                Err(io::Error::other("response body read while not open"))
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self.state {
            SourceState::Open => {
                self.state = SourceState::Closed;
                self.body.close()
            }
            SourceState::Unopened | SourceState::Closed => Ok(()),
        }
    }
}

#[inline(always)]
const fn connection_header(version: Version, keep_alive: bool) -> Option<&'static [u8]> {
    match (version, keep_alive) {
        (Version::Http11, true) => None,
        (Version::Http11, false) => Some(b"close"),
        (Version::Http10, true) => Some(b"keep-alive"),
        (Version::Http10, false) => None,
    }
}

fn is_managed_header(name: &str) -> bool {
    ["content-length", "transfer-encoding", "connection"]
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn fill_template(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        match after.find('%').and_then(|end| Some((end, variables.get(&after[..end])?))) {
            Some((end, value)) => {
                out.push_str(value);
                rest = &after[end + 1..];
            }
            None => {
                out.push('%');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Content type for a file name, `application/octet-stream` when unknown.
pub(crate) fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "json" => "application/json",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::str_op;

    fn drain(resp: &mut Response, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0; chunk];

        resp.open().unwrap();
        loop {
            match resp.read(&mut buf).unwrap() {
                0 => break,
                n => out.extend_from_slice(&buf[..n]),
            }
        }
        resp.close().unwrap();
        out
    }

    fn head(resp: &Response, version: Version, keep_alive: bool) -> String {
        let mut out = Vec::new();
        resp.write_head(&mut out, version, resp.framing(version), keep_alive);
        str_op(&out).to_string()
    }

    #[test]
    fn text_body() {
        let mut resp = Response::text("hello world");

        assert_eq!(resp.content_type(), Some("text/plain; charset=utf-8"));
        assert_eq!(resp.content_length(), Some(11));
        assert_eq!(drain(&mut resp, 4), b"hello world");
    }

    #[test]
    fn head_layout() {
        let resp = Response::text("hi").with_header("X-Id", "7");
        let text = head(&resp, Version::Http11, true);

        assert!(text.starts_with("HTTP/1.1 200 OK\r\nDate: "));
        assert!(text.contains("\r\nServer: kiln_web/"));
        assert!(text.contains("\r\nCache-Control: no-cache\r\n"));
        assert!(text.contains("\r\nContent-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.contains("\r\nContent-Length: 2\r\n"));
        assert!(text.contains("\r\nX-Id: 7\r\n"));
        assert!(!text.contains("Connection"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn connection_headers() {
        #[rustfmt::skip]
        let cases = [
            (Version::Http11, true,  None),
            (Version::Http11, false, Some("Connection: close")),
            (Version::Http10, true,  Some("Connection: keep-alive")),
            (Version::Http10, false, None),
        ];

        for (version, keep_alive, expected) in cases {
            let text = head(&Response::text("x"), version, keep_alive);
            let found = text.lines().find(|l| l.starts_with("Connection"));
            assert_eq!(found, expected, "{version:?} {keep_alive}");
        }
    }

    #[test]
    fn framing() {
        let stream = Response::stream(vec![b"a".to_vec()], "text/plain");

        #[rustfmt::skip]
        let cases = [
            (Response::text("abc"),                         Version::Http11, Framing::Length(3)),
            (Response::status_only(StatusCode::NotFound),   Version::Http11, Framing::Length(0)),
            (Response::status_only(StatusCode::NoContent),  Version::Http11, Framing::NoBody),
            (Response::text("x").with_status(StatusCode::NotModified), Version::Http10, Framing::NoBody),
            (stream,                                        Version::Http11, Framing::Chunked),
            (Response::stream(Vec::new(), "text/plain"),    Version::Http10, Framing::UntilClose),
        ];

        for (resp, version, expected) in cases {
            assert_eq!(resp.framing(version), expected, "{resp:?}");
        }
    }

    #[test]
    fn cache_control() {
        let text = head(&Response::text("x").with_cache_max_age(3600), Version::Http11, true);
        assert!(text.contains("\r\nCache-Control: max-age=3600, public\r\n"));
    }

    #[test]
    fn custom_headers_replace_derived() {
        let resp = Response::text("x")
            .with_cache_max_age(60)
            .with_header("Cache-Control", "private, max-age=5")
            .with_header("content-type", "application/json")
            .with_header("Server", "edge");
        let text = head(&resp, Version::Http11, true);

        #[rustfmt::skip]
        let cases = [
            ("cache-control:", "Cache-Control: private, max-age=5\r\n"),
            ("content-type:",  "content-type: application/json\r\n"),
            ("server:",        "Server: edge\r\n"),
            ("date:",          "Date: "),
        ];

        let lower = text.to_ascii_lowercase();
        for (name, line) in cases {
            assert_eq!(lower.matches(name).count(), 1, "{text}");
            assert!(text.contains(line), "{text}");
        }
    }

    #[test]
    fn redirect() {
        #[rustfmt::skip]
        let cases = [
            (true,  StatusCode::MovedPermanently),
            (false, StatusCode::Found),
        ];

        for (permanent, status) in cases {
            let resp = Response::redirect("/new", permanent);
            assert_eq!(resp.status(), status);
            assert_eq!(resp.headers().get("location"), Some("/new"));
            assert!(!resp.has_body());
        }
    }

    #[test]
    fn managed_headers_are_ignored() {
        let resp = Response::text("x")
            .with_header("Content-Length", "100")
            .with_header("connection", "upgrade");

        assert!(resp.headers().is_empty());
    }

    #[test]
    fn stream_body() {
        let chunks = vec![b"ab".to_vec(), Vec::new(), b"cde".to_vec()];
        let mut resp = Response::stream(chunks, "text/plain");

        assert_eq!(resp.content_length(), None);
        assert_eq!(drain(&mut resp, 2), b"abcde");
    }

    #[test]
    fn file_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.JSON");
        std::fs::write(&path, b"{\"ok\":true}").unwrap();

        let mut resp = Response::file(&path).unwrap();
        assert_eq!(resp.content_type(), Some("application/json"));
        assert_eq!(resp.content_length(), Some(11));
        assert_eq!(drain(&mut resp, 3), b"{\"ok\":true}");

        let resp = Response::file_attachment(&path).unwrap();
        assert_eq!(
            resp.headers().get("content-disposition"),
            Some("attachment; filename=\"report.JSON\"")
        );

        assert!(Response::file(dir.path().join("missing")).is_none());
        assert!(Response::file(dir.path()).is_none());
    }

    #[test]
    fn template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        std::fs::write(&path, "<p>%greeting%, %name%! 100% %unknown%</p>").unwrap();

        let mut variables = HashMap::new();
        variables.insert("greeting".to_string(), "Hello".to_string());
        variables.insert("name".to_string(), "Ada".to_string());

        let mut resp = Response::html_template(&path, &variables).unwrap();
        assert_eq!(
            str_op(&drain(&mut resp, 64)),
            "<p>Hello, Ada! 100% %unknown%</p>"
        );
        assert!(Response::html_template(dir.path().join("nope"), &variables).is_none());
    }

    #[test]
    fn source_lifecycle() {
        // Closing a never-opened source is a no-op
        let mut resp = Response::text("x");
        assert!(resp.close().is_ok());

        let mut resp = Response::text("x");
        let mut buf = [0; 4];
        assert!(resp.read(&mut buf).is_err());
        resp.open().unwrap();
        assert!(resp.open().is_err());
    }

    #[test]
    fn user_data() {
        let resp = Response::default().with_user_data(42u32);
        assert_eq!(resp.user_data::<u32>(), Some(&42));
        assert_eq!(resp.user_data::<String>(), None);
    }

    #[test]
    fn mime_lookup() {
        #[rustfmt::skip]
        let cases = [
            ("index.html",  "text/html; charset=utf-8"),
            ("a/b/c.PNG",   "image/png"),
            ("archive.tar", "application/octet-stream"),
            ("noext",       "application/octet-stream"),
        ];

        for (path, expected) in cases {
            assert_eq!(mime_for_path(Path::new(path)), expected);
        }
    }
}
