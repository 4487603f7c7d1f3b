//! Request head and request bodies.
//!
//! # General designations
//! ```text
//! POST /upload?kind=avatar HTTP/1.1\r
//! Host: localhost\r
//! Content-Type: multipart/form-data; boundary=XyZ\r
//! Content-Length: 151\r
//! \r
//! --XyZ\r
//! ...
//! ```
//!
//! The head is parsed by the connection and handed to the matchers as a
//! [`RequestHead`]. The matcher that accepts it builds a [`Request`], choosing
//! through [`BodyKind`] where the body goes. The connection then streams the
//! body into it through [`BodySink`].

use crate::{
    form,
    http::types::{media_type, HeaderMap, Method, Url, Version},
    multipart::{self, MultipartArgument, MultipartFile, MultipartForm},
    Error,
};
use std::{
    collections::HashMap,
    io::Write,
    net::SocketAddr,
    ops::Deref,
    path::Path,
};
use tempfile::{NamedTempFile, TempPath};

/// Everything known about a request before its body is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub(crate) method: Method,
    pub(crate) version: Version,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) content_type: Option<String>,
    pub(crate) content_length: Option<usize>,
    pub(crate) chunked: bool,
    pub(crate) expect_continue: bool,
    pub(crate) keep_alive: bool,
    pub(crate) peer: SocketAddr,
}

impl RequestHead {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    #[inline(always)]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Percent-decoded path, shorthand for `url().path()`.
    #[inline(always)]
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Decoded query value, shorthand for `url().query(key)`.
    #[inline(always)]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.url.query(key)
    }

    #[inline(always)]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Header value by case-insensitive name.
    #[inline(always)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// `Content-Type` of the body; `None` when the request has no body.
    #[inline(always)]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// `Content-Length`; `None` when absent (chunked bodies have no length).
    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    #[inline(always)]
    pub const fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Whether the client asked for `100 Continue` before sending the body.
    #[inline(always)]
    pub const fn expects_continue(&self) -> bool {
        self.expect_continue
    }

    /// Whether the client allows the connection to stay open.
    #[inline(always)]
    pub const fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline(always)]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether body bytes follow the head.
    #[inline(always)]
    pub fn has_body(&self) -> bool {
        self.chunked || self.content_length.is_some_and(|len| len > 0)
    }
}

/// Where a matched request's body is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyKind {
    /// In memory, see [`Request::data`].
    Data,
    /// In a temporary file, see [`Request::file_path`].
    File,
    /// Decoded as `application/x-www-form-urlencoded`, see [`Request::arguments`].
    UrlEncodedForm,
    /// Decoded as `multipart/form-data`, see [`Request::multipart`].
    MultipartForm,
}

/// Receiver of a request body.
///
/// Driven by the connection as `open`, any number of `write`s, then `close`.
pub trait BodySink {
    /// Prepares the sink before the first byte arrives.
    fn open(&mut self) -> Result<(), Error>;

    /// Accepts the next piece of the body. Every byte is consumed.
    fn write(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Finishes the body. Decoding sinks do their work here.
    fn close(&mut self) -> Result<(), Error>;
}

#[derive(Debug)]
pub(crate) enum RequestBody {
    Data(Vec<u8>),
    File {
        file: Option<NamedTempFile>,
        path: Option<TempPath>,
    },
    UrlEncodedForm {
        buffer: Vec<u8>,
        arguments: HashMap<String, String>,
    },
    MultipartForm {
        buffer: Vec<u8>,
        boundary: Option<String>,
        form: MultipartForm,
    },
}

impl RequestBody {
    fn new(kind: BodyKind, head: &RequestHead) -> Self {
        match kind {
            BodyKind::Data => Self::Data(Vec::new()),
            BodyKind::File => Self::File {
                file: None,
                path: None,
            },
            BodyKind::UrlEncodedForm => Self::UrlEncodedForm {
                buffer: Vec::new(),
                arguments: HashMap::new(),
            },
            BodyKind::MultipartForm => Self::MultipartForm {
                buffer: Vec::new(),
                boundary: head
                    .content_type()
                    .and_then(|ct| multipart::boundary(ct).ok()),
                form: MultipartForm::default(),
            },
        }
    }

    fn kind(&self) -> BodyKind {
        match self {
            Self::Data(_) => BodyKind::Data,
            Self::File { .. } => BodyKind::File,
            Self::UrlEncodedForm { .. } => BodyKind::UrlEncodedForm,
            Self::MultipartForm { .. } => BodyKind::MultipartForm,
        }
    }
}

impl BodySink for RequestBody {
    fn open(&mut self) -> Result<(), Error> {
        match self {
            Self::File { file, .. } => {
                *file = Some(tempfile::Builder::new().prefix("kiln-body-").tempfile()?);
            }
            Self::MultipartForm { boundary: None, .. } => {
                return Err(multipart::MultipartError::MissingBoundary.into());
            }
            Self::Data(_) | Self::UrlEncodedForm { .. } | Self::MultipartForm { .. } => {}
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        match self {
            Self::Data(buffer)
            | Self::UrlEncodedForm { buffer, .. }
            | Self::MultipartForm { buffer, .. } => buffer.extend_from_slice(data),
            Self::File { file, .. } => file
                .as_mut()
                .ok_or(Error::SinkState("file body written before open"))?
                .write_all(data)?,
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        match self {
            Self::Data(_) => {}
            Self::File { file, path } => {
                if let Some(mut file) = file.take() {
                    file.flush()?;
                    *path = Some(file.into_temp_path());
                }
            }
            Self::UrlEncodedForm { buffer, arguments } => {
                *arguments = form::decode(buffer);
                *buffer = Vec::new();
            }
            Self::MultipartForm {
                buffer,
                boundary,
                form,
            } => {
                let boundary = boundary
                    .as_deref()
                    .ok_or(multipart::MultipartError::MissingBoundary)?;
                *form = multipart::decode(buffer, boundary)?;
                *buffer = Vec::new();
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Unopened,
    Open,
    Closed,
}

/// A matched request: the head plus a body of the chosen [`BodyKind`].
///
/// Dereferences to [`RequestHead`], so `request.path()` and friends work directly.
/// Temporary files created for the body are removed when the request is dropped.
#[derive(Debug)]
pub struct Request {
    head: RequestHead,
    body: RequestBody,
    state: SinkState,
}

impl Request {
    /// Creates an unopened request for `head`; called from matchers.
    pub fn new(head: &RequestHead, kind: BodyKind) -> Self {
        Self {
            body: RequestBody::new(kind, head),
            head: head.clone(),
            state: SinkState::Unopened,
        }
    }

    #[inline(always)]
    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn kind(&self) -> BodyKind {
        self.body.kind()
    }

    /// Body bytes of a [`BodyKind::Data`] request.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.body {
            RequestBody::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Body of a [`BodyKind::Data`] request as UTF-8 text.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(self.data()?).ok()
    }

    /// Temporary file holding the body of a [`BodyKind::File`] request.
    pub fn file_path(&self) -> Option<&Path> {
        match &self.body {
            RequestBody::File { path, .. } => path.as_deref(),
            _ => None,
        }
    }

    /// Decoded pairs of a [`BodyKind::UrlEncodedForm`] request.
    pub fn arguments(&self) -> Option<&HashMap<String, String>> {
        match &self.body {
            RequestBody::UrlEncodedForm { arguments, .. } => Some(arguments),
            _ => None,
        }
    }

    /// Decoded parts of a [`BodyKind::MultipartForm`] request.
    pub fn multipart(&self) -> Option<&MultipartForm> {
        match &self.body {
            RequestBody::MultipartForm { form, .. } => Some(form),
            _ => None,
        }
    }

    /// Non-file parts of a [`BodyKind::MultipartForm`] request.
    pub fn multipart_arguments(&self) -> Option<&HashMap<String, MultipartArgument>> {
        self.multipart().map(MultipartForm::arguments)
    }

    /// File parts of a [`BodyKind::MultipartForm`] request.
    pub fn files(&self) -> Option<&HashMap<String, MultipartFile>> {
        self.multipart().map(MultipartForm::files)
    }

    /// Whether the body's declared media type is `mime` (parameters ignored).
    pub fn is_content_type(&self, mime: &str) -> bool {
        self.head
            .content_type()
            .is_some_and(|ct| media_type(ct).eq_ignore_ascii_case(mime))
    }
}

impl Deref for Request {
    type Target = RequestHead;

    fn deref(&self) -> &RequestHead {
        &self.head
    }
}

impl BodySink for Request {
    fn open(&mut self) -> Result<(), Error> {
        if self.state != SinkState::Unopened {
            return Err(Error::SinkState("open called twice"));
        }
        self.body.open()?;
        self.state = SinkState::Open;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        match self.state {
            SinkState::Open => self.body.write(data),
            SinkState::Unopened => Err(Error::SinkState("write before open")),
            SinkState::Closed => Err(Error::SinkState("write after close")),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        match self.state {
            SinkState::Unopened => Ok(()),
            SinkState::Closed => Err(Error::SinkState("close called twice")),
            SinkState::Open => {
                self.state = SinkState::Closed;
                self.body.close()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn head(method: Method, target: &str, headers: &[(&str, &str)]) -> RequestHead {
        let mut map = HeaderMap::default();
        for (name, value) in headers {
            map.insert(*name, *value);
        }

        let content_length = map.get("content-length").and_then(|v| v.parse().ok());
        let chunked = map.has_token("transfer-encoding", "chunked");
        let has_body = chunked || content_length.is_some_and(|len: usize| len > 0);

        RequestHead {
            method,
            version: Version::Http11,
            url: Url::parse(target).unwrap(),
            content_type: map
                .get("content-type")
                .filter(|_| has_body)
                .map(str::to_string),
            headers: map,
            content_length,
            chunked,
            expect_continue: false,
            keep_alive: true,
            peer: "127.0.0.1:4000".parse().unwrap(),
        }
    }

    fn feed(request: &mut Request, chunks: &[&[u8]]) -> Result<(), Error> {
        request.open()?;
        for chunk in chunks {
            request.write(chunk)?;
        }
        request.close()
    }

    #[test]
    fn data_body() {
        let head = head(Method::Post, "/echo", &[("Content-Length", "11")]);
        let mut request = Request::new(&head, BodyKind::Data);

        feed(&mut request, &[b"hello", b" world"]).unwrap();

        assert_eq!(request.kind(), BodyKind::Data);
        assert_eq!(request.data(), Some(&b"hello world"[..]));
        assert_eq!(request.text(), Some("hello world"));
        assert_eq!(request.path(), "/echo");
        assert_eq!(request.file_path(), None);
    }

    #[test]
    fn file_body_is_removed_on_drop() {
        let head = head(Method::Put, "/blob", &[("Content-Length", "4")]);
        let mut request = Request::new(&head, BodyKind::File);

        assert_eq!(request.file_path(), None);
        feed(&mut request, &[b"da", b"ta"]).unwrap();

        let path = request.file_path().unwrap().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), b"data");

        drop(request);
        assert!(!path.exists());
    }

    #[test]
    fn urlencoded_body() {
        let head = head(
            Method::Post,
            "/form",
            &[
                ("Content-Type", "application/x-www-form-urlencoded"),
                ("Content-Length", "20"),
            ],
        );
        let mut request = Request::new(&head, BodyKind::UrlEncodedForm);

        feed(&mut request, &[b"a=1&b=hello", b"+world"]).unwrap();

        let arguments = request.arguments().unwrap();
        assert_eq!(arguments["a"], "1");
        assert_eq!(arguments["b"], "hello world");
        assert!(request.is_content_type("application/x-www-form-urlencoded"));
    }

    #[test]
    fn multipart_body() {
        let body = b"--XyZ\r\n\
            Content-Disposition: form-data; name=\"field\"\r\n\r\n\
            value\r\n\
            --XyZ\r\n\
            Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\r\n\
            hello\r\n\
            --XyZ--\r\n";
        let len = body.len().to_string();
        let head = head(
            Method::Post,
            "/upload",
            &[
                ("Content-Type", "multipart/form-data; boundary=XyZ"),
                ("Content-Length", &len),
            ],
        );
        let mut request = Request::new(&head, BodyKind::MultipartForm);

        let (first, second) = body.split_at(30);
        feed(&mut request, &[first, second]).unwrap();

        let arguments = request.multipart_arguments().unwrap();
        assert_eq!(arguments["field"].string(), Some("value"));

        let upload = &request.files().unwrap()["upload"];
        assert_eq!(upload.file_name(), "a.txt");
        assert_eq!(std::fs::read(upload.temporary_path()).unwrap(), b"hello");
    }

    #[test]
    fn multipart_without_boundary() {
        let head = head(
            Method::Post,
            "/upload",
            &[("Content-Type", "multipart/form-data"), ("Content-Length", "3")],
        );
        let mut request = Request::new(&head, BodyKind::MultipartForm);

        assert!(matches!(request.open(), Err(Error::Multipart(_))));
    }

    #[test]
    fn lifecycle() {
        let head = head(Method::Get, "/", &[]);

        // Closing a never-opened sink is a no-op
        let mut request = Request::new(&head, BodyKind::Data);
        assert!(request.close().is_ok());
        assert_eq!(request.data(), Some(&b""[..]));

        let mut request = Request::new(&head, BodyKind::File);
        assert!(matches!(request.write(b"x"), Err(Error::SinkState(_))));
        request.open().unwrap();
        assert!(matches!(request.open(), Err(Error::SinkState(_))));
        request.close().unwrap();
        assert!(matches!(request.write(b"x"), Err(Error::SinkState(_))));
        assert!(matches!(request.close(), Err(Error::SinkState(_))));
    }

    #[test]
    fn head_without_body_has_no_content_type() {
        let head = head(
            Method::Post,
            "/",
            &[("Content-Type", "text/plain"), ("Content-Length", "0")],
        );

        assert!(!head.has_body());
        assert_eq!(head.content_type(), None);
        assert_eq!(head.content_length(), Some(0));
    }
}
