use crate::{multipart::MultipartError, Version};
use std::{io, net::SocketAddr};

/// Errors surfaced through the public API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The listening socket could not be created or bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// [`ServerBuilder::build`](crate::ServerBuilder::build) was called without a listener.
    #[error("the `listener` method must be called before `build`")]
    MissingListener,

    /// A path pattern passed to
    /// [`Handlers::add_regex_handler`](crate::Handlers::add_regex_handler) did not compile.
    #[error("invalid path pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// The multipart body could not be decoded.
    #[error("multipart body: {0}")]
    Multipart(#[from] MultipartError),

    /// A body sink or source was driven out of order (e.g. `write` after `close`).
    #[error("body used out of order: {0}")]
    SinkState(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Error type returned by processors. Converted into a `500` response.
pub type ProcessError = Box<dyn std::error::Error + Send + Sync>;

/// Connection-level failures. Protocol errors are answered with a ready-made
/// response (see [`ErrorKind::as_http`]); the rest abort the connection.
#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    InvalidMethod,
    UnsupportedMethod,

    InvalidUrl,
    UriTooLong,

    InvalidVersion,
    UnsupportedVersion,

    InvalidHeader,
    InvalidEncoding,
    TooManyHeaders,
    HeadersTooLarge,
    InvalidContentLength,
    ConflictingFraming,
    UnsupportedTransferEncoding,

    ServiceUnavailable,

    BodyFraming(&'static str),
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status_code:expr, $len:literal => $json:literal; )*) => {
        pub(crate) const fn as_http(
            &self,
            version: Version,
            json: bool,
        ) -> &'static [u8] {
            match (json, self, version) { $(
                (true, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
                (true, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
            )* }.as_bytes()
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidMethod: "400 Bad Request", "55"
            => r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#;
        UnsupportedMethod: "501 Not Implemented", "67"
            => r#"{"error":"HTTP method not implemented","code":"UNSUPPORTED_METHOD"}"#;

        InvalidUrl: "400 Bad Request", "51"
            => r#"{"error":"Invalid URL format","code":"INVALID_URL"}"#;
        UriTooLong: "414 URI Too Long", "55"
            => r#"{"error":"Request line too long","code":"URI_TOO_LONG"}"#;

        InvalidVersion: "400 Bad Request", "57"
            => r#"{"error":"Invalid HTTP version","code":"INVALID_VERSION"}"#;
        UnsupportedVersion: "505 HTTP Version Not Supported", "67"
            => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;

        InvalidHeader: "400 Bad Request", "57"
            => r#"{"error":"Invalid header format","code":"INVALID_HEADER"}"#;
        InvalidEncoding: "400 Bad Request", "63"
            => r#"{"error":"Request head is not UTF-8","code":"INVALID_ENCODING"}"#;
        TooManyHeaders: "431 Request Header Fields Too Large", "54"
            => r#"{"error":"Too many headers","code":"TOO_MANY_HEADERS"}"#;
        HeadersTooLarge: "431 Request Header Fields Too Large", "61"
            => r#"{"error":"Header block too large","code":"HEADERS_TOO_LARGE"}"#;
        InvalidContentLength: "400 Bad Request", "66"
            => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
        ConflictingFraming: "400 Bad Request", "80"
            => r#"{"error":"Both Content-Length and chunked present","code":"CONFLICTING_FRAMING"}"#;
        UnsupportedTransferEncoding: "501 Not Implemented", "80"
            => r#"{"error":"Unsupported Transfer-Encoding","code":"UNSUPPORTED_TRANSFER_ENCODING"}"#;

        ServiceUnavailable: "503 Service Unavailable", "72"
            => r#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#;

        BodyFraming: "400 Bad Request", "56"
            => r#"{"error":"Malformed message body","code":"BODY_FRAMING"}"#;
        Io: "503 Service Unavailable", "48"
            => r#"{"error":"I/O error occurred","code":"IO_ERROR"}"#;
    }

    /// Whether the protocol state still allows an error response to be written.
    /// Framing and socket failures close the connection without one.
    #[inline]
    pub(crate) const fn is_respondable(&self) -> bool {
        !matches!(self, Self::BodyFraming(_) | Self::Io(_))
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}
