#![allow(rustdoc::bare_urls)]

//! Core HTTP protocol types and utilities

use crate::{errors::ErrorKind, form};
use std::{collections::HashMap, fmt};

#[inline(always)]
pub(crate) fn slice_to_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: usize = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as usize)?;
    }

    Some(result)
}

/// Media type of a `Content-Type`-like value, parameters stripped and lowercased.
///
/// `"Text/HTML; charset=utf-8"` → `"text/html"`
pub(crate) fn media_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Parameters of a header value such as `Content-Type` or
/// `Content-Disposition`, with parameter names lowercased.
///
/// Quoted values may contain `;` and backslash escapes.
///
/// `form-data; name="a"; filename="x;y.txt"` → `[("name", "a"), ("filename", "x;y.txt")]`
pub(crate) fn header_params(value: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = match value.find(';') {
        Some(pos) => &value[pos + 1..],
        None => return params,
    };

    loop {
        rest = rest.trim_start_matches([' ', '\t', ';']);
        if rest.is_empty() {
            break;
        }

        let name_end = rest.find(['=', ';']).unwrap_or(rest.len());
        let name = rest[..name_end].trim().to_ascii_lowercase();
        rest = &rest[name_end..];

        let value = match rest.strip_prefix('=') {
            Some(after) => {
                let after = after.trim_start_matches([' ', '\t']);
                if let Some(quoted) = after.strip_prefix('"') {
                    let (value, used) = unquote(quoted);
                    rest = &quoted[used..];
                    value
                } else {
                    let end = after.find(';').unwrap_or(after.len());
                    rest = &after[end..];
                    after[..end].trim().to_string()
                }
            }
            None => String::new(),
        };

        if !name.is_empty() {
            params.push((name, value));
        }
    }

    params
}

// Reads a quoted string whose opening quote is already consumed.
// Returns the value and the number of bytes used, closing quote included.
fn unquote(src: &str) -> (String, usize) {
    let mut value = String::new();
    let mut chars = src.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return (value, i + 1),
            '\\' => match chars.next() {
                Some((_, escaped)) => value.push(escaped),
                None => break,
            },
            c => value.push(c),
        }
    }

    (value, src.len())
}

/// `tchar` from RFC 9110, the alphabet of methods and header names.
#[inline(always)]
pub(crate) const fn is_token(byte: u8) -> bool {
    matches!(byte,
        b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9'
        | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*'
        | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~'
    )
}

// METHOD

/// HTTP request methods
///
/// # Disabled methods
///
/// * `TRACE` - disabled for security reasons
/// * `CONNECT` - tunnels are out of scope for an embedded server
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// [[RFC7231, Section 4.3.1](https://tools.ietf.org/html/rfc7231#section-4.3.1)]
    Get,
    /// [[RFC7231, Section 4.3.4](https://tools.ietf.org/html/rfc7231#section-4.3.4)]
    Put,
    /// [[RFC7231, Section 4.3.3](https://tools.ietf.org/html/rfc7231#section-4.3.3)]
    Post,
    /// Same as GET but the response carries no body
    /// [[RFC7231, Section 4.3.2](https://tools.ietf.org/html/rfc7231#section-4.3.2)]
    Head,
    /// [[RFC5789, Section 2](https://tools.ietf.org/html/rfc5789#section-2)]
    Patch,
    /// [[RFC7231, Section 4.3.5](https://tools.ietf.org/html/rfc7231#section-4.3.5)]
    Delete,
    /// [[RFC7231, Section 4.3.7](https://tools.ietf.org/html/rfc7231#section-4.3.7)]
    Options,
}

impl Method {
    /// Unknown but well-formed tokens are not implemented rather than invalid.
    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"GET" => Ok(Method::Get),
            b"PUT" => Ok(Method::Put),
            b"POST" => Ok(Method::Post),
            b"HEAD" => Ok(Method::Head),
            b"PATCH" => Ok(Method::Patch),
            b"DELETE" => Ok(Method::Delete),
            b"OPTIONS" => Ok(Method::Options),
            [] => Err(ErrorKind::InvalidMethod),
            _ if src.iter().all(|&b| is_token(b)) => Err(ErrorKind::UnsupportedMethod),
            _ => Err(ErrorKind::InvalidMethod),
        }
    }

    /// Canonical method token, e.g. `"GET"`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// VERSION

/// HTTP protocol version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    /// HTTP/1.0 [RFC 1945](https://tools.ietf.org/html/rfc1945)
    Http10,
    /// HTTP/1.1 [RFC 7230](https://tools.ietf.org/html/rfc7230) and related
    Http11,
}

impl Version {
    #[inline(always)]
    pub(crate) const fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"HTTP/1.1" => Ok(Self::Http11),
            b"HTTP/1.0" => Ok(Self::Http10),
            [b'H', b'T', b'T', b'P', b'/', major, b'.', minor]
                if major.is_ascii_digit() && minor.is_ascii_digit() =>
            {
                Err(ErrorKind::UnsupportedVersion)
            }
            _ => Err(ErrorKind::InvalidVersion),
        }
    }

    /// `HTTP/1.1` keeps connections open unless asked not to; `HTTP/1.0` does the opposite.
    #[inline(always)]
    pub const fn keep_alive_by_default(&self) -> bool {
        matches!(self, Self::Http11)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $(#[$docs:meta])*
        $name:ident = ($num:expr, $str:expr);
    )+) => {
        /// HTTP status codes
        ///
        /// Represents valid HTTP status codes as defined in
        /// [RFC 9110](https://datatracker.ietf.org/doc/html/rfc9110#section-15) and other standards.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $(#[$docs])*
            $name = $num,
        )+ }

        impl StatusCode {
            // Returns the HTTP first line as bytes (e.g., `b"HTTP/1.1 200 OK\r\n"`).
            #[inline]
            pub(crate) const fn into_first_line(&self, version: Version) -> &'static [u8] {
                match (self, version) { $(
                    (StatusCode::$name, Version::Http11) => {
                        concat!("HTTP/1.1 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                    (StatusCode::$name, Version::Http10) => {
                        concat!("HTTP/1.0 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                )+ }
            }

            /// Reason phrase, e.g. `"Not Found"`.
            pub const fn reason(&self) -> &'static str {
                match self { $(
                    StatusCode::$name => $str,
                )+ }
            }
        }
    }
}

set_status_codes! {
    Continue = (100, "Continue");
    SwitchingProtocols = (101, "Switching Protocols");

    Ok = (200, "OK");
    Created = (201, "Created");
    Accepted = (202, "Accepted");
    NonAuthoritativeInformation = (203, "Non Authoritative Information");
    NoContent = (204, "No Content");
    ResetContent = (205, "Reset Content");
    PartialContent = (206, "Partial Content");

    MultipleChoices = (300, "Multiple Choices");
    /// Used by [`Response::redirect`](crate::Response::redirect) for permanent redirects
    MovedPermanently = (301, "Moved Permanently");
    /// Used by [`Response::redirect`](crate::Response::redirect) for temporary redirects
    Found = (302, "Found");
    SeeOther = (303, "See Other");
    NotModified = (304, "Not Modified");
    TemporaryRedirect = (307, "Temporary Redirect");
    PermanentRedirect = (308, "Permanent Redirect");

    BadRequest = (400, "Bad Request");
    Unauthorized = (401, "Unauthorized");
    Forbidden = (403, "Forbidden");
    NotFound = (404, "Not Found");
    MethodNotAllowed = (405, "Method Not Allowed");
    NotAcceptable = (406, "Not Acceptable");
    RequestTimeout = (408, "Request Timeout");
    Conflict = (409, "Conflict");
    Gone = (410, "Gone");
    LengthRequired = (411, "Length Required");
    PreconditionFailed = (412, "Precondition Failed");
    PayloadTooLarge = (413, "Payload Too Large");
    UriTooLong = (414, "URI Too Long");
    UnsupportedMediaType = (415, "Unsupported Media Type");
    RangeNotSatisfiable = (416, "Range Not Satisfiable");
    ExpectationFailed = (417, "Expectation Failed");
    ImaTeapot = (418, "I'm a teapot");
    UnprocessableEntity = (422, "Unprocessable Entity");
    TooManyRequests = (429, "Too Many Requests");
    RequestHeaderFieldsTooLarge = (431, "Request Header Fields Too Large");

    InternalServerError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    BadGateway = (502, "Bad Gateway");
    ServiceUnavailable = (503, "Service Unavailable");
    GatewayTimeout = (504, "Gateway Timeout");
    HttpVersionNotSupported = (505, "HTTP Version Not Supported");
}

impl StatusCode {
    /// Numeric code, e.g. `404`.
    #[inline]
    pub const fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// `1xx`, `204` and `304` responses never carry a body.
    #[inline]
    pub const fn allows_body(&self) -> bool {
        !matches!(self.as_u16(), 100..=199 | 204 | 304)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason())
    }
}

// Url

/// The request target, split and decoded.
///
/// # Components
///
/// - **Target**: Raw path with query string (e.g., `/api/my%20files?sort=name&debug`)
/// - **Path**: Percent-decoded path without query string (e.g., `/api/my files`)
/// - **Segments**: Path split by `/` (e.g., `["api", "my files"]`)
/// - **Query**: Decoded `key -> value` mapping, `None` when the target has no `?`
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Url {
    target: String,
    path: String,
    query: Option<HashMap<String, String>>,
}

impl Url {
    pub(crate) fn parse(target: &str) -> Result<Self, ErrorKind> {
        let (raw_path, raw_query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };

        if !raw_path.starts_with('/') && raw_path != "*" {
            return Err(ErrorKind::InvalidUrl);
        }

        let path = form::percent_decode(raw_path.as_bytes()).ok_or(ErrorKind::InvalidUrl)?;
        let query = raw_query.map(|q| form::decode(q.as_bytes()));

        Ok(Self {
            target: target.to_string(),
            path,
            query,
        })
    }
}

// Public API
impl Url {
    /// Returns the raw request target exactly as received.
    #[inline(always)]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns the percent-decoded path.
    #[inline(always)]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the path segments, without empty ones.
    ///
    /// # Examples
    ///
    /// For path `/api/users/123/`:
    /// ```text
    /// ["api", "users", "123"]
    /// ```
    pub fn path_segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }

    /// Returns the decoded query mapping, `None` if the target has no `?`.
    #[inline(always)]
    pub fn query_map(&self) -> Option<&HashMap<String, String>> {
        self.query.as_ref()
    }

    /// Returns the value for the specified query parameter key.
    ///
    /// # Examples
    ///
    /// For target `/search?q=rust+lang&debug`:
    /// - at the key `"q"`: `Some("rust lang")`
    /// - at the key `"debug"`: `Some("")`
    /// - at the key `"page"`: `None`
    #[inline(always)]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.as_ref()?.get(key).map(String::as_str)
    }
}

// HEADER MAP

/// Header mapping with case-insensitive names.
///
/// Inserting a name that is already present replaces the earlier value in
/// place, so iteration keeps the first position.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    #[inline(always)]
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Sets `name` to `value`, replacing an existing value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Value for `name`, looked up case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(pos).1)
    }

    /// Whether the comma separated value of `name` lists `token` (case-insensitive).
    ///
    /// `Connection: keep-alive, Upgrade` has the token `upgrade`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name).is_some_and(|value| {
            value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
