//! Request head parsing: the read buffer, the request line and the header block.

use crate::{
    errors::ErrorKind,
    http::{
        request::RequestHead,
        types::{self, is_token, HeaderMap, Method, Url, Version},
    },
    limits::ReqLimits,
};
use memchr::{memchr, memmem};
use std::{io, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::sleep,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestLine {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) version: Version,
}

/// Parses `METHOD SP request-target SP HTTP/1.x`, without the line break.
pub(crate) fn parse_request_line(line: &[u8]) -> Result<RequestLine, ErrorKind> {
    let line = simdutf8::basic::from_utf8(line).map_err(|_| ErrorKind::InvalidEncoding)?;

    let (method, rest) = line.split_once(' ').ok_or(ErrorKind::InvalidMethod)?;
    let method = Method::from_bytes(method.as_bytes())?;

    let (target, version) = rest.split_once(' ').ok_or(ErrorKind::InvalidVersion)?;
    if target.is_empty() {
        return Err(ErrorKind::InvalidUrl);
    }
    let version = Version::from_bytes(version.as_bytes())?;

    if target == "*" && method != Method::Options {
        return Err(ErrorKind::InvalidUrl);
    }

    Ok(RequestLine {
        method,
        target: target.to_string(),
        version,
    })
}

/// Parses the header lines between the request line and the empty line.
///
/// Names are checked against the token grammar, values have surrounding
/// whitespace removed. A repeated name replaces the earlier value.
pub(crate) fn parse_headers(block: &[u8], limits: &ReqLimits) -> Result<HeaderMap, ErrorKind> {
    let block = simdutf8::basic::from_utf8(block).map_err(|_| ErrorKind::InvalidEncoding)?;
    let mut headers = HeaderMap::with_capacity(16);

    for (count, line) in block.split("\r\n").enumerate() {
        if count >= limits.header_count {
            return Err(ErrorKind::TooManyHeaders);
        }

        let (name, value) = line.split_once(':').ok_or(ErrorKind::InvalidHeader)?;
        if name.is_empty() || !name.bytes().all(is_token) {
            return Err(ErrorKind::InvalidHeader);
        }

        let value = value.trim_matches([' ', '\t']);
        if value.bytes().any(|b| b == b'\r' || b == b'\n') {
            return Err(ErrorKind::InvalidHeader);
        }

        if name.eq_ignore_ascii_case("content-length")
            && headers.get(name).is_some_and(|previous| previous != value)
        {
            return Err(ErrorKind::InvalidContentLength);
        }

        headers.insert(name, value);
    }

    Ok(headers)
}

/// Derives the framing and connection attributes of a request.
pub(crate) fn build_head(
    line: RequestLine,
    headers: HeaderMap,
    peer: SocketAddr,
) -> Result<RequestHead, ErrorKind> {
    let url = Url::parse(&line.target)?;

    let content_length = match headers.get("content-length") {
        Some(value) => Some(
            types::slice_to_usize(value.as_bytes()).ok_or(ErrorKind::InvalidContentLength)?,
        ),
        None => None,
    };

    let chunked = match headers.get("transfer-encoding") {
        Some(value) if value.eq_ignore_ascii_case("chunked") => true,
        Some(_) => return Err(ErrorKind::UnsupportedTransferEncoding),
        None => false,
    };

    if chunked && content_length.is_some() {
        return Err(ErrorKind::ConflictingFraming);
    }

    let keep_alive = match line.version.keep_alive_by_default() {
        true => !headers.has_token("connection", "close"),
        false => headers.has_token("connection", "keep-alive"),
    };

    let expect_continue = line.version == Version::Http11
        && headers
            .get("expect")
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));

    let has_body = chunked || content_length.is_some_and(|len| len > 0);
    let content_type = headers
        .get("content-type")
        .filter(|_| has_body)
        .map(str::to_string);

    Ok(RequestHead {
        method: line.method,
        version: line.version,
        url,
        headers,
        content_type,
        content_length,
        chunked,
        expect_continue,
        keep_alive,
        peer,
    })
}

/// Per-connection read buffer.
///
/// Bytes past the current request stay buffered for the next one.
#[derive(Debug)]
pub(crate) struct Parser {
    buffer: Vec<u8>,
    start: usize,
    end: usize,
    initial: usize,
    pub(crate) bytes_read: u64,
}

impl Parser {
    #[inline(always)]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        let initial = limits.buffer_size.max(64);
        Parser {
            buffer: vec![0; initial],
            start: 0,
            end: 0,
            initial,
            bytes_read: 0,
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        if self.buffer.len() > self.initial * 4 {
            self.buffer = vec![0; self.initial];
        }
        self.start = 0;
        self.end = 0;
        self.bytes_read = 0;
    }

    #[inline(always)]
    pub(crate) fn available(&self) -> &[u8] {
        &self.buffer[self.start..self.end]
    }

    #[inline(always)]
    pub(crate) fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Reads more bytes from `stream`. `Ok(0)` means the peer closed its side.
    pub(crate) async fn fill_buffer<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        time: Duration,
    ) -> Result<usize, io::Error> {
        if self.start > 0 {
            self.buffer.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.end == self.buffer.len() {
            let len = self.buffer.len() * 2;
            self.buffer.resize(len, 0);
        }

        tokio::select! {
            biased;

            read_result = stream.read(&mut self.buffer[self.end..]) => {
                let n = read_result?;
                self.end += n;
                self.bytes_read += n as u64;
                Ok(n)
            }
            _ = sleep(time) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout"))
            },
        }
    }

    /// Waits for the next request line, skipping empty lines before it.
    ///
    /// `Ok(None)` when the peer closes (or goes quiet) between requests.
    pub(crate) async fn read_request_line<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        limits: &ReqLimits,
        time: Duration,
    ) -> Result<Option<RequestLine>, ErrorKind> {
        let max_len = limits.first_line();

        loop {
            while self.available().starts_with(b"\r\n") {
                self.consume(2);
            }

            let available = self.available();
            if let Some(i) = memchr(b'\n', available) {
                if i + 1 > max_len {
                    return Err(ErrorKind::UriTooLong);
                }
                if i == 0 || available[i - 1] != b'\r' {
                    return Err(ErrorKind::InvalidVersion);
                }

                let line = parse_request_line(&available[..i - 1])?;
                self.consume(i + 1);
                return Ok(Some(line));
            }
            if available.len() >= max_len {
                return Err(ErrorKind::UriTooLong);
            }

            match self.fill_buffer(stream, time).await {
                Ok(0) if self.available().is_empty() => return Ok(None),
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::TimedOut && self.available().is_empty() => {
                    return Ok(None)
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Reads the header block up to and including the empty line.
    pub(crate) async fn read_headers<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        limits: &ReqLimits,
        time: Duration,
    ) -> Result<HeaderMap, ErrorKind> {
        loop {
            let available = self.available();
            if available.starts_with(b"\r\n") {
                self.consume(2);
                return Ok(HeaderMap::default());
            }

            if let Some(i) = memmem::find(available, b"\r\n\r\n") {
                if i + 4 > limits.header_block_size {
                    return Err(ErrorKind::HeadersTooLarge);
                }

                let headers = parse_headers(&available[..i], limits)?;
                self.consume(i + 4);
                return Ok(headers);
            }
            if available.len() >= limits.header_block_size {
                return Err(ErrorKind::HeadersTooLarge);
            }

            if self.fill_buffer(stream, time).await? == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
    }
}
