//! `multipart/form-data` decoding.
//!
//! # Format
//!
//! ```text
//! --boundary\r\n
//! Content-Disposition: form-data; name="field1"\r\n
//! \r\n
//! value1\r\n
//! --boundary\r\n
//! Content-Disposition: form-data; name="file"; filename="example.txt"\r\n
//! Content-Type: text/plain\r\n
//! \r\n
//! file contents...\r\n
//! --boundary--\r\n
//! ```
//!
//! Parts without a `filename` become [`MultipartArgument`]s. Parts with one
//! are written to a temporary file and become [`MultipartFile`]s; the file is
//! removed when the value is dropped.

use crate::http::types::{header_params, media_type, HeaderMap};
use memchr::{memchr, memmem};
use std::{
    collections::HashMap,
    io::{self, Write},
    path::Path,
};
use tempfile::TempPath;

/// Mime type assumed for parts without `Content-Type`.
pub const DEFAULT_MIME_TYPE: &str = "text/plain";

/// Errors that can occur while decoding a multipart body.
#[derive(Debug, thiserror::Error)]
pub enum MultipartError {
    /// `Content-Type` has no usable `boundary` parameter.
    #[error("missing boundary parameter")]
    MissingBoundary,
    /// The body ended before the closing `--boundary--`.
    #[error("missing terminal boundary")]
    MissingTerminalBoundary,
    /// A delimiter line is followed by something other than padding and a line break.
    #[error("malformed delimiter line")]
    InvalidDelimiter,
    /// A part header is not valid UTF-8 or has no `:`.
    #[error("malformed part headers")]
    InvalidPartHeaders,
    /// A part has no `Content-Disposition` header with a `name`.
    #[error("part without a name")]
    MissingName,
    /// The temporary file for a file part could not be written.
    #[error("temporary file: {0}")]
    Io(#[from] io::Error),
}

/// A non-file part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartArgument {
    content_type: String,
    mime_type: String,
    data: Vec<u8>,
    string: Option<String>,
}

impl MultipartArgument {
    /// `Content-Type` of the part as sent, or [`DEFAULT_MIME_TYPE`].
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Lowercased content type without parameters.
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The value as text, present for `text/*` parts that are valid UTF-8.
    pub fn string(&self) -> Option<&str> {
        self.string.as_deref()
    }
}

/// A file part, stored in a temporary file.
#[derive(Debug)]
pub struct MultipartFile {
    content_type: String,
    mime_type: String,
    file_name: String,
    temp: TempPath,
}

impl MultipartFile {
    /// `filename` from `Content-Disposition` as sent by the client.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Where the uploaded bytes live until this value is dropped.
    pub fn temporary_path(&self) -> &Path {
        &self.temp
    }
}

/// Decoded parts, keyed by their `name`. A repeated name keeps the last part.
#[derive(Debug, Default)]
pub struct MultipartForm {
    pub(crate) arguments: HashMap<String, MultipartArgument>,
    pub(crate) files: HashMap<String, MultipartFile>,
}

impl MultipartForm {
    pub fn arguments(&self) -> &HashMap<String, MultipartArgument> {
        &self.arguments
    }

    pub fn files(&self) -> &HashMap<String, MultipartFile> {
        &self.files
    }

    fn add_part(&mut self, headers: &HeaderMap, data: &[u8]) -> Result<(), MultipartError> {
        let disposition = headers
            .get("content-disposition")
            .ok_or(MultipartError::MissingName)?;
        let params = header_params(disposition);
        let param = |key: &str| params.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());

        let name = param("name").ok_or(MultipartError::MissingName)?;
        let content_type = headers
            .get("content-type")
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string();
        let mime_type = media_type(&content_type);

        match param("filename") {
            Some(file_name) => {
                let mut file = tempfile::Builder::new()
                    .prefix("kiln-upload-")
                    .tempfile()?;
                file.write_all(data)?;
                file.flush()?;

                let file = MultipartFile {
                    content_type,
                    mime_type,
                    file_name,
                    temp: file.into_temp_path(),
                };
                self.files.insert(name, file);
            }
            None => {
                let string = match mime_type.starts_with("text/") {
                    true => std::str::from_utf8(data).ok().map(str::to_string),
                    false => None,
                };

                let argument = MultipartArgument {
                    content_type,
                    mime_type,
                    data: data.to_vec(),
                    string,
                };
                self.arguments.insert(name, argument);
            }
        }

        Ok(())
    }
}

/// Extracts the `boundary` parameter (quoted or bare) from a `Content-Type` value.
///
/// ```rust
/// use kiln_web::multipart;
///
/// let ct = "multipart/form-data; boundary=\"----WebKitFormBoundary7MA4\"";
/// assert_eq!(multipart::boundary(ct).unwrap(), "----WebKitFormBoundary7MA4");
/// ```
pub fn boundary(content_type: &str) -> Result<String, MultipartError> {
    header_params(content_type)
        .into_iter()
        .find(|(k, v)| k == "boundary" && !v.is_empty())
        .map(|(_, v)| v)
        .ok_or(MultipartError::MissingBoundary)
}

/// Decodes a whole `multipart/form-data` body.
///
/// The preamble before the first delimiter and the epilogue after the
/// terminal one are ignored. Transport padding after a delimiter and bare
/// `LF` line endings are accepted.
pub fn decode(body: &[u8], boundary: &str) -> Result<MultipartForm, MultipartError> {
    if boundary.is_empty() {
        return Err(MultipartError::MissingBoundary);
    }

    let delimiter = format!("--{boundary}");
    let finder = memmem::Finder::new(delimiter.as_bytes());
    let mut form = MultipartForm::default();

    let (_, mut pos) =
        find_delimiter(&finder, body, 0).ok_or(MultipartError::MissingTerminalBoundary)?;

    loop {
        let after = pos + delimiter.len();
        if body[after..].starts_with(b"--") {
            return Ok(form);
        }

        let start = skip_line_end(body, after).ok_or(MultipartError::InvalidDelimiter)?;
        let (headers, content_start) = parse_part_headers(body, start)?;

        let (content_end, next) = find_delimiter(&finder, body, content_start)
            .ok_or(MultipartError::MissingTerminalBoundary)?;
        form.add_part(&headers, &body[content_start..content_end])?;

        pos = next;
    }
}

// Finds the next delimiter at the start of a line. Returns where the
// preceding content ends (the line break belongs to the delimiter) and
// where the delimiter starts.
fn find_delimiter(finder: &memmem::Finder, body: &[u8], from: usize) -> Option<(usize, usize)> {
    let len = finder.needle().len();

    finder
        .find_iter(&body[from..])
        .map(|i| from + i)
        .find(|&p| {
            let line_start = p == 0 || body[p - 1] == b'\n';
            let followed_ok = match body.get(p + len..) {
                Some([b'-', b'-', ..]) => true,
                Some([b' ' | b'\t' | b'\r' | b'\n', ..]) => true,
                _ => false,
            };
            line_start && followed_ok
        })
        .map(|p| {
            let end = if p >= from + 2 && &body[p - 2..p] == b"\r\n" {
                p - 2
            } else if p > from && body[p - 1] == b'\n' {
                p - 1
            } else {
                p
            };
            (end, p)
        })
}

// Skips transport padding and the line break after a delimiter.
fn skip_line_end(body: &[u8], mut pos: usize) -> Option<usize> {
    while matches!(body.get(pos), Some(b' ' | b'\t')) {
        pos += 1;
    }

    match body.get(pos..)? {
        [b'\r', b'\n', ..] => Some(pos + 2),
        [b'\n', ..] => Some(pos + 1),
        _ => None,
    }
}

// Reads header lines up to the empty line; returns the headers and the
// offset of the part content.
fn parse_part_headers(body: &[u8], mut pos: usize) -> Result<(HeaderMap, usize), MultipartError> {
    let mut headers = HeaderMap::default();

    loop {
        let line_end = memchr(b'\n', &body[pos..])
            .map(|i| pos + i)
            .ok_or(MultipartError::MissingTerminalBoundary)?;

        let line = &body[pos..line_end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        pos = line_end + 1;

        if line.is_empty() {
            return Ok((headers, pos));
        }

        let line = std::str::from_utf8(line).map_err(|_| MultipartError::InvalidPartHeaders)?;
        let (name, value) = line
            .split_once(':')
            .ok_or(MultipartError::InvalidPartHeaders)?;
        headers.insert(name.trim(), value.trim());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"preamble is ignored\r\n\
        --XyZ\r\n\
        Content-Disposition: form-data; name=\"field\"\r\n\
        \r\n\
        value\r\n\
        --XyZ\r\n\
        Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        hello\r\n\
        --XyZ--\r\n\
        epilogue too";

    #[test]
    fn fields_and_files() {
        let form = decode(BODY, "XyZ").unwrap();

        assert_eq!(form.arguments().len(), 1);
        let field = &form.arguments()["field"];
        assert_eq!(field.data(), b"value");
        assert_eq!(field.string(), Some("value"));
        assert_eq!(field.mime_type(), DEFAULT_MIME_TYPE);

        assert_eq!(form.files().len(), 1);
        let file = &form.files()["upload"];
        assert_eq!(file.file_name(), "a.txt");
        assert!(!file.temporary_path().as_os_str().is_empty());
        assert_eq!(std::fs::read(file.temporary_path()).unwrap(), b"hello");
    }

    #[test]
    fn temp_file_removed_on_drop() {
        let form = decode(BODY, "XyZ").unwrap();
        let path = form.files()["upload"].temporary_path().to_path_buf();
        assert!(path.exists());

        drop(form);
        assert!(!path.exists());
    }

    #[test]
    fn bare_lf_padding_and_empty_parts() {
        let body = b"--b  \t\n\
            Content-Disposition: form-data; name=\"empty\"\n\
            \n\
            \n\
            --b\n\
            Content-Disposition: form-data; name=\"bin\"\n\
            Content-Type: Application/Octet-Stream\n\
            \n\
            \xff\xfe\n\
            --b\n\
            Content-Disposition: form-data; name=\"nofile\"; filename=\"\"\n\
            \n\
            \n\
            --b--";

        let form = decode(body, "b").unwrap();

        assert_eq!(form.arguments()["empty"].data(), b"");
        assert_eq!(form.arguments()["empty"].string(), Some(""));

        let bin = &form.arguments()["bin"];
        assert_eq!(bin.data(), b"\xff\xfe");
        assert_eq!(bin.mime_type(), "application/octet-stream");
        assert_eq!(bin.string(), None);

        let file = &form.files()["nofile"];
        assert_eq!(file.file_name(), "");
        assert_eq!(std::fs::read(file.temporary_path()).unwrap(), b"");
    }

    #[test]
    fn last_part_wins() {
        let body = b"--b\r\n\
            Content-Disposition: form-data; name=\"x\"\r\n\r\n\
            1\r\n\
            --b\r\n\
            Content-Disposition: form-data; name=\"x\"\r\n\r\n\
            2\r\n\
            --b--\r\n";

        let form = decode(body, "b").unwrap();
        assert_eq!(form.arguments()["x"].string(), Some("2"));
    }

    #[test]
    fn boundary_text_inside_content() {
        // `--bb` inside the value is not a delimiter for boundary `b`
        let body = b"--b\r\n\
            Content-Disposition: form-data; name=\"x\"\r\n\r\n\
            a\r\n--bb\r\n\
            --b--\r\n";

        let form = decode(body, "b").unwrap();
        assert_eq!(form.arguments()["x"].data(), b"a\r\n--bb");
    }

    #[test]
    fn errors() {
        let missing_terminal = b"--b\r\nContent-Disposition: form-data; name=\"x\"\r\n\r\nvalue";
        assert!(matches!(
            decode(missing_terminal, "b"),
            Err(MultipartError::MissingTerminalBoundary)
        ));

        let no_name = b"--b\r\nContent-Type: text/plain\r\n\r\nvalue\r\n--b--";
        assert!(matches!(decode(no_name, "b"), Err(MultipartError::MissingName)));

        let bad_delimiter = b"--b junk\r\n\r\nvalue\r\n--b--";
        assert!(matches!(
            decode(bad_delimiter, "b"),
            Err(MultipartError::InvalidDelimiter)
        ));

        assert!(matches!(decode(b"no delimiters", "b"), Err(MultipartError::MissingTerminalBoundary)));
        assert!(matches!(decode(BODY, ""), Err(MultipartError::MissingBoundary)));
    }

    #[test]
    fn boundary_param() {
        #[rustfmt::skip]
        let cases = [
            ("multipart/form-data; boundary=abc",       Some("abc")),
            ("multipart/form-data; boundary=\"a b\"",   Some("a b")),
            ("multipart/form-data; charset=utf-8",      None),
            ("multipart/form-data; boundary=",          None),
        ];

        for (ct, expected) in cases {
            assert_eq!(boundary(ct).ok().as_deref(), expected, "{ct}");
        }
    }
}
