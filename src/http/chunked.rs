//! Incremental decoder for the `chunked` transfer-coding.
//!
//! ```text
//! 5;ext=1\r\n
//! hello\r\n
//! 0\r\n
//! Trailer: x\r\n
//! \r\n
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum ChunkedError {
    #[error("invalid chunk size")]
    InvalidSize,
    #[error("chunk size overflow")]
    SizeOverflow,
    #[error("missing CRLF after chunk")]
    MissingCrlf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size { value: usize, digits: usize },
    Extension { value: usize },
    SizeLf { value: usize },
    Data { remaining: usize },
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    TrailerLf,
    FinalLf,
    Done,
}

/// Accepts the body in arbitrary pieces and writes the payload to `out`.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: State,
}

impl ChunkedDecoder {
    pub(crate) const fn new() -> Self {
        Self {
            state: State::Size {
                value: 0,
                digits: 0,
            },
        }
    }

    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Decodes as much of `input` as possible, appending payload bytes to `out`.
    ///
    /// Returns the number of bytes consumed. Stops right after the final
    /// empty line, so bytes of a pipelined request are left untouched.
    pub(crate) fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ChunkedError> {
        let mut pos = 0;

        while pos < input.len() {
            let byte = input[pos];
            self.state = match (self.state, byte) {
                (State::Done, _) => return Ok(pos),

                (State::Size { value, digits }, b) if b.is_ascii_hexdigit() => {
                    let digit = (b as char).to_digit(16).unwrap_or_default() as usize;
                    let value = value
                        .checked_mul(16)
                        .and_then(|v| v.checked_add(digit))
                        .ok_or(ChunkedError::SizeOverflow)?;
                    State::Size {
                        value,
                        digits: digits + 1,
                    }
                }
                (State::Size { digits: 0, .. }, _) => return Err(ChunkedError::InvalidSize),
                (State::Size { value, .. }, b';' | b' ' | b'\t') => State::Extension { value },
                (State::Size { value, .. }, b'\r') => State::SizeLf { value },
                (State::Size { .. }, _) => return Err(ChunkedError::InvalidSize),

                (State::Extension { value }, b'\r') => State::SizeLf { value },
                (State::Extension { .. }, b'\n') => return Err(ChunkedError::MissingCrlf),
                (State::Extension { value }, _) => State::Extension { value },

                (State::SizeLf { value: 0 }, b'\n') => State::TrailerStart,
                (State::SizeLf { value }, b'\n') => State::Data { remaining: value },
                (State::SizeLf { .. }, _) => return Err(ChunkedError::MissingCrlf),

                (State::Data { remaining }, _) => {
                    let take = remaining.min(input.len() - pos);
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;

                    self.state = match remaining - take {
                        0 => State::DataCr,
                        remaining => State::Data { remaining },
                    };
                    continue;
                }

                (State::DataCr, b'\r') => State::DataLf,
                (State::DataLf, b'\n') => State::Size {
                    value: 0,
                    digits: 0,
                },
                (State::DataCr | State::DataLf, _) => return Err(ChunkedError::MissingCrlf),

                (State::TrailerStart, b'\r') => State::FinalLf,
                (State::TrailerStart | State::TrailerLine, b'\n') => {
                    return Err(ChunkedError::MissingCrlf)
                }
                (State::TrailerLine, b'\r') => State::TrailerLf,
                (State::TrailerStart | State::TrailerLine, _) => State::TrailerLine,

                (State::TrailerLf, b'\n') => State::TrailerStart,
                (State::FinalLf, b'\n') => State::Done,
                (State::TrailerLf | State::FinalLf, _) => return Err(ChunkedError::MissingCrlf),
            };
            pos += 1;
        }

        Ok(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Result<(Vec<u8>, usize, bool), ChunkedError> {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let used = decoder.decode(input, &mut out)?;
        Ok((out, used, decoder.is_done()))
    }

    #[test]
    fn simple() {
        let input = b"5\r\nhello\r\n0\r\n\r\n";
        let (out, used, done) = decode_all(input).unwrap();

        assert_eq!(out, b"hello");
        assert_eq!(used, input.len());
        assert!(done);
    }

    #[test]
    fn any_split_gives_same_result() {
        let input = b"4;name=val\r\nWiki\r\n9\r\npedia in \r\n0\r\nExpires: never\r\n\r\n";

        for split in 0..=input.len() {
            let mut decoder = ChunkedDecoder::new();
            let mut out = Vec::new();

            let used = decoder.decode(&input[..split], &mut out).unwrap();
            assert_eq!(used, split);
            let used = decoder.decode(&input[split..], &mut out).unwrap();
            assert_eq!(used, input.len() - split);

            assert_eq!(out, b"Wikipedia in ", "split at {split}");
            assert!(decoder.is_done());
        }
    }

    #[test]
    fn stops_at_end_of_body() {
        let input = b"3\r\nabc\r\n0\r\n\r\nGET / HTTP/1.1\r\n";
        let (out, used, done) = decode_all(input).unwrap();

        assert_eq!(out, b"abc");
        assert_eq!(&input[used..], b"GET / HTTP/1.1\r\n");
        assert!(done);
    }

    #[test]
    fn incomplete_is_not_done() {
        let (out, used, done) = decode_all(b"5\r\nhel").unwrap();
        assert_eq!(out, b"hel");
        assert_eq!(used, 6);
        assert!(!done);
    }

    #[test]
    fn errors() {
        #[rustfmt::skip]
        let cases: [(&[u8], ChunkedError); 7] = [
            (b"zz\r\n",                          ChunkedError::InvalidSize),
            (b"\r\n",                            ChunkedError::InvalidSize),
            (b"5x\r\n",                          ChunkedError::InvalidSize),
            (b"fffffffffffffffffffff\r\n",       ChunkedError::SizeOverflow),
            (b"3\r\nabcX",                       ChunkedError::MissingCrlf),
            (b"3\rX",                            ChunkedError::MissingCrlf),
            (b"0\r\n\r\r",                       ChunkedError::MissingCrlf),
        ];

        for (input, expected) in cases {
            assert_eq!(decode_all(input).map(|_| ()), Err(expected), "{input:?}");
        }
    }
}
