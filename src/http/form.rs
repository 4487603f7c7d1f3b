//! `application/x-www-form-urlencoded` decoding and encoding.
//!
//! Used for query strings and for request bodies matched with
//! [`BodyKind::UrlEncodedForm`](crate::BodyKind::UrlEncodedForm).
//!
//! # Examples
//! ```rust
//! use kiln_web::form;
//! use std::collections::HashMap;
//!
//! // Decode into HashMap (last occurrence wins)
//! let params = form::decode(b"name=John+Doe&city=K%C3%B6ln&name=Jane");
//! assert_eq!(params["name"], "Jane");
//! assert_eq!(params["city"], "Köln");
//!
//! // Decode into Vec (preserves order and duplicates)
//! let pairs: Vec<(String, String)> = form::parse(b"flag&empty=&=val");
//! assert_eq!(pairs.len(), 3);
//!
//! // Encode back
//! let mut map = HashMap::new();
//! map.insert("q", "a b");
//! assert_eq!(form::encode(map), "q=a%20b");
//! ```

use memchr::memchr;
use std::{borrow::Cow, collections::HashMap};

/// Decodes a form body or query string, last occurrence of a key wins.
#[inline]
pub fn decode(input: &[u8]) -> HashMap<String, String> {
    parse(input)
}

/// Decodes into any [`FormCollector`].
///
/// A leading `?` is ignored, so `?a=1` and `a=1` are equivalent. Empty pairs
/// (`a=1&&b=2`) are skipped and a pair without `=` is a key with an empty
/// value. A pair with a malformed `%` escape, or one decoding to invalid
/// UTF-8, is dropped; the rest of the input still decodes.
#[inline]
pub fn parse<C: FormCollector>(input: &[u8]) -> C {
    let mut result = C::default();
    parse_into(&mut result, input);
    result
}

/// Decodes into an existing collection, appending to it.
pub fn parse_into<C: FormCollector>(result: &mut C, input: &[u8]) {
    let data = match input.first() {
        Some(b'?') => &input[1..],
        _ => input,
    };

    let mut start = 0;
    while start < data.len() {
        // Find next '&' or end of string
        let end = memchr(b'&', &data[start..])
            .map(|pos| start + pos)
            .unwrap_or(data.len());

        let pair = &data[start..end];
        start = end + 1;

        if pair.is_empty() {
            continue;
        }

        let (key, value) = match memchr(b'=', pair) {
            Some(pos) => (&pair[..pos], &pair[pos + 1..]),
            None => (pair, &b""[..]),
        };

        if let (Some(key), Some(value)) = (decode_component(key), decode_component(value)) {
            result.add_param(key, value);
        }
    }
}

/// Decodes one form component: `+` becomes a space, then `%XX` escapes are
/// resolved. `None` for a malformed escape or invalid UTF-8.
pub fn decode_component(raw: &[u8]) -> Option<String> {
    match memchr(b'+', raw) {
        Some(_) => {
            let spaced: Vec<u8> = raw
                .iter()
                .map(|&b| if b == b'+' { b' ' } else { b })
                .collect();
            percent_decode(&spaced)
        }
        None => percent_decode(raw),
    }
}

/// Resolves `%XX` escapes, leaving `+` alone (path decoding).
pub(crate) fn percent_decode(raw: &[u8]) -> Option<String> {
    if !escapes_are_valid(raw) {
        return None;
    }

    match urlencoding::decode_binary(raw) {
        Cow::Borrowed(bytes) => std::str::from_utf8(bytes).ok().map(str::to_string),
        Cow::Owned(bytes) => String::from_utf8(bytes).ok(),
    }
}

// `urlencoding` passes malformed escapes through unchanged
fn escapes_are_valid(raw: &[u8]) -> bool {
    let mut rest = raw;
    while let Some(pos) = memchr(b'%', rest) {
        match rest.get(pos + 1..pos + 3) {
            Some([a, b]) if a.is_ascii_hexdigit() && b.is_ascii_hexdigit() => {
                rest = &rest[pos + 3..];
            }
            _ => return false,
        }
    }
    true
}

/// Encodes pairs as `key=value&...`, percent-encoding both sides.
pub fn encode<I, K, V>(pairs: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut out = String::new();

    for (key, value) in pairs {
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(&urlencoding::encode(key.as_ref()));
        out.push('=');
        out.push_str(&urlencoding::encode(value.as_ref()));
    }

    out
}

/// Storage for decoded form pairs.
///
/// # Examples
/// ```rust
/// use kiln_web::form::{self, FormCollector};
///
/// #[derive(Default)]
/// struct Keys(Vec<String>);
///
/// impl FormCollector for Keys {
///     fn add_param(&mut self, key: String, _value: String) {
///         self.0.push(key);
///     }
/// }
///
/// let keys: Keys = form::parse(b"a=1&b=2");
/// assert_eq!(keys.0, ["a", "b"]);
/// ```
pub trait FormCollector: Default {
    /// Adds a decoded pair to the collection.
    fn add_param(&mut self, key: String, value: String);
}

// Implementation for Vec - preserves parameter order
impl FormCollector for Vec<(String, String)> {
    #[inline(always)]
    fn add_param(&mut self, key: String, value: String) {
        self.push((key, value));
    }
}

// Implementation for HashMap - deduplicates parameters (last wins)
impl FormCollector for HashMap<String, String> {
    #[inline(always)]
    fn add_param(&mut self, key: String, value: String) {
        self.insert(key, value);
    }
}
