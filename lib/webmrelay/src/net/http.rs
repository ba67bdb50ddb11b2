//! Line-oriented HTTP request tokenization and query-string handling.
//! Deliberately small: the relay only ever needs the request line, the
//! header terminator, and the query parameters of the publisher URL.

/// Length of the first complete line in `buf`, including its `\n`.
/// Only `\n` terminates a line; a stray `\r` stays part of it.
pub fn first_line_length(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&byte| byte == b'\n').map(|at| at + 1)
}

/// True for the header-terminating line: nothing but CR/LF.
pub fn is_blank_line(line: &[u8]) -> bool {
    line.iter().all(|&byte| byte == b'\r' || byte == b'\n')
}

/// Splits `METHOD RESOURCE VERSION` out of the request line. All three
/// tokens must be present; anything else is a malformed request.
pub fn parse_request_line(line: &str) -> Option<(String, String)> {
    let mut tokens = line.split_whitespace();

    let method = tokens.next()?;
    let resource = tokens.next()?;
    let _version = tokens.next()?;

    Some((method.to_string(), resource.to_string()))
}

/// Parses a `Name: value` header line. Lines that don't fit the shape
/// (no colon, spaces inside the name, empty value) yield `None` and are
/// skipped by the caller.
pub fn parse_header_line(line: &str) -> Option<(String, String)> {
    let (name, value) = split_once(line, ':')?;

    let name = name.trim();
    let value = value.trim();
    if name.is_empty() || name.contains(' ') || name.contains('\t') || value.is_empty() {
        return None;
    }

    Some((name.to_string(), value.to_string()))
}

/// Splits a request resource into the routing path and the raw query
/// string (without the `?`).
pub fn split_resource(resource: &str) -> (&str, &str) {
    match resource.find('?') {
        Some(at) => (&resource[..at], &resource[at + 1..]),
        None => (resource, ""),
    }
}

/// Parses `name[=value]` pairs out of a raw query string. Names and
/// values are percent-decoded; `+` is not treated as a space.
pub fn parse_query(query: &str) -> Vec<(String, Option<String>)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match split_once(pair, '=') {
            Some((name, value)) => (urldecode(name), Some(urldecode(value))),
            None => (urldecode(pair), None),
        })
        .collect()
}

/// Percent-decoding only: `%xx` with two hex digits becomes one byte,
/// everything else passes through untouched.
pub fn urldecode(src: &str) -> String {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());

    let mut at = 0;
    while at < bytes.len() {
        let decoded = if bytes[at] == b'%' && at + 2 < bytes.len() {
            let high = (bytes[at + 1] as char).to_digit(16);
            let low = (bytes[at + 2] as char).to_digit(16);
            match (high, low) {
                (Some(high), Some(low)) => Some((high * 16 + low) as u8),
                _ => None,
            }
        } else {
            None
        };

        match decoded {
            Some(byte) => {
                out.push(byte);
                at += 3;
            }
            None => {
                out.push(bytes[at]);
                at += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn split_once(text: &str, separator: char) -> Option<(&str, &str)> {
    let at = text.find(separator)?;
    Some((&text[..at], &text[at + separator.len_utf8()..]))
}
