//! Forgiving HTTP/1.1 request-line and header parser.
//!
//! The cache key is the raw request bytes, not a normalized structure, so
//! this parser's only job is to pull out what the handler needs to dispatch
//! the request (method, host, port, path, version, headers) — it does not
//! aim for RFC 7230 compliance. `memchr` does the `\r\n\r\n` terminator scan
//! on the read side (see `server::handler`); this module works on a buffer
//! that already contains a complete header block.

use memchr::memmem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub host: String,
    pub port: Option<String>,
    pub path: String,
    pub version: String,
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("missing request line")]
    MissingRequestLine,
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("request line or header was not valid UTF-8")]
    InvalidEncoding,
}

/// Parse a complete header block (request line plus headers, terminated by
/// `\r\n\r\n`, though the terminator itself need not be present in `buf`).
pub fn parse_request(buf: &[u8]) -> Result<ParsedRequest, ParseError> {
    let text = std::str::from_utf8(buf).map_err(|_| ParseError::InvalidEncoding)?;

    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or(ParseError::MissingRequestLine)?;
    if request_line.is_empty() {
        return Err(ParseError::MissingRequestLine);
    }

    let mut parts = request_line.split(' ').filter(|s| !s.is_empty());
    let method = parts.next().ok_or(ParseError::MalformedRequestLine)?;
    let target = parts.next().ok_or(ParseError::MalformedRequestLine)?;
    let version = parts.next().ok_or(ParseError::MalformedRequestLine)?;

    let headers: Vec<Header> = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some(Header {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect();

    let (host_from_target, port_from_target, path) = split_target(target, &headers);

    Ok(ParsedRequest {
        method: method.to_string(),
        host: host_from_target,
        port: port_from_target,
        path,
        version: version.to_string(),
        headers,
    })
}

/// Pull host/port/path out of the request target. Absolute-form targets
/// (`http://host:port/path`) carry their own authority; origin-form targets
/// (`/path`) fall back to the `Host` header.
fn split_target(target: &str, headers: &[Header]) -> (String, Option<String>, String) {
    if let Some(rest) = target.strip_prefix("http://") {
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, "/".to_string()),
        };
        let (host, port) = split_authority(authority);
        return (host, port, path);
    }

    let host_header = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .map(|h| h.value.clone())
        .unwrap_or_default();
    let (host, port) = split_authority(&host_header);
    let path = if target.is_empty() {
        "/".to_string()
    } else {
        target.to_string()
    };
    (host, port, path)
}

fn split_authority(authority: &str) -> (String, Option<String>) {
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            (host.to_string(), Some(port.to_string()))
        }
        _ => (authority.to_string(), None),
    }
}

/// Reserialize headers for forwarding upstream, in original order.
pub fn unparse_headers(headers: &[Header]) -> Vec<u8> {
    let mut out = Vec::new();
    for header in headers {
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Locate the `\r\n\r\n` header terminator in an accumulating read buffer.
/// Returns the byte offset immediately past the terminator.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    memmem::find(buf, b"\r\n\r\n").map(|idx| idx + 4)
}
