//! Bounded HTTP/1.1 request parsing.
//!
//! Only ASCII header names, an eagerly-buffered body and `Content-Length`
//! framing are supported; chunked encoding is rejected. The parsed request
//! carries transport facts (remote tag, peer certificate chain, unix
//! credentials) so authentication never needs the socket again.

use httparse::Status;
use std::io::{self, Read};
use thiserror::Error;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("connection closed while reading headers")]
    ConnectionClosedBeforeHeaders,
    #[error("HTTP headers exceed limit")]
    HeadersTooLarge,
    #[error("partial HTTP request received")]
    PartialRequest,
    #[error("HTTP request parse error: {0:?}")]
    RequestParse(httparse::Error),
    #[error("HTTP method missing")]
    MissingMethod,
    #[error("HTTP path missing")]
    MissingPath,
    #[error("invalid header value for {name}")]
    InvalidHeaderValue { name: String },
    #[error("invalid Content-Length header value")]
    InvalidContentLength,
    #[error("chunked transfer encoding unsupported")]
    ChunkedEncodingUnsupported,
    #[error("HTTP body exceeds limit")]
    BodyTooLarge,
    #[error("connection closed before HTTP body completed")]
    ConnectionClosedBeforeBody,
    #[error("HTTP request timed out")]
    RequestTimeout,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Where a request came from. The unix variants use the abstract tags the
/// authenticator matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAddr {
    Tcp(std::net::SocketAddr),
    /// Local unix socket; tag `@`. Credentials resolved from the connection.
    Unix {
        uid: u32,
        gid: u32,
        pid: i32,
    },
    /// Guest API unix socket; tag `@guestapi`.
    Guest,
}

impl RemoteAddr {
    pub fn tag(&self) -> String {
        match self {
            RemoteAddr::Tcp(addr) => addr.to_string(),
            RemoteAddr::Unix { .. } => "@".to_string(),
            RemoteAddr::Guest => "@guestapi".to_string(),
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, RemoteAddr::Unix { .. })
    }
}

/// A fully-buffered request plus its transport facts.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub remote: RemoteAddr,
    /// DER-encoded peer certificate chain, empty when no TLS or no client cert.
    pub peer_certs: Vec<Vec<u8>>,
    /// Whether the transport was TLS at all.
    pub tls: bool,
    /// Set by the listener when a CA bundle is installed and the peer chain
    /// verified against it during the handshake.
    pub ca_verified: bool,
}

impl RequestInfo {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_json(&self) -> bool {
        self.header("content-type")
            .map(|value| value.starts_with("application/json"))
            .unwrap_or(false)
    }

    pub fn path_segments(&self) -> Vec<&str> {
        self.path
            .trim_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect()
    }
}

/// Parses one blocking HTTP/1.1 request from `stream`, attaching the given
/// transport facts.
pub fn read_request(
    stream: &mut impl Read,
    remote: RemoteAddr,
    peer_certs: Vec<Vec<u8>>,
    tls: bool,
    ca_verified: bool,
) -> Result<RequestInfo, HttpError> {
    let mut buffer = Vec::new();
    let mut header_end = None;
    let mut temp = [0u8; 1024];
    while header_end.is_none() {
        let read = match stream.read(&mut temp) {
            Ok(0) => return Err(HttpError::ConnectionClosedBeforeHeaders),
            Ok(read) => read,
            Err(err) => return Err(map_read_error(err)),
        };
        buffer.extend_from_slice(&temp[..read]);
        if buffer.len() > MAX_HEADER_BYTES {
            return Err(HttpError::HeadersTooLarge);
        }
        if let Some(pos) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
            header_end = Some(pos + 4);
        }
    }
    let header_len = header_end.unwrap_or(buffer.len());

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(&buffer) {
        Ok(Status::Complete(_)) => {}
        Ok(Status::Partial) => return Err(HttpError::PartialRequest),
        Err(err) => return Err(HttpError::RequestParse(err)),
    }
    let method = request.method.ok_or(HttpError::MissingMethod)?.to_string();
    let raw_path = request.path.ok_or(HttpError::MissingPath)?;
    let (path, query) = match raw_path.find('?') {
        Some(idx) => (&raw_path[..idx], Some(raw_path[idx + 1..].to_string())),
        None => (raw_path, None),
    };

    let mut header_pairs = Vec::with_capacity(request.headers.len());
    for header in request.headers.iter() {
        let value =
            String::from_utf8(header.value.to_vec()).map_err(|_| HttpError::InvalidHeaderValue {
                name: header.name.to_string(),
            })?;
        header_pairs.push((header.name.to_string(), value));
    }

    let mut content_length = 0usize;
    for (name, value) in &header_pairs {
        if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            return Err(HttpError::ChunkedEncodingUnsupported);
        }
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .trim()
                .parse()
                .map_err(|_| HttpError::InvalidContentLength)?;
        }
    }
    if content_length > MAX_BODY_BYTES {
        return Err(HttpError::BodyTooLarge);
    }

    let mut body = Vec::with_capacity(content_length);
    let already = buffer.len() - header_len;
    if already > 0 {
        let copy = already.min(content_length);
        body.extend_from_slice(&buffer[header_len..header_len + copy]);
    }
    while body.len() < content_length {
        let read = match stream.read(&mut temp) {
            Ok(0) => return Err(HttpError::ConnectionClosedBeforeBody),
            Ok(read) => read,
            Err(err) => return Err(map_read_error(err)),
        };
        let remaining = content_length - body.len();
        body.extend_from_slice(&temp[..read.min(remaining)]);
    }

    Ok(RequestInfo {
        method,
        path: path.to_string(),
        query,
        headers: header_pairs,
        body,
        remote,
        peer_certs,
        tls,
        ca_verified,
    })
}

fn map_read_error(err: io::Error) -> HttpError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => HttpError::RequestTimeout,
        _ => HttpError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(raw: &str) -> Result<RequestInfo, HttpError> {
        let mut stream = Cursor::new(raw.as_bytes().to_vec());
        read_request(
            &mut stream,
            RemoteAddr::Unix {
                uid: 0,
                gid: 0,
                pid: 1,
            },
            Vec::new(),
            false,
            false,
        )
    }

    #[test]
    fn parses_request_line_headers_and_body() {
        let request = parse(
            "POST /1.0/instances?project=web HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\nContent-Length: 7\r\n\r\n{\"a\":1}",
        )
        .unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/1.0/instances");
        assert_eq!(request.query.as_deref(), Some("project=web"));
        assert_eq!(request.body, b"{\"a\":1}");
        assert!(request.is_json());
        assert_eq!(request.path_segments(), vec!["1.0", "instances"]);
    }

    #[test]
    fn rejects_chunked_encoding() {
        let err = parse(
            "POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap_err();
        assert!(matches!(err, HttpError::ChunkedEncodingUnsupported));
    }

    #[test]
    fn rejects_oversized_declared_body() {
        let err = parse(
            "POST / HTTP/1.1\r\nContent-Length: 999999999\r\n\r\n",
        )
        .unwrap_err();
        assert!(matches!(err, HttpError::BodyTooLarge));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let request =
            parse("GET / HTTP/1.1\r\nX-Burrow-Authenticated: yes\r\n\r\n").unwrap();
        assert_eq!(request.header("x-burrow-authenticated"), Some("yes"));
    }
}
