//! Minimal HTTPS client for intra-cluster requests (heartbeats, upgrade
//! notifications, cluster accept).

use super::{tls, NetError};
use crate::security::certs::CertInfo;
use crate::timeouts::CLUSTER_DIAL_TIMEOUT;
use httparse::Status;
use rustls::{ClientConnection, ServerName, Stream};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;

/// One request to another cluster member.
pub struct ClusterRequest<'a> {
    pub address: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub body: Option<serde_json::Value>,
    /// Client identity presented to the peer (the effective server cert).
    pub client_cert: Option<Arc<CertInfo>>,
    /// Expected peer certificate; None accepts anything (first contact).
    pub expected_fingerprint: Option<String>,
}

/// Sends the request, discarding the response body. Returns the HTTP status.
pub fn send(request: &ClusterRequest<'_>) -> Result<u16, NetError> {
    send_with_body(request).map(|(status, _body)| status)
}

pub fn send_with_body(request: &ClusterRequest<'_>) -> Result<(u16, Vec<u8>), NetError> {
    let cert = request
        .client_cert
        .as_ref()
        .ok_or(NetError::MissingClientIdentity)?;
    let config = tls::client_config(cert, request.expected_fingerprint.clone())?;

    let mut stream = connect(request.address)?;
    stream.set_read_timeout(Some(CLUSTER_DIAL_TIMEOUT))?;
    stream.set_write_timeout(Some(CLUSTER_DIAL_TIMEOUT))?;

    // SNI carries no trust here; verification pins the fingerprint.
    let server_name = ServerName::try_from("cluster.local")
        .map_err(|_| NetError::InvalidAddress(request.address.to_string()))?;
    let mut conn = ClientConnection::new(config, server_name)?;
    let mut tls_stream = Stream::new(&mut conn, &mut stream);

    let body = match &request.body {
        Some(value) => serde_json::to_vec(value).map_err(NetError::Json)?,
        None => Vec::new(),
    };
    let header = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        request.method,
        request.path,
        request.address,
        crate::auth::CLUSTER_NOTIFY_USER_AGENT,
        body.len()
    );
    tls_stream.write_all(header.as_bytes())?;
    if !body.is_empty() {
        tls_stream.write_all(&body)?;
    }
    tls_stream.flush()?;

    let mut raw = Vec::new();
    // close_notify may be skipped by the peer; a clean EOF error still
    // carries the full response.
    match tls_stream.read_to_end(&mut raw) {
        Ok(_) => {}
        Err(err) if raw.is_empty() => return Err(NetError::from(err)),
        Err(_) => {}
    }
    parse_response(&raw)
}

fn connect(address: &str) -> Result<TcpStream, NetError> {
    let mut last_err = None;
    for addr in address
        .to_socket_addrs()
        .map_err(|_| NetError::InvalidAddress(address.to_string()))?
    {
        match TcpStream::connect_timeout(&addr, CLUSTER_DIAL_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => NetError::from(err),
        None => NetError::InvalidAddress(address.to_string()),
    })
}

fn parse_response(raw: &[u8]) -> Result<(u16, Vec<u8>), NetError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    let header_len = match response.parse(raw) {
        Ok(Status::Complete(len)) => len,
        Ok(Status::Partial) => return Err(NetError::ResponseParse),
        Err(_) => return Err(NetError::ResponseParse),
    };
    let status = response.code.ok_or(NetError::ResponseParse)?;
    Ok((status, raw[header_len..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_and_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let (status, body) = parse_response(raw).unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"ok");
    }

    #[test]
    fn partial_response_is_an_error() {
        assert!(parse_response(b"HTTP/1.1 2").is_err());
    }
}
