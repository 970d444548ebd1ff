//! Canonical JSON response rendering.
//!
//! Every user-visible body has one of two shapes: a sync envelope
//! (`{"type":"sync","status":"Success",...}`) or an error envelope
//! (`{"type":"error","error":...,"error_code":...}`). Responses are written
//! as complete HTTP/1.1 messages with `Connection: close`.

use serde::Serialize;
use serde_json::json;
use std::fmt::Write as _;
use std::io::{self, Write};

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Sync envelope with no metadata; also the sentinel an access handler
    /// returns to let the pipeline proceed.
    EmptySync,
    /// Sync envelope wrapping a metadata value.
    Sync(serde_json::Value),
    /// Error envelope.
    Error { code: u16, message: String },
    /// Raw body with its own content type (metrics text).
    Manual {
        status: u16,
        content_type: &'static str,
        body: Vec<u8>,
    },
}

impl Response {
    pub fn sync(metadata: impl Serialize) -> Response {
        match serde_json::to_value(metadata) {
            Ok(value) => Response::Sync(value),
            Err(err) => Response::internal_error(format!("encoding response: {err}")),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Response {
        Response::Error {
            code: 400,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Response {
        Response::Error {
            code: 401,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Response {
        let message = message.into();
        Response::Error {
            code: 403,
            message: if message.is_empty() {
                "Forbidden".to_string()
            } else {
                message
            },
        }
    }

    pub fn not_found(message: impl Into<String>) -> Response {
        Response::Error {
            code: 404,
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Response {
        Response::Error {
            code: 500,
            message: message.into(),
        }
    }

    pub fn not_implemented() -> Response {
        Response::Error {
            code: 501,
            message: "Not implemented".to_string(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Response {
        Response::Error {
            code: 503,
            message: message.into(),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Response::EmptySync | Response::Sync(_) => 200,
            Response::Error { code, .. } => *code,
            Response::Manual { status, .. } => *status,
        }
    }

    /// Writes the full HTTP message, with any extra headers (e.g. OIDC
    /// challenges) ahead of the body.
    pub fn render(
        &self,
        stream: &mut (impl Write + ?Sized),
        extra_headers: &[(String, String)],
    ) -> io::Result<()> {
        let (status, content_type, body) = match self {
            Response::EmptySync => (
                200,
                "application/json",
                serde_json::to_vec(&json!({
                    "type": "sync",
                    "status": "Success",
                    "status_code": 200,
                    "metadata": serde_json::Value::Null,
                }))?,
            ),
            Response::Sync(metadata) => (
                200,
                "application/json",
                serde_json::to_vec(&json!({
                    "type": "sync",
                    "status": "Success",
                    "status_code": 200,
                    "metadata": metadata,
                }))?,
            ),
            Response::Error { code, message } => (
                *code,
                "application/json",
                serde_json::to_vec(&json!({
                    "type": "error",
                    "error": message,
                    "error_code": code,
                }))?,
            ),
            Response::Manual {
                status,
                content_type,
                body,
            } => (*status, *content_type, body.clone()),
        };

        let mut header = String::new();
        write!(
            header,
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n",
            status,
            status_text(status),
            content_type,
            body.len()
        )
        .map_err(|_| io::Error::other("response header formatting failed"))?;
        for (name, value) in extra_headers {
            write!(header, "{name}: {value}\r\n")
                .map_err(|_| io::Error::other("response header formatting failed"))?;
        }
        header.push_str("Connection: close\r\n\r\n");
        stream.write_all(header.as_bytes())?;
        stream.write_all(&body)?;
        stream.flush()
    }
}

/// Maps an arbitrary error onto the canonical error envelope. Rendering
/// failures fall back here so the client always sees a valid body.
pub fn smart_error(err: &dyn std::error::Error) -> Response {
    Response::internal_error(err.to_string())
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "OK",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(response: &Response) -> String {
        let mut buffer = Vec::new();
        response.render(&mut buffer, &[]).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn sync_envelope_shape() {
        let out = rendered(&Response::sync(vec!["/1.0"]));
        assert!(out.starts_with("HTTP/1.1 200 OK"));
        assert!(out.contains("\"type\":\"sync\""));
        assert!(out.contains("\"metadata\":[\"/1.0\"]"));
    }

    #[test]
    fn error_envelope_shape() {
        let out = rendered(&Response::unavailable("Daemon setup in progress"));
        assert!(out.starts_with("HTTP/1.1 503 Service Unavailable"));
        assert!(out.contains("\"error\":\"Daemon setup in progress\""));
        assert!(out.contains("\"error_code\":503"));
    }

    #[test]
    fn extra_headers_precede_body() {
        let mut buffer = Vec::new();
        Response::unauthorized("no")
            .render(
                &mut buffer,
                &[("WWW-Authenticate".into(), "Bearer realm=\"burrow\"".into())],
            )
            .unwrap();
        let out = String::from_utf8(buffer).unwrap();
        let header_end = out.find("\r\n\r\n").unwrap();
        assert!(out[..header_end].contains("WWW-Authenticate: Bearer"));
    }
}
