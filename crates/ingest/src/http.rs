//! Minimal HTTP/1.1 framing for the request loop: bounded header reads,
//! exact `Content-Length` body reads, and keep-alive bookkeeping.

use std::io::{self, BufRead, Read, Write};
use std::net::TcpStream;

use thiserror::Error;

use crate::config::IngestConfig;

/// How a request read can end. Only `BadRequest`, `HeadersTooLarge`, and
/// `BodyTooLarge` earn the client a response; the rest close the connection
/// silently.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Peer closed between requests; the normal end of a persistent
    /// connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Peer vanished mid-request.
    #[error("connection closed mid-request")]
    UnexpectedEof,

    /// The socket receive timeout expired.
    #[error("read timed out")]
    Timeout,

    /// Malformed request line, header, or body framing. The message is
    /// echoed in the 400 response.
    #[error("{0}")]
    BadRequest(String),

    /// Request line plus headers exceeded the configured cap.
    #[error("request headers too large")]
    HeadersTooLarge,

    /// Declared `Content-Length` exceeded the configured cap.
    #[error("request body too large")]
    BodyTooLarge,

    #[error("socket error: {0}")]
    Io(io::Error),
}

/// One parsed request off the wire.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    http_11: bool,
}

impl Request {
    /// Header lookup by lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Path with any query string stripped.
    pub fn route_path(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }

    /// Whether the connection may carry another request after this one.
    /// HTTP/1.1 defaults to keep-alive; either side can opt out with
    /// `Connection: close`.
    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(value) if value.eq_ignore_ascii_case("close") => false,
            Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.http_11,
        }
    }
}

/// Read one full request: line, headers (bounded), body (exact declared
/// length, bounded).
pub fn read_request<R: BufRead>(
    reader: &mut R,
    limits: &IngestConfig,
) -> Result<Request, HttpError> {
    let mut line = Vec::new();
    read_line(reader, &mut line, limits.max_header_bytes, true)?;
    let mut header_budget = limits.max_header_bytes.saturating_sub(line.len());

    let request_line = std::str::from_utf8(&line)
        .map_err(|_| HttpError::BadRequest("request line is not valid utf-8".to_string()))?
        .trim_end_matches(['\r', '\n']);
    let mut parts = request_line.split(' ');
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| HttpError::BadRequest("empty request line".to_string()))?;
    let path = parts
        .next()
        .ok_or_else(|| HttpError::BadRequest("request line missing path".to_string()))?;
    let http_11 = match parts.next() {
        Some("HTTP/1.1") => true,
        Some("HTTP/1.0") => false,
        _ => {
            return Err(HttpError::BadRequest(
                "unsupported protocol version".to_string(),
            ))
        }
    };
    if parts.next().is_some() {
        return Err(HttpError::BadRequest("malformed request line".to_string()));
    }

    let mut headers = Vec::new();
    loop {
        let mut header_line = Vec::new();
        read_line(reader, &mut header_line, header_budget, false)?;
        header_budget = header_budget.saturating_sub(header_line.len());

        let text = std::str::from_utf8(&header_line)
            .map_err(|_| HttpError::BadRequest("header is not valid utf-8".to_string()))?
            .trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            break;
        }
        let (name, value) = text
            .split_once(':')
            .ok_or_else(|| HttpError::BadRequest("malformed header line".to_string()))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }

    let content_length = match headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .map(|(_, value)| value.as_str())
    {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| HttpError::BadRequest("invalid content-length".to_string()))?,
        None => 0,
    };
    if content_length > limits.max_body_bytes {
        return Err(HttpError::BodyTooLarge);
    }

    // Exactly the declared length is read; a short body is a client error,
    // not something to wait out.
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => {
                HttpError::BadRequest("body shorter than content-length".to_string())
            }
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => HttpError::Timeout,
            _ => HttpError::Io(err),
        })?;
    }

    Ok(Request {
        method: method.to_string(),
        path: path.to_string(),
        headers,
        body,
        http_11,
    })
}

/// Append one `\n`-terminated line to `out`, reading at most `max` bytes.
/// `at_request_start` distinguishes a clean idle close from a peer vanishing
/// mid-request.
fn read_line<R: BufRead>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max: usize,
    at_request_start: bool,
) -> Result<(), HttpError> {
    loop {
        let available = match reader.fill_buf() {
            Ok(buffer) => buffer,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(HttpError::Timeout)
            }
            Err(err) => return Err(HttpError::Io(err)),
        };
        if available.is_empty() {
            return Err(if at_request_start && out.is_empty() {
                HttpError::ConnectionClosed
            } else {
                HttpError::UnexpectedEof
            });
        }

        if let Some(newline) = available.iter().position(|&byte| byte == b'\n') {
            if out.len() + newline + 1 > max {
                return Err(HttpError::HeadersTooLarge);
            }
            out.extend_from_slice(&available[..=newline]);
            reader.consume(newline + 1);
            return Ok(());
        }

        let chunk = available.len();
        if out.len() + chunk > max {
            return Err(HttpError::HeadersTooLarge);
        }
        out.extend_from_slice(available);
        reader.consume(chunk);
    }
}

/// Write a complete response. Bodies are always JSON here.
pub fn write_response(
    stream: &mut TcpStream,
    status: u16,
    body: &[u8],
    keep_alive: bool,
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        status,
        reason(status),
        body.len(),
        if keep_alive { "keep-alive" } else { "close" },
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        429 => "Too Many Requests",
        503 => "Service Unavailable",
        _ => "Error",
    }
}
