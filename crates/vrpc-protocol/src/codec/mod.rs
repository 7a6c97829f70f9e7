//! Wire codec for request and response messages.
//!
//! A message is a start line, `Key: Value` header lines, a blank line, and an
//! optional UTF-8 JSON body whose byte length is declared by
//! `Content-Length`. Every line ends with CRLF. The codec works on complete
//! byte buffers and has no knowledge of how they were framed.

use std::str::{self, Utf8Error};

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::envelope::{Envelope, unix_timestamp};
use crate::errors::{ErrorKind, RpcFault, TransportStatus};
use crate::headers::{self, Headers};

/// Protocol version written on every start line.
pub const PROTOCOL_VERSION: &str = "HTTP/1.1";

/// Value of the `Host` header injected into requests.
pub const DEFAULT_HOST: &str = "virtio-rpc";

/// Content type of every body.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Separator between the header block and the body.
pub const HEADER_TERMINATOR: &[u8; 4] = b"\r\n\r\n";

const CRLF: &str = "\r\n";

/// Errors raised while decoding a message.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The header block is not valid UTF-8.
    #[error("header block is not valid UTF-8: {0}")]
    HeadEncoding(#[source] Utf8Error),
    /// The request line is not `METHOD PATH HTTP/ver`.
    #[error("invalid request line: {line:?}")]
    MalformedRequestLine {
        /// Offending line.
        line: String,
    },
    /// The status line is not `HTTP/ver STATUS REASON`.
    #[error("invalid status line: {line:?}")]
    MalformedStatusLine {
        /// Offending line.
        line: String,
    },
    /// A header line has no `:` separator or an empty name.
    #[error("invalid header line: {line:?}")]
    MalformedHeader {
        /// Offending line.
        line: String,
    },
    /// `Content-Length` is not a non-negative integer.
    #[error("invalid Content-Length: {value:?}")]
    InvalidContentLength {
        /// Declared value.
        value: String,
    },
    /// Fewer body bytes are present than `Content-Length` declares.
    #[error("body truncated: declared {declared} bytes, received {available}")]
    Truncated {
        /// Declared body length.
        declared: usize,
        /// Body bytes actually present.
        available: usize,
    },
    /// The body is not valid JSON.
    #[error("invalid JSON body: {0}")]
    Body(#[source] serde_json::Error),
    /// The response body is not a valid envelope.
    #[error("invalid response envelope: {0}")]
    Envelope(#[source] serde_json::Error),
}

impl From<DecodeError> for RpcFault {
    fn from(error: DecodeError) -> Self {
        Self::with_message(ErrorKind::JsonParse, format!("Failed to parse message: {error}"))
    }
}

/// Errors raised while encoding a message.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The method is empty or contains whitespace or control characters.
    #[error("invalid method: {method:?}")]
    InvalidMethod {
        /// Offending method.
        method: String,
    },
    /// The path is empty or contains whitespace or control characters.
    #[error("invalid path: {path:?}")]
    InvalidPath {
        /// Offending path.
        path: String,
    },
    /// A header name or value would break the header block.
    #[error("invalid header: {name:?}")]
    InvalidHeader {
        /// Offending header name.
        name: String,
    },
    /// The body could not be serialised.
    #[error("failed to serialise body: {0}")]
    Body(#[source] serde_json::Error),
}

impl From<EncodeError> for RpcFault {
    fn from(error: EncodeError) -> Self {
        Self::invalid_params(error.to_string())
    }
}

/// Decoded or outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Request method, for example `GET`.
    pub method: String,
    /// Raw path including any query string.
    pub path: String,
    /// Header block.
    pub headers: Headers,
    /// Optional JSON body.
    pub body: Option<Value>,
}

impl Request {
    /// Builds a request without headers.
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Headers::new(),
            body,
        }
    }

    /// Injects the standard request headers.
    ///
    /// `Host`, `Content-Type`, and `X-Request-ID` are added only when absent;
    /// `X-Timestamp` is always refreshed.
    #[must_use]
    pub fn with_default_headers(mut self) -> Self {
        apply_request_defaults(&mut self.headers);
        self
    }

    /// Returns the correlation identifier, if present.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(headers::REQUEST_ID)
    }

    /// Serialises the request exactly as stored, computing `Content-Length`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] when the method, path, or a header would
    /// corrupt the start line or header block.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        if !is_token(&self.method) {
            return Err(EncodeError::InvalidMethod {
                method: self.method.clone(),
            });
        }
        if !is_token(&self.path) {
            return Err(EncodeError::InvalidPath {
                path: self.path.clone(),
            });
        }
        let start_line = format!("{} {} {PROTOCOL_VERSION}", self.method, self.path);
        write_message(&start_line, &self.headers, self.body.as_ref())
    }
}

/// Decoded or outgoing response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    /// Header block.
    pub headers: Headers,
    /// Optional JSON body.
    pub body: Option<Value>,
}

impl Response {
    /// Wraps an envelope into a response, resolving the status from its code.
    ///
    /// The request identifier is mirrored back when supplied.
    #[must_use]
    pub fn from_envelope(envelope: &Envelope, request_id: Option<&str>) -> Self {
        let status = TransportStatus::for_code(envelope.code);
        let mut response_headers = Headers::new();
        response_headers.insert(headers::CONTENT_TYPE, JSON_CONTENT_TYPE);
        if let Some(id) = request_id {
            response_headers.insert(headers::REQUEST_ID, id);
        }
        Self {
            status: status.code,
            reason: status.reason.to_owned(),
            headers: response_headers,
            body: Some(envelope.to_value()),
        }
    }

    /// Serialises the response, computing `Content-Length`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] when the reason phrase or a header would
    /// corrupt the status line or header block.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        if self.reason.contains(['\r', '\n']) {
            return Err(EncodeError::InvalidHeader {
                name: "status reason".to_owned(),
            });
        }
        let start_line = format!("{PROTOCOL_VERSION} {} {}", self.status, self.reason);
        write_message(&start_line, &self.headers, self.body.as_ref())
    }

    /// Returns the correlation identifier, if present.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(headers::REQUEST_ID)
    }

    /// Interprets the body as an envelope.
    ///
    /// A response without a body is reported as a bare success.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Envelope`] when the body has the wrong shape.
    pub fn envelope(&self) -> Result<Envelope, DecodeError> {
        match &self.body {
            Some(body) => serde_json::from_value(body.clone()).map_err(DecodeError::Envelope),
            None => Ok(Envelope::success(None)),
        }
    }
}

/// Encodes a request, injecting the standard headers.
///
/// # Errors
///
/// Returns [`EncodeError`] for methods, paths, or headers that cannot be
/// written safely.
pub fn encode_request(
    method: &str,
    path: &str,
    headers: Headers,
    body: Option<&Value>,
) -> Result<Vec<u8>, EncodeError> {
    let mut request = Request::new(method, path, body.cloned());
    request.headers = headers;
    request.with_default_headers().to_bytes()
}

/// Encodes a response envelope for `code`.
///
/// Status and reason are resolved from the taxonomy; a `None` message falls
/// back to the default message of the code.
///
/// # Errors
///
/// Returns [`EncodeError`] when the mirrored request identifier contains
/// line breaks.
pub fn encode_response(
    code: u32,
    message: Option<String>,
    data: Option<Value>,
    request_id: Option<&str>,
) -> Result<Vec<u8>, EncodeError> {
    let envelope = Envelope::for_code(code, message, data);
    Response::from_envelope(&envelope, request_id).to_bytes()
}

/// Decodes a request from a complete message buffer.
///
/// # Errors
///
/// Returns [`DecodeError`] when the head is not UTF-8, the request line or a
/// header line is malformed, or the body is truncated or not JSON.
pub fn decode_request(bytes: &[u8]) -> Result<Request, DecodeError> {
    let parts = MessageParts::parse(bytes)?;
    let (method, path) =
        parse_request_line(parts.start_line).ok_or_else(|| DecodeError::MalformedRequestLine {
            line: parts.start_line.to_owned(),
        })?;
    Ok(Request {
        method: method.to_owned(),
        path: path.to_owned(),
        headers: parts.headers,
        body: parts.body,
    })
}

/// Decodes a response from a complete message buffer.
///
/// # Errors
///
/// Returns [`DecodeError`] when the head is not UTF-8, the status line or a
/// header line is malformed, or the body is truncated or not JSON.
pub fn decode_response(bytes: &[u8]) -> Result<Response, DecodeError> {
    let parts = MessageParts::parse(bytes)?;
    let (status, reason) =
        parse_status_line(parts.start_line).ok_or_else(|| DecodeError::MalformedStatusLine {
            line: parts.start_line.to_owned(),
        })?;
    Ok(Response {
        status,
        reason: reason.to_owned(),
        headers: parts.headers,
        body: parts.body,
    })
}

/// Returns the offset of the first header terminator in `bytes`.
#[must_use]
pub fn find_header_end(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

struct MessageParts<'a> {
    start_line: &'a str,
    headers: Headers,
    body: Option<Value>,
}

impl<'a> MessageParts<'a> {
    fn parse(bytes: &'a [u8]) -> Result<Self, DecodeError> {
        let (head, tail) = split_head(bytes);
        let text = str::from_utf8(head).map_err(DecodeError::HeadEncoding)?;
        let mut lines = text.split(CRLF);
        let start_line = lines.next().unwrap_or_default();
        let headers = parse_header_lines(lines)?;
        let body = parse_body(&headers, tail)?;
        Ok(Self {
            start_line,
            headers,
            body,
        })
    }
}

fn split_head(bytes: &[u8]) -> (&[u8], &[u8]) {
    match find_header_end(bytes) {
        Some(end) => {
            let (head, rest) = bytes.split_at(end);
            (head, rest.get(HEADER_TERMINATOR.len()..).unwrap_or_default())
        }
        None => (bytes, &[]),
    }
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers, DecodeError> {
    let mut parsed = Headers::new();
    for line in lines.filter(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .filter(|(name, _)| !name.trim().is_empty())
            .ok_or_else(|| DecodeError::MalformedHeader {
                line: line.to_owned(),
            })?;
        parsed.insert(name.trim(), value.trim());
    }
    Ok(parsed)
}

fn parse_body(parsed: &Headers, tail: &[u8]) -> Result<Option<Value>, DecodeError> {
    let declared = match parsed.get(headers::CONTENT_LENGTH) {
        Some(value) => Some(value.parse::<usize>().map_err(|_| {
            DecodeError::InvalidContentLength {
                value: value.to_owned(),
            }
        })?),
        None => None,
    };
    let body = match declared {
        Some(0) => return Ok(None),
        Some(length) => tail.get(..length).ok_or(DecodeError::Truncated {
            declared: length,
            available: tail.len(),
        })?,
        None if tail.is_empty() => return Ok(None),
        None => tail,
    };
    serde_json::from_slice(body)
        .map(Some)
        .map_err(DecodeError::Body)
}

fn parse_request_line(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.split(' ');
    let method = parts.next().filter(|method| !method.is_empty())?;
    let path = parts.next().filter(|path| !path.is_empty())?;
    let version = parts.next()?;
    if parts.next().is_some() || !version.starts_with("HTTP/") {
        return None;
    }
    Some((method, path))
}

fn parse_status_line(line: &str) -> Option<(u16, &str)> {
    let (version, rest) = line.split_once(' ')?;
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return None;
    }
    let (code, reason) = rest.split_once(' ')?;
    if code.len() != 3 || reason.is_empty() {
        return None;
    }
    let status = code.parse::<u16>().ok()?;
    Some((status, reason))
}

fn apply_request_defaults(target: &mut Headers) {
    target.insert_if_absent(headers::HOST, || DEFAULT_HOST.to_owned());
    target.insert_if_absent(headers::CONTENT_TYPE, || JSON_CONTENT_TYPE.to_owned());
    target.insert_if_absent(headers::REQUEST_ID, || Uuid::new_v4().to_string());
    target.insert(headers::TIMESTAMP, unix_timestamp().to_string());
}

fn write_message(
    start_line: &str,
    message_headers: &Headers,
    body: Option<&Value>,
) -> Result<Vec<u8>, EncodeError> {
    let body_bytes = body
        .map(serde_json::to_vec)
        .transpose()
        .map_err(EncodeError::Body)?
        .unwrap_or_default();

    let mut all_headers = message_headers.clone();
    all_headers.insert(headers::CONTENT_LENGTH, body_bytes.len().to_string());

    let mut head = String::with_capacity(128);
    head.push_str(start_line);
    head.push_str(CRLF);
    for (name, value) in all_headers.iter() {
        if !is_token(name) || name.contains(':') || value.contains(['\r', '\n']) {
            return Err(EncodeError::InvalidHeader {
                name: name.to_owned(),
            });
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str(CRLF);
    }
    head.push_str(CRLF);

    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(&body_bytes);
    Ok(bytes)
}

fn is_token(value: &str) -> bool {
    !value.is_empty()
        && !value
            .chars()
            .any(|character| character.is_whitespace() || character.is_control())
}
