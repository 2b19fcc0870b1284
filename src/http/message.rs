//! Incremental HTTP message assembly
//!
//! [`RawMessage`] owns the byte buffers for one in-progress HTTP message.
//! Bytes are appended with [`RawMessage::feed`] in whatever chunks the
//! stream produced them; [`RawMessage::status`] reports how far along the
//! message is according to `Content-Length` framing, including the case
//! where surplus bytes belong to the next pipelined message.

use bytes::{Bytes, BytesMut};

use super::{Error, Headers, Result, CRLF};

/// Whether a message is parsed as a request or a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

/// Completeness of an in-progress message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    /// The blank-line header terminator has not been seen yet.
    HeadersIncomplete,
    /// Headers are complete but carry no `Content-Length`. Such a message
    /// never completes from length alone; the driver treats it as
    /// still-in-progress.
    NoLengthSpecified,
    /// Fewer body bytes than `Content-Length` have arrived.
    Incomplete,
    /// Body length equals `Content-Length` exactly.
    Complete,
    /// More body bytes than `Content-Length` arrived: the surplus is the
    /// start of the next pipelined message and must be fed to a fresh
    /// assembler.
    CompleteExtraBytes(Bytes),
}

#[derive(Debug)]
enum StartLine {
    Request {
        method: String,
        target: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
        reason: String,
    },
}

impl StartLine {
    fn parse(kind: MessageKind, line: &str) -> Result<Self> {
        match kind {
            MessageKind::Request => {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() != 3 {
                    return Err(Error::Parse(format!(
                        "Invalid request line: expected 3 parts, got {}",
                        parts.len()
                    )));
                }
                Ok(StartLine::Request {
                    method: parts[0].to_string(),
                    target: parts[1].to_string(),
                    version: parts[2].to_string(),
                })
            }
            MessageKind::Response => {
                let parts: Vec<&str> = line.splitn(3, ' ').collect();
                if parts.len() < 2 {
                    return Err(Error::Parse(format!("Invalid status line: {}", line)));
                }
                let status = parts[1]
                    .parse::<u16>()
                    .map_err(|_| Error::Parse(format!("Invalid status code: {}", parts[1])))?;
                Ok(StartLine::Response {
                    version: parts[0].to_string(),
                    status,
                    reason: parts.get(2).unwrap_or(&"").to_string(),
                })
            }
        }
    }
}

/// One HTTP message being assembled from arbitrarily-chunked reads.
///
/// Headers become immutable once the header block completes; after that,
/// body bytes only ever grow, except for the one-time truncation performed
/// when [`MessageStatus::CompleteExtraBytes`] splits off the next message.
#[derive(Debug)]
pub struct RawMessage {
    kind: MessageKind,
    header_buf: BytesMut,
    start_line: Option<StartLine>,
    headers: Headers,
    body: BytesMut,
    finalized: bool,
}

impl RawMessage {
    /// Create an empty assembler for a message of the given kind.
    pub fn new(kind: MessageKind) -> Self {
        RawMessage {
            kind,
            header_buf: BytesMut::new(),
            start_line: None,
            headers: Headers::new(),
            body: BytesMut::new(),
            finalized: false,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Request method, available once the header block is complete.
    pub fn method(&self) -> Option<&str> {
        match self.start_line.as_ref()? {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    /// Request target, available once the header block is complete.
    pub fn target(&self) -> Option<&str> {
        match self.start_line.as_ref()? {
            StartLine::Request { target, .. } => Some(target),
            StartLine::Response { .. } => None,
        }
    }

    /// HTTP version from the start line, available once the header block is
    /// complete.
    pub fn version(&self) -> Option<&str> {
        match self.start_line.as_ref()? {
            StartLine::Request { version, .. } => Some(version),
            StartLine::Response { version, .. } => Some(version),
        }
    }

    /// Response status code, available once the header block is complete.
    pub fn response_status(&self) -> Option<u16> {
        match self.start_line.as_ref()? {
            StartLine::Request { .. } => None,
            StartLine::Response { status, .. } => Some(*status),
        }
    }

    /// Response reason phrase, available once the header block is complete.
    pub fn response_reason(&self) -> Option<&str> {
        match self.start_line.as_ref()? {
            StartLine::Request { .. } => None,
            StartLine::Response { reason, .. } => Some(reason),
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    fn headers_complete(&self) -> bool {
        self.start_line.is_some()
    }

    /// Append raw bytes to the message.
    ///
    /// Fails with [`Error::FramingAppend`] once the body has been finalized
    /// by a [`MessageStatus::CompleteExtraBytes`] truncation, and with
    /// [`Error::Parse`] if a completed header block is malformed.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        if self.finalized {
            return Err(Error::FramingAppend);
        }

        if self.headers_complete() {
            self.body.extend_from_slice(data);
            return Ok(());
        }

        self.header_buf.extend_from_slice(data);
        if let Some(end) = find_header_end(&self.header_buf) {
            let buf = std::mem::take(&mut self.header_buf);
            self.parse_header_block(&buf[..end])?;
            self.body.extend_from_slice(&buf[end + 4..]);
        }
        Ok(())
    }

    fn parse_header_block(&mut self, block: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(block);
        let mut lines = text.split(CRLF);

        let start = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or_else(|| Error::Parse("Missing start line".to_string()))?;
        self.start_line = Some(StartLine::parse(self.kind, start)?);

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = Headers::parse_header_line(line)?;
            self.headers.insert(name, value);
        }
        Ok(())
    }

    /// Report the completeness of the message so far.
    ///
    /// This is a query over buffered state and performs no I/O. It is
    /// idempotent except for the one-time truncation that accompanies
    /// [`MessageStatus::CompleteExtraBytes`]: the surplus is handed to the
    /// caller exactly once and the body keeps exactly `Content-Length`
    /// bytes from then on.
    pub fn status(&mut self) -> Result<MessageStatus> {
        if !self.headers_complete() {
            return Ok(MessageStatus::HeadersIncomplete);
        }

        let content_length = match self.headers.get("Content-Length") {
            None => return Ok(MessageStatus::NoLengthSpecified),
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(n) if n >= 0 => n as usize,
                _ => return Err(Error::InvalidContentLength(raw.to_string())),
            },
        };

        if self.body.len() < content_length {
            return Ok(MessageStatus::Incomplete);
        }
        if self.body.len() == content_length {
            return Ok(MessageStatus::Complete);
        }

        let extra = self.body.split_off(content_length).freeze();
        self.finalized = true;
        Ok(MessageStatus::CompleteExtraBytes(extra))
    }
}

/// Position of the blank-line header terminator, if present.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// A serialized HTTP/1.1 response to queue on a connection.
#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    reason: String,
    body: Vec<u8>,
}

impl Reply {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Reply {
            status,
            reason: reason.into(),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Serialize to wire format, with `Content-Length` framing the body.
    pub fn to_wire(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"HTTP/1.1 ");
        buf.extend_from_slice(self.status.to_string().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.reason.as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());
        buf.extend_from_slice(b"Content-Length: ");
        buf.extend_from_slice(self.body.len().to_string().as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }
}
