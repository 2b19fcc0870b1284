//! Per-connection read/write driver
//!
//! One [`Connection`] owns one transport session, one in-progress
//! [`RawMessage`] assembler and the FIFO queue of replies for that peer.
//! Its `run` loop is the connection's serial execution context: socket
//! readiness and handler results are the only inputs, and both are consumed
//! on this loop, so none of the connection state needs locking.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, warn};

use super::handler::{HandlerError, SecretHandler, SecretReply, SecretRequest};
use super::message::{MessageKind, MessageStatus, RawMessage, Reply};
use super::registry::ConnectionRegistry;
use super::session::{Interest, SessionOps};
use super::{Error, Result, READ_CHUNK};

/// How long one loop iteration waits for readiness or an event.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Events delivered onto a connection's serial loop from other threads.
pub enum ConnEvent {
    /// A dispatched handler finished with the secret value or a failure.
    HandlerResult(std::result::Result<String, HandlerError>),
}

struct InFlight {
    data: Bytes,
    sent: usize,
}

/// Driver for one accepted connection.
pub struct Connection<S: SessionOps> {
    id: u64,
    session: S,
    handler: Arc<dyn SecretHandler>,
    registry: Arc<ConnectionRegistry>,
    events: Receiver<ConnEvent>,
    event_tx: Sender<ConnEvent>,
    assembler: RawMessage,
    replies: VecDeque<Bytes>,
    in_flight: Option<InFlight>,
    sent_reply: bool,
    pending_handlers: usize,
    read_closed: bool,
    closed: bool,
}

impl<S: SessionOps> Connection<S> {
    pub fn new(
        id: u64,
        session: S,
        handler: Arc<dyn SecretHandler>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        let (event_tx, events) = mpsc::channel();
        Connection {
            id,
            session,
            handler,
            registry,
            events,
            event_tx,
            assembler: RawMessage::new(MessageKind::Request),
            replies: VecDeque::new(),
            in_flight: None,
            sent_reply: false,
            pending_handlers: 0,
            read_closed: false,
            closed: false,
        }
    }

    /// Drive the connection until it closes.
    pub fn run(mut self) {
        self.registry.add(self.id);
        debug!(id = self.id, "connection open");

        loop {
            while let Ok(event) = self.events.try_recv() {
                self.on_event(event);
            }

            if self.finished() {
                break;
            }

            let interest = Interest {
                readable: !self.read_closed,
                writable: self.wants_write(),
            };

            if !interest.readable && !interest.writable {
                // Only a handler result can move this connection forward.
                match self.events.recv_timeout(POLL_INTERVAL) {
                    Ok(event) => self.on_event(event),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            }

            let ready = match self.session.poll(interest, Some(POLL_INTERVAL)) {
                Ok(ready) => ready,
                Err(err) => {
                    error!(id = self.id, %err, "poll failed");
                    break;
                }
            };

            if ready.readable && !self.read_closed {
                match self.read_once() {
                    Ok(()) => {}
                    Err(Error::Io(err)) => {
                        error!(id = self.id, %err, "read failed");
                        break;
                    }
                    Err(err) => {
                        // Framing-level failure: answer 400 and stop
                        // consuming input from this peer.
                        warn!(id = self.id, %err, "bad message framing");
                        self.enqueue(Reply::new(400, "Bad Message").to_wire());
                        self.read_closed = true;
                    }
                }
            }

            if ready.writable && self.wants_write() {
                if let Err(err) = self.write_bytes() {
                    error!(id = self.id, %err, "write failed");
                    break;
                }
            }
        }

        self.close();
    }

    /// All owed replies are out and no more can ever be produced.
    fn finished(&self) -> bool {
        if self.closed {
            return true;
        }
        let drained =
            self.replies.is_empty() && self.in_flight.is_none() && self.pending_handlers == 0;
        drained && (self.sent_reply || self.read_closed)
    }

    fn wants_write(&self) -> bool {
        self.in_flight.is_some() || !self.replies.is_empty()
    }

    fn enqueue(&mut self, reply: Bytes) {
        self.replies.push_back(reply);
    }

    fn on_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::HandlerResult(Ok(secret)) => {
                self.pending_handlers -= 1;
                let body = serde_json::to_vec(&SecretReply { secret: &secret }).unwrap_or_default();
                self.enqueue(Reply::new(200, "OK").with_body(body).to_wire());
            }
            ConnEvent::HandlerResult(Err(err)) => {
                self.pending_handlers -= 1;
                warn!(id = self.id, %err, "request failed");
                let body = format!("Request failed: {}", err).into_bytes();
                self.enqueue(Reply::new(402, "Request Failed").with_body(body).to_wire());
            }
        }
    }

    /// Read one chunk, feed the assembler, and drain any messages that
    /// became complete.
    fn read_once(&mut self) -> Result<()> {
        let mut buf = [0u8; READ_CHUNK];
        let n = self.session.read(&mut buf)?;
        if n == 0 {
            debug!(id = self.id, "end of stream");
            self.read_closed = true;
            // One final parse attempt over whatever is already buffered.
            while self.check_current_message()? {}
            return Ok(());
        }

        self.assembler.feed(&buf[..n])?;
        while self.check_current_message()? {}
        Ok(())
    }

    /// Returns true when a fresh assembler was seeded with leftover bytes
    /// and its status needs checking again.
    fn check_current_message(&mut self) -> Result<bool> {
        match self.assembler.status()? {
            MessageStatus::HeadersIncomplete
            | MessageStatus::NoLengthSpecified
            | MessageStatus::Incomplete => Ok(false),
            MessageStatus::Complete => {
                let message =
                    std::mem::replace(&mut self.assembler, RawMessage::new(MessageKind::Request));
                self.dispatch(message);
                Ok(false)
            }
            MessageStatus::CompleteExtraBytes(extra) => {
                let message =
                    std::mem::replace(&mut self.assembler, RawMessage::new(MessageKind::Request));
                self.dispatch(message);
                self.assembler.feed(&extra)?;
                Ok(true)
            }
        }
    }

    /// Hand a completed message to the handler, or answer 400 right away if
    /// it never qualifies for dispatch.
    fn dispatch(&mut self, message: RawMessage) {
        if message.method() != Some("POST") {
            debug!(id = self.id, method = ?message.method(), "rejecting non-POST message");
            self.enqueue(Reply::new(400, "Bad Message").to_wire());
            return;
        }

        let request: SecretRequest = match serde_json::from_slice(message.body()) {
            Ok(request) => request,
            Err(err) => {
                debug!(id = self.id, %err, "undecodable request body");
                self.enqueue(Reply::new(400, "Bad Message").to_wire());
                return;
            }
        };

        debug!(id = self.id, url = %request.url, "requesting secret");
        self.pending_handlers += 1;
        let handler = Arc::clone(&self.handler);
        let tx = self.event_tx.clone();
        thread::spawn(move || {
            let result = handler.fetch(&request.url);
            // The connection may already be gone; nothing to do then.
            let _ = tx.send(ConnEvent::HandlerResult(result));
        });
    }

    /// Push queued replies out, resuming the in-flight one first.
    fn write_bytes(&mut self) -> Result<()> {
        loop {
            if let Some(reply) = self.in_flight.as_mut() {
                let n = self.session.write(&reply.data[reply.sent..])?;
                if n == 0 {
                    return Err(Error::ConnectionClosed);
                }
                reply.sent += n;
                if reply.sent < reply.data.len() {
                    // Partial write; resume when the stream has space again.
                    return Ok(());
                }
                debug!(id = self.id, bytes = reply.data.len(), "reply sent");
                self.in_flight = None;
                self.sent_reply = true;
                continue;
            }

            match self.replies.pop_front() {
                Some(data) => self.in_flight = Some(InFlight { data, sent: 0 }),
                None => return Ok(()),
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!(id = self.id, "closing");
        if let Err(err) = self.session.close() {
            debug!(id = self.id, %err, "error closing session");
        }
        self.registry.remove(self.id);
    }
}

/// Spawn a connection driver on its own named thread.
pub fn spawn<S: SessionOps + Send + 'static>(
    connection: Connection<S>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("kv-conn-{}", connection.id))
        .spawn(move || connection.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::session::Readiness;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct ScriptState {
        input: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        write_limit: Option<usize>,
        closed: bool,
    }

    /// Scripted session: reads pop chunks (then report EOF), writes append
    /// to a shared buffer with an optional per-call byte cap.
    #[derive(Clone)]
    struct ScriptSession(Arc<Mutex<ScriptState>>);

    impl ScriptSession {
        fn new(chunks: Vec<&[u8]>) -> Self {
            let state = ScriptState {
                input: chunks.into_iter().map(|c| c.to_vec()).collect(),
                ..Default::default()
            };
            ScriptSession(Arc::new(Mutex::new(state)))
        }

        fn with_write_limit(self, limit: usize) -> Self {
            self.0.lock().unwrap().write_limit = Some(limit);
            self
        }

        fn written(&self) -> Vec<u8> {
            self.0.lock().unwrap().written.clone()
        }

        fn closed(&self) -> bool {
            self.0.lock().unwrap().closed
        }
    }

    impl SessionOps for ScriptSession {
        fn poll(&self, interest: Interest, _timeout: Option<Duration>) -> Result<Readiness> {
            Ok(Readiness {
                readable: interest.readable,
                writable: interest.writable,
            })
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let mut state = self.0.lock().unwrap();
            match state.input.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }

        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            let mut state = self.0.lock().unwrap();
            let n = state.write_limit.map_or(buf.len(), |l| l.min(buf.len()));
            state.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn close(&mut self) -> Result<()> {
            self.0.lock().unwrap().closed = true;
            Ok(())
        }
    }

    fn post(url: &str) -> Vec<u8> {
        let body = format!("{{\"url\":\"{}\"}}", url);
        format!(
            "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes()
    }

    fn run_connection(session: ScriptSession, handler: Arc<dyn SecretHandler>) -> ScriptSession {
        let registry = Arc::new(ConnectionRegistry::new());
        let id = registry.next_id();
        let probe = session.clone();
        Connection::new(id, session, handler, Arc::clone(&registry)).run();
        assert!(registry.is_empty());
        probe
    }

    fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
        haystack.windows(needle.len()).filter(|w| *w == needle).count()
    }

    #[test]
    fn test_post_request_gets_secret_reply() {
        let session = ScriptSession::new(vec![&post("https://vault/secret/a")]);
        let handler: Arc<dyn SecretHandler> =
            Arc::new(|_url: &str| -> std::result::Result<String, HandlerError> {
                Ok("s3cr3t".to_string())
            });

        let probe = run_connection(session, handler);

        let written = probe.written();
        let text = String::from_utf8(written).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("{\"secret\":\"s3cr3t\"}"));
        assert!(probe.closed());
    }

    #[test]
    fn test_non_post_never_reaches_handler() {
        let session =
            ScriptSession::new(vec![b"GET / HTTP/1.1\r\nContent-Length: 0\r\n\r\n"]);
        let handler: Arc<dyn SecretHandler> =
            Arc::new(|_url: &str| -> std::result::Result<String, HandlerError> {
                panic!("handler must not be invoked for non-POST requests")
            });

        let probe = run_connection(session, handler);

        let text = String::from_utf8(probe.written()).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Message\r\n"));
        assert_eq!(count_occurrences(text.as_bytes(), b"HTTP/1.1"), 1);
        assert!(probe.closed());
    }

    #[test]
    fn test_undecodable_body_gets_bad_message() {
        let session =
            ScriptSession::new(vec![b"POST / HTTP/1.1\r\nContent-Length: 7\r\n\r\nnotjson"]);
        let handler: Arc<dyn SecretHandler> =
            Arc::new(|_url: &str| -> std::result::Result<String, HandlerError> {
                panic!("handler must not see undecodable bodies")
            });

        let probe = run_connection(session, handler);
        let text = String::from_utf8(probe.written()).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Message\r\n"));
    }

    #[test]
    fn test_handler_failure_becomes_402() {
        let session = ScriptSession::new(vec![&post("https://vault/secret/missing")]);
        let handler: Arc<dyn SecretHandler> =
            Arc::new(|_url: &str| -> std::result::Result<String, HandlerError> {
                Err(HandlerError::new("secret not found"))
            });

        let probe = run_connection(session, handler);

        let text = String::from_utf8(probe.written()).unwrap();
        assert!(text.starts_with("HTTP/1.1 402 Request Failed\r\n"));
        assert!(text.contains("secret not found"));
        assert!(probe.closed());
    }

    #[test]
    fn test_pipelined_requests_both_answered() {
        let mut combined = post("https://vault/secret/missing");
        combined.extend_from_slice(&post("https://vault/secret/b"));
        let session = ScriptSession::new(vec![&combined]);

        // First URL fails, second succeeds; the connection must stay open
        // until both replies are out.
        let handler: Arc<dyn SecretHandler> = Arc::new(
            |url: &str| -> std::result::Result<String, HandlerError> {
                if url.ends_with("missing") {
                    Err(HandlerError::new("secret not found"))
                } else {
                    Ok("beta".to_string())
                }
            },
        );

        let probe = run_connection(session, handler);

        let written = probe.written();
        assert_eq!(count_occurrences(&written, b"HTTP/1.1 402 Request Failed"), 1);
        assert_eq!(count_occurrences(&written, b"HTTP/1.1 200 OK"), 1);
        assert!(probe.closed());
    }

    #[test]
    fn test_partial_writes_resume() {
        let session =
            ScriptSession::new(vec![&post("https://vault/secret/a")]).with_write_limit(7);
        let handler: Arc<dyn SecretHandler> =
            Arc::new(|_url: &str| -> std::result::Result<String, HandlerError> {
                Ok("resumable".to_string())
            });

        let probe = run_connection(session, handler);

        let text = String::from_utf8(probe.written()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("{\"secret\":\"resumable\"}"));
    }

    #[test]
    fn test_framing_error_gets_bad_message() {
        let session = ScriptSession::new(vec![b"BOGUS\r\n\r\n"]);
        let handler: Arc<dyn SecretHandler> =
            Arc::new(|_url: &str| -> std::result::Result<String, HandlerError> {
                Ok(String::new())
            });

        let probe = run_connection(session, handler);

        let text = String::from_utf8(probe.written()).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Message\r\n"));
        assert!(probe.closed());
    }

    #[test]
    fn test_invalid_content_length_gets_bad_message() {
        let session =
            ScriptSession::new(vec![b"POST / HTTP/1.1\r\nContent-Length: abc\r\n\r\n"]);
        let handler: Arc<dyn SecretHandler> =
            Arc::new(|_url: &str| -> std::result::Result<String, HandlerError> {
                Ok(String::new())
            });

        let probe = run_connection(session, handler);

        let text = String::from_utf8(probe.written()).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Message\r\n"));
    }

    #[test]
    fn test_early_hangup_closes_without_reply() {
        // Peer disconnects before completing a request.
        let session = ScriptSession::new(vec![b"POST / HTTP/1.1\r\nContent-"]);
        let handler: Arc<dyn SecretHandler> =
            Arc::new(|_url: &str| -> std::result::Result<String, HandlerError> {
                Ok(String::new())
            });

        let probe = run_connection(session, handler);

        assert!(probe.written().is_empty());
        assert!(probe.closed());
    }
}
