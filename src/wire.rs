//! NDJSON wire protocol shared with the supervisor.
//!
//! Every record is one JSON object per line with top-level keys
//! `{id, type, payload}`. Stdin carries `invoke` records; stdout carries
//! `ready`, `response`, `log` and `error` records. Anything the worker
//! wants to tell an operator goes to stderr instead, never to stdout.

use std::cell::RefCell;
use std::io::{BufRead, Write};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, warn};

/// Longest stdin line the codec accepts. Longer lines are consumed and
/// dropped with a stderr diagnostic.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// A record read from stdin. `payload` is kept raw until the record type
/// is known; unknown types are ignored by the dispatcher.
#[derive(Debug, Deserialize)]
pub struct InboundRecord {
    #[serde(default = "default_record_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

fn default_record_id() -> String {
    "unknown".into()
}

/// Payload of an `invoke` record. Missing fields fall back to an empty
/// GET against `/`.
#[derive(Debug, Deserialize)]
pub struct InvokePayload {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub query: Map<String, Value>,
    /// Base64 of the raw request bytes; empty means no body.
    #[serde(default)]
    pub body: String,
}

fn default_method() -> String {
    "GET".into()
}

fn default_path() -> String {
    "/".into()
}

/// Payload of a `response` record. `body` is base64-encoded.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ResponsePayload {
    pub status: i32,
    pub headers: Map<String, Value>,
    pub body: String,
}

/// Severity of a guest `console` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    /// Maps a level name coming from the console shim. Anything
    /// unrecognized degrades to `info`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "warn" => Self::Warn,
            "error" => Self::Error,
            "debug" => Self::Debug,
            _ => Self::Info,
        }
    }
}

/// Stable error codes the supervisor classifies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BundleLoadError,
    RequestCreationError,
    HandlerError,
    HandlerNotLoaded,
    InvalidMessage,
    UnknownError,
}

#[derive(Debug, Serialize)]
struct OutboundRecord<'a> {
    id: &'a str,
    #[serde(flatten)]
    body: OutboundBody<'a>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
enum OutboundBody<'a> {
    Ready {},
    Response(&'a ResponsePayload),
    Log { level: LogLevel, message: &'a str },
    Error { message: &'a str, code: ErrorCode },
}

/// Outcome of reading one stdin line.
enum Line {
    Complete(Vec<u8>),
    Oversized,
}

/// Reads NDJSON records from the supervisor, skipping blank, oversized
/// and malformed lines with stderr diagnostics. The worker never
/// terminates on a codec error; only EOF ends the stream.
pub struct RecordReader<R> {
    input: R,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }

    /// Next parseable record, or `None` at end of input.
    pub fn next_record(&mut self) -> Option<InboundRecord> {
        loop {
            let line = match self.read_line() {
                Ok(Some(Line::Complete(line))) => line,
                Ok(Some(Line::Oversized)) => {
                    warn!("dropping stdin line longer than {MAX_LINE_LEN} bytes");
                    continue;
                }
                Ok(None) => return None,
                Err(err) => {
                    error!("failed to read from stdin: {err}");
                    return None;
                }
            };

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice(&line) {
                Ok(record) => return Some(record),
                Err(err) => {
                    warn!("dropping malformed stdin record: {err}");
                    continue;
                }
            }
        }
    }

    /// Reads up to the next newline without buffering more than
    /// `MAX_LINE_LEN` bytes; the remainder of an oversized line is
    /// consumed and discarded.
    fn read_line(&mut self) -> std::io::Result<Option<Line>> {
        let mut line = Vec::new();
        let mut oversized = false;

        loop {
            let chunk = self.input.fill_buf()?;
            if chunk.is_empty() {
                return match (line.is_empty(), oversized) {
                    (true, false) => Ok(None),
                    (_, true) => Ok(Some(Line::Oversized)),
                    (false, _) => Ok(Some(Line::Complete(line))),
                };
            }

            let (segment, found_newline) = match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => (&chunk[..pos], true),
                None => (chunk, false),
            };

            if !oversized {
                if line.len() + segment.len() > MAX_LINE_LEN {
                    oversized = true;
                    line = Vec::new();
                } else {
                    line.extend_from_slice(segment);
                }
            }

            let consumed = segment.len() + usize::from(found_newline);
            self.input.consume(consumed);

            if found_newline {
                return if oversized {
                    Ok(Some(Line::Oversized))
                } else {
                    Ok(Some(Line::Complete(line)))
                };
            }
        }
    }
}

/// Writes wire records to the supervisor and tags guest logs with the
/// invocation they belong to.
///
/// A clone is captured by the guest `console` hook, so the writer and the
/// current-invocation slot live behind a shared single-threaded cell. Each
/// record is serialized to a single newline-terminated buffer, written in
/// one call and flushed, so the supervisor sees whole records only.
#[derive(Clone)]
pub struct Emitter {
    inner: Rc<EmitterInner>,
}

struct EmitterInner {
    out: RefCell<Box<dyn Write>>,
    current_invoke: RefCell<Option<String>>,
}

impl Emitter {
    pub fn new(out: Box<dyn Write>) -> Self {
        Self {
            inner: Rc::new(EmitterInner {
                out: RefCell::new(out),
                current_invoke: RefCell::new(None),
            }),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Emitted exactly once, after the bundle's handler is retained.
    pub fn ready(&self, worker_id: &str) {
        self.send(&OutboundRecord {
            id: worker_id,
            body: OutboundBody::Ready {},
        });
    }

    pub fn response(&self, id: &str, payload: &ResponsePayload) {
        self.send(&OutboundRecord {
            id,
            body: OutboundBody::Response(payload),
        });
    }

    pub fn error(&self, id: &str, code: ErrorCode, message: &str) {
        self.send(&OutboundRecord {
            id,
            body: OutboundBody::Error { message, code },
        });
    }

    /// A guest `console` line. Tagged with the running invocation's id, or
    /// `"bundle"` when emitted outside a handler frame (top-level bundle
    /// code).
    pub fn log(&self, level: LogLevel, message: &str) {
        let current = self.inner.current_invoke.borrow();
        let id = current.as_deref().unwrap_or("bundle");
        self.send(&OutboundRecord {
            id,
            body: OutboundBody::Log { level, message },
        });
    }

    /// Marks `id` as the running invocation for the lifetime of the
    /// returned guard. The slot is cleared on drop, so every exit path
    /// out of the dispatcher untags the console bridge.
    pub fn begin_invocation(&self, id: &str) -> InvocationScope<'_> {
        *self.inner.current_invoke.borrow_mut() = Some(id.to_owned());
        InvocationScope { emitter: self }
    }

    fn send(&self, record: &OutboundRecord<'_>) {
        let mut line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(err) => {
                error!("failed to serialize wire record: {err}");
                return;
            }
        };
        line.push('\n');

        let mut out = self.inner.out.borrow_mut();
        if let Err(err) = out.write_all(line.as_bytes()).and_then(|()| out.flush()) {
            error!("failed to write wire record: {err}");
        }
    }
}

/// RAII guard returned by [`Emitter::begin_invocation`].
pub struct InvocationScope<'a> {
    emitter: &'a Emitter,
}

impl Drop for InvocationScope<'_> {
    fn drop(&mut self) {
        *self.emitter.inner.current_invoke.borrow_mut() = None;
    }
}
