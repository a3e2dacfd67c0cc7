//! The serve loop: invocations are processed strictly in stdin arrival
//! order, one at a time. A handler's promise is driven to completion
//! before the next line is read, so records for invocation N are always
//! fully emitted before any record of invocation N+1.

use std::io::BufRead;

use tracing::debug;

use crate::WorkerRuntime;
use crate::wire::{Emitter, ErrorCode, InboundRecord, InvokePayload, RecordReader};

pub struct Dispatcher {
    runtime: WorkerRuntime,
    emitter: Emitter,
}

impl Dispatcher {
    pub fn new(runtime: WorkerRuntime, emitter: Emitter) -> Self {
        Self { runtime, emitter }
    }

    /// Serves until end of input. Codec-level problems are stderr
    /// diagnostics handled inside the reader; only EOF ends the loop.
    pub fn serve(&mut self, input: impl BufRead) {
        let mut records = RecordReader::new(input);
        while let Some(record) = records.next_record() {
            match record.kind.as_str() {
                "invoke" => self.dispatch(record),
                // Unknown record types are ignored for forward compatibility.
                other => debug!("ignoring record of unknown type {other:?}"),
            }
        }
    }

    /// Emits exactly one of `response` or `error` for the record.
    fn dispatch(&mut self, record: InboundRecord) {
        let invocation = match record.payload.map(serde_json::from_value::<InvokePayload>) {
            Some(Ok(invocation)) => invocation,
            Some(Err(err)) => {
                self.emitter.error(
                    &record.id,
                    ErrorCode::InvalidMessage,
                    &format!("Malformed invoke payload: {err}"),
                );
                return;
            }
            None => {
                self.emitter.error(
                    &record.id,
                    ErrorCode::InvalidMessage,
                    "Missing payload in invoke message",
                );
                return;
            }
        };

        // Tag console output with this invocation until its terminating
        // record is out; the guard clears the slot on every path.
        let _scope = self.emitter.begin_invocation(&record.id);
        match self.runtime.invoke(&invocation) {
            Ok(response) => self.emitter.response(&record.id, &response),
            Err(err) => self.emitter.error(&record.id, err.code, &err.message),
        }
    }
}
