//! Outstanding calls and the ledger that tracks them.
//!
//! A [`Call`] is registered in the [`CallLedger`] under its sequence number
//! before its request goes on the wire. Whoever removes it from the ledger
//! (the receive loop on a response, the sender on a write failure, a caller
//! giving up, or connection teardown) owns it and is the only party allowed to
//! complete it, so each call completes at most once.

use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::debug;

use crate::codec::CodecType;
use crate::error::{Result, RpcError};

/// A single outstanding invocation.
#[derive(Debug)]
pub struct Call {
    pub seq: u64,
    pub service_method: String,
    /// Encoded arguments as sent.
    pub args: Bytes,
    /// Encoded reply, present once the call succeeded.
    pub reply: Option<Bytes>,
    pub error: Option<RpcError>,
    codec: CodecType,
    done: mpsc::Sender<Call>,
}

impl Call {
    pub(crate) fn new(
        service_method: impl Into<String>,
        args: Bytes,
        codec: CodecType,
        done: mpsc::Sender<Call>,
    ) -> Self {
        Self {
            seq: 0,
            service_method: service_method.into(),
            args,
            reply: None,
            error: None,
            codec,
            done,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Decode the reply into a typed value.
    ///
    /// Returns the call's error if it failed, or a `ReplyDecode` error if the
    /// reply does not match `R`.
    pub fn decode_reply<R: DeserializeOwned>(&self) -> Result<R> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let body = self.reply.as_deref().unwrap_or_default();
        self.codec.decode(body).map_err(|e| RpcError::ReplyDecode {
            message: e.to_string(),
        })
    }

    pub(crate) fn fail(mut self, err: RpcError) {
        self.error = Some(err);
        self.complete();
    }

    pub(crate) fn succeed(mut self, reply: Bytes) {
        self.reply = Some(reply);
        self.complete();
    }

    /// Hand the call back to whoever is waiting on its completion channel.
    ///
    /// Never blocks the caller. A full channel is fed from a background task;
    /// a closed one means nobody is waiting any more.
    pub(crate) fn complete(self) {
        let done = self.done.clone();
        match done.try_send(self) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(call)) => {
                tokio::spawn(async move {
                    let _ = done.send(call).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(call)) => {
                debug!("rpc client: nobody waiting for call {} {}", call.seq, call.service_method);
            }
        }
    }
}

/// Pending calls plus the connection's lifecycle flags.
///
/// Both are guarded by the same lock so that registering a call and tearing
/// the connection down can never interleave.
#[derive(Debug)]
pub struct CallLedger {
    seq: u64,
    pending: HashMap<u64, Call>,
    /// Set by an explicit close.
    closing: bool,
    /// Set when a fatal transport error ended the connection.
    shutdown: bool,
}

impl Default for CallLedger {
    fn default() -> Self {
        Self {
            seq: 1,
            pending: HashMap::new(),
            closing: false,
            shutdown: false,
        }
    }
}

impl CallLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next sequence number to `call` and track it.
    ///
    /// A closing or shut-down ledger hands the call back untouched.
    pub fn register(&mut self, mut call: Call) -> std::result::Result<u64, Call> {
        if self.closing || self.shutdown {
            return Err(call);
        }
        let seq = self.seq;
        call.seq = seq;
        self.pending.insert(seq, call);
        self.seq += 1;
        Ok(seq)
    }

    pub fn remove(&mut self, seq: u64) -> Option<Call> {
        self.pending.remove(&seq)
    }

    /// Mark the ledger shut down and take every pending call.
    pub fn terminate(&mut self) -> Vec<Call> {
        self.shutdown = true;
        self.pending.drain().map(|(_, call)| call).collect()
    }

    /// Mark the ledger closing. Returns false if it already was.
    pub fn begin_close(&mut self) -> bool {
        if self.closing {
            return false;
        }
        self.closing = true;
        true
    }

    pub fn is_available(&self) -> bool {
        !self.closing && !self.shutdown
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn next_seq(&self) -> u64 {
        self.seq
    }
}
