//! RPC client multiplexing concurrent calls over one connection.
//!
//! # Architecture
//!
//! ```text
//! caller ──go()──▶ [ledger: seq → Call] ──write lock──▶ CodecWriter ──▶ conn
//!                         ▲
//!                         └── receive loop ◀── CodecReader ◀── conn
//! ```
//!
//! Writes are serialized by an async mutex so a header is always followed by
//! its own body. The ledger sits behind a separate lock, which lets the
//! receive loop complete calls while a write is in flight.
//!
//! # Thread Safety
//!
//! `Client` is cheap to clone; every clone shares the same connection.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::call::{Call, CallLedger};
use crate::codec::{CodecReader, CodecType, CodecWriter, Header};
use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::protocol::{write_options, Options};

/// A connection to one RPC server.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    options: Options,
    writer: tokio::sync::Mutex<CodecWriter>,
    ledger: Arc<Mutex<CallLedger>>,
    loop_shutdown: watch::Sender<bool>,
}

fn lock_ledger(ledger: &Mutex<CallLedger>) -> MutexGuard<'_, CallLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClientInner {
    fn ledger(&self) -> MutexGuard<'_, CallLedger> {
        lock_ledger(&self.ledger)
    }

    fn remove_call(&self, seq: u64) -> Option<Call> {
        self.ledger().remove(seq)
    }

    /// Register `call` and write its request under the write lock.
    async fn send(&self, call: Call, body: Bytes) -> u64 {
        let mut writer = self.writer.lock().await;

        let service_method = call.service_method.clone();
        let registered = self.ledger().register(call);
        let seq = match registered {
            Ok(seq) => seq,
            Err(call) => {
                call.fail(RpcError::Shutdown);
                return 0;
            }
        };

        let header = Header::new(service_method, seq);
        if let Err(e) = writer.write(&header, &body).await {
            drop(writer);
            // The receive loop may already have consumed the call.
            if let Some(call) = self.remove_call(seq) {
                call.fail(e.clone());
            }
            self.terminate(&e);
        }
        seq
    }

    /// Fail every pending call and stop the receive loop.
    fn terminate(&self, err: &RpcError) {
        let pending = self.ledger().terminate();
        for call in pending {
            call.fail(err.clone());
        }
        let _ = self.loop_shutdown.send(true);
    }
}

impl Client {
    /// Perform the handshake on an established connection and start the
    /// receive loop.
    pub async fn new<S>(conn: S, options: Options) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(conn);
        if let Err(e) = write_options(&mut write_half, &options).await {
            warn!("rpc client: options error: {}", e);
            return Err(e);
        }

        let codec = options.codec_type;
        let reader = CodecReader::new(Box::new(read_half), codec);
        let writer = CodecWriter::new(Box::new(write_half), codec);
        let ledger = Arc::new(Mutex::new(CallLedger::new()));
        let (loop_shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(receive_loop(reader, Arc::clone(&ledger), shutdown_rx));

        Ok(Self {
            inner: Arc::new(ClientInner {
                options,
                writer: tokio::sync::Mutex::new(writer),
                ledger,
                loop_shutdown,
            }),
        })
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn codec(&self) -> CodecType {
        self.inner.options.codec_type
    }

    /// Start a call without waiting for it.
    ///
    /// The finished [`Call`] is delivered exactly once on `done`. Returns the
    /// call's sequence number, or 0 if the call failed before reaching the
    /// wire (in which case it has already been delivered with its error).
    ///
    /// The request is written by a separate task, so dropping the returned
    /// future never leaves a partial frame on the connection.
    pub async fn go<A>(&self, service_method: &str, args: &A, done: mpsc::Sender<Call>) -> u64
    where
        A: Serialize + ?Sized,
    {
        let mut call = Call::new(service_method, Bytes::new(), self.codec(), done);
        let body = match self.codec().encode(args) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                call.fail(e);
                return 0;
            }
        };
        call.args = body.clone();

        let inner = Arc::clone(&self.inner);
        let send = tokio::spawn(async move { inner.send(call, body).await });
        match send.await {
            Ok(seq) => seq,
            Err(e) => {
                warn!("rpc client: send task failed: {}", e);
                0
            }
        }
    }

    /// Call a remote method and wait for its reply or for `ctx` to finish.
    ///
    /// A cancelled call is forgotten locally; its response, if one arrives,
    /// is discarded. The connection stays usable.
    pub async fn call<A, R>(&self, ctx: &Context, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let (done, mut completed) = mpsc::channel(1);
        let seq = self.go(service_method, args, done).await;

        tokio::select! {
            call = completed.recv() => match call {
                Some(call) => call.decode_reply(),
                None => Err(RpcError::Shutdown),
            },
            err = ctx.done() => {
                self.inner.remove_call(seq);
                Err(RpcError::CallFailed(err))
            }
        }
    }

    /// Close the connection. Pending calls fail with `Shutdown`.
    ///
    /// Closing twice reports `Shutdown`.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.ledger().begin_close() {
            return Err(RpcError::Shutdown);
        }
        self.inner.terminate(&RpcError::Shutdown);
        self.inner.writer.lock().await.close().await
    }

    /// Whether the client can still accept calls.
    pub fn is_available(&self) -> bool {
        self.inner.ledger().is_available()
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.ledger().pending_len()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("codec", &self.codec())
            .field("available", &self.is_available())
            .finish()
    }
}

async fn receive_loop(
    mut reader: CodecReader,
    ledger: Arc<Mutex<CallLedger>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let err = loop {
        let header = tokio::select! {
            result = reader.read_header() => match result {
                Ok(header) => header,
                Err(e) => break e,
            },
            _ = shutdown.changed() => break RpcError::Shutdown,
        };

        let call = lock_ledger(&ledger).remove(header.seq);
        let body = match reader.read_body().await {
            Ok(body) => body,
            Err(e) => {
                if let Some(call) = call {
                    call.fail(e.clone());
                }
                break e;
            }
        };

        match call {
            None => debug!("rpc client: discarding response for seq {}", header.seq),
            Some(call) if header.has_error() => call.fail(RpcError::Server(header.error)),
            Some(call) => call.succeed(body),
        }
    };

    if err.is_disconnect() || matches!(err, RpcError::Shutdown) {
        debug!("rpc client: receive loop stopped: {}", err);
    } else {
        warn!("rpc client: receive loop failed: {}", err);
    }

    let pending = lock_ledger(&ledger).terminate();
    for call in pending {
        call.fail(err.clone());
    }
}

/// Race connection setup against `timeout`; zero means wait forever.
pub(crate) async fn with_connect_timeout<F>(timeout: Duration, connect: F) -> Result<Client>
where
    F: Future<Output = Result<Client>>,
{
    if timeout.is_zero() {
        return connect.await;
    }
    tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| RpcError::ConnectTimeout(timeout))?
}

/// Connect to an RPC server over TCP.
pub async fn dial(addr: &str, options: Options) -> Result<Client> {
    let timeout = options.connect_timeout;
    with_connect_timeout(timeout, async move {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Client::new(stream, options).await
    })
    .await
}

/// Connect to an RPC server over a Unix domain socket.
#[cfg(unix)]
pub async fn dial_unix(path: &str, options: Options) -> Result<Client> {
    let timeout = options.connect_timeout;
    with_connect_timeout(timeout, async move {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Client::new(stream, options).await
    })
    .await
}

/// Connect using an address of the form `protocol@addr`.
///
/// `http@host:port` dials through an HTTP CONNECT, `tcp@host:port` dials
/// plain TCP and, on unix, `unix@/path/to/socket` dials a Unix socket.
pub async fn xdial(rpc_addr: &str, options: Options) -> Result<Client> {
    let (protocol, addr) = rpc_addr
        .split_once('@')
        .ok_or_else(|| RpcError::InvalidAddress(rpc_addr.to_string()))?;

    match protocol {
        "http" => crate::http::dial_http(addr, options).await,
        "tcp" | "tcp4" | "tcp6" => dial(addr, options).await,
        #[cfg(unix)]
        "unix" => dial_unix(addr, options).await,
        _ => Err(RpcError::InvalidAddress(rpc_addr.to_string())),
    }
}
