//! RPC server: connection handshake, request dispatch and drain.
//!
//! Each accepted connection runs one dispatch loop that reads a header and
//! its body, resolves `Service.Method`, and spawns a task per request, so a
//! slow handler never holds up the requests behind it. Responses from those
//! tasks share one write lock per connection. When the loop hits a fatal read
//! error it stops reading, waits for every in-flight request to answer, and
//! only then closes the connection.
//!
//! # Thread Safety
//!
//! The server is shared as `Arc<Server>`; the service map sits behind a
//! `RwLock` that is only written during registration.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::codec::{CodecReader, CodecType, CodecWriter, Header, InvalidRequest};
use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::protocol::read_options;
use crate::service::{MethodType, PreparedCall, Service};

type SharedWriter = Arc<Mutex<CodecWriter>>;

/// Handle to a running server. Dropping it shuts the server down.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and tell every connection to drain.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Tcp,
    HttpConnect,
}

/// An RPC server holding registered services.
#[derive(Debug, Default)]
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a service. Each name can be registered once.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self
            .services
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if services.contains_key(service.name()) {
            return Err(RpcError::DuplicateService(service.name().to_string()));
        }
        info!(
            "rpc server: registered service {} ({} methods)",
            service.name(),
            service.method_names().len()
        );
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Resolve `Service.Method`, splitting on the last dot.
    pub fn find_method(&self, service_method: &str) -> Result<Arc<MethodType>> {
        let (service_name, method_name) = service_method
            .rsplit_once('.')
            .ok_or_else(|| RpcError::IllFormedServiceMethod(service_method.to_string()))?;
        let service = self
            .service(service_name)
            .ok_or_else(|| RpcError::ServiceNotFound(service_name.to_string()))?;
        service
            .method(method_name)
            .ok_or_else(|| RpcError::MethodNotFound(method_name.to_string()))
    }

    /// Bind `addr` and serve plain TCP connections in the background.
    pub async fn start(self: &Arc<Self>, addr: &str) -> Result<ServerHandle> {
        self.spawn_listener(addr, Transport::Tcp).await
    }

    /// Bind `addr` and serve connections that open with an HTTP CONNECT.
    pub async fn start_http(self: &Arc<Self>, addr: &str) -> Result<ServerHandle> {
        self.spawn_listener(addr, Transport::HttpConnect).await
    }

    async fn spawn_listener(self: &Arc<Self>, addr: &str, transport: Transport) -> Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("rpc server: listening on {} ({:?})", addr, transport);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(Arc::clone(self).accept_loop(
            listener,
            transport,
            async move {
                let _ = shutdown_rx.await;
            },
            conn_shutdown_rx,
        ));

        Ok(ServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    /// Serve plain TCP connections from `listener` until the task is dropped.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        let (_conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        self.accept_loop(listener, Transport::Tcp, std::future::pending(), conn_shutdown_rx)
            .await
    }

    /// Serve HTTP CONNECT connections from `listener` until the task is dropped.
    pub async fn accept_http(self: Arc<Self>, listener: TcpListener) {
        let (_conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        self.accept_loop(
            listener,
            Transport::HttpConnect,
            std::future::pending(),
            conn_shutdown_rx,
        )
        .await
    }

    async fn accept_loop<F>(
        self: Arc<Self>,
        listener: TcpListener,
        transport: Transport,
        shutdown: F,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("rpc server: shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("rpc server: connection from {}", peer_addr);
                            let _ = stream.set_nodelay(true);
                            let server = Arc::clone(&self);
                            let conn_shutdown = conn_shutdown_rx.clone();
                            tokio::spawn(async move {
                                match transport {
                                    Transport::Tcp => server.serve_until(stream, conn_shutdown).await,
                                    Transport::HttpConnect => {
                                        crate::http::serve_http_conn(server, stream, conn_shutdown).await
                                    }
                                }
                                debug!("rpc server: connection {} closed", peer_addr);
                            });
                        }
                        Err(e) => {
                            error!("rpc server: accept error: {}", e);
                            tokio::time::sleep(RpcConfig::ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }

    /// Serve one connection until the peer disconnects.
    pub async fn serve_conn<S>(self: Arc<Self>, conn: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.serve_until(conn, shutdown_rx).await
    }

    pub(crate) async fn serve_until<S>(self: Arc<Self>, conn: S, shutdown: watch::Receiver<bool>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut read_half, write_half) = tokio::io::split(conn);
        let options = match read_options(&mut read_half).await {
            Ok(options) => options,
            Err(e) => {
                warn!("rpc server: options error: {}", e);
                return;
            }
        };

        let codec = options.codec_type;
        let reader = CodecReader::new(Box::new(read_half), codec);
        let writer = Arc::new(Mutex::new(CodecWriter::new(Box::new(write_half), codec)));
        self.dispatch_loop(reader, writer, options.handle_timeout, shutdown)
            .await
    }

    async fn dispatch_loop(
        &self,
        mut reader: CodecReader,
        writer: SharedWriter,
        handle_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let codec = reader.codec();
        let mut in_flight = JoinSet::new();

        loop {
            let header = tokio::select! {
                result = reader.read_header() => match result {
                    Ok(header) => header,
                    Err(e) => {
                        if !e.is_disconnect() {
                            warn!("rpc server: read header error: {}", e);
                        }
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            };

            let body = match reader.read_body().await {
                Ok(body) => body,
                Err(e) => {
                    warn!("rpc server: read body error for {}: {}", header.service_method, e);
                    break;
                }
            };

            while in_flight.try_join_next().is_some() {}

            let prepared = self
                .find_method(&header.service_method)
                .and_then(|method| method.prepare(codec, &body).map(|call| (method, call)));
            match prepared {
                Ok((method, call)) => {
                    in_flight.spawn(handle_request(
                        Arc::clone(&writer),
                        header,
                        method,
                        call,
                        handle_timeout,
                    ));
                }
                Err(e) => {
                    debug!("rpc server: rejecting {}: {}", header.service_method, e);
                    send_error(&writer, header, &e.to_string()).await;
                }
            }
        }

        while in_flight.join_next().await.is_some() {}

        if let Err(e) = writer.lock().await.close().await {
            debug!("rpc server: close error: {}", e);
        }
    }
}

/// Run one request and send exactly one response for it.
///
/// The handler runs detached; on timeout its eventual result is dropped.
async fn handle_request(
    writer: SharedWriter,
    mut header: Header,
    method: Arc<MethodType>,
    call: PreparedCall,
    handle_timeout: Duration,
) {
    let (result_tx, result_rx) = oneshot::channel();
    let invocation = method.invoke(call);
    tokio::spawn(async move {
        let _ = result_tx.send(invocation.await);
    });

    let outcome = if handle_timeout.is_zero() {
        result_rx.await
    } else {
        match tokio::time::timeout(handle_timeout, result_rx).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let err = RpcError::HandleTimeout(handle_timeout);
                warn!("rpc server: {} {}", header.service_method, err);
                send_error(&writer, header, &err.to_string()).await;
                return;
            }
        }
    };

    match outcome {
        Ok(Ok(reply)) => send_response(&writer, &header, &reply).await,
        Ok(Err(message)) => {
            header.error = message;
            let placeholder = placeholder_body(writer.lock().await.codec());
            send_response(&writer, &header, &placeholder).await;
        }
        Err(_) => {
            let message = format!("rpc server: method {} panicked", header.service_method);
            error!("{}", message);
            send_error(&writer, header, &message).await;
        }
    }
}

fn placeholder_body(codec: CodecType) -> Vec<u8> {
    codec.encode(&InvalidRequest {}).unwrap_or_default()
}

async fn send_error(writer: &SharedWriter, mut header: Header, message: &str) {
    header.error = message.to_string();
    let mut writer = writer.lock().await;
    let body = placeholder_body(writer.codec());
    if let Err(e) = writer.write(&header, &body).await {
        error!("rpc server: write response error: {}", e);
    }
}

async fn send_response(writer: &SharedWriter, header: &Header, body: &[u8]) {
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write(header, body).await {
        error!("rpc server: write response error: {}", e);
    }
}
