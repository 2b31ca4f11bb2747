//! HTTP CONNECT transport.
//!
//! A client opens a TCP connection, sends `CONNECT /_simplerpc_ HTTP/1.0`,
//! waits for `HTTP/1.0 200 Connected to simplerpc`, and from then on speaks
//! the plain RPC protocol over the same stream.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::client::{with_connect_timeout, Client};
use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::protocol::Options;
use crate::server::Server;

/// Connect to a server started with [`Server::start_http`].
pub async fn dial_http(addr: &str, options: Options) -> Result<Client> {
    let timeout = options.connect_timeout;
    with_connect_timeout(timeout, async move {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let stream = connect_tunnel(stream, RpcConfig::DEFAULT_RPC_PATH).await?;
        Client::new(stream, options).await
    })
    .await
}

/// Send the CONNECT request and wait for the success status line.
///
/// Returns the buffered stream so no bytes read past the response are lost.
pub async fn connect_tunnel<S>(stream: S, path: &str) -> Result<BufReader<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    let request = format!("CONNECT {} HTTP/1.0\r\n\r\n", path);
    stream.get_mut().write_all(request.as_bytes()).await?;
    stream.get_mut().flush().await?;

    let head = read_head(&mut stream).await?;
    let status_line = head.first().map(String::as_str).unwrap_or_default();
    let status = status_line.split_once(' ').map(|(_, status)| status);
    if status != Some(RpcConfig::CONNECTED_STATUS) {
        return Err(RpcError::UnexpectedHttpResponse(status_line.to_string()));
    }
    Ok(stream)
}

/// Read an HTTP head up to the blank line. Lines are returned without their
/// terminators.
async fn read_head<S>(stream: &mut BufReader<S>) -> Result<Vec<String>>
where
    S: AsyncRead + Unpin,
{
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        if stream.read_line(&mut line).await? == 0 {
            return Err(RpcError::ConnectionClosed);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok(lines);
        }
        if lines.len() >= RpcConfig::MAX_HTTP_HEAD_LINES {
            return Err(RpcError::UnexpectedHttpResponse("header too long".to_string()));
        }
        lines.push(line.to_string());
    }
}

/// Serve one connection that is expected to open with an HTTP CONNECT.
pub(crate) async fn serve_http_conn(
    server: Arc<Server>,
    stream: TcpStream,
    shutdown: watch::Receiver<bool>,
) {
    let mut stream = BufReader::new(stream);
    let head = match read_head(&mut stream).await {
        Ok(head) => head,
        Err(e) => {
            debug!("rpc server: reading HTTP request: {}", e);
            return;
        }
    };

    let mut request_line = head.first().map(String::as_str).unwrap_or_default().split(' ');
    let method = request_line.next().unwrap_or_default();
    let path = request_line.next().unwrap_or_default();

    let rejection = if method != "CONNECT" {
        Some("405 Method Not Allowed\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n405 must CONNECT\n")
    } else if path != RpcConfig::DEFAULT_RPC_PATH {
        Some("404 Not Found\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n404 page not found\n")
    } else {
        None
    };

    if let Some(response) = rejection {
        warn!("rpc server: rejecting HTTP {} {}", method, path);
        let response = format!("HTTP/1.0 {}", response);
        let _ = stream.get_mut().write_all(response.as_bytes()).await;
        let _ = stream.get_mut().shutdown().await;
        return;
    }

    let connected = format!("HTTP/1.0 {}\r\n\r\n", RpcConfig::CONNECTED_STATUS);
    if let Err(e) = stream.get_mut().write_all(connected.as_bytes()).await {
        debug!("rpc server: writing CONNECT response: {}", e);
        return;
    }

    server.serve_until(stream, shutdown).await
}
