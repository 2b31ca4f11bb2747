//! Server registry for simplerpc discovery.
//!
//! Servers announce themselves with periodic heartbeats; clients ask for the
//! list of servers whose last heartbeat is younger than the registry timeout.
//!
//! - `GET <path>` answers with the `X-Simplerpc-Servers` header holding the
//!   alive servers, sorted and comma separated.
//! - `POST <path>` with an `X-Simplerpc-Server` header records a heartbeat.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use simplerpc::{RegistryConfig, Result, RpcError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Tracks servers by the time of their last heartbeat.
#[derive(Debug)]
pub struct Registry {
    /// Zero means servers never expire.
    timeout: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::DEFAULT_TIMEOUT)
    }
}

impl Registry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn servers(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a heartbeat from `addr`.
    pub fn put_server(&self, addr: &str) {
        let previous = self.servers().insert(addr.to_string(), Instant::now());
        if previous.is_none() {
            info!("rpc registry: new server {}", addr);
        }
    }

    /// Servers with a recent heartbeat, sorted. Expired servers are dropped.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers();
        if !self.timeout.is_zero() {
            let timeout = self.timeout;
            servers.retain(|addr, last_seen| {
                let alive = last_seen.elapsed() < timeout;
                if !alive {
                    info!("rpc registry: server {} expired", addr);
                }
                alive
            });
        }

        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// Routes for the registry endpoint at `path`.
    pub fn router(self: Arc<Self>, path: &str) -> Router {
        Router::new()
            .route(path, get(handle_list).post(handle_heartbeat))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Serve the registry at [`RegistryConfig::DEFAULT_PATH`] on `addr`.
    pub async fn start(self: Arc<Self>, addr: &str) -> Result<RegistryHandle> {
        let app = self.router(RegistryConfig::DEFAULT_PATH);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("rpc registry: listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task_handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("rpc registry: server error: {}", e);
            }
        });

        Ok(RegistryHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        })
    }
}

async fn handle_list(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let servers = registry.alive_servers().join(",");
    [(RegistryConfig::SERVERS_HEADER, servers)]
}

async fn handle_heartbeat(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
) -> StatusCode {
    let addr = headers
        .get(RegistryConfig::SERVER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if addr.is_empty() {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    registry.put_server(addr);
    StatusCode::OK
}

/// Handle to a running registry. Dropping it shuts the registry down.
pub struct RegistryHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl RegistryHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Full URL of the registry endpoint.
    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, RegistryConfig::DEFAULT_PATH)
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for RegistryHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(RegistryConfig::REQUEST_TIMEOUT)
        .user_agent("simplerpc/0.1")
        .build()
        .map_err(|e| RpcError::registry(format!("Failed to create HTTP client: {}", e)))
}

/// Announce `addr` to the registry at `registry` once.
pub async fn send_heartbeat(http: &reqwest::Client, registry: &str, addr: &str) -> Result<()> {
    debug!("rpc registry: {} sends heartbeat to {}", addr, registry);
    http.post(registry)
        .header(RegistryConfig::SERVER_HEADER, addr)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| {
            error!("rpc server: heartbeat error: {}", e);
            RpcError::registry(e)
        })?;
    Ok(())
}

/// Keep announcing `addr` every `interval` until a heartbeat fails.
///
/// The first heartbeat is sent immediately. A zero `interval` leaves a
/// minute of margin inside the default registry timeout.
pub fn spawn_heartbeat(
    registry: impl Into<String>,
    addr: impl Into<String>,
    interval: Duration,
) -> JoinHandle<()> {
    let registry = registry.into();
    let addr = addr.into();
    let interval = if interval.is_zero() {
        RegistryConfig::DEFAULT_TIMEOUT - RegistryConfig::HEARTBEAT_MARGIN
    } else {
        interval
    };

    tokio::spawn(async move {
        let http = match http_client() {
            Ok(http) => http,
            Err(e) => {
                error!("rpc server: {}", e);
                return;
            }
        };

        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if send_heartbeat(&http, &registry, &addr).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alive_servers_sorted() {
        let registry = Registry::new(Duration::from_secs(60));
        registry.put_server("tcp@b:2");
        registry.put_server("tcp@a:1");
        registry.put_server("tcp@b:2");

        assert_eq!(registry.alive_servers(), vec!["tcp@a:1", "tcp@b:2"]);
    }

    #[test]
    fn test_expired_servers_are_evicted() {
        let registry = Registry::new(Duration::from_millis(20));
        registry.put_server("tcp@a:1");
        std::thread::sleep(Duration::from_millis(40));
        registry.put_server("tcp@b:2");

        assert_eq!(registry.alive_servers(), vec!["tcp@b:2"]);
        assert_eq!(registry.servers().len(), 1);
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let registry = Registry::new(Duration::ZERO);
        registry.put_server("tcp@a:1");
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(registry.alive_servers(), vec!["tcp@a:1"]);
    }

    #[test]
    fn test_default_timeout() {
        assert_eq!(Registry::default().timeout(), RegistryConfig::DEFAULT_TIMEOUT);
    }
}
