//! Discovery backed by a registry service.
//!
//! The address list is a cache of the registry's answer. It is refreshed at
//! most once per refresh interval; concurrent callers that find it stale wait
//! for the single in-flight lookup instead of issuing their own.

use std::time::Duration;

use async_trait::async_trait;
use simplerpc::{DiscoveryConfig, RegistryConfig, Result, RpcError};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::discovery::{Discovery, MultiServersDiscovery, SelectMode};

pub struct RegistryDiscovery {
    servers: MultiServersDiscovery,
    registry: String,
    refresh_interval: Duration,
    last_update: Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// Discover servers through the registry at `registry` (a full URL).
    ///
    /// A zero `refresh_interval` uses the default.
    pub fn new(registry: impl Into<String>, refresh_interval: Duration) -> Result<Self> {
        let refresh_interval = if refresh_interval.is_zero() {
            DiscoveryConfig::DEFAULT_REFRESH_INTERVAL
        } else {
            refresh_interval
        };

        let http = reqwest::Client::builder()
            .timeout(RegistryConfig::REQUEST_TIMEOUT)
            .user_agent("simplerpc/0.1")
            .build()
            .map_err(|e| RpcError::registry(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            servers: MultiServersDiscovery::default(),
            registry: registry.into(),
            refresh_interval,
            last_update: Mutex::new(None),
            http,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// The cached address list, without refreshing.
    pub fn cached_servers(&self) -> Vec<String> {
        self.servers.all()
    }

    async fn fetch(&self) -> Result<Vec<String>> {
        let response = self
            .http
            .get(&self.registry)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(RpcError::registry)?;

        let header = response
            .headers()
            .get(RegistryConfig::SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        Ok(parse_servers(header))
    }
}

impl std::fmt::Debug for RegistryDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryDiscovery")
            .field("registry", &self.registry)
            .field("refresh_interval", &self.refresh_interval)
            .field("servers", &self.servers.all())
            .finish()
    }
}

/// Split a comma-separated address list, dropping blanks.
pub fn parse_servers(header: &str) -> Vec<String> {
    header
        .split(',')
        .map(str::trim)
        .filter(|server| !server.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<()> {
        let mut last_update = self.last_update.lock().await;
        if let Some(at) = *last_update {
            if at.elapsed() < self.refresh_interval {
                return Ok(());
            }
        }

        debug!("rpc registry: refresh servers from registry {}", self.registry);
        let servers = self.fetch().await.map_err(|e| {
            warn!("rpc registry: refresh failed, keeping cached servers: {}", e);
            e
        })?;
        self.servers.replace(servers);
        *last_update = Some(Instant::now());
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        let mut last_update = self.last_update.lock().await;
        self.servers.replace(servers);
        *last_update = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh().await?;
        self.servers.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        Ok(self.servers.all())
    }
}
