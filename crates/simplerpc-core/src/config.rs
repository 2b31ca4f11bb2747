//! Centralized configuration for simplerpc.
//!
//! Protocol constants shared by clients, servers, discovery and the registry.

use std::time::Duration;

/// Wire protocol configuration.
pub struct RpcConfig;

impl RpcConfig {
    /// Identifies a simplerpc handshake; anything else is rejected.
    pub const MAGIC_NUMBER: u32 = 0x3bef5c;
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// Pause after a failed accept, e.g. when out of file descriptors.
    pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

    // HTTP CONNECT transport
    pub const DEFAULT_RPC_PATH: &'static str = "/_simplerpc_";
    pub const CONNECTED_STATUS: &'static str = "200 Connected to simplerpc";
    pub const MAX_HTTP_HEAD_LINES: usize = 64;
}

/// Registry collaborator configuration.
pub struct RegistryConfig;

impl RegistryConfig {
    pub const DEFAULT_PATH: &'static str = "/_simplerpc_/registry";
    /// Response header carrying the comma-separated list of alive servers.
    pub const SERVERS_HEADER: &'static str = "X-Simplerpc-Servers";
    /// Request header carrying the address announced by a heartbeat.
    pub const SERVER_HEADER: &'static str = "X-Simplerpc-Server";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
    pub const HEARTBEAT_MARGIN: Duration = Duration::from_secs(60);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Client-side discovery configuration.
pub struct DiscoveryConfig;

impl DiscoveryConfig {
    pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_fits_inside_registry_timeout() {
        assert!(RegistryConfig::HEARTBEAT_MARGIN < RegistryConfig::DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_accept_backoff_is_short_but_nonzero() {
        assert!(!RpcConfig::ACCEPT_ERROR_BACKOFF.is_zero());
        assert!(RpcConfig::ACCEPT_ERROR_BACKOFF < Duration::from_secs(1));
    }

    #[test]
    fn test_connected_status_is_a_success_code() {
        assert!(RpcConfig::CONNECTED_STATUS.starts_with("200 "));
    }
}
