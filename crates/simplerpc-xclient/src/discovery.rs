//! Server discovery over a fixed list of addresses.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rand::Rng;
use simplerpc::{Result, RpcError};

/// How a single server is picked from the known set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniformly at random.
    #[default]
    Random,
    /// Cycle through the list in order.
    RoundRobin,
}

/// A source of server addresses.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Reload the address list from wherever it comes from.
    async fn refresh(&self) -> Result<()>;

    /// Replace the address list.
    async fn update(&self, servers: Vec<String>) -> Result<()>;

    /// Pick one address.
    async fn get(&self, mode: SelectMode) -> Result<String>;

    /// Every known address.
    async fn get_all(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Default)]
struct ServerList {
    servers: Vec<String>,
    index: usize,
}

/// Discovery over a list of addresses supplied by the caller.
#[derive(Debug, Default)]
pub struct MultiServersDiscovery {
    state: Mutex<ServerList>,
}

impl MultiServersDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            state: Mutex::new(ServerList { servers, index: 0 }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServerList> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn replace(&self, servers: Vec<String>) {
        self.state().servers = servers;
    }

    pub fn select(&self, mode: SelectMode) -> Result<String> {
        let mut state = self.state();
        let n = state.servers.len();
        if n == 0 {
            return Err(RpcError::NoAvailableServers);
        }
        match mode {
            SelectMode::Random => {
                let i = rand::rng().random_range(0..n);
                Ok(state.servers[i].clone())
            }
            SelectMode::RoundRobin => {
                // The list may have shrunk since the last pick.
                let server = state.servers[state.index % n].clone();
                state.index = (state.index + 1) % n;
                Ok(server)
            }
        }
    }

    pub fn all(&self) -> Vec<String> {
        self.state().servers.clone()
    }
}

#[async_trait]
impl Discovery for MultiServersDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.replace(servers);
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.all())
    }
}
