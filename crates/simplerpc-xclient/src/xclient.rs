//! Multi-server client: load-balanced calls and broadcast.
//!
//! Addresses come from a [`Discovery`] in `protocol@addr` form and are dialed
//! lazily. Connections are pooled per address; a pooled client that is no
//! longer available is evicted and redialed on next use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use simplerpc::{xdial, Client, Context, Options, Result, RpcError};
use tracing::debug;

use crate::discovery::{Discovery, SelectMode};

pub struct XClient {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    options: Options,
    clients: tokio::sync::Mutex<HashMap<String, Client>>,
}

struct BroadcastState<'a, R> {
    err: Option<RpcError>,
    /// Taken by the first successful call.
    reply: Option<&'a mut R>,
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, options: Options) -> Self {
        Self {
            discovery,
            mode,
            options,
            clients: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn discovery(&self) -> &Arc<dyn Discovery> {
        &self.discovery
    }

    pub fn mode(&self) -> SelectMode {
        self.mode
    }

    /// Number of pooled connections.
    pub async fn pool_size(&self) -> usize {
        self.clients.lock().await.len()
    }

    async fn dial(&self, rpc_addr: &str) -> Result<Client> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            debug!("rpc xclient: evicting unavailable client for {}", rpc_addr);
            if let Some(stale) = clients.remove(rpc_addr) {
                // Close outside the pool lock; it waits on the client's writer.
                tokio::spawn(async move {
                    let _ = stale.close().await;
                });
            }
        }

        let client = xdial(rpc_addr, self.options.clone()).await?;
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    async fn call_addr<A, R>(
        &self,
        rpc_addr: &str,
        ctx: &Context,
        service_method: &str,
        args: &A,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let client = self.dial(rpc_addr).await?;
        client.call(ctx, service_method, args).await
    }

    /// Call one server picked by the select mode.
    pub async fn call<A, R>(&self, ctx: &Context, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        self.call_addr(&rpc_addr, ctx, service_method, args).await
    }

    /// Call every known server concurrently.
    ///
    /// The first error cancels the calls still in flight and is returned.
    /// If `reply` is given it receives the first successful reply; later
    /// replies never overwrite it.
    pub async fn broadcast<A, R>(
        &self,
        ctx: &Context,
        service_method: &str,
        args: &A,
        reply: Option<&mut R>,
    ) -> Result<()>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let servers = self.discovery.get_all().await?;
        let ctx = ctx.child();
        let state = Mutex::new(BroadcastState { err: None, reply });
        let (shared_ctx, shared_state) = (&ctx, &state);

        let calls = servers.iter().map(move |rpc_addr| {
            let (ctx, state) = (shared_ctx, shared_state);
            async move {
                let result = self.call_addr::<A, R>(rpc_addr, ctx, service_method, args).await;

                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                match result {
                    Ok(value) => {
                        if let Some(slot) = state.reply.take() {
                            *slot = value;
                        }
                    }
                    Err(e) => {
                        debug!("rpc xclient: broadcast to {} failed: {}", rpc_addr, e);
                        if state.err.is_none() {
                            state.err = Some(e);
                            ctx.cancel();
                        }
                    }
                }
            }
        });
        join_all(calls).await;

        let state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        match state.err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Close every pooled connection.
    pub async fn close(&self) -> Result<()> {
        let mut clients = self.clients.lock().await;
        for (rpc_addr, client) in clients.drain() {
            if let Err(e) = client.close().await {
                debug!("rpc xclient: closing {}: {}", rpc_addr, e);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for XClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XClient")
            .field("mode", &self.mode)
            .field("options", &self.options)
            .finish()
    }
}
