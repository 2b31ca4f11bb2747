//! simplerpc - a multiplexed RPC runtime.
//!
//! A [`Client`] carries many concurrent calls over one connection, matching
//! responses to calls by sequence number. A [`Server`] dispatches requests to
//! services registered through an explicit builder and handles each request
//! in its own task. Bodies are encoded with a per-connection codec (JSON or
//! MessagePack) chosen in the handshake.
//!
//! For discovery and multi-server calls see the `simplerpc-xclient` crate;
//! the registry collaborator lives in `simplerpc-registry`.
//!
//! # Example
//!
//! ```rust,no_run
//! use simplerpc::{dial, Context, MethodResult, Options, Server, Service};
//! use std::sync::Arc;
//!
//! struct Foo;
//!
//! #[tokio::main]
//! async fn main() -> simplerpc::Result<()> {
//!     let server = Arc::new(Server::new());
//!     server.register(
//!         Service::builder(Foo)
//!             .method("Sum", |_: Arc<Foo>, (a, b): (i32, i32)| async move {
//!                 MethodResult::Ok(a + b)
//!             })
//!             .build()?,
//!     )?;
//!     let handle = server.start("127.0.0.1:0").await?;
//!
//!     let client = dial(&handle.addr().to_string(), Options::default()).await?;
//!     let sum: i32 = client.call(&Context::background(), "Foo.Sum", &(1, 2)).await?;
//!     assert_eq!(sum, 3);
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod protocol;
pub mod server;
pub mod service;

pub use call::{Call, CallLedger};
pub use client::{dial, xdial, Client};
#[cfg(unix)]
pub use client::dial_unix;
pub use codec::{CodecType, Header};
pub use config::{DiscoveryConfig, RegistryConfig, RpcConfig};
pub use context::{CancellationToken, Context, ContextError};
pub use error::{Result, RpcError};
pub use http::dial_http;
pub use protocol::Options;
pub use server::{Server, ServerHandle};
pub use service::{MethodError, MethodResult, MethodType, Service, ServiceBuilder};
