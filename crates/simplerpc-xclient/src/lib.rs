//! Discovery and multi-server calls for simplerpc.
//!
//! - [`MultiServersDiscovery`] - a fixed address list
//! - [`RegistryDiscovery`] - addresses fetched from a registry and cached
//! - [`XClient`] - picks a server per call, or broadcasts to all of them
//!
//! # Example
//!
//! ```rust,no_run
//! use simplerpc::{Context, Options};
//! use simplerpc_xclient::{MultiServersDiscovery, SelectMode, XClient};
//! use std::sync::Arc;
//!
//! # async fn run() -> simplerpc::Result<()> {
//! let discovery = MultiServersDiscovery::new(vec![
//!     "tcp@127.0.0.1:7001".to_string(),
//!     "tcp@127.0.0.1:7002".to_string(),
//! ]);
//! let xc = XClient::new(Arc::new(discovery), SelectMode::RoundRobin, Options::default());
//!
//! let _sum: i32 = xc.call(&Context::background(), "Foo.Sum", &(1, 2)).await?;
//! xc.broadcast::<_, i32>(&Context::background(), "Foo.Sum", &(1, 2), None).await?;
//! # Ok(())
//! # }
//! ```

pub mod discovery;
pub mod registry_discovery;
pub mod xclient;

pub use discovery::{Discovery, MultiServersDiscovery, SelectMode};
pub use registry_discovery::RegistryDiscovery;
pub use xclient::XClient;
