//! Service registry: named dispatch tables built once at startup.
//!
//! A [`Service`] binds a receiver value to a set of typed async handlers.
//! Each handler is stored behind a type-erased invoker that decodes the
//! request body into the handler's argument type and encodes its reply, so the
//! server only ever moves bytes.
//!
//! # Example
//!
//! ```
//! use simplerpc::service::{MethodResult, Service};
//! use std::sync::Arc;
//!
//! struct Arith;
//!
//! let service = Service::builder(Arith)
//!     .method("Add", |_: Arc<Arith>, (a, b): (i64, i64)| async move {
//!         MethodResult::Ok(a + b)
//!     })
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(service.name(), "Arith");
//! assert!(service.method("Add").is_some());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::codec::CodecType;
use crate::error::{Result, RpcError};

/// Failure returned by a service method. Its message becomes the response
/// header's error string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError(pub String);

impl MethodError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MethodError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MethodError {}

impl From<String> for MethodError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for MethodError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<RpcError> for MethodError {
    fn from(err: RpcError) -> Self {
        Self(err.to_string())
    }
}

/// Result type returned by service methods.
pub type MethodResult<R> = std::result::Result<R, MethodError>;

/// A running invocation: resolves to the encoded reply or an error message.
pub type Invocation = BoxFuture<'static, std::result::Result<Vec<u8>, String>>;

/// A decoded request ready to be invoked.
pub struct PreparedCall {
    invocation: Invocation,
}

trait Invoke: Send + Sync {
    fn prepare(&self, codec: CodecType, body: &[u8]) -> Result<Invocation>;
}

struct Handler<S, A, R, F> {
    receiver: Arc<S>,
    func: F,
    _types: PhantomData<fn(A) -> R>,
}

impl<S, A, R, F, Fut> Invoke for Handler<S, A, R, F>
where
    S: Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MethodResult<R>> + Send + 'static,
{
    fn prepare(&self, codec: CodecType, body: &[u8]) -> Result<Invocation> {
        let args: A = codec.decode(body)?;
        let reply = (self.func)(Arc::clone(&self.receiver), args);
        Ok(Box::pin(async move {
            let reply = reply.await.map_err(|e| e.0)?;
            codec.encode(&reply).map_err(|e| e.to_string())
        }))
    }
}

/// One registered method.
pub struct MethodType {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    invoker: Box<dyn Invoke>,
    num_calls: AtomicU64,
}

impl MethodType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Number of times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::SeqCst)
    }

    /// Decode a request body into this method's argument type.
    pub fn prepare(&self, codec: CodecType, body: &[u8]) -> Result<PreparedCall> {
        let invocation = self.invoker.prepare(codec, body)?;
        Ok(PreparedCall { invocation })
    }

    /// Count the call and hand back the running handler.
    pub fn invoke(&self, call: PreparedCall) -> Invocation {
        self.num_calls.fetch_add(1, Ordering::SeqCst);
        call.invocation
    }
}

impl std::fmt::Debug for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodType")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("num_calls", &self.num_calls())
            .finish()
    }
}

/// A named receiver with its methods.
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
}

impl Service {
    pub fn builder<S: Send + Sync + 'static>(receiver: S) -> ServiceBuilder<S> {
        ServiceBuilder::new(Arc::new(receiver))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<Arc<MethodType>> {
        self.methods.get(name).cloned()
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Builder for [`Service`].
pub struct ServiceBuilder<S> {
    receiver: Arc<S>,
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
}

impl<S: Send + Sync + 'static> ServiceBuilder<S> {
    /// Start a service around a shared receiver. The name defaults to the
    /// receiver's type name.
    pub fn new(receiver: Arc<S>) -> Self {
        Self {
            receiver,
            name: short_type_name::<S>().to_string(),
            methods: HashMap::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Register a method. Names that are not exported identifiers are skipped.
    pub fn method<A, R, F, Fut>(mut self, name: &str, func: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult<R>> + Send + 'static,
    {
        if !is_exported(name) {
            debug!("rpc server: skipping unexported method {}.{}", self.name, name);
            return self;
        }

        let method = MethodType {
            name: name.to_string(),
            arg_type: std::any::type_name::<A>(),
            reply_type: std::any::type_name::<R>(),
            invoker: Box::new(Handler {
                receiver: Arc::clone(&self.receiver),
                func,
                _types: PhantomData,
            }),
            num_calls: AtomicU64::new(0),
        };
        if self.methods.insert(name.to_string(), Arc::new(method)).is_some() {
            warn!("rpc server: method {}.{} registered twice", self.name, name);
        }
        self
    }

    pub fn build(self) -> Result<Service> {
        if !is_exported(&self.name) {
            return Err(RpcError::InvalidServiceName(self.name));
        }
        for method in self.methods.values() {
            debug!("rpc server: register {}.{}", self.name, method.name);
        }
        Ok(Service {
            name: self.name,
            methods: self.methods,
        })
    }
}

/// Exported identifiers start with an ASCII uppercase letter.
pub fn is_exported(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
