//! Error types for simplerpc.
//!
//! Every variant carries owned messages rather than foreign error values so
//! the enum stays `Clone`: a single fatal connection error has to be handed
//! to every call that was still pending on that connection.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::context::ContextError;

/// Main error type for the RPC runtime.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("connection is shut down")]
    Shutdown,

    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("rpc client: unexpected HTTP response: {0}")]
    UnexpectedHttpResponse(String),

    #[error("rpc client: wrong address format '{0}', expect protocol@addr")]
    InvalidAddress(String),

    // Serialization errors
    #[error("codec error: {message}")]
    Codec { message: String },

    #[error("invalid codec type {0}")]
    InvalidCodec(String),

    #[error("handshake error: {message}")]
    Handshake { message: String },

    // Call outcome errors
    #[error("rpc client: call failed: {0}")]
    CallFailed(ContextError),

    #[error("reading body {message}")]
    ReplyDecode { message: String },

    /// Error string reported by the remote side in the response header.
    #[error("{0}")]
    Server(String),

    // Dispatch errors (server side)
    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormedServiceMethod(String),

    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),

    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),

    #[error("rpc server: request handle timeout: expect within {0:?}")]
    HandleTimeout(Duration),

    // Registration errors
    #[error("rpc: service already defined: {0}")]
    DuplicateService(String),

    #[error("rpc server: {0} is not a valid service name")]
    InvalidServiceName(String),

    // Discovery errors
    #[error("rpc discovery: no available servers")]
    NoAvailableServers,

    #[error("rpc registry: {message}")]
    Registry { message: String },
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Codec {
            message: err.to_string(),
        }
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        RpcError::Codec {
            message: err.to_string(),
        }
    }
}

impl From<rmp_serde::decode::Error> for RpcError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        RpcError::Codec {
            message: err.to_string(),
        }
    }
}

impl RpcError {
    /// Create a registry error from any displayable cause.
    pub fn registry(message: impl std::fmt::Display) -> Self {
        RpcError::Registry {
            message: message.to_string(),
        }
    }

    /// Whether the peer went away cleanly rather than failing mid-stream.
    pub fn is_disconnect(&self) -> bool {
        match self {
            RpcError::ConnectionClosed => true,
            RpcError::Io {
                source: Some(err), ..
            } => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
