//! Error taxonomy.
//!
//! Each layer has its own error enum (`TransportError`, `RegistryError`,
//! `LoadBalancerError`). The invoker classifies them into [`RpcError`], the
//! single error type callers ever see. Every `RpcError` message names the
//! pipeline [`Stage`] it failed at.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::responses::ErrorInfo;

/// Failures while moving bytes to or from a remote endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("codec error: {0}")]
    Codec(String),
}

impl TransportError {
    /// Map IO errors to transport error variants
    ///
    /// - Timeouts/would block -> `Timeout`
    /// - Refused/unreachable -> `ConnectionRefused`
    /// - Reset/aborted/EOF -> `Closed`
    /// - Other IO errors -> `Io`
    pub fn from_io(err: std::io::Error, context: &str, timeout_ms: u64) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::TimedOut | Io::WouldBlock => TransportError::Timeout(timeout_ms),
            Io::ConnectionRefused | Io::AddrNotAvailable => {
                TransportError::ConnectionRefused(format!("{}: {}", context, err))
            }
            Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::UnexpectedEof => TransportError::Closed(format!("{}: {}", context, err)),
            _ => TransportError::Io(format!("{}: {}", context, err)),
        }
    }
}

/// Failures reported by the registry client or one of its backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("no registered instances for service '{0}'")]
    NotFound(String),

    #[error("registry key '{0}' is owned by another session")]
    Conflict(String),

    #[error("invalid registry entry: {0}")]
    Codec(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadBalancerError {
    #[error("no available instance for service '{0}'")]
    NoAvailableInstance(String),
}

/// Pipeline stage a call failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Resolve,
    Select,
    Send,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolve => "resolve",
            Stage::Select => "select",
            Stage::Send => "send",
        };
        f.write_str(name)
    }
}

/// Coarse classification used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Codec,
    RegistryUnavailable,
    NotFound,
    Conflict,
    NoAvailableInstance,
    PoolExhausted,
    Application,
    RetryExhausted,
}

/// The caller-facing error for a remote invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("[resolve] no provider available for service '{service}'")]
    NoProviderAvailable { service: String },

    #[error("[{stage}] {source}")]
    Registry { stage: Stage, source: RegistryError },

    #[error("[select] {0}")]
    LoadBalancer(#[from] LoadBalancerError),

    #[error("[{stage}] transport error talking to {instance}: {source}")]
    Transport {
        stage: Stage,
        instance: String,
        source: TransportError,
    },

    #[error("[{stage}] timed out after {after_ms}ms (instance: {})", .instance.as_deref().unwrap_or("none"))]
    Timeout {
        stage: Stage,
        instance: Option<String>,
        after_ms: u64,
    },

    #[error("[send] connection pool for {instance} exhausted after {waited_ms}ms")]
    PoolExhausted { instance: String, waited_ms: u64 },

    #[error("[send] remote exception: {0}")]
    Application(ErrorInfo),

    #[error("[{stage}] codec error: {message}")]
    Codec { stage: Stage, message: String },

    #[error("retries exhausted after {attempts} attempts, last failure: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<RpcError>,
    },
}

impl RpcError {
    /// Wraps a transport failure observed while talking to `instance`.
    ///
    /// Transport timeouts become [`RpcError::Timeout`] so they classify as
    /// [`ErrorKind::Timeout`].
    pub fn from_transport(stage: Stage, instance: impl Into<String>, source: TransportError) -> Self {
        match source {
            TransportError::Timeout(after_ms) => RpcError::Timeout {
                stage,
                instance: Some(instance.into()),
                after_ms,
            },
            TransportError::Codec(message) => RpcError::Codec { stage, message },
            source => RpcError::Transport {
                stage,
                instance: instance.into(),
                source,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::NoProviderAvailable { .. } => ErrorKind::NotFound,
            RpcError::Registry { source, .. } => match source {
                RegistryError::Unavailable(_) => ErrorKind::RegistryUnavailable,
                RegistryError::NotFound(_) => ErrorKind::NotFound,
                RegistryError::Conflict(_) => ErrorKind::Conflict,
                RegistryError::Codec(_) => ErrorKind::Codec,
            },
            RpcError::LoadBalancer(_) => ErrorKind::NoAvailableInstance,
            RpcError::Transport { .. } => ErrorKind::Transport,
            RpcError::Timeout { .. } => ErrorKind::Timeout,
            RpcError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            RpcError::Application(_) => ErrorKind::Application,
            RpcError::Codec { .. } => ErrorKind::Codec,
            RpcError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
        }
    }

    /// Stage the (last) failure happened in.
    pub fn stage(&self) -> Stage {
        match self {
            RpcError::NoProviderAvailable { .. } => Stage::Resolve,
            RpcError::Registry { stage, .. }
            | RpcError::Transport { stage, .. }
            | RpcError::Timeout { stage, .. }
            | RpcError::Codec { stage, .. } => *stage,
            RpcError::LoadBalancer(_) => Stage::Select,
            RpcError::PoolExhausted { .. } | RpcError::Application(_) => Stage::Send,
            RpcError::RetryExhausted { last, .. } => last.stage(),
        }
    }

    /// Identity (`host:port`) of the instance the failure is attributed to.
    pub fn instance(&self) -> Option<&str> {
        match self {
            RpcError::Transport { instance, .. } | RpcError::PoolExhausted { instance, .. } => {
                Some(instance)
            }
            RpcError::Timeout { instance, .. } => instance.as_deref(),
            RpcError::RetryExhausted { last, .. } => last.instance(),
            _ => None,
        }
    }

    /// The concrete failure behind any retry wrapping.
    pub fn root(&self) -> &RpcError {
        match self {
            RpcError::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

pub type Result<T, E = RpcError> = std::result::Result<T, E>;
