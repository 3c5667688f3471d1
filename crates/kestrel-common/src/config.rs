//! Resolved configuration.
//!
//! The core never reads files. Binaries build an [`RpcConfig`] however they
//! like (the `kestrel` CLI layers TOML files and environment variables) and
//! hand the resolved struct to the registry, client and server crates.
//!
//! Algorithm and backend names are closed sets: unknown identifiers are
//! rejected when the configuration is parsed, not when it is first used.

use serde::de::{self, Deserializer, Unexpected};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Error returned when a configuration identifier is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what} '{value}' (expected one of: {expected})")]
pub struct UnknownIdentifier {
    pub what: &'static str,
    pub value: String,
    pub expected: &'static str,
}

macro_rules! identifier_enum {
    ($(#[$meta:meta])* $name:ident, $what:literal, { $($variant:ident => $ident:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $ident)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $ident,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownIdentifier;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($ident => Ok($name::$variant),)+
                    _ => Err(UnknownIdentifier {
                        what: $what,
                        value: s.to_string(),
                        expected: concat!($($ident, " "),+),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

identifier_enum!(
    /// Load balancing algorithm.
    LoadBalancerKind, "load balancer", {
        RoundRobin => "roundRobin",
        Random => "random",
        ConsistentHash => "consistentHash",
    }
);

identifier_enum!(
    /// Registry backend.
    RegistryKind, "registry", {
        Etcd => "etcd",
        Zookeeper => "zookeeper",
        Memory => "memory",
    }
);

identifier_enum!(
    /// Retry strategy.
    RetryStrategyKind, "retry strategy", {
        FixedInterval => "fixedInterval",
        Exponential => "exponential",
        NoRetry => "noRetry",
    }
);

identifier_enum!(
    /// Body codec for request/response envelopes.
    SerializerKind, "serializer", {
        Json => "json",
        Postcard => "postcard",
    }
);

/// Registry connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub kind: RegistryKind,
    /// `http://host:port` for etcd, `host:port` for ZooKeeper; unused for memory
    pub address: String,
    /// Timeout for a single backend request
    pub timeout_ms: u64,
    /// Lease TTL (etcd) or session timeout (ZooKeeper)
    pub session_ttl_secs: u64,
    /// How often the lease/session is renewed
    #[serde(deserialize_with = "non_zero")]
    pub heartbeat_interval_secs: u64,
    /// Poll period for backends without push notification
    #[serde(deserialize_with = "non_zero")]
    pub watch_interval_ms: u64,
}

/// Periods drive `tokio::time::interval`, which rejects zero.
fn non_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = u64::deserialize(deserializer)?;
    if value == 0 {
        return Err(de::Error::invalid_value(Unexpected::Unsigned(0), &"a period greater than zero"));
    }
    Ok(value)
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: RegistryKind::Etcd,
            address: "http://127.0.0.1:2379".to_string(),
            timeout_ms: 10_000,
            session_ttl_secs: 30,
            heartbeat_interval_secs: 10,
            watch_interval_ms: 1_000,
        }
    }
}

impl RegistryConfig {
    pub fn memory() -> Self {
        Self {
            kind: RegistryKind::Memory,
            address: String::new(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// At least one second, even when the field was set to zero in code.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// At least one millisecond, even when the field was set to zero in code.
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms.max(1))
    }
}

/// Retry tuning shared by the fixed-interval and exponential strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Fixed delay, or the first delay for exponential backoff
    pub delay_ms: u64,
    /// Exponential backoff cap
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Randomise exponential delays within `[d/2, d]`
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 3_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Client connection pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections per instance address
    pub max_connections: usize,
    /// Maximum time to wait for a free connection
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_ms: 30_000,
        }
    }
}

/// Everything the core needs, fully resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub name: String,
    pub version: String,
    pub server_host: String,
    pub server_port: u16,
    pub serializer: SerializerKind,
    pub load_balancer: LoadBalancerKind,
    pub registry: RegistryConfig,
    pub retry_strategy: RetryStrategyKind,
    pub retry: RetryConfig,
    pub call_timeout_ms: u64,
    /// Skip instances that already failed during the same call when retrying
    pub exclude_failed_on_retry: bool,
    pub pool: PoolConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            name: "kestrel".to_string(),
            version: "1.0".to_string(),
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            serializer: SerializerKind::Json,
            load_balancer: LoadBalancerKind::RoundRobin,
            registry: RegistryConfig::default(),
            retry_strategy: RetryStrategyKind::NoRetry,
            retry: RetryConfig::default(),
            call_timeout_ms: 5_000,
            exclude_failed_on_retry: true,
            pool: PoolConfig::default(),
        }
    }
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
