//! # Kestrel CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve the demo UserService on port 9001, registered in etcd
//! kestrel provider --port 9001 --registry http://127.0.0.1:2379
//!
//! # Same, with settings from ./conf/application.toml and application-prod.toml
//! kestrel provider --config-dir conf --profile prod
//!
//! # Call a method (outputs raw JSON)
//! kestrel call UserService getUser --args '[42]'
//!
//! # Pin calls for one user to one instance
//! kestrel call UserService getUser --args '[42]' --load-balancer consistentHash --affinity-key user-42
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use argh::FromArgs;
use kestrel_client::{CallOptions, KestrelClient};
use kestrel_common::config::{LoadBalancerKind, RegistryKind, RetryStrategyKind, RpcConfig};
use kestrel_registry::RegistryClient;
use kestrel_server::Provider;
use serde_json::Value;

#[derive(FromArgs)]
/// Kestrel - RPC with service discovery
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Provider(ProviderArgs),
    Call(CallArgs),
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "provider")]
/// serve the demo UserService and register it
struct ProviderArgs {
    /// directory holding application.toml
    #[argh(option, long = "config-dir", default = "PathBuf::from(\".\")")]
    config_dir: PathBuf,

    /// configuration profile; also reads application-{profile}.toml
    #[argh(option, long = "profile")]
    profile: Option<String>,

    /// host to bind and advertise
    #[argh(option, long = "host")]
    host: Option<String>,

    /// port to bind and advertise
    #[argh(option, short = 'p', long = "port")]
    port: Option<u16>,

    /// registry backend (etcd, zookeeper or memory)
    #[argh(option, long = "registry-kind")]
    registry_kind: Option<RegistryKind>,

    /// registry address
    #[argh(option, long = "registry")]
    registry: Option<String>,

    /// name reported by the echo method
    #[argh(option, long = "name")]
    name: Option<String>,
}

/// Arguments for making a single RPC call.
///
/// Prints the raw JSON result to stdout, so the output can be piped into
/// other tools. Errors go to stderr with a non-zero exit code.
#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "call")]
/// call a method on a registered service
struct CallArgs {
    /// service name
    #[argh(positional)]
    service: String,

    /// method name
    #[argh(positional)]
    method: String,

    /// JSON parameters: an array holds one value per parameter, anything else is a single parameter
    #[argh(option, short = 'a', long = "args", default = "\"[]\".into()")]
    args: String,

    /// directory holding application.toml
    #[argh(option, long = "config-dir", default = "PathBuf::from(\".\")")]
    config_dir: PathBuf,

    /// configuration profile; also reads application-{profile}.toml
    #[argh(option, long = "profile")]
    profile: Option<String>,

    /// registry backend (etcd, zookeeper or memory)
    #[argh(option, long = "registry-kind")]
    registry_kind: Option<RegistryKind>,

    /// registry address
    #[argh(option, long = "registry")]
    registry: Option<String>,

    /// load balancer (roundRobin, random or consistentHash)
    #[argh(option, long = "load-balancer")]
    load_balancer: Option<LoadBalancerKind>,

    /// retry strategy (fixedInterval, exponential or noRetry)
    #[argh(option, long = "retry")]
    retry: Option<RetryStrategyKind>,

    /// routing key for consistent hashing
    #[argh(option, long = "affinity-key")]
    affinity_key: Option<String>,

    /// overall deadline for the call in milliseconds
    #[argh(option, long = "timeout-ms")]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // `call` keeps stdout clean for piping
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Provider(args) => run_provider(args).await,
        Commands::Call(args) => run_call(args).await,
    }
}

fn provider_config(args: &ProviderArgs) -> Result<RpcConfig> {
    let mut config = kestrel_cli::load_config(&args.config_dir, args.profile.clone())?;
    if let Some(host) = &args.host {
        config.server_host = host.clone();
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(kind) = args.registry_kind {
        config.registry.kind = kind;
    }
    if let Some(address) = &args.registry {
        config.registry.address = address.clone();
    }
    Ok(config)
}

async fn run_provider(args: ProviderArgs) -> Result<()> {
    let config = provider_config(&args)?;
    let name = args.name.clone().unwrap_or_else(|| config.name.clone());

    tracing::info!(
        name = %name,
        registry = %config.registry.kind,
        address = %config.registry.address,
        "Starting provider"
    );
    if config.registry.kind == RegistryKind::Memory {
        tracing::warn!("The memory registry is private to this process; callers in other processes cannot see it");
    }

    let registry = Arc::new(
        RegistryClient::connect(&config.registry)
            .await
            .context("connecting to registry")?,
    );
    let provider = Provider::new(kestrel_cli::demo::user_service(&name), registry.clone(), &config);

    provider.start().await?;

    registry.shutdown().await.context("closing registry session")?;
    tracing::info!("Provider stopped");
    Ok(())
}

fn call_config(args: &CallArgs) -> Result<RpcConfig> {
    let mut config = kestrel_cli::load_config(&args.config_dir, args.profile.clone())?;
    if let Some(kind) = args.registry_kind {
        config.registry.kind = kind;
    }
    if let Some(address) = &args.registry {
        config.registry.address = address.clone();
    }
    if let Some(load_balancer) = args.load_balancer {
        config.load_balancer = load_balancer;
    }
    if let Some(retry) = args.retry {
        config.retry_strategy = retry;
    }
    Ok(config)
}

/// Splits the `--args` JSON into call parameters.
fn parse_params(raw: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(raw).with_context(|| format!("invalid JSON in args: {}", raw))?;
    Ok(match value {
        Value::Array(values) => values,
        other => vec![other],
    })
}

async fn run_call(args: CallArgs) -> Result<()> {
    let params = parse_params(&args.args)?;
    let config = call_config(&args)?;

    let client = KestrelClient::connect(&config).await?;
    let request = KestrelClient::request(&args.service, &args.method, &params)?;

    let mut options = CallOptions::default();
    if let Some(key) = &args.affinity_key {
        options = options.with_affinity_key(key.clone());
    }
    if let Some(timeout_ms) = args.timeout_ms {
        options = options.with_timeout(std::time::Duration::from_millis(timeout_ms));
    }

    let result: Value = client.call_with(request, options).await?;
    println!("{}", serde_json::to_string(&result)?);

    Ok(())
}

/// CLI argument parsing tests.
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cli_parse_provider_defaults() {
        let args: Cli = Cli::from_args(&["kestrel"], &["provider"]).unwrap();
        match args.command {
            Commands::Provider(args) => {
                assert_eq!(args.config_dir, PathBuf::from("."));
                assert!(args.profile.is_none());
                assert!(args.port.is_none());
                assert!(args.registry_kind.is_none());
            }
            _ => panic!("Expected Provider command"),
        }
    }

    #[test]
    fn test_cli_parse_provider_overrides() {
        let args: Cli = Cli::from_args(
            &["kestrel"],
            &["provider", "-p", "9001", "--registry-kind", "zookeeper", "--registry", "127.0.0.1:2181"],
        )
        .unwrap();
        let Commands::Provider(args) = args.command else {
            panic!("Expected Provider command");
        };

        let config = provider_config(&args).unwrap();
        assert_eq!(config.server_port, 9001);
        assert_eq!(config.registry.kind, RegistryKind::Zookeeper);
        assert_eq!(config.registry.address, "127.0.0.1:2181");
    }

    #[test]
    fn test_cli_parse_call() {
        let args: Cli = Cli::from_args(
            &["kestrel"],
            &[
                "call",
                "UserService",
                "getUser",
                "--args",
                "[42]",
                "--load-balancer",
                "consistentHash",
                "--affinity-key",
                "user-42",
            ],
        )
        .unwrap();
        let Commands::Call(args) = args.command else {
            panic!("Expected Call command");
        };

        assert_eq!(args.service, "UserService");
        assert_eq!(args.method, "getUser");
        assert_eq!(args.affinity_key.as_deref(), Some("user-42"));
        let config = call_config(&args).unwrap();
        assert_eq!(config.load_balancer, LoadBalancerKind::ConsistentHash);
    }

    #[test]
    fn test_cli_rejects_unknown_load_balancer() {
        let result = Cli::from_args(&["kestrel"], &["call", "S", "m", "--load-balancer", "leastConnections"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params("[1, \"a\"]").unwrap(), vec![json!(1), json!("a")]);
        assert_eq!(parse_params("{\"id\": 1}").unwrap(), vec![json!({"id": 1})]);
        assert!(parse_params("[]").unwrap().is_empty());
        assert!(parse_params("not json").is_err());
    }
}
