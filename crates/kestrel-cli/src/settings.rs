use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, ConfigError, Environment, File, FileFormat, Source};
use kestrel_common::config::RpcConfig;

/// Environment prefix for configuration overrides.
pub const ENV_PREFIX: &str = "KESTREL";

/// Table holding the RPC settings in every source.
const ROOT_KEY: &str = "rpc";

/// Layers configuration files and environment variables into an [`RpcConfig`].
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    dir: PathBuf,
    profile: Option<String>,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            profile: None,
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    /// Also reads `application-{profile}.toml`, overriding the base file.
    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile.filter(|p| !p.is_empty());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    fn file(&self, name: &str) -> impl Source + Send + Sync + 'static {
        File::from(self.dir.join(name)).format(FileFormat::Toml).required(false)
    }

    pub fn load(&self) -> Result<RpcConfig> {
        let mut builder = Config::builder().add_source(self.file("application.toml"));
        if let Some(profile) = &self.profile {
            builder = builder.add_source(self.file(&format!("application-{}.toml", profile)));
        }
        builder = builder.add_source(Environment::with_prefix(&self.env_prefix).separator("__"));

        let settings = builder
            .build()
            .with_context(|| format!("reading configuration from {}", self.dir.display()))?;

        match settings.get::<RpcConfig>(ROOT_KEY) {
            Ok(config) => Ok(config),
            Err(ConfigError::NotFound(_)) => {
                tracing::debug!(dir = %self.dir.display(), "No rpc configuration found, using defaults");
                Ok(RpcConfig::default())
            }
            Err(e) => Err(e).context("invalid rpc configuration"),
        }
    }
}

/// Loads the configuration for `dir` and `profile` with the default prefix.
pub fn load_config(dir: &Path, profile: Option<String>) -> Result<RpcConfig> {
    ConfigLoader::new(dir).with_profile(profile).load()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::config::{LoadBalancerKind, RegistryKind, RetryStrategyKind};

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    /// Each test gets its own prefix so parallel tests don't see each other's variables.
    fn loader(dir: &Path, prefix: &str) -> ConfigLoader {
        ConfigLoader::new(dir).with_env_prefix(prefix)
    }

    #[test]
    fn test_defaults_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = loader(dir.path(), "KESTREL_TEST_DEFAULTS").load().unwrap();
        assert_eq!(config, RpcConfig::default());
    }

    #[test]
    fn test_base_file() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "application.toml",
            r#"
            [rpc]
            name = "user-provider"
            server_port = 9100
            load_balancer = "consistentHash"

            [rpc.registry]
            kind = "zookeeper"
            address = "127.0.0.1:2181"
            "#,
        );

        let config = loader(dir.path(), "KESTREL_TEST_BASE").load().unwrap();
        assert_eq!(config.name, "user-provider");
        assert_eq!(config.server_port, 9100);
        assert_eq!(config.load_balancer, LoadBalancerKind::ConsistentHash);
        assert_eq!(config.registry.kind, RegistryKind::Zookeeper);
        assert_eq!(config.registry.address, "127.0.0.1:2181");
        // Untouched fields keep their defaults
        assert_eq!(config.registry.session_ttl_secs, 30);
        assert_eq!(config.call_timeout_ms, 5_000);
    }

    #[test]
    fn test_profile_overrides_base() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "application.toml", "[rpc]\nserver_port = 9100\nname = \"base\"\n");
        write(
            dir.path(),
            "application-prod.toml",
            "[rpc]\nserver_port = 9200\nretry_strategy = \"exponential\"\n",
        );

        let config = loader(dir.path(), "KESTREL_TEST_PROFILE")
            .with_profile(Some("prod".to_string()))
            .load()
            .unwrap();
        assert_eq!(config.server_port, 9200);
        assert_eq!(config.name, "base");
        assert_eq!(config.retry_strategy, RetryStrategyKind::Exponential);
    }

    #[test]
    fn test_missing_profile_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "application.toml", "[rpc]\nserver_port = 9100\n");

        let config = loader(dir.path(), "KESTREL_TEST_NO_PROFILE")
            .with_profile(Some("staging".to_string()))
            .load()
            .unwrap();
        assert_eq!(config.server_port, 9100);
    }

    #[test]
    fn test_environment_overrides_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "application.toml", "[rpc]\nserver_port = 9100\n");
        std::env::set_var("KESTREL_TEST_ENV__RPC__SERVER_PORT", "9300");
        std::env::set_var("KESTREL_TEST_ENV__RPC__REGISTRY__KIND", "memory");

        let config = loader(dir.path(), "KESTREL_TEST_ENV").load().unwrap();
        assert_eq!(config.server_port, 9300);
        assert_eq!(config.registry.kind, RegistryKind::Memory);

        std::env::remove_var("KESTREL_TEST_ENV__RPC__SERVER_PORT");
        std::env::remove_var("KESTREL_TEST_ENV__RPC__REGISTRY__KIND");
    }

    #[test]
    fn test_zero_watch_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "application.toml", "[rpc.registry]\nwatch_interval_ms = 0\n");

        let err = loader(dir.path(), "KESTREL_TEST_ZERO").load().unwrap_err();
        assert!(format!("{:#}", err).contains("greater than zero"), "{:#}", err);
    }

    #[test]
    fn test_unknown_identifier_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "application.toml", "[rpc]\nload_balancer = \"leastConnections\"\n");

        let err = loader(dir.path(), "KESTREL_TEST_UNKNOWN").load().unwrap_err();
        assert!(format!("{:#}", err).contains("leastConnections"), "{:#}", err);
    }
}
