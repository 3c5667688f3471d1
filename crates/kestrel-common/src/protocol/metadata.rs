use serde::{Deserialize, Serialize};

/// Root under which every instance is published.
pub const SERVICE_KEY_PREFIX: &str = "/services";

/// One running instance of a service.
///
/// Instances are unique by `(host, port)` within a service name; that pair is
/// also the instance's identity for load balancing and failure tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceMetadata {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_weight() -> u32 {
    1
}

fn default_version() -> String {
    "1.0".to_string()
}

impl ServiceMetadata {
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
            weight: default_weight(),
            version: default_version(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// `host:port`, used both as dial address and instance identity.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Registry key: `/services/{service_name}/{host}:{port}`.
    pub fn registry_key(&self) -> String {
        format!("{}{}", Self::service_prefix(&self.service_name), self.address())
    }

    /// Prefix shared by every instance of `service_name`, trailing slash included.
    pub fn service_prefix(service_name: &str) -> String {
        format!("{}/{}/", SERVICE_KEY_PREFIX, service_name)
    }
}
