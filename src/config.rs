use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use hickory_server::proto::rr::Name;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::selector::LabelSelector;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Label selector choosing the pods to publish.
    pub selector: String,
    pub inventory: InventoryConfig,
    pub debounce_window_ms: u64,
    pub reconcile_period_secs: u64,
    /// Upper bound for every single inventory or store call.
    pub call_timeout_secs: u64,
    pub retry_backoff: BackoffConfig,
    pub readiness: ReadinessConfig,
    pub bootstrap: BootstrapConfig,
    pub store: StoreConfig,
    pub artifact: ArtifactConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryBackend {
    Kubernetes,
    Docker,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InventoryConfig {
    pub backend: InventoryBackend,
    /// Kubernetes namespaces to watch; empty means all of them.
    pub namespaces: Vec<String>,
    /// Docker network whose address is published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessPolicy {
    /// Every pod with an address is published.
    IncludeUnready,
    /// Unready pods are withdrawn as soon as they are seen unready.
    ExcludeUnready,
    /// Unready pods stay published for `grace_secs`.
    GracePeriod,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ReadinessConfig {
    pub policy: ReadinessPolicy,
    pub grace_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct BootstrapConfig {
    pub deadline_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_file: Option<PathBuf>,
    pub server_id: String,
    pub zone: String,
    pub record_prefix: String,
    pub ttl: u32,
    pub verify_tls: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactConfig {
    pub dir: PathBuf,
    pub text_file: String,
    pub json_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapTarget>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfigMapTarget {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            selector: "dns=true".into(),
            inventory: InventoryConfig {
                backend: InventoryBackend::Kubernetes,
                namespaces: Vec::new(),
                network: None,
            },
            debounce_window_ms: 1_000,
            reconcile_period_secs: 30,
            call_timeout_secs: 10,
            retry_backoff: BackoffConfig {
                initial_ms: 1_000,
                max_ms: 30_000,
            },
            readiness: ReadinessConfig {
                policy: ReadinessPolicy::ExcludeUnready,
                grace_secs: 30,
            },
            bootstrap: BootstrapConfig { deadline_secs: 120 },
            store: StoreConfig {
                api_url: "http://127.0.0.1:8081".into(),
                api_key: String::new(),
                api_key_file: None,
                server_id: "localhost".into(),
                zone: "example.com.".into(),
                record_prefix: String::new(),
                ttl: 30,
                verify_tls: false,
            },
            artifact: ArtifactConfig {
                dir: "/var/lib/podpeer".into(),
                text_file: "peers.txt".into(),
                json_file: "peers.json".into(),
                config_map: None,
            },
            health: HealthConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("podpeer.toml"))
            .merge(Json::file("podpeer.json"))
            .merge(Env::prefixed("PODPEER_").split("__"));

        Self::from_figment(figment).map_err(|e| anyhow::anyhow!("{}", e))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let mut config: Config = figment.extract()?;

        // Support mounted secrets for the store API key
        if let Some(ref path) = config.store.api_key_file {
            config.store.api_key = std::fs::read_to_string(path)
                .map_err(|source| ConfigError::SecretFile {
                    path: path.display().to_string(),
                    source,
                })?
                .trim()
                .to_string();
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        LabelSelector::parse(&self.selector)?;

        if self.reconcile_period_secs == 0 {
            return Err(ConfigError::Invalid("reconcile_period_secs must be > 0".into()));
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid("call_timeout_secs must be > 0".into()));
        }
        if self.retry_backoff.initial_ms == 0 || self.retry_backoff.initial_ms > self.retry_backoff.max_ms {
            return Err(ConfigError::Invalid(
                "retry_backoff requires 0 < initial_ms <= max_ms".into(),
            ));
        }
        if Name::from_ascii(&self.store.zone).is_err() {
            return Err(ConfigError::Invalid(format!("invalid zone {:?}", self.store.zone)));
        }
        if self.artifact.text_file == self.artifact.json_file {
            return Err(ConfigError::Invalid(
                "artifact.text_file and artifact.json_file must differ".into(),
            ));
        }
        Ok(())
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn reconcile_period(&self) -> Duration {
        Duration::from_secs(self.reconcile_period_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn bootstrap_deadline(&self) -> Duration {
        Duration::from_secs(self.bootstrap.deadline_secs)
    }
}

impl BackoffConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn defaults() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::from_figment(defaults()).unwrap();
        assert_eq!(config.selector, "dns=true");
        assert_eq!(config.reconcile_period(), Duration::from_secs(30));
        assert_eq!(config.readiness.policy, ReadinessPolicy::ExcludeUnready);
        assert_eq!(config.inventory.backend, InventoryBackend::Kubernetes);
    }

    #[test]
    fn toml_overrides_nested_sections() {
        let figment = defaults().merge(Toml::string(
            r#"
            selector = "app=peer"
            [store]
            zone = "peers.internal."
            [readiness]
            policy = "grace_period"
            grace_secs = 5
            [artifact.config_map]
            namespace = "ops"
            name = "pod-peers"
            "#,
        ));
        let config = Config::from_figment(figment).unwrap();
        assert_eq!(config.selector, "app=peer");
        assert_eq!(config.store.zone, "peers.internal.");
        assert_eq!(config.store.ttl, 30);
        assert_eq!(config.readiness.policy, ReadinessPolicy::GracePeriod);
        assert_eq!(config.artifact.config_map.unwrap().name, "pod-peers");
    }

    #[test]
    fn inverted_backoff_is_rejected() {
        let figment = defaults().merge(Toml::string(
            "[retry_backoff]\ninitial_ms = 5000\nmax_ms = 1000\n",
        ));
        assert!(matches!(
            Config::from_figment(figment),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn bad_selector_is_rejected() {
        let figment = defaults().merge(Toml::string("selector = \"=oops\""));
        assert!(Config::from_figment(figment).is_err());
    }

    #[test]
    fn api_key_is_read_from_file() {
        let mut secret = tempfile::NamedTempFile::new().unwrap();
        writeln!(secret, "s3cret").unwrap();
        let figment = defaults().merge(Serialized::default(
            "store.api_key_file",
            secret.path().display().to_string(),
        ));
        let config = Config::from_figment(figment).unwrap();
        assert_eq!(config.store.api_key, "s3cret");
    }
}
