use crate::error::{LagError, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub exporter: ExporterConfig,
    /// Raw cluster entries. Each one is resolved on its own so a broken entry
    /// only takes its own cluster out of the cycle.
    #[serde(default)]
    pub clusters: Vec<toml::Table>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExporterConfig {
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_broker_timeout")]
    pub broker_timeout: Duration,
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
    #[serde(default = "default_max_concurrent_cycles")]
    pub max_concurrent_cycles: usize,
    /// Broker calls in flight per cluster; further calls wait before their
    /// timeout starts.
    #[serde(default = "default_max_broker_calls")]
    pub max_broker_calls_per_cluster: usize,
    /// Group offset trackers (one librdkafka consumer each) open per cluster.
    #[serde(default = "default_max_offset_trackers")]
    pub max_offset_trackers_per_cluster: usize,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_http_host")]
    pub http_host: String,
    #[serde(default)]
    pub push: PushConfig,
}

/// What to do when the interval fires while a previous cycle is still running.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Drop the trigger.
    #[default]
    Skip,
    /// Queue the new cycle behind the running one.
    Serialize,
    /// Run up to `max_concurrent_cycles` cycles at once, dropping triggers beyond that.
    Concurrent,
}

/// Remote write target for lag lines.
#[derive(Debug, Deserialize, Clone)]
pub struct PushConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_push_endpoint")]
    pub endpoint: String,
    #[serde(with = "humantime_serde", default = "default_push_timeout")]
    pub timeout: Duration,
}

/// One `[[clusters]]` entry as written in the file.
#[derive(Debug, Deserialize, Clone)]
pub struct ClusterSettings {
    pub name: String,
    #[serde(default)]
    pub brokers: Vec<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub sasl: SaslSettings,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub consumer_properties: HashMap<String, String>,
    #[serde(default = "default_whitelist")]
    pub group_whitelist: Vec<String>,
    #[serde(default)]
    pub group_blacklist: Vec<String>,
    #[serde(default = "default_whitelist")]
    pub topic_whitelist: Vec<String>,
    #[serde(default)]
    pub topic_blacklist: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SaslSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub mechanism: String,
}

/// A validated cluster configuration, immutable for the cycle that uses it.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub name: String,
    pub brokers: Vec<String>,
    pub version: KafkaVersion,
    pub auth: Option<SaslAuth>,
    pub tls: bool,
    pub consumer_properties: HashMap<String, String>,
    pub filters: CompiledFilters,
}

#[derive(Clone)]
pub struct SaslAuth {
    pub username: String,
    pub password: String,
    pub mechanism: SaslMechanism,
}

impl fmt::Debug for SaslAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslAuth")
            .field("username", &self.username)
            .field("mechanism", &self.mechanism)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
    Gssapi,
    OAuthBearer,
}

impl SaslMechanism {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
            Self::Gssapi => "GSSAPI",
            Self::OAuthBearer => "OAUTHBEARER",
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = LagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            // Unset mechanism means PLAIN.
            "" | "PLAIN" => Ok(Self::Plain),
            "SCRAM-SHA-256" => Ok(Self::ScramSha256),
            "SCRAM-SHA-512" => Ok(Self::ScramSha512),
            "GSSAPI" => Ok(Self::Gssapi),
            "OAUTHBEARER" => Ok(Self::OAuthBearer),
            other => Err(LagError::UnsupportedMechanism(other.to_string())),
        }
    }
}

/// Kafka protocol version. Pre-1.0 releases use four components ("0.10.2.0"),
/// later ones three ("2.8.0"). Only published broker releases are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KafkaVersion([u16; 4]);

const RELEASED_VERSIONS: &[&str] = &[
    "0.8.2.0", "0.8.2.1", "0.8.2.2", "0.9.0.0", "0.9.0.1", "0.10.0.0", "0.10.0.1", "0.10.1.0",
    "0.10.1.1", "0.10.2.0", "0.10.2.1", "0.10.2.2", "0.11.0.0", "0.11.0.1", "0.11.0.2", "0.11.0.3",
    "1.0.0", "1.0.1", "1.0.2", "1.1.0", "1.1.1", "2.0.0", "2.0.1", "2.1.0", "2.1.1", "2.2.0",
    "2.2.1", "2.2.2", "2.3.0", "2.3.1", "2.4.0", "2.4.1", "2.5.0", "2.5.1", "2.6.0", "2.6.1",
    "2.6.2", "2.6.3", "2.7.0", "2.7.1", "2.7.2", "2.8.0", "2.8.1", "2.8.2", "3.0.0", "3.0.1",
    "3.0.2", "3.1.0", "3.1.1", "3.1.2", "3.2.0", "3.2.1", "3.2.3", "3.3.1", "3.3.2", "3.4.0",
    "3.4.1", "3.5.0", "3.5.1", "3.5.2", "3.6.0", "3.6.1", "3.6.2", "3.7.0", "3.7.1", "3.7.2",
    "3.8.0", "3.8.1", "3.9.0", "3.9.1", "4.0.0", "4.1.0",
];

impl KafkaVersion {
    /// Brokers older than 0.10.0 reject ApiVersionRequest.
    pub fn supports_api_version_request(self) -> bool {
        self >= Self([0, 10, 0, 0])
    }
}

impl FromStr for KafkaVersion {
    type Err = LagError;

    fn from_str(s: &str) -> Result<Self> {
        let unsupported = || LagError::UnsupportedVersion(s.to_string());

        let parts = s
            .trim()
            .split('.')
            .map(|p| p.parse::<u16>().map_err(|_| unsupported()))
            .collect::<Result<Vec<_>>>()?;

        let version = match parts.as_slice() {
            [0, minor, patch, build] => Self([0, *minor, *patch, *build]),
            [major, minor, patch] if *major > 0 => Self([*major, *minor, *patch, 0]),
            _ => return Err(unsupported()),
        };

        if !RELEASED_VERSIONS.contains(&version.to_string().as_str()) {
            return Err(unsupported());
        }
        Ok(version)
    }
}

impl fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, patch, build] = self.0;
        if major == 0 {
            write!(f, "{major}.{minor}.{patch}.{build}")
        } else {
            write!(f, "{major}.{minor}.{patch}")
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_broker_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_concurrent_cycles() -> usize {
    2
}

fn default_max_broker_calls() -> usize {
    64
}

fn default_max_offset_trackers() -> usize {
    16
}

fn default_http_port() -> u16 {
    8000
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_push_endpoint() -> String {
    "http://localhost:8428/api/v1/import/prometheus".to_string()
}

fn default_push_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_whitelist() -> Vec<String> {
    vec![".*".to_string()]
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            broker_timeout: default_broker_timeout(),
            overlap_policy: OverlapPolicy::default(),
            max_concurrent_cycles: default_max_concurrent_cycles(),
            max_broker_calls_per_cluster: default_max_broker_calls(),
            max_offset_trackers_per_cluster: default_max_offset_trackers(),
            http_port: default_http_port(),
            http_host: default_http_host(),
            push: PushConfig::default(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_push_endpoint(),
            timeout: default_push_timeout(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Config> {
        let config_path = path.unwrap_or("config.toml");

        if !Path::new(config_path).exists() {
            return Err(LagError::Config(format!(
                "Configuration file not found: {config_path}"
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Config> {
        let content = Self::substitute_env_vars(content)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn substitute_env_vars(content: &str) -> Result<String> {
        // Supports:
        // - ${VAR} - replaced with env var value, empty string if not set
        // - ${VAR:-default} - replaced with env var value, or "default" if not set
        // - ${?VAR} - same as ${VAR}
        let re = Regex::new(r"\$\{\??([^}:-]+)(?::-([^}]*))?\}")?;
        Ok(re
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map_or("", |m| m.as_str());
                std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
            })
            .to_string())
    }

    pub fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            return Err(LagError::Config(
                "At least one cluster must be configured".to_string(),
            ));
        }
        self.exporter.validate()
    }

    /// Resolve every cluster entry, keeping the per-entry outcome.
    /// Entries are labelled by their `name` when present.
    pub fn resolve_cluster_entries(&self) -> Vec<(String, Result<ClusterConfig>)> {
        let mut seen = HashSet::new();

        self.clusters
            .iter()
            .enumerate()
            .map(|(idx, table)| {
                let label = table
                    .get("name")
                    .and_then(toml::Value::as_str)
                    .map_or_else(|| format!("<cluster #{idx}>"), str::to_string);

                let resolved = toml::Value::Table(table.clone())
                    .try_into::<ClusterSettings>()
                    .map_err(LagError::from)
                    .and_then(|settings| settings.resolve())
                    .and_then(|cluster| {
                        if seen.insert(cluster.name.clone()) {
                            Ok(cluster)
                        } else {
                            Err(LagError::Config(format!(
                                "Cluster '{}' is configured more than once",
                                cluster.name
                            )))
                        }
                    });

                (label, resolved)
            })
            .collect()
    }

    /// Resolve cluster entries, logging and dropping the ones that fail.
    pub fn resolve_clusters(&self) -> Vec<ClusterConfig> {
        self.resolve_cluster_entries()
            .into_iter()
            .filter_map(|(label, resolved)| match resolved {
                Ok(cluster) => Some(cluster),
                Err(e) => {
                    error!(
                        cluster = %label,
                        error = %e,
                        "Invalid cluster configuration, skipping cluster"
                    );
                    None
                }
            })
            .collect()
    }
}

impl ExporterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(LagError::Config("poll_interval must be positive".to_string()));
        }
        if self.broker_timeout.is_zero() {
            return Err(LagError::Config("broker_timeout must be positive".to_string()));
        }
        if self.overlap_policy == OverlapPolicy::Concurrent && self.max_concurrent_cycles == 0 {
            return Err(LagError::Config(
                "max_concurrent_cycles must be at least 1".to_string(),
            ));
        }
        if self.max_broker_calls_per_cluster == 0 {
            return Err(LagError::Config(
                "max_broker_calls_per_cluster must be at least 1".to_string(),
            ));
        }
        if self.max_offset_trackers_per_cluster == 0 {
            return Err(LagError::Config(
                "max_offset_trackers_per_cluster must be at least 1".to_string(),
            ));
        }
        if self.push.enabled && self.push.endpoint.trim().is_empty() {
            return Err(LagError::Config(
                "push.endpoint cannot be empty when push is enabled".to_string(),
            ));
        }
        if self.broker_timeout >= self.poll_interval {
            warn!(
                broker_timeout = ?self.broker_timeout,
                poll_interval = ?self.poll_interval,
                "broker_timeout is not shorter than poll_interval; cycles may overlap"
            );
        }
        Ok(())
    }
}

impl ClusterSettings {
    pub fn resolve(self) -> Result<ClusterConfig> {
        if self.name.trim().is_empty() {
            return Err(LagError::Config("Cluster name cannot be empty".to_string()));
        }

        let brokers: Vec<String> = self
            .brokers
            .iter()
            .flat_map(|b| b.split(','))
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_string)
            .collect();
        if brokers.is_empty() {
            return Err(LagError::Config(format!(
                "Cluster '{}': brokers cannot be empty",
                self.name
            )));
        }

        let version: KafkaVersion = match self.version.as_deref().map(str::trim) {
            Some(v) if !v.is_empty() => v.parse()?,
            _ => {
                return Err(LagError::Config(format!(
                    "Cluster '{}': version is required",
                    self.name
                )));
            }
        };

        let auth = if self.sasl.enabled {
            if self.sasl.username.is_empty() {
                return Err(LagError::Config(format!(
                    "Cluster '{}': sasl.username is required when SASL is enabled",
                    self.name
                )));
            }
            Some(SaslAuth {
                username: self.sasl.username,
                password: self.sasl.password,
                mechanism: self.sasl.mechanism.parse()?,
            })
        } else {
            None
        };

        let filters = CompiledFilters::compile(
            &self.group_whitelist,
            &self.group_blacklist,
            &self.topic_whitelist,
            &self.topic_blacklist,
        )?;

        debug!(
            cluster = %self.name,
            brokers = ?brokers,
            version = %version,
            "Resolved cluster configuration"
        );

        Ok(ClusterConfig {
            name: self.name,
            brokers,
            version,
            auth,
            tls: self.tls,
            consumer_properties: self.consumer_properties,
            filters,
        })
    }
}

impl ClusterConfig {
    /// librdkafka properties for this cluster. Explicit `consumer_properties`
    /// are applied last and win over derived ones.
    pub fn client_properties(&self) -> Vec<(String, String)> {
        let mut props = vec![
            ("bootstrap.servers".to_string(), self.brokers.join(",")),
            (
                "client.id".to_string(),
                format!("kafka-lag-monitor-{}", self.name),
            ),
            (
                "broker.version.fallback".to_string(),
                self.version.to_string(),
            ),
            (
                "api.version.request".to_string(),
                self.version.supports_api_version_request().to_string(),
            ),
        ];

        let security_protocol = match (&self.auth, self.tls) {
            (Some(_), true) => Some("SASL_SSL"),
            (Some(_), false) => Some("SASL_PLAINTEXT"),
            (None, true) => Some("SSL"),
            (None, false) => None,
        };
        if let Some(protocol) = security_protocol {
            props.push(("security.protocol".to_string(), protocol.to_string()));
        }

        if let Some(auth) = &self.auth {
            props.push((
                "sasl.mechanism".to_string(),
                auth.mechanism.as_str().to_string(),
            ));
            props.push(("sasl.username".to_string(), auth.username.clone()));
            props.push(("sasl.password".to_string(), auth.password.clone()));
        }

        for (key, value) in &self.consumer_properties {
            props.push((key.clone(), value.clone()));
        }

        props
    }
}

#[derive(Debug, Clone)]
pub struct CompiledFilters {
    pub group_whitelist: Vec<Regex>,
    pub group_blacklist: Vec<Regex>,
    pub topic_whitelist: Vec<Regex>,
    pub topic_blacklist: Vec<Regex>,
}

impl CompiledFilters {
    pub fn compile(
        group_whitelist: &[String],
        group_blacklist: &[String],
        topic_whitelist: &[String],
        topic_blacklist: &[String],
    ) -> Result<Self> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| Regex::new(p))
                .collect::<std::result::Result<Vec<_>, _>>()
        };

        Ok(Self {
            group_whitelist: compile(group_whitelist)?,
            group_blacklist: compile(group_blacklist)?,
            topic_whitelist: compile(topic_whitelist)?,
            topic_blacklist: compile(topic_blacklist)?,
        })
    }

    pub fn matches_group(&self, group: &str) -> bool {
        let matches_whitelist = self.group_whitelist.iter().any(|r| r.is_match(group));
        let matches_blacklist = self.group_blacklist.iter().any(|r| r.is_match(group));
        matches_whitelist && !matches_blacklist
    }

    pub fn matches_topic(&self, topic: &str) -> bool {
        let matches_whitelist = self.topic_whitelist.iter().any(|r| r.is_match(topic));
        let matches_blacklist = self.topic_blacklist.iter().any(|r| r.is_match(topic));
        matches_whitelist && !matches_blacklist
    }
}

impl Default for CompiledFilters {
    /// Accept every group and every topic.
    fn default() -> Self {
        Self::compile(&default_whitelist(), &[], &default_whitelist(), &[])
        .unwrap_or_else(|_| Self {
            group_whitelist: Vec::new(),
            group_blacklist: Vec::new(),
            topic_whitelist: Vec::new(),
            topic_blacklist: Vec::new(),
        })
    }
}

/// Re-reads the configuration file on every cycle, falling back to the last
/// configuration that parsed.
pub struct ConfigSource {
    path: PathBuf,
    last_good: Mutex<Config>,
}

impl ConfigSource {
    pub fn new(path: impl Into<PathBuf>, initial: Config) -> Self {
        Self {
            path: path.into(),
            last_good: Mutex::new(initial),
        }
    }

    pub fn refresh(&self) -> Config {
        let mut last_good = self.last_good.lock().unwrap_or_else(PoisonError::into_inner);
        match self.path.to_str().map(|p| Config::load(Some(p))) {
            Some(Ok(config)) => {
                *last_good = config.clone();
                config
            }
            Some(Err(e)) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to reload configuration, using last good configuration"
                );
                last_good.clone()
            }
            None => {
                warn!(
                    path = %self.path.display(),
                    "Configuration path is not valid UTF-8, using last good configuration"
                );
                last_good.clone()
            }
        }
    }

    /// Clusters to measure in the next cycle.
    pub fn clusters(&self) -> Vec<ClusterConfig> {
        self.refresh().resolve_clusters()
    }
}

impl fmt::Debug for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigSource")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
