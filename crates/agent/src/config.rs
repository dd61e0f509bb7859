//! Agent configuration
//!
//! Layered with the `config` crate: an optional file, then `BILLING_`
//! environment variables (nested keys use `__`, lists are comma separated),
//! then command line flags.

use billing_lib::{
    BackoffConfig, NamespaceFilter, PodEventNormalizer, Scope, SessionConfig, SupervisorConfig,
};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "BILLING";

/// Keys parsed as comma separated lists from the environment
const LIST_KEYS: &[&str] = &[
    "namespaces",
    "excluded_namespaces",
    "excluded_namespace_prefixes",
];

/// Invalid or unreadable configuration; the agent refuses to start
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Pod billing agent
#[derive(Debug, Default, Parser)]
#[command(name = "pod-billing-agent")]
#[command(author, version, about = "Records pod resource requests for billing", long_about = None)]
pub struct Cli {
    /// Configuration file (toml, yaml or json)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Namespace to watch; repeat for several (default: all namespaces)
    #[arg(long = "namespace", short = 'n')]
    pub namespaces: Vec<String>,

    /// Path of the JSON-lines billing sink
    #[arg(long)]
    pub sink_path: Option<PathBuf>,

    /// Path to kubeconfig file (in-cluster config if not specified)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Log level filter, overridden by RUST_LOG
    #[arg(long)]
    pub log_level: Option<String>,

    /// Port for the health and metrics server
    #[arg(long)]
    pub api_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Append-only JSON-lines file
    Jsonl,
    /// Keep records in memory only (dry run)
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkSettings {
    #[serde(default = "default_sink_kind")]
    pub kind: SinkKind,
    #[serde(default = "default_sink_path")]
    pub path: PathBuf,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            kind: default_sink_kind(),
            path: default_sink_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackoffSettings {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchSettings {
    /// Server-side watch timeout
    #[serde(default = "default_watch_timeout")]
    pub timeout_secs: u32,
    /// No-data watchdog
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Periodic relist; 0 disables
    #[serde(default)]
    pub resync_interval_secs: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_watch_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            resync_interval_secs: 0,
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Cluster name attached to every log line
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Namespaces to watch; empty means cluster-wide
    #[serde(default)]
    pub namespaces: Vec<String>,

    #[serde(default = "default_excluded_namespaces")]
    pub excluded_namespaces: Vec<String>,

    #[serde(default)]
    pub excluded_namespace_prefixes: Vec<String>,

    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    #[serde(default)]
    pub sink: SinkSettings,

    #[serde(default)]
    pub backoff: BackoffSettings,

    #[serde(default)]
    pub watch: WatchSettings,

    /// Restart ceiling per scope; unlimited if unset
    #[serde(default)]
    pub max_restarts: Option<u32>,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_cluster_name() -> String {
    std::env::var("CLUSTER_NAME").unwrap_or_else(|_| "default".to_string())
}

fn default_excluded_namespaces() -> Vec<String> {
    ["kube-system", "kube-public", "kube-node-lease"]
        .iter()
        .map(|ns| ns.to_string())
        .collect()
}

fn default_sink_kind() -> SinkKind {
    SinkKind::Jsonl
}

fn default_sink_path() -> PathBuf {
    PathBuf::from("/var/lib/pod-billing/records.jsonl")
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_watch_timeout() -> u32 {
    290
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_api_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AgentConfig {
    /// Load configuration from the file named on the command line, the
    /// process environment and flag overrides
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        Self::load_with_env(cli, None)
    }

    /// Same as [`AgentConfig::load`], reading environment variables from
    /// `env` instead of the process when given
    pub fn load_with_env(
        cli: &Cli,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        let mut environment = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .try_parsing(true)
            .source(env);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }
        builder = builder.add_source(environment);

        if !cli.namespaces.is_empty() {
            builder = builder.set_override("namespaces", cli.namespaces.clone())?;
        }
        builder = builder
            .set_override_option("sink.path", cli.sink_path.as_ref().map(|p| p.display().to_string()))?
            .set_override_option("kubeconfig", cli.kubeconfig.as_ref().map(|p| p.display().to_string()))?
            .set_override_option("log_level", cli.log_level.clone())?
            .set_override_option("api_port", cli.api_port.map(i64::from))?;

        let mut config: AgentConfig = builder.build()?.try_deserialize()?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Trim list entries and drop empty ones (e.g. from `BILLING_NAMESPACES=""`)
    fn normalize(&mut self) {
        for list in [
            &mut self.namespaces,
            &mut self.excluded_namespaces,
            &mut self.excluded_namespace_prefixes,
        ] {
            *list = list
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        self.namespaces.sort();
        self.namespaces.dedup();
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_name.trim().is_empty() {
            return Err(ConfigError::Invalid("cluster_name must not be empty".to_string()));
        }
        if self.backoff.initial_ms == 0 {
            return Err(ConfigError::Invalid("backoff.initial_ms must be positive".to_string()));
        }
        if self.backoff.max_ms < self.backoff.initial_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff.max_ms ({}) is below backoff.initial_ms ({})",
                self.backoff.max_ms, self.backoff.initial_ms
            )));
        }
        if self.watch.timeout_secs == 0 {
            return Err(ConfigError::Invalid("watch.timeout_secs must be positive".to_string()));
        }
        if self.watch.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "watch.idle_timeout_secs must be positive".to_string(),
            ));
        }
        if self.sink.kind == SinkKind::Jsonl && self.sink.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("sink.path is required for the jsonl sink".to_string()));
        }

        let filter = self.namespace_filter();
        if let Some(ns) = self.namespaces.iter().find(|ns| filter.is_excluded(ns)) {
            return Err(ConfigError::Invalid(format!(
                "namespace {} is both watched and excluded",
                ns
            )));
        }
        Ok(())
    }

    pub fn scopes(&self) -> Vec<Scope> {
        Scope::from_namespaces(&self.namespaces)
    }

    pub fn namespace_filter(&self) -> NamespaceFilter {
        NamespaceFilter::new(
            self.excluded_namespaces.clone(),
            self.excluded_namespace_prefixes.clone(),
        )
    }

    pub fn normalizer(&self) -> PodEventNormalizer {
        PodEventNormalizer::new(self.namespace_filter())
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.backoff.initial_ms),
            max: Duration::from_millis(self.backoff.max_ms),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let resync_interval = match self.watch.resync_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        SessionConfig {
            idle_timeout: Duration::from_secs(self.watch.idle_timeout_secs),
            resync_interval,
            backoff: self.backoff_config(),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            session: self.session_config(),
            restart_backoff: self.backoff_config(),
            max_restarts: self.max_restarts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::load_with_env(&Cli::default(), env(&[])).unwrap();

        assert!(config.namespaces.is_empty());
        assert_eq!(config.scopes(), vec![Scope::AllNamespaces]);
        assert_eq!(
            config.excluded_namespaces,
            vec!["kube-system", "kube-public", "kube-node-lease"]
        );
        assert_eq!(config.sink.kind, SinkKind::Jsonl);
        assert_eq!(config.watch.timeout_secs, 290);
        assert_eq!(config.session_config().resync_interval, None);
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.max_restarts, None);
    }

    #[test]
    fn test_environment_overrides() {
        let config = AgentConfig::load_with_env(
            &Cli::default(),
            env(&[
                ("BILLING_CLUSTER_NAME", "prod-eu"),
                ("BILLING_NAMESPACES", "team-b,team-a"),
                ("BILLING_EXCLUDED_NAMESPACE_PREFIXES", "openshift-"),
                ("BILLING_SINK__KIND", "memory"),
                ("BILLING_WATCH__RESYNC_INTERVAL_SECS", "600"),
                ("BILLING_BACKOFF__MAX_MS", "5000"),
                ("BILLING_MAX_RESTARTS", "3"),
            ]),
        )
        .unwrap();

        assert_eq!(config.cluster_name, "prod-eu");
        assert_eq!(
            config.scopes(),
            vec![
                Scope::Namespace("team-a".to_string()),
                Scope::Namespace("team-b".to_string())
            ]
        );
        assert!(config.namespace_filter().is_excluded("openshift-monitoring"));
        assert_eq!(config.sink.kind, SinkKind::Memory);
        assert_eq!(
            config.session_config().resync_interval,
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.backoff_config().max, Duration::from_millis(5000));
        assert_eq!(config.max_restarts, Some(3));
    }

    #[test]
    fn test_flags_override_environment() {
        let cli = Cli {
            namespaces: vec!["team-c".to_string()],
            sink_path: Some(PathBuf::from("/tmp/billing.jsonl")),
            api_port: Some(9100),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        let config = AgentConfig::load_with_env(
            &cli,
            env(&[
                ("BILLING_NAMESPACES", "team-a"),
                ("BILLING_API_PORT", "8081"),
            ]),
        )
        .unwrap();

        assert_eq!(config.namespaces, vec!["team-c"]);
        assert_eq!(config.sink.path, PathBuf::from("/tmp/billing.jsonl"));
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_config_file_then_environment() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "cluster_name = \"staging\"\nnamespaces = [\"team-a\"]\n\n[watch]\nidle_timeout_secs = 120\n"
        )
        .unwrap();

        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let config =
            AgentConfig::load_with_env(&cli, env(&[("BILLING_CLUSTER_NAME", "staging-2")])).unwrap();

        assert_eq!(config.cluster_name, "staging-2");
        assert_eq!(config.namespaces, vec!["team-a"]);
        assert_eq!(config.session_config().idle_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_missing_config_file_is_fatal() {
        let cli = Cli {
            config: Some(PathBuf::from("/nonexistent/billing.toml")),
            ..Default::default()
        };
        let err = AgentConfig::load_with_env(&cli, env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let err = AgentConfig::load_with_env(
            &Cli::default(),
            env(&[
                ("BILLING_BACKOFF__INITIAL_MS", "2000"),
                ("BILLING_BACKOFF__MAX_MS", "1000"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_watched_namespace_cannot_be_excluded() {
        let cli = Cli {
            namespaces: vec!["kube-system".to_string()],
            ..Default::default()
        };
        let err = AgentConfig::load_with_env(&cli, env(&[])).unwrap_err();
        assert!(err.to_string().contains("kube-system"));
    }
}
