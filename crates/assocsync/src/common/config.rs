use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer};
use slurm_assoc::ROOT_ACCOUNT;
use slurm_assoc::client::TransportKind;
use slurm_assoc::client::api::DEFAULT_API_VERSION;
use slurm_assoc::fairshare::FairShareAlgorithm;
use slurm_assoc::partition::AccessPolicy;
use slurm_assoc::spec::SpecSet;

use crate::common::error::AssocSyncError;

fn deserialize_human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let buf = String::deserialize(deserializer)?;
    humantime::parse_duration(&buf).map_err(serde::de::Error::custom)
}

fn default_parallelism() -> usize {
    1
}

fn default_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_allow_all_groups() -> Vec<String> {
    AccessPolicy::default().allow_all_groups.into_iter().collect()
}

fn default_ignored() -> BTreeSet<String> {
    BTreeSet::from([ROOT_ACCOUNT.to_string()])
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

/// Entities that are never touched by sync or check.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IgnoreLists {
    #[serde(default = "default_ignored")]
    pub users: BTreeSet<String>,
    #[serde(default = "default_ignored")]
    pub accounts: BTreeSet<String>,
    #[serde(default)]
    pub clusters: BTreeSet<String>,
}

impl Default for IgnoreLists {
    fn default() -> Self {
        Self {
            users: default_ignored(),
            accounts: default_ignored(),
            clusters: BTreeSet::new(),
        }
    }
}

impl IgnoreLists {
    pub fn user(&self, name: &str) -> bool {
        self.users.contains(name)
    }

    pub fn account(&self, name: &str) -> bool {
        name == ROOT_ACCOUNT || self.accounts.contains(name)
    }

    pub fn cluster(&self, name: &str) -> bool {
        self.clusters.contains(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliTransport {
    /// Login node to connect to. Commands run locally when it is missing.
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity: Option<PathBuf>,
    pub binary_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiTransport {
    pub base_url: String,
    pub token: Option<String>,
    /// Environment variable that holds the token.
    pub token_env: Option<String>,
    pub user: Option<String>,
    #[serde(default = "default_api_version")]
    pub version: String,
}

impl ApiTransport {
    pub fn resolve_token(&self) -> crate::Result<String> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        match &self.token_env {
            Some(variable) => std::env::var(variable).map_err(|_| {
                AssocSyncError::ConfigError(format!(
                    "Environment variable {variable} with the API token is not set"
                ))
            }),
            None => Err(AssocSyncError::ConfigError(format!(
                "API transport of {} needs `token` or `token_env`",
                self.base_url
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TransportConfig {
    Cli(CliTransport),
    Api(ApiTransport),
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Cli(_) => TransportKind::Cli,
            TransportConfig::Api(_) => TransportKind::Api,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    /// Specs applied to every account created on this cluster.
    #[serde(default)]
    pub specs: Vec<String>,
    /// Specs applied to every user association created on this cluster.
    #[serde(default)]
    pub user_specs: Vec<String>,
    pub transport: TransportConfig,
}

impl ClusterConfig {
    pub fn specs(&self) -> crate::Result<SpecSet> {
        Ok(SpecSet::parse_list(&self.specs)?)
    }

    pub fn user_specs(&self) -> crate::Result<SpecSet> {
        Ok(SpecSet::parse_list(&self.user_specs)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub noop: bool,
    /// Number of clusters reconciled at the same time.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Deadline of every single transport call.
    #[serde(
        default = "default_timeout",
        deserialize_with = "deserialize_human_duration"
    )]
    pub timeout: Duration,
    #[serde(default)]
    pub fairshare: FairShareAlgorithm,
    #[serde(default = "default_allow_all_groups")]
    pub allow_all_groups: Vec<String>,
    /// First day of usage reports, January 1st of the current year by default.
    #[serde(default)]
    pub usage_start: Option<NaiveDate>,
    #[serde(default)]
    pub ignore: IgnoreLists,
    #[serde(default, rename = "cluster")]
    pub clusters: Vec<ClusterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            noop: false,
            parallelism: default_parallelism(),
            timeout: default_timeout(),
            fairshare: FairShareAlgorithm::default(),
            allow_all_groups: default_allow_all_groups(),
            usage_start: None,
            ignore: IgnoreLists::default(),
            clusters: Vec::new(),
        }
    }
}

impl Config {
    pub fn parse(text: &str) -> crate::Result<Config> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> crate::Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|error| {
            AssocSyncError::ConfigError(format!("Cannot read {}: {error}", path.display()))
        })?;
        Self::parse(&text)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.parallelism == 0 {
            return Err(AssocSyncError::ConfigError(
                "`parallelism` must be at least 1".into(),
            ));
        }
        let mut names = BTreeSet::new();
        for cluster in &self.clusters {
            if cluster.name.is_empty() {
                return Err(AssocSyncError::ConfigError("Cluster without a name".into()));
            }
            if !names.insert(cluster.name.as_str()) {
                return Err(AssocSyncError::ConfigError(format!(
                    "Cluster {} is configured more than once",
                    cluster.name
                )));
            }
            cluster.specs()?;
            cluster.user_specs()?;
        }
        Ok(())
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|cluster| cluster.name == name)
    }

    pub fn access_policy(&self) -> AccessPolicy {
        AccessPolicy {
            allow_all_groups: self.allow_all_groups.iter().cloned().collect(),
        }
    }

    pub fn usage_start(&self, today: NaiveDate) -> NaiveDate {
        self.usage_start
            .or_else(|| NaiveDate::from_ymd_opt(today.year(), 1, 1))
            .unwrap_or(today)
    }
}
