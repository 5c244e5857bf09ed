//! Entry points that run a command over the configured clusters.
use chrono::{DateTime, Utc};
use futures::StreamExt;
use slurm_assoc::client::command::{CommandRunner, LocalRunner, SshRunner};
use slurm_assoc::client::{
    ApiClient, ApiSettings, AssociationClient, CliClient, MutationOutcome, ShareRow,
    with_deadline,
};
use slurm_assoc::fairshare::backfill;

use crate::check::check_cluster;
use crate::common::config::{ClusterConfig, Config, TransportConfig};
use crate::common::error::AssocSyncError;
use crate::dump::build_cluster;
use crate::report::{CheckReport, SyncReport};
use crate::store::{AllocationStore, MemoryStore};
use crate::sync::{Filter, SyncSettings, sync_cluster};

/// Options given on the command line.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub noop: bool,
    pub push: bool,
    pub cluster: Option<String>,
    pub filter: Filter,
}

pub fn create_client(cluster: &ClusterConfig) -> crate::Result<Box<dyn AssociationClient>> {
    Ok(match &cluster.transport {
        TransportConfig::Cli(cli) => {
            let runner: Box<dyn CommandRunner> = match &cli.host {
                Some(host) => Box::new(SshRunner {
                    host: host.clone(),
                    user: cli.user.clone(),
                    port: cli.port,
                    identity: cli.identity.clone(),
                }),
                None => Box::new(LocalRunner),
            };
            Box::new(
                CliClient::new(cluster.name.as_str(), runner)
                    .with_binary_dir(cli.binary_dir.clone()),
            )
        }
        TransportConfig::Api(api) => {
            let mut settings = ApiSettings::new(api.base_url.as_str(), api.resolve_token()?);
            settings.user = api.user.clone();
            settings.version = api.version.clone();
            Box::new(ApiClient::new(cluster.name.as_str(), settings))
        }
    })
}

/// Clusters the command runs on: the requested one, or every cluster that is not ignored.
pub fn select_clusters<'a>(
    config: &'a Config,
    name: Option<&str>,
) -> crate::Result<Vec<&'a ClusterConfig>> {
    match name {
        Some(name) => match config.cluster(name) {
            Some(cluster) => Ok(vec![cluster]),
            None => Err(AssocSyncError::ConfigError(format!(
                "Cluster {name} is not configured"
            ))),
        },
        None => Ok(config
            .clusters
            .iter()
            .filter(|cluster| {
                let ignored = config.ignore.cluster(&cluster.name);
                if ignored {
                    log::debug!("Cluster {} is ignored", cluster.name);
                }
                !ignored
            })
            .collect()),
    }
}

pub fn create_settings(
    config: &Config,
    cluster: &ClusterConfig,
    options: &RunOptions,
    now: DateTime<Utc>,
) -> crate::Result<SyncSettings> {
    Ok(SyncSettings {
        noop: config.noop || options.noop,
        push: options.push,
        timeout: config.timeout,
        ignore: config.ignore.clone(),
        policy: config.access_policy(),
        fairshare: config.fairshare,
        usage_start: config.usage_start(now.date_naive()),
        now,
        filter: options.filter.clone(),
        specs: cluster.specs()?,
        user_specs: cluster.user_specs()?,
    })
}

fn prepare(
    config: &Config,
    cluster: &ClusterConfig,
    options: &RunOptions,
    now: DateTime<Utc>,
) -> crate::Result<(Box<dyn AssociationClient>, SyncSettings)> {
    Ok((
        create_client(cluster)?,
        create_settings(config, cluster, options, now)?,
    ))
}

/// Synchronizes the selected clusters, at most `parallelism` of them at the same time.
///
/// A dry run works on a fork of `store`, so `store` itself is written only by a real run.
pub async fn run_sync(
    config: &Config,
    store: &MemoryStore,
    options: &RunOptions,
) -> crate::Result<Vec<SyncReport>> {
    let clusters = select_clusters(config, options.cluster.as_deref())?;
    let fork;
    let store: &dyn AllocationStore = if config.noop || options.noop {
        fork = store.fork();
        &fork
    } else {
        store
    };
    let now = Utc::now();

    let mut reports: Vec<SyncReport> = futures::stream::iter(clusters)
        .map(|cluster| async move {
            match prepare(config, cluster, options, now) {
                Ok((client, settings)) => sync_cluster(&*client, store, &settings).await,
                Err(error) => {
                    let mut report = SyncReport::new(&cluster.name, cluster.transport.kind());
                    report.fatal = Some(error.to_string());
                    report.log_summary();
                    report
                }
            }
        })
        .buffer_unordered(config.parallelism)
        .collect()
        .await;
    reports.sort_by(|a, b| a.cluster.cmp(&b.cluster));
    Ok(reports)
}

pub async fn run_check(
    config: &Config,
    store: &dyn AllocationStore,
    options: &RunOptions,
) -> crate::Result<Vec<CheckReport>> {
    let clusters = select_clusters(config, options.cluster.as_deref())?;
    let now = Utc::now();

    let mut reports: Vec<CheckReport> = futures::stream::iter(clusters)
        .map(|cluster| async move {
            match prepare(config, cluster, options, now) {
                Ok((client, settings)) => check_cluster(&*client, store, &settings).await,
                Err(error) => {
                    let mut report = CheckReport::new(&cluster.name);
                    report.fatal = Some(error.to_string());
                    report.log_summary();
                    report
                }
            }
        })
        .buffer_unordered(config.parallelism)
        .collect()
        .await;
    reports.sort_by(|a, b| a.cluster.cmp(&b.cluster));
    Ok(reports)
}

/// Share rows of one cluster, with fair-share factors filled in if the scheduler reported none.
pub async fn run_shares(
    config: &Config,
    cluster: &str,
    filter: &Filter,
) -> crate::Result<Vec<ShareRow>> {
    let cluster = select_clusters(config, Some(cluster))?[0];
    let client = create_client(cluster)?;
    let accounts: Vec<String> = filter.account.iter().cloned().collect();
    let users: Vec<String> = filter.user.iter().cloned().collect();
    let mut rows = with_deadline(
        config.timeout,
        "get shares",
        client.get_shares(&accounts, &users),
    )
    .await?;
    backfill(&mut rows, &*config.fairshare.strategy());
    Ok(rows)
}

pub async fn run_set_fairshare(
    config: &Config,
    cluster: &str,
    account: &str,
    user: Option<&str>,
    value: u32,
    noop: bool,
) -> crate::Result<MutationOutcome> {
    let cluster = select_clusters(config, Some(cluster))?[0];
    let client = create_client(cluster)?;
    Ok(with_deadline(
        config.timeout,
        "set fairshare",
        client.set_fairshare(account, user, value, config.noop || noop),
    )
    .await?)
}

/// Writes the association tree that `cluster` should have according to the store.
pub fn run_dump(
    config: &Config,
    cluster: &str,
    store: &dyn AllocationStore,
    output: &mut impl std::io::Write,
) -> crate::Result<()> {
    let cluster = select_clusters(config, Some(cluster))?[0];
    let tree = build_cluster(
        &cluster.name,
        &cluster.specs()?,
        &cluster.user_specs()?,
        store,
    )?;
    crate::dump::write_cluster(&tree, output)
}
