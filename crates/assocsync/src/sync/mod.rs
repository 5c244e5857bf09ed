//! Reconciliation of one cluster: fetch the scheduler state once, then map it onto the
//! allocation store in consecutive passes.
use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use slurm_assoc::client::{AssociationClient, TransportKind, UsageRow, with_deadline};
use slurm_assoc::fairshare::{FairShareAlgorithm, backfill};
use slurm_assoc::model::Cluster;
use slurm_assoc::node::Node;
use slurm_assoc::partition::{AccessPolicy, Partition};
use slurm_assoc::spec::SpecSet;
use slurm_assoc::SlurmResult;

use crate::common::config::IgnoreLists;
use crate::report::SyncReport;
use crate::store::{AllocationStore, Resource, ResourceKind};

mod accounts;
mod nodes;
mod partitions;
mod push;

/// Restricts a run to a single account and/or user.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub account: Option<String>,
    pub user: Option<String>,
}

impl Filter {
    pub fn account(&self, name: &str) -> bool {
        self.account.as_deref().is_none_or(|account| account == name)
    }

    pub fn user(&self, name: &str) -> bool {
        self.user.as_deref().is_none_or(|user| user == name)
    }
}

/// Everything a pass needs besides the transport and the store.
#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub noop: bool,
    /// Create accounts and associations that exist only in the store.
    pub push: bool,
    pub timeout: Duration,
    pub ignore: IgnoreLists,
    pub policy: AccessPolicy,
    pub fairshare: FairShareAlgorithm,
    pub usage_start: NaiveDate,
    /// Time recorded as the service end of retired resources.
    pub now: DateTime<Utc>,
    pub filter: Filter,
    /// Specs of accounts created by a push.
    pub specs: SpecSet,
    /// Specs of user associations created by a push.
    pub user_specs: SpecSet,
}

impl SyncSettings {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            noop: false,
            push: false,
            timeout: Duration::from_secs(300),
            ignore: IgnoreLists::default(),
            policy: AccessPolicy::default(),
            fairshare: FairShareAlgorithm::default(),
            usage_start: now.date_naive(),
            now,
            filter: Filter::default(),
            specs: SpecSet::new(),
            user_specs: SpecSet::new(),
        }
    }
}

/// Scheduler state fetched once per pass.
pub(crate) struct ExternalState {
    pub cluster: Cluster,
    pub partitions: Vec<Partition>,
    /// Only the REST API reports nodes in a usable form.
    pub nodes: Option<Vec<Node>>,
    pub usage: Vec<UsageRow>,
}

async fn fetch(
    client: &dyn AssociationClient,
    settings: &SyncSettings,
    report: &mut SyncReport,
) -> SlurmResult<ExternalState> {
    let timeout = settings.timeout;
    let mut cluster = Cluster::new(client.cluster());
    for account in with_deadline(timeout, "list accounts", client.list_accounts(true, false)).await?
    {
        cluster.add_account(account);
    }

    let accounts: Vec<String> = settings.filter.account.iter().cloned().collect();
    let users: Vec<String> = settings.filter.user.iter().cloned().collect();
    let mut shares =
        with_deadline(timeout, "get shares", client.get_shares(&accounts, &users)).await?;
    backfill(&mut shares, &*settings.fairshare.strategy());
    for conflict in cluster.attach_shares(&shares) {
        report.error("shares", conflict);
    }

    let partitions = with_deadline(timeout, "list partitions", client.list_partitions()).await?;
    let nodes = match client.transport() {
        TransportKind::Api => {
            Some(with_deadline(timeout, "list nodes", client.list_nodes()).await?)
        }
        TransportKind::Cli => None,
    };

    let usage = match with_deadline(
        timeout,
        "get usage",
        client.get_usage(settings.usage_start),
    )
    .await
    {
        Ok(usage) => usage,
        Err(error) => {
            report.error("usage", error);
            Vec::new()
        }
    };

    Ok(ExternalState {
        cluster,
        partitions,
        nodes,
        usage,
    })
}

/// Runs one full reconciliation pass of the cluster behind `client`.
///
/// A failed fetch aborts the pass and is reported in [`SyncReport::fatal`]. Failures of single
/// entities are logged and collected while the rest of the pass continues.
pub async fn sync_cluster(
    client: &dyn AssociationClient,
    store: &dyn AllocationStore,
    settings: &SyncSettings,
) -> SyncReport {
    let mut report = SyncReport::new(client.cluster(), client.transport());
    log::info!(
        "Synchronizing cluster {} through {}",
        client.cluster(),
        client.transport()
    );

    let mut state = match fetch(client, settings, &mut report).await {
        Ok(state) => state,
        Err(error) => {
            report.fatal = Some(error.to_string());
            report.log_summary();
            return report;
        }
    };

    if let Err(error) = register_cluster(&state.cluster, store, &mut report) {
        report.error(format!("cluster {}", state.cluster.name), error);
    }
    if settings.push {
        push::push_missing(client, store, settings, &mut state.cluster, &mut report).await;
    }
    accounts::sync_accounts(&state, store, settings, &mut report);
    partitions::sync_partitions(&state, store, settings, &mut report);
    if let Some(nodes) = &state.nodes {
        nodes::sync_nodes(&state.cluster.name, nodes, store, settings, &mut report);
    }

    report.log_summary();
    report
}

fn register_cluster(
    cluster: &Cluster,
    store: &dyn AllocationStore,
    report: &mut SyncReport,
) -> crate::Result<()> {
    let mut resource = store
        .resource(&cluster.name, ResourceKind::Cluster, &cluster.name)?
        .unwrap_or_else(|| Resource::new(&cluster.name, ResourceKind::Cluster, &cluster.name));
    resource.available = true;
    resource.service_end = None;
    report.record(store.upsert_resource(resource)?);
    Ok(())
}

/// Marks resources of `kind` that the scheduler no longer reports as unavailable.
fn retire_missing(
    cluster: &str,
    kind: ResourceKind,
    seen: &BTreeSet<&str>,
    store: &dyn AllocationStore,
    settings: &SyncSettings,
    report: &mut SyncReport,
) -> crate::Result<()> {
    for mut resource in store.resources(cluster, kind)? {
        if !resource.available || seen.contains(resource.name.as_str()) {
            continue;
        }
        log::info!(
            "Cluster {cluster}: {kind:?} {} is no longer reported, marking it unavailable",
            resource.name
        );
        resource.available = false;
        resource.service_end = Some(settings.now);
        if store.upsert_resource(resource)?.is_change() {
            report.removed += 1;
        }
    }
    Ok(())
}
