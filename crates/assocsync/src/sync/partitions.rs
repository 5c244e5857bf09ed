use std::collections::{BTreeMap, BTreeSet};

use slurm_assoc::partition::{Partition, eligible_accounts};

use crate::report::SyncReport;
use crate::store::{
    ATTR_BILLING_WEIGHTS, ATTR_NODES, Allocation, AllocationStore, Resource, ResourceKind,
    account_name,
};
use crate::sync::{ExternalState, SyncSettings, retire_missing};

pub(super) fn sync_partitions(
    state: &ExternalState,
    store: &dyn AllocationStore,
    settings: &SyncSettings,
    report: &mut SyncReport,
) {
    let cluster = &state.cluster.name;
    let allocations = match linkable_allocations(cluster, store, settings) {
        Ok(allocations) => allocations,
        Err(error) => {
            report.error("partitions", error);
            return;
        }
    };
    // Eligibility depends on the complete roster, filters restrict only the links.
    let roster: Vec<&str> = state.cluster.account_names().collect();

    let mut seen = BTreeSet::new();
    for partition in &state.partitions {
        seen.insert(partition.name.as_str());
        if let Err(error) =
            sync_partition(cluster, partition, &roster, &allocations, store, settings, report)
        {
            report.error(format!("partition {}", partition.name), error);
        }
    }
    if let Err(error) = retire_missing(
        cluster,
        ResourceKind::Partition,
        &seen,
        store,
        settings,
        report,
    ) {
        report.error("partitions", error);
    }
}

/// Allocations of the cluster by their account name.
fn linkable_allocations(
    cluster: &str,
    store: &dyn AllocationStore,
    settings: &SyncSettings,
) -> crate::Result<BTreeMap<String, Allocation>> {
    let mut result = BTreeMap::new();
    for allocation in store.allocations(cluster)? {
        let name = account_name(store, &allocation)?;
        if settings.ignore.account(&name) || !settings.filter.account(&name) {
            continue;
        }
        result.insert(name, allocation);
    }
    Ok(result)
}

fn sync_partition(
    cluster: &str,
    partition: &Partition,
    roster: &[&str],
    allocations: &BTreeMap<String, Allocation>,
    store: &dyn AllocationStore,
    settings: &SyncSettings,
    report: &mut SyncReport,
) -> crate::Result<()> {
    let mut resource = store
        .resource(cluster, ResourceKind::Partition, &partition.name)?
        .unwrap_or_else(|| Resource::new(cluster, ResourceKind::Partition, &partition.name));
    match partition.billing_weights() {
        Some(weights) => {
            resource
                .attributes
                .insert(ATTR_BILLING_WEIGHTS.to_string(), weights.to_string());
        }
        None => {
            resource.attributes.remove(ATTR_BILLING_WEIGHTS);
        }
    }
    resource
        .attributes
        .insert(ATTR_NODES.to_string(), partition.nodes.join(","));
    resource.available = true;
    resource.service_end = None;
    report.record(store.upsert_resource(resource)?);

    let eligible = eligible_accounts(partition, roster.iter().copied(), &settings.policy);
    for (name, allocation) in allocations {
        if eligible.contains(name) && allocation.is_active() {
            report.record(store.link_partition(allocation.id, &partition.name)?);
        } else if store
            .unlink_partition(allocation.id, &partition.name)?
            .is_change()
        {
            log::info!(
                "Cluster {cluster}: account {name} lost access to partition {}",
                partition.name
            );
            report.removed += 1;
        }
    }
    Ok(())
}
