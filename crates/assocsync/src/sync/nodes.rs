use std::collections::BTreeSet;

use slurm_assoc::node::Node;

use crate::report::SyncReport;
use crate::store::{
    ATTR_CORES, ATTR_FEATURES, ATTR_GPUS, ATTR_OWNER, ATTR_PARTITIONS, ATTR_STATE,
    AllocationStore, Resource, ResourceKind,
};
use crate::sync::{SyncSettings, retire_missing};

pub(super) fn sync_nodes(
    cluster: &str,
    nodes: &[Node],
    store: &dyn AllocationStore,
    settings: &SyncSettings,
    report: &mut SyncReport,
) {
    let mut seen = BTreeSet::new();
    for node in nodes {
        seen.insert(node.name.as_str());
        if let Err(error) = sync_node(cluster, node, store, report) {
            report.error(format!("node {}", node.name), error);
        }
    }
    if let Err(error) = retire_missing(cluster, ResourceKind::Node, &seen, store, settings, report)
    {
        report.error("nodes", error);
    }
}

fn sync_node(
    cluster: &str,
    node: &Node,
    store: &dyn AllocationStore,
    report: &mut SyncReport,
) -> crate::Result<()> {
    let mut resource = store
        .resource(cluster, ResourceKind::Node, &node.name)?
        .unwrap_or_else(|| Resource::new(cluster, ResourceKind::Node, &node.name));

    let attributes = [
        (ATTR_FEATURES, node.features.join(",")),
        (ATTR_GPUS, node.gpus.to_string()),
        (ATTR_CORES, node.cpus.to_string()),
        (ATTR_STATE, node.state.join("+")),
        (ATTR_PARTITIONS, node.partitions.join(",")),
    ];
    for (key, value) in attributes {
        resource.attributes.insert(key.to_string(), value);
    }

    // The owner is assigned once and never replaced by a later report.
    match (resource.attribute(ATTR_OWNER), &node.owner) {
        (None, Some(owner)) => {
            resource
                .attributes
                .insert(ATTR_OWNER.to_string(), owner.clone());
        }
        (Some(current), Some(owner)) if current != owner => {
            log::warn!(
                "Cluster {cluster}: node {} reports owner {owner}, keeping {current}",
                node.name
            );
        }
        _ => {}
    }

    resource.available = true;
    resource.service_end = None;
    report.record(store.upsert_resource(resource)?);
    Ok(())
}
