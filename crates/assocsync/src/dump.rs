//! Builds the association tree a cluster should have according to the store.
use std::io::Write;

use slurm_assoc::ROOT_ACCOUNT;
use slurm_assoc::model::{AllocationSource, Cluster};
use slurm_assoc::parser::write_dump;
use slurm_assoc::spec::SpecSet;

use crate::store::{ATTR_SLURM_SPECS, ATTR_SLURM_USER_SPECS, AllocationStore, account_name};

/// Merges every active allocation on `cluster` into a new tree.
///
/// `user_specs` are added to every user association. Allocations that cannot be merged are
/// logged and left out.
pub fn build_cluster(
    cluster: &str,
    specs: &SpecSet,
    user_specs: &SpecSet,
    store: &dyn AllocationStore,
) -> crate::Result<Cluster> {
    let mut tree = Cluster::new(cluster);
    tree.specs = specs.clone();
    tree.get_or_insert_account(ROOT_ACCOUNT);

    for allocation in store.allocations(cluster)? {
        if !allocation.is_active() {
            continue;
        }
        let Some(project) = store.project(allocation.project)? else {
            log::warn!(
                "Allocation {} refers to missing project {}",
                allocation.id,
                allocation.project
            );
            continue;
        };
        let source = AllocationSource {
            account_name: Some(account_name(store, &allocation)?),
            specs: allocation.specs(ATTR_SLURM_SPECS)?,
            user_specs: allocation.specs(ATTR_SLURM_USER_SPECS)?,
            active_users: allocation.active_users().map(|user| user.to_string()).collect(),
        };
        if let Err(error) = tree
            .get_or_insert_account(&project.name)
            .add_allocation(&source, user_specs)
        {
            log::error!("Allocation {} of project {}: {error}", allocation.id, project.name);
        }
    }
    Ok(tree)
}

pub fn write_cluster(tree: &Cluster, output: &mut impl Write) -> crate::Result<()> {
    write_dump(tree, output)?;
    Ok(())
}
