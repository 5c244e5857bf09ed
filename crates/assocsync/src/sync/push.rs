use slurm_assoc::client::{AssociationClient, with_deadline};
use slurm_assoc::model::{Account, Cluster, User};

use crate::report::SyncReport;
use crate::store::{
    ATTR_SLURM_SPECS, ATTR_SLURM_USER_SPECS, Allocation, AllocationStore, account_name,
};
use crate::sync::SyncSettings;

/// Creates the accounts and user associations of active allocations that the scheduler does
/// not know yet.
///
/// Everything that is created (or would be created in a dry run) is merged into `cluster`, so
/// that the following account pass treats the pushed users as present.
pub(super) async fn push_missing(
    client: &dyn AssociationClient,
    store: &dyn AllocationStore,
    settings: &SyncSettings,
    cluster: &mut Cluster,
    report: &mut SyncReport,
) {
    let allocations = match store.allocations(&cluster.name) {
        Ok(allocations) => allocations,
        Err(error) => {
            report.error("push", error);
            return;
        }
    };
    for allocation in allocations.iter().filter(|allocation| allocation.is_active()) {
        let name = match account_name(store, allocation) {
            Ok(name) => name,
            Err(error) => {
                report.error(format!("allocation {}", allocation.id), error);
                continue;
            }
        };
        if settings.ignore.account(&name) || !settings.filter.account(&name) {
            continue;
        }
        let result = push_allocation(client, settings, &name, allocation, cluster, report).await;
        if let Err(error) = result {
            report.error(format!("account {name}"), error);
        }
    }
}

async fn push_allocation(
    client: &dyn AssociationClient,
    settings: &SyncSettings,
    name: &str,
    allocation: &Allocation,
    cluster: &mut Cluster,
    report: &mut SyncReport,
) -> crate::Result<()> {
    if cluster.account(name).is_none() {
        let mut specs = settings.specs.clone();
        specs.extend(&allocation.specs(ATTR_SLURM_SPECS)?);
        let outcome = with_deadline(
            settings.timeout,
            "add account",
            client.add_account(name, &specs, settings.noop),
        )
        .await?;
        if !outcome.is_simulated() {
            log::info!("Cluster {}: created account {name}", cluster.name);
        }
        report.mutation(outcome);
        let mut account = Account::new(name);
        account.specs = specs;
        cluster.add_account(account);
    }

    let mut user_specs = settings.user_specs.clone();
    user_specs.extend(&allocation.specs(ATTR_SLURM_USER_SPECS)?);
    for username in allocation.active_users() {
        if settings.ignore.user(username) || !settings.filter.user(username) {
            continue;
        }
        if cluster
            .account(name)
            .is_some_and(|account| account.user(username).is_some())
        {
            continue;
        }
        let outcome = with_deadline(
            settings.timeout,
            "add association",
            client.add_association(name, username, &user_specs, settings.noop),
        )
        .await;
        match outcome {
            Ok(outcome) => {
                if !outcome.is_simulated() {
                    log::info!(
                        "Cluster {}: created association {username}@{name}",
                        cluster.name
                    );
                }
                report.mutation(outcome);
                cluster
                    .get_or_insert_account(name)
                    .add_user(User::new(username).with_specs(user_specs.clone()));
            }
            Err(error) => report.error(format!("association {username}@{name}"), error),
        }
    }
    Ok(())
}
