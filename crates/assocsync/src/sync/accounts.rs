use slurm_assoc::model::Account;

use crate::report::SyncReport;
use crate::store::{
    ATTR_CLOUD_ACCOUNT, ATTR_SLURM_ACCOUNT, ATTR_USAGE_HOURS, Allocation, AllocationStore,
    AllocationUserStatus,
};
use crate::sync::{ExternalState, SyncSettings};

pub(super) fn sync_accounts(
    state: &ExternalState,
    store: &dyn AllocationStore,
    settings: &SyncSettings,
    report: &mut SyncReport,
) {
    for account in state.cluster.accounts() {
        if account.is_root()
            || settings.ignore.account(&account.name)
            || !settings.filter.account(&account.name)
        {
            continue;
        }
        if let Err(error) = sync_account(account, state, store, settings, report) {
            report.error(format!("account {}", account.name), error);
        }
    }
}

fn sync_account(
    account: &Account,
    state: &ExternalState,
    store: &dyn AllocationStore,
    settings: &SyncSettings,
    report: &mut SyncReport,
) -> crate::Result<()> {
    let cluster = &state.cluster.name;
    let Some(project) = store.find_project(&account.name)? else {
        log::warn!(
            "Cluster {cluster}: account {} has no matching project",
            account.name
        );
        report.undetected.push(account.name.clone());
        return Ok(());
    };

    let (allocation, change) = store.get_or_create_allocation(&project, cluster)?;
    report.record(change);
    let id = allocation.id;
    report.record(store.set_allocation_attribute(id, ATTR_SLURM_ACCOUNT, &account.name)?);
    report.record(store.set_allocation_attribute(id, ATTR_CLOUD_ACCOUNT, &account.name)?);
    report.record(store.init_allocation_attribute(id, ATTR_USAGE_HOURS, "0")?);
    if let Some(metrics) = account.shares() {
        report.record(store.set_allocation_shares(id, *metrics)?);
    }

    sync_users(account, &allocation, store, settings, report)?;
    import_usage(account, &allocation, state, store, settings, report)
}

/// Users that are active internally but missing from the scheduler are removed, every user
/// known to the scheduler is made active.
fn sync_users(
    account: &Account,
    allocation: &Allocation,
    store: &dyn AllocationStore,
    settings: &SyncSettings,
    report: &mut SyncReport,
) -> crate::Result<()> {
    let considered = |name: &str| !settings.ignore.user(name) && settings.filter.user(name);

    for username in allocation.active_users() {
        if account.user(username).is_some() || !considered(username) {
            continue;
        }
        let change = store.set_user_status(allocation.id, username, AllocationUserStatus::Removed)?;
        if change.is_change() {
            log::info!(
                "Cluster {}: user {username} was removed from account {}",
                allocation.cluster,
                account.name
            );
            report.removed += 1;
        }
    }

    for user in account.users() {
        if !considered(&user.name) {
            continue;
        }
        report.record(store.set_user_status(
            allocation.id,
            &user.name,
            AllocationUserStatus::Active,
        )?);
        if let Some(metrics) = user.shares() {
            report.record(store.set_user_shares(allocation.id, &user.name, *metrics)?);
        }
    }
    Ok(())
}

fn import_usage(
    account: &Account,
    allocation: &Allocation,
    state: &ExternalState,
    store: &dyn AllocationStore,
    settings: &SyncSettings,
    report: &mut SyncReport,
) -> crate::Result<()> {
    let imported = |name: &str| {
        account.user(name).is_some() && !settings.ignore.user(name) && settings.filter.user(name)
    };
    for row in state.usage.iter().filter(|row| row.account == account.name) {
        match &row.user {
            None => {
                let hours = format!("{:.2}", row.hours);
                report.record(store.set_allocation_attribute(
                    allocation.id,
                    ATTR_USAGE_HOURS,
                    &hours,
                )?);
            }
            Some(user) if imported(user) => {
                report.record(store.set_user_usage(allocation.id, user, row.hours)?);
            }
            Some(user) => {
                log::debug!(
                    "Usage of user {user} in account {} is not imported",
                    account.name
                );
            }
        }
    }
    Ok(())
}
