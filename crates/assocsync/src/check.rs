//! Consistency check that prunes scheduler associations without an active internal counterpart.
//!
//! The check only ever removes things from the scheduler and never writes to the store.
use std::collections::{BTreeMap, BTreeSet};

use slurm_assoc::client::{AssociationClient, AssociationRecord, with_deadline};

use crate::report::CheckReport;
use crate::store::{AllocationStore, account_name};
use crate::sync::SyncSettings;

/// Active users of every active allocation on `cluster`, by account name.
fn expected_associations(
    cluster: &str,
    store: &dyn AllocationStore,
) -> crate::Result<BTreeMap<String, BTreeSet<String>>> {
    let mut expected: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for allocation in store.allocations(cluster)? {
        if !allocation.is_active() {
            continue;
        }
        let name = account_name(store, &allocation)?;
        expected
            .entry(name)
            .or_default()
            .extend(allocation.active_users().map(|user| user.to_string()));
    }
    Ok(expected)
}

pub async fn check_cluster(
    client: &dyn AssociationClient,
    store: &dyn AllocationStore,
    settings: &SyncSettings,
) -> CheckReport {
    let mut report = CheckReport::new(client.cluster());
    log::info!("Checking associations of cluster {}", client.cluster());

    let records = with_deadline(
        settings.timeout,
        "get associations",
        client.get_associations(
            settings.filter.account.as_deref(),
            settings.filter.user.as_deref(),
        ),
    )
    .await;
    let records = match records {
        Ok(records) => records,
        Err(error) => {
            report.fatal = Some(error.to_string());
            report.log_summary();
            return report;
        }
    };
    let expected = match expected_associations(client.cluster(), store) {
        Ok(expected) => expected,
        Err(error) => {
            report.fatal = Some(error.to_string());
            report.log_summary();
            return report;
        }
    };

    let mut by_account: BTreeMap<&str, Vec<&AssociationRecord>> = BTreeMap::new();
    for record in &records {
        if settings.ignore.account(&record.account) || !settings.filter.account(&record.account) {
            continue;
        }
        by_account.entry(&record.account).or_default().push(record);
    }

    for (account, records) in by_account {
        match expected.get(account) {
            // A user filter must never remove a whole account.
            None if settings.filter.user.is_none() => {
                remove_account(client, settings, account, &mut report).await;
            }
            None => {
                remove_users(client, settings, account, &records, &BTreeSet::new(), &mut report)
                    .await;
            }
            Some(users) => {
                remove_users(client, settings, account, &records, users, &mut report).await;
            }
        }
    }

    report.log_summary();
    report
}

async fn remove_account(
    client: &dyn AssociationClient,
    settings: &SyncSettings,
    account: &str,
    report: &mut CheckReport,
) {
    log::info!(
        "Cluster {}: account {account} has no active allocation",
        client.cluster()
    );
    let result = with_deadline(
        settings.timeout,
        "remove account",
        client.remove_account(account, settings.noop),
    )
    .await;
    match result {
        Ok(outcome) => {
            report.mutation(outcome);
            report.removed_accounts.push(account.to_string());
        }
        Err(error) => report.error(format!("account {account}"), error),
    }
}

async fn remove_users(
    client: &dyn AssociationClient,
    settings: &SyncSettings,
    account: &str,
    records: &[&AssociationRecord],
    expected: &BTreeSet<String>,
    report: &mut CheckReport,
) {
    for record in records {
        let Some(user) = &record.user else {
            continue;
        };
        if expected.contains(user) || settings.ignore.user(user) || !settings.filter.user(user) {
            continue;
        }
        let Some(reference) = record.reference() else {
            continue;
        };
        log::info!(
            "Cluster {}: association {reference} has no active allocation user",
            client.cluster()
        );
        let result = with_deadline(
            settings.timeout,
            "remove association",
            client.remove_association(&reference, settings.noop),
        )
        .await;
        match result {
            Ok(outcome) => {
                report.mutation(outcome);
                report
                    .removed_associations
                    .push(format!("{user}@{account}"));
            }
            Err(error) => report.error(format!("association {user}@{account}"), error),
        }
    }
}
