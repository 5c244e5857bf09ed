use std::cell::RefCell;

use chrono::{NaiveDate, TimeZone, Utc};
use slurm_assoc::client::{
    AssociationClient, AssociationRecord, AssociationRef, ClientFuture, MutationOutcome,
    ShareRow, TransportKind, UsageRow,
};
use slurm_assoc::model::{Account, ShareMetrics, User};
use slurm_assoc::node::Node;
use slurm_assoc::partition::Partition;
use slurm_assoc::spec::SpecSet;
use slurm_assoc::{SlurmError, SlurmResult};

use crate::store::{AllocationStore, AllocationUserStatus, MemoryStore};
use crate::sync::SyncSettings;

/// Scheduler state served by [`FakeClient`].
#[derive(Default)]
pub struct FakeState {
    pub accounts: Vec<Account>,
    pub partitions: Vec<Partition>,
    pub nodes: Vec<Node>,
    pub shares: Vec<ShareRow>,
    pub usage: Vec<UsageRow>,
    pub fail_accounts: bool,
    /// Association creation fails as for a missing parent account.
    pub fail_creates: bool,
}

/// In-memory scheduler that records every mutation that was really applied.
pub struct FakeClient {
    cluster: String,
    transport: TransportKind,
    pub state: RefCell<FakeState>,
    pub calls: RefCell<Vec<String>>,
}

impl FakeClient {
    pub fn new(cluster: &str, transport: TransportKind) -> Self {
        Self {
            cluster: cluster.to_string(),
            transport,
            state: Default::default(),
            calls: Default::default(),
        }
    }

    pub fn add_slurm_account(&self, name: &str, users: &[&str]) {
        let mut account = Account::new(name);
        for user in users {
            account.add_user(User::new(*user));
        }
        self.state.borrow_mut().accounts.push(account);
    }

    pub fn add_share(&self, account: &str, user: Option<&str>, raw_shares: f64) {
        self.state.borrow_mut().shares.push(ShareRow {
            account: account.to_string(),
            user: user.map(|u| u.to_string()),
            metrics: ShareMetrics {
                raw_shares,
                normalized_shares: 0.5,
                raw_usage: 10.0,
                effective_usage: 0.25,
                fair_share: 0.0,
            },
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn mutate(&self, payload: String, noop: bool) -> SlurmResult<MutationOutcome> {
        if noop {
            return Ok(MutationOutcome::Simulated(payload));
        }
        self.calls.borrow_mut().push(payload);
        Ok(MutationOutcome::Applied)
    }

    fn records(&self) -> Vec<AssociationRecord> {
        let state = self.state.borrow();
        let mut records = Vec::new();
        for account in &state.accounts {
            records.push(AssociationRecord {
                account: account.name.clone(),
                user: None,
                id: None,
                specs: SpecSet::new(),
            });
            for user in account.users() {
                records.push(AssociationRecord {
                    account: account.name.clone(),
                    user: Some(user.name.clone()),
                    id: None,
                    specs: user.specs.clone(),
                });
            }
        }
        records
    }
}

impl AssociationClient for FakeClient {
    fn cluster(&self) -> &str {
        &self.cluster
    }

    fn transport(&self) -> TransportKind {
        self.transport
    }

    fn list_accounts(
        &self,
        with_associations: bool,
        _with_coordinators: bool,
    ) -> ClientFuture<'_, Vec<Account>> {
        Box::pin(async move {
            let state = self.state.borrow();
            if state.fail_accounts {
                return Err(SlurmError::Transport("connection refused".into()));
            }
            let mut accounts = state.accounts.clone();
            if !with_associations {
                accounts.iter_mut().for_each(|a| a.clear_users());
            }
            Ok(accounts)
        })
    }

    fn list_partitions(&self) -> ClientFuture<'_, Vec<Partition>> {
        Box::pin(async move { Ok(self.state.borrow().partitions.clone()) })
    }

    fn list_nodes(&self) -> ClientFuture<'_, Vec<Node>> {
        Box::pin(async move { Ok(self.state.borrow().nodes.clone()) })
    }

    fn get_associations<'a>(
        &'a self,
        account: Option<&'a str>,
        user: Option<&'a str>,
    ) -> ClientFuture<'a, Vec<AssociationRecord>> {
        Box::pin(async move {
            Ok(self
                .records()
                .into_iter()
                .filter(|r| account.is_none_or(|a| r.account == a))
                .filter(|r| user.is_none_or(|u| r.user.as_deref() == Some(u)))
                .collect())
        })
    }

    fn add_association<'a>(
        &'a self,
        account: &'a str,
        user: &'a str,
        specs: &'a SpecSet,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome> {
        Box::pin(async move {
            if self.state.borrow().fail_creates && !noop {
                return Err(SlurmError::Transport(format!(
                    "Parent account {account} doesn't exist"
                )));
            }
            self.mutate(format!("add association {user}@{account} {}", specs.join(":")), noop)
        })
    }

    fn remove_association<'a>(
        &'a self,
        association: &'a AssociationRef,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome> {
        Box::pin(async move { self.mutate(format!("remove association {association}"), noop) })
    }

    fn add_account<'a>(
        &'a self,
        name: &'a str,
        specs: &'a SpecSet,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome> {
        Box::pin(async move {
            self.mutate(format!("add account {name} {}", specs.join(":")), noop)
        })
    }

    fn remove_account<'a>(
        &'a self,
        name: &'a str,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome> {
        Box::pin(async move { self.mutate(format!("remove account {name}"), noop) })
    }

    fn get_shares<'a>(
        &'a self,
        accounts: &'a [String],
        users: &'a [String],
    ) -> ClientFuture<'a, Vec<ShareRow>> {
        Box::pin(async move {
            Ok(self
                .state
                .borrow()
                .shares
                .iter()
                .filter(|row| accounts.is_empty() || accounts.contains(&row.account))
                .filter(|row| {
                    users.is_empty() || row.user.as_ref().is_some_and(|u| users.contains(u))
                })
                .cloned()
                .collect())
        })
    }

    fn set_fairshare<'a>(
        &'a self,
        account: &'a str,
        user: Option<&'a str>,
        value: u32,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome> {
        Box::pin(async move {
            self.mutate(
                format!("set fairshare {account} {} {value}", user.unwrap_or("-")),
                noop,
            )
        })
    }

    fn get_usage(&self, _start: NaiveDate) -> ClientFuture<'_, Vec<UsageRow>> {
        Box::pin(async move { Ok(self.state.borrow().usage.clone()) })
    }
}

pub fn settings() -> SyncSettings {
    SyncSettings::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
}

/// Adds a project with an allocation on `cluster` whose users are all active.
pub fn add_allocation(store: &MemoryStore, project: &str, cluster: &str, users: &[&str]) -> u64 {
    let project = store.add_project(project, true);
    let (allocation, _) = store.get_or_create_allocation(&project, cluster).unwrap();
    for user in users {
        store
            .set_user_status(allocation.id, user, AllocationUserStatus::Active)
            .unwrap();
    }
    allocation.id
}
