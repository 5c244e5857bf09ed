//! In-memory association tree: Cluster -> Account -> User.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::client::ShareRow;
use crate::spec::SpecSet;
use crate::{ROOT_ACCOUNT, SlurmError, SlurmResult};

/// Share metrics as reported by `sshare` or the shares endpoint of the REST API.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShareMetrics {
    pub raw_shares: f64,
    pub normalized_shares: f64,
    pub raw_usage: f64,
    pub effective_usage: f64,
    pub fair_share: f64,
}

/// Share metrics can be set only once per entity and pass. Setting the same record again is a
/// no-op, setting a different one is a conflict.
fn set_shares_once(
    slot: &mut Option<ShareMetrics>,
    metrics: ShareMetrics,
    entity: &str,
) -> SlurmResult<()> {
    match slot {
        None => {
            *slot = Some(metrics);
            Ok(())
        }
        Some(existing) if *existing == metrics => Ok(()),
        Some(existing) => Err(SlurmError::MappingConflict(format!(
            "{entity} already has share metrics {existing:?}, refusing to replace them with {metrics:?}"
        ))),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub specs: SpecSet,
    shares: Option<ShareMetrics>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            specs: SpecSet::new(),
            shares: None,
        }
    }

    pub fn with_specs(mut self, specs: SpecSet) -> Self {
        self.specs = specs;
        self
    }

    pub fn shares(&self) -> Option<&ShareMetrics> {
        self.shares.as_ref()
    }

    pub fn set_shares(&mut self, metrics: ShareMetrics) -> SlurmResult<()> {
        set_shares_once(&mut self.shares, metrics, &format!("User {}", self.name))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    /// Account under which this account was declared (`None` means directly under root).
    pub parent: Option<String>,
    pub specs: SpecSet,
    pub coordinators: Vec<String>,
    shares: Option<ShareMetrics>,
    users: BTreeMap<String, User>,
}

impl Account {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            specs: SpecSet::new(),
            coordinators: Vec::new(),
            shares: None,
            users: BTreeMap::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.name == ROOT_ACCOUNT
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn user(&self, name: &str) -> Option<&User> {
        self.users.get(name)
    }

    pub fn user_mut(&mut self, name: &str) -> Option<&mut User> {
        self.users.get_mut(name)
    }

    pub fn user_names(&self) -> impl Iterator<Item = &str> {
        self.users.keys().map(|name| name.as_str())
    }

    pub fn clear_users(&mut self) {
        self.users.clear();
    }

    pub fn shares(&self) -> Option<&ShareMetrics> {
        self.shares.as_ref()
    }

    pub fn set_shares(&mut self, metrics: ShareMetrics) -> SlurmResult<()> {
        set_shares_once(&mut self.shares, metrics, &format!("Account {}", self.name))
    }

    /// Merges `user` into the account by name.
    ///
    /// Specs accumulate. A share metrics record is taken over only if the stored user has none
    /// yet; a different record for the same user is logged as a conflict and dropped.
    /// Returns `false` if such a conflict happened.
    pub fn add_user(&mut self, user: User) -> bool {
        let User {
            name,
            specs,
            shares,
        } = user;
        let entry = self
            .users
            .entry(name.clone())
            .or_insert_with(|| User::new(name));
        entry.specs.extend(&specs);
        if let Some(metrics) = shares {
            if let Err(error) = entry.set_shares(metrics) {
                log::warn!("Account {}: {error}", self.name);
                return false;
            }
        }
        true
    }

    /// Merges an internal allocation into this account.
    ///
    /// The allocation specs are added to the account, while the allocation user specs together
    /// with `user_specs` are added to every active user of the allocation. The allocation has to
    /// declare this account as its owner, otherwise the two sources disagree about ownership and
    /// nothing is merged.
    pub fn add_allocation(
        &mut self,
        allocation: &AllocationSource,
        user_specs: &SpecSet,
    ) -> SlurmResult<()> {
        let declared = allocation.account_name.as_deref().unwrap_or(ROOT_ACCOUNT);
        if declared != self.name {
            return Err(SlurmError::MappingConflict(format!(
                "Allocation declares account `{declared}`, but it is being merged into account `{}`",
                self.name
            )));
        }

        self.specs.extend(&allocation.specs);
        for username in &allocation.active_users {
            let mut specs = allocation.user_specs.clone();
            specs.extend(user_specs);
            self.add_user(User::new(username.as_str()).with_specs(specs));
        }
        Ok(())
    }
}

/// View of an internal allocation that is needed to merge it into the association tree.
#[derive(Clone, Debug, Default)]
pub struct AllocationSource {
    /// External account name declared by the allocation.
    pub account_name: Option<String>,
    pub specs: SpecSet,
    pub user_specs: SpecSet,
    /// Usernames of the active allocation users.
    pub active_users: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub specs: SpecSet,
    accounts: BTreeMap<String, Account>,
}

impl Cluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            specs: SpecSet::new(),
            accounts: BTreeMap::new(),
        }
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn account(&self, name: &str) -> Option<&Account> {
        self.accounts.get(name)
    }

    pub fn account_mut(&mut self, name: &str) -> Option<&mut Account> {
        self.accounts.get_mut(name)
    }

    /// Names of all accounts except the structural root.
    pub fn account_names(&self) -> impl Iterator<Item = &str> {
        self.accounts
            .keys()
            .map(|name| name.as_str())
            .filter(|name| *name != ROOT_ACCOUNT)
    }

    pub fn get_or_insert_account(&mut self, name: &str) -> &mut Account {
        self.accounts
            .entry(name.to_string())
            .or_insert_with(|| Account::new(name))
    }

    /// Adds an account, merging specs, coordinators and users into an existing account of the
    /// same name.
    pub fn add_account(&mut self, account: Account) {
        match self.accounts.get_mut(&account.name) {
            Some(existing) => {
                existing.specs.extend(&account.specs);
                for coordinator in account.coordinators {
                    if !existing.coordinators.contains(&coordinator) {
                        existing.coordinators.push(coordinator);
                    }
                }
                if existing.parent.is_none() {
                    existing.parent = account.parent;
                }
                if let Some(metrics) = account.shares {
                    if let Err(error) = existing.set_shares(metrics) {
                        log::warn!("Cluster {}: {error}", self.name);
                    }
                }
                for user in account.users.into_values() {
                    existing.add_user(user);
                }
            }
            None => {
                self.accounts.insert(account.name.clone(), account);
            }
        }
    }

    /// Merges an allocation into the account it declares, creating the account if needed.
    pub fn add_allocation(
        &mut self,
        allocation: &AllocationSource,
        user_specs: &SpecSet,
    ) -> SlurmResult<()> {
        let name = allocation
            .account_name
            .clone()
            .unwrap_or_else(|| ROOT_ACCOUNT.to_string());
        self.get_or_insert_account(&name)
            .add_allocation(allocation, user_specs)
    }

    /// Attaches share rows to the matching accounts and users.
    /// Rows for unknown entities are ignored, conflicts are returned to the caller.
    pub fn attach_shares(&mut self, rows: &[ShareRow]) -> Vec<SlurmError> {
        let mut conflicts = Vec::new();
        for row in rows {
            let Some(account) = self.accounts.get_mut(&row.account) else {
                continue;
            };
            let result = match &row.user {
                None => account.set_shares(row.metrics),
                Some(user) => match account.user_mut(user) {
                    Some(user) => user.set_shares(row.metrics),
                    None => Ok(()),
                },
            };
            if let Err(error) = result {
                conflicts.push(error);
            }
        }
        conflicts
    }

    pub fn into_accounts(self) -> Vec<Account> {
        self.accounts.into_values().collect()
    }
}
