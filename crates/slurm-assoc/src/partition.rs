use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::spec::SpecSet;

/// Explicit allow-list of a partition, which may be missing, a wildcard, or a list of names.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessList {
    #[default]
    Unset,
    All,
    Names(Vec<String>),
}

impl AccessList {
    pub const WILDCARD: &'static str = "ALL";

    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") | Some("(null)") => AccessList::Unset,
            Some(Self::WILDCARD) => AccessList::All,
            Some(value) => AccessList::from_names(value.split(',').map(str::trim)),
        }
    }

    pub fn from_names<S: AsRef<str>>(names: impl IntoIterator<Item = S>) -> Self {
        let names: Vec<String> = names
            .into_iter()
            .map(|name| name.as_ref().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        if names.is_empty() {
            AccessList::Unset
        } else if names.iter().any(|name| name == Self::WILDCARD) {
            AccessList::All
        } else {
            AccessList::Names(names)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    pub specs: SpecSet,
    pub allowed_accounts: AccessList,
    pub denied_accounts: Vec<String>,
    pub allowed_groups: Vec<String>,
    pub nodes: Vec<String>,
}

impl Partition {
    pub const BILLING_WEIGHTS: &'static str = "TRESBillingWeights";

    pub fn billing_weights(&self) -> Option<&str> {
        self.specs.get(Self::BILLING_WEIGHTS)
    }
}

/// Cluster wide settings of the partition access resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessPolicy {
    /// Groups whose presence in `AllowGroups` opens the partition to every account.
    ///
    /// Slurm's own `AllowGroups=ALL` is not one of them, since it is the default of every
    /// partition that restricts access only through `AllowAccounts`.
    pub allow_all_groups: BTreeSet<String>,
}

impl AccessPolicy {
    pub const SITE_GROUP: &'static str = "cluster_users";
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            allow_all_groups: BTreeSet::from([Self::SITE_GROUP.to_string()]),
        }
    }
}

/// Returns the accounts from `roster` (and, where Slurm treats groups as account names, from the
/// allowed groups) that may use `partition`.
///
/// The `ALL` group is not an account name and never ends up in the result.
///
/// The rules are evaluated in this order and the first matching one wins:
/// 1. an allow-all group is allowed: every account except the denied ones,
/// 2. `AllowAccounts=ALL`: the allowed groups,
/// 3. no `AllowAccounts`: the allowed groups except the denied accounts,
/// 4. otherwise the allowed groups together with the allowed accounts.
pub fn eligible_accounts<'a>(
    partition: &Partition,
    roster: impl IntoIterator<Item = &'a str>,
    policy: &AccessPolicy,
) -> BTreeSet<String> {
    let denied: BTreeSet<&str> = partition
        .denied_accounts
        .iter()
        .map(|a| a.as_str())
        .collect();
    let groups = partition
        .allowed_groups
        .iter()
        .filter(|g| g.as_str() != AccessList::WILDCARD)
        .map(|g| g.to_string());

    if partition
        .allowed_groups
        .iter()
        .any(|group| policy.allow_all_groups.contains(group))
    {
        return roster
            .into_iter()
            .filter(|account| !denied.contains(account))
            .map(|account| account.to_string())
            .collect();
    }

    match &partition.allowed_accounts {
        AccessList::All => groups.collect(),
        AccessList::Unset => groups.filter(|g| !denied.contains(g.as_str())).collect(),
        AccessList::Names(accounts) => groups.chain(accounts.iter().cloned()).collect(),
    }
}
