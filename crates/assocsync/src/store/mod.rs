//! Internal allocation records that the scheduler state is reconciled with.
//!
//! The store is owned by the surrounding allocation system. Only the operations needed by the
//! reconciliation are modelled here; each of them touches a single entity, so a failure can never
//! roll back entities that were written before it.
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slurm_assoc::model::ShareMetrics;
use slurm_assoc::spec::SpecSet;

use crate::common::error::AssocSyncError;

pub mod memory;

pub use memory::MemoryStore;

pub type ProjectId = u64;
pub type AllocationId = u64;

/// Allocation attribute with the name of the Slurm account.
pub const ATTR_SLURM_ACCOUNT: &str = "slurm_account_name";
/// Allocation attribute with the alias of the account in the cloud/accounting portal.
pub const ATTR_CLOUD_ACCOUNT: &str = "cloud_account_name";
pub const ATTR_USAGE_HOURS: &str = "usage_hours";
/// Colon-joined specs applied to the Slurm account of the allocation.
pub const ATTR_SLURM_SPECS: &str = "slurm_specs";
/// Colon-joined specs applied to every user association of the allocation.
pub const ATTR_SLURM_USER_SPECS: &str = "slurm_user_specs";

/// Resource attributes.
pub const ATTR_BILLING_WEIGHTS: &str = "billing_weights";
pub const ATTR_NODES: &str = "nodes";
pub const ATTR_FEATURES: &str = "features";
pub const ATTR_CORES: &str = "cores";
pub const ATTR_GPUS: &str = "gpus";
pub const ATTR_STATE: &str = "state";
pub const ATTR_PARTITIONS: &str = "partitions";
pub const ATTR_OWNER: &str = "owner";

/// Outcome of a single store write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    Created,
    Updated,
    Unchanged,
}

impl Change {
    pub fn is_change(self) -> bool {
        self != Change::Unchanged
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    /// External identifier, equal to the name of the Slurm account.
    pub name: String,
    #[serde(default)]
    pub title: String,
    pub active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStatus {
    Active,
    Expired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationUserStatus {
    Active,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllocationUser {
    pub status: AllocationUserStatus,
    #[serde(default)]
    pub shares: Option<ShareMetrics>,
    #[serde(default)]
    pub usage_hours: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub project: ProjectId,
    pub cluster: String,
    pub status: AllocationStatus,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub shares: Option<ShareMetrics>,
    #[serde(default)]
    pub users: BTreeMap<String, AllocationUser>,
    /// Names of partitions of the cluster that are linked to this allocation.
    #[serde(default)]
    pub partitions: BTreeSet<String>,
}

impl Allocation {
    pub fn is_active(&self) -> bool {
        self.status == AllocationStatus::Active
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|value| value.as_str())
    }

    /// Specs stored in a colon-joined attribute of the allocation.
    pub fn specs(&self, key: &str) -> crate::Result<SpecSet> {
        match self.attribute(key) {
            Some(value) => Ok(SpecSet::parse_joined(value, ':')?),
            None => Ok(SpecSet::new()),
        }
    }

    pub fn active_users(&self) -> impl Iterator<Item = &str> {
        self.users
            .iter()
            .filter(|(_, user)| user.status == AllocationUserStatus::Active)
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Cluster,
    Partition,
    Node,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub cluster: String,
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub available: bool,
    #[serde(default)]
    pub service_end: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn new(cluster: &str, kind: ResourceKind, name: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            kind,
            name: name.to_string(),
            attributes: BTreeMap::new(),
            available: true,
            service_end: None,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|value| value.as_str())
    }
}

/// Serializable content of a store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub projects: BTreeMap<ProjectId, Project>,
    #[serde(default)]
    pub allocations: BTreeMap<AllocationId, Allocation>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

pub trait AllocationStore {
    fn find_project(&self, name: &str) -> crate::Result<Option<Project>>;

    fn project(&self, id: ProjectId) -> crate::Result<Option<Project>>;

    /// Returns the allocation of `project` on `cluster`, creating an active one if it is missing.
    fn get_or_create_allocation(
        &self,
        project: &Project,
        cluster: &str,
    ) -> crate::Result<(Allocation, Change)>;

    fn allocations(&self, cluster: &str) -> crate::Result<Vec<Allocation>>;

    fn set_allocation_attribute(
        &self,
        allocation: AllocationId,
        key: &str,
        value: &str,
    ) -> crate::Result<Change>;

    /// Sets the attribute only if the allocation does not have it yet.
    fn init_allocation_attribute(
        &self,
        allocation: AllocationId,
        key: &str,
        value: &str,
    ) -> crate::Result<Change>;

    fn set_allocation_shares(
        &self,
        allocation: AllocationId,
        metrics: ShareMetrics,
    ) -> crate::Result<Change>;

    /// Sets the status of an allocation user, creating the user if needed.
    fn set_user_status(
        &self,
        allocation: AllocationId,
        username: &str,
        status: AllocationUserStatus,
    ) -> crate::Result<Change>;

    fn set_user_shares(
        &self,
        allocation: AllocationId,
        username: &str,
        metrics: ShareMetrics,
    ) -> crate::Result<Change>;

    fn set_user_usage(
        &self,
        allocation: AllocationId,
        username: &str,
        hours: f64,
    ) -> crate::Result<Change>;

    fn resource(
        &self,
        cluster: &str,
        kind: ResourceKind,
        name: &str,
    ) -> crate::Result<Option<Resource>>;

    fn resources(&self, cluster: &str, kind: ResourceKind) -> crate::Result<Vec<Resource>>;

    fn upsert_resource(&self, resource: Resource) -> crate::Result<Change>;

    /// Links a partition resource to an allocation. Linking twice is unchanged.
    fn link_partition(&self, allocation: AllocationId, partition: &str) -> crate::Result<Change>;

    fn unlink_partition(&self, allocation: AllocationId, partition: &str)
    -> crate::Result<Change>;

    fn snapshot(&self) -> crate::Result<StoreSnapshot>;
}

/// Name of the Slurm account of `allocation`: its account attribute, or the name of its project.
pub fn account_name(store: &dyn AllocationStore, allocation: &Allocation) -> crate::Result<String> {
    if let Some(name) = allocation.attribute(ATTR_SLURM_ACCOUNT) {
        return Ok(name.to_string());
    }
    store
        .project(allocation.project)?
        .map(|project| project.name)
        .ok_or_else(|| {
            AssocSyncError::StoreError(format!(
                "Project {} of allocation {} not found",
                allocation.project, allocation.id
            ))
        })
}
