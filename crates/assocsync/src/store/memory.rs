use std::cell::RefCell;
use std::path::Path;

use slurm_assoc::model::ShareMetrics;

use crate::common::error::AssocSyncError;
use crate::store::{
    Allocation, AllocationId, AllocationStatus, AllocationStore, AllocationUser,
    AllocationUserStatus, Change, Project, ProjectId, Resource, ResourceKind, StoreSnapshot,
};

/// Allocation store kept in memory, optionally persisted as a JSON file.
///
/// Borrows of the state never outlive a single method call, so concurrent cluster passes on the
/// same thread interleave only between whole entity writes.
#[derive(Default)]
pub struct MemoryStore {
    state: RefCell<StoreSnapshot>,
}

fn missing_allocation(id: AllocationId) -> AssocSyncError {
    AssocSyncError::StoreError(format!("Allocation {id} not found"))
}

fn update<T: PartialEq>(slot: &mut T, value: T) -> Change {
    if *slot == value {
        Change::Unchanged
    } else {
        *slot = value;
        Change::Updated
    }
}

impl MemoryStore {
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: RefCell::new(snapshot),
        }
    }

    /// Loads the store from `path`. A missing file is an empty store.
    pub fn load(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            log::debug!("Store {} does not exist, starting empty", path.display());
            return Ok(Self::default());
        }
        let data = std::fs::read(path)?;
        let snapshot: StoreSnapshot = serde_json::from_slice(&data)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let data = serde_json::to_vec_pretty(&*self.state.borrow())?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Independent copy of the store, used for dry runs.
    pub fn fork(&self) -> Self {
        Self::from_snapshot(self.state.borrow().clone())
    }

    pub fn add_project(&self, name: &str, active: bool) -> Project {
        let mut state = self.state.borrow_mut();
        let id = state.projects.keys().next_back().map_or(1, |id| id + 1);
        let project = Project {
            id,
            name: name.to_string(),
            title: String::new(),
            active,
        };
        state.projects.insert(id, project.clone());
        project
    }

    /// Inserts an allocation, assigning it a fresh id.
    pub fn add_allocation(&self, mut allocation: Allocation) -> AllocationId {
        let mut state = self.state.borrow_mut();
        let id = state.allocations.keys().next_back().map_or(1, |id| id + 1);
        allocation.id = id;
        state.allocations.insert(id, allocation);
        id
    }

    pub fn allocation(&self, id: AllocationId) -> Option<Allocation> {
        self.state.borrow().allocations.get(&id).cloned()
    }

    fn with_allocation<T>(
        &self,
        id: AllocationId,
        f: impl FnOnce(&mut Allocation) -> T,
    ) -> crate::Result<T> {
        let mut state = self.state.borrow_mut();
        let allocation = state
            .allocations
            .get_mut(&id)
            .ok_or_else(|| missing_allocation(id))?;
        Ok(f(allocation))
    }

    fn with_user<T>(
        &self,
        id: AllocationId,
        username: &str,
        f: impl FnOnce(&mut AllocationUser) -> T,
    ) -> crate::Result<T> {
        self.with_allocation(id, |allocation| {
            allocation.users.get_mut(username).map(f).ok_or_else(|| {
                AssocSyncError::StoreError(format!(
                    "User {username} is not a member of allocation {id}"
                ))
            })
        })?
    }
}

impl AllocationStore for MemoryStore {
    fn find_project(&self, name: &str) -> crate::Result<Option<Project>> {
        Ok(self
            .state
            .borrow()
            .projects
            .values()
            .find(|project| project.name == name)
            .cloned())
    }

    fn project(&self, id: ProjectId) -> crate::Result<Option<Project>> {
        Ok(self.state.borrow().projects.get(&id).cloned())
    }

    fn get_or_create_allocation(
        &self,
        project: &Project,
        cluster: &str,
    ) -> crate::Result<(Allocation, Change)> {
        let existing = self
            .state
            .borrow()
            .allocations
            .values()
            .find(|allocation| allocation.project == project.id && allocation.cluster == cluster)
            .cloned();
        if let Some(allocation) = existing {
            return Ok((allocation, Change::Unchanged));
        }
        let id = self.add_allocation(Allocation {
            id: 0,
            project: project.id,
            cluster: cluster.to_string(),
            status: AllocationStatus::Active,
            attributes: Default::default(),
            shares: None,
            users: Default::default(),
            partitions: Default::default(),
        });
        let allocation = self.allocation(id).ok_or_else(|| missing_allocation(id))?;
        log::debug!(
            "Created allocation {id} of project {} on cluster {cluster}",
            project.name
        );
        Ok((allocation, Change::Created))
    }

    fn allocations(&self, cluster: &str) -> crate::Result<Vec<Allocation>> {
        Ok(self
            .state
            .borrow()
            .allocations
            .values()
            .filter(|allocation| allocation.cluster == cluster)
            .cloned()
            .collect())
    }

    fn set_allocation_attribute(
        &self,
        allocation: AllocationId,
        key: &str,
        value: &str,
    ) -> crate::Result<Change> {
        self.with_allocation(allocation, |allocation| {
            match allocation.attributes.get_mut(key) {
                Some(current) => update(current, value.to_string()),
                None => {
                    allocation
                        .attributes
                        .insert(key.to_string(), value.to_string());
                    Change::Created
                }
            }
        })
    }

    fn init_allocation_attribute(
        &self,
        allocation: AllocationId,
        key: &str,
        value: &str,
    ) -> crate::Result<Change> {
        self.with_allocation(allocation, |allocation| {
            if allocation.attributes.contains_key(key) {
                Change::Unchanged
            } else {
                allocation
                    .attributes
                    .insert(key.to_string(), value.to_string());
                Change::Created
            }
        })
    }

    fn set_allocation_shares(
        &self,
        allocation: AllocationId,
        metrics: ShareMetrics,
    ) -> crate::Result<Change> {
        self.with_allocation(allocation, |allocation| {
            update(&mut allocation.shares, Some(metrics))
        })
    }

    fn set_user_status(
        &self,
        allocation: AllocationId,
        username: &str,
        status: AllocationUserStatus,
    ) -> crate::Result<Change> {
        self.with_allocation(allocation, |allocation| {
            match allocation.users.get_mut(username) {
                Some(user) => update(&mut user.status, status),
                None => {
                    allocation.users.insert(
                        username.to_string(),
                        AllocationUser {
                            status,
                            shares: None,
                            usage_hours: 0.0,
                        },
                    );
                    Change::Created
                }
            }
        })
    }

    fn set_user_shares(
        &self,
        allocation: AllocationId,
        username: &str,
        metrics: ShareMetrics,
    ) -> crate::Result<Change> {
        self.with_user(allocation, username, |user| {
            update(&mut user.shares, Some(metrics))
        })
    }

    fn set_user_usage(
        &self,
        allocation: AllocationId,
        username: &str,
        hours: f64,
    ) -> crate::Result<Change> {
        self.with_user(allocation, username, |user| {
            update(&mut user.usage_hours, hours)
        })
    }

    fn resource(
        &self,
        cluster: &str,
        kind: ResourceKind,
        name: &str,
    ) -> crate::Result<Option<Resource>> {
        Ok(self
            .state
            .borrow()
            .resources
            .iter()
            .find(|r| r.cluster == cluster && r.kind == kind && r.name == name)
            .cloned())
    }

    fn resources(&self, cluster: &str, kind: ResourceKind) -> crate::Result<Vec<Resource>> {
        Ok(self
            .state
            .borrow()
            .resources
            .iter()
            .filter(|r| r.cluster == cluster && r.kind == kind)
            .cloned()
            .collect())
    }

    fn upsert_resource(&self, resource: Resource) -> crate::Result<Change> {
        let mut state = self.state.borrow_mut();
        let existing = state.resources.iter_mut().find(|r| {
            r.cluster == resource.cluster && r.kind == resource.kind && r.name == resource.name
        });
        Ok(match existing {
            Some(existing) => update(existing, resource),
            None => {
                state.resources.push(resource);
                Change::Created
            }
        })
    }

    fn link_partition(&self, allocation: AllocationId, partition: &str) -> crate::Result<Change> {
        self.with_allocation(allocation, |allocation| {
            if allocation.partitions.insert(partition.to_string()) {
                Change::Created
            } else {
                Change::Unchanged
            }
        })
    }

    fn unlink_partition(
        &self,
        allocation: AllocationId,
        partition: &str,
    ) -> crate::Result<Change> {
        self.with_allocation(allocation, |allocation| {
            if allocation.partitions.remove(partition) {
                Change::Updated
            } else {
                Change::Unchanged
            }
        })
    }

    fn snapshot(&self) -> crate::Result<StoreSnapshot> {
        Ok(self.state.borrow().clone())
    }
}
