//! Summaries produced by the reconciliation and the consistency check of a single cluster.
use serde::Serialize;
use slurm_assoc::client::{MutationOutcome, TransportKind};

use crate::store::Change;

/// One entity that failed during a pass.
#[derive(Clone, Debug, Serialize)]
pub struct EntityError {
    pub entity: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncReport {
    pub cluster: String,
    pub transport: TransportKind,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub errors: Vec<EntityError>,
    /// External accounts without a matching internal project.
    pub undetected: Vec<String>,
    /// Payloads of mutations that were not sent because of a dry run.
    pub simulated: Vec<String>,
    /// Set when the pass of this cluster was aborted.
    pub fatal: Option<String>,
}

impl SyncReport {
    pub fn new(cluster: &str, transport: TransportKind) -> Self {
        Self {
            cluster: cluster.to_string(),
            transport,
            created: 0,
            updated: 0,
            removed: 0,
            errors: Vec::new(),
            undetected: Vec::new(),
            simulated: Vec::new(),
            fatal: None,
        }
    }

    pub fn record(&mut self, change: Change) {
        match change {
            Change::Created => self.created += 1,
            Change::Updated => self.updated += 1,
            Change::Unchanged => {}
        }
    }

    pub fn error(&mut self, entity: impl Into<String>, error: impl ToString) {
        let entity = entity.into();
        let message = error.to_string();
        log::error!("Cluster {}: {entity}: {message}", self.cluster);
        self.errors.push(EntityError { entity, message });
    }

    pub fn mutation(&mut self, outcome: MutationOutcome) {
        if let MutationOutcome::Simulated(payload) = outcome {
            self.simulated.push(payload);
        }
    }

    pub fn is_ok(&self) -> bool {
        self.fatal.is_none() && self.errors.is_empty()
    }

    pub fn log_summary(&self) {
        match &self.fatal {
            Some(error) => log::error!("Cluster {} was not synchronized: {error}", self.cluster),
            None => log::info!(
                "Cluster {} synchronized: {} created, {} updated, {} removed, {} errors, {} undetected projects",
                self.cluster,
                self.created,
                self.updated,
                self.removed,
                self.errors.len(),
                self.undetected.len()
            ),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CheckReport {
    pub cluster: String,
    pub removed_accounts: Vec<String>,
    pub removed_associations: Vec<String>,
    pub simulated: Vec<String>,
    pub errors: Vec<EntityError>,
    pub fatal: Option<String>,
}

impl CheckReport {
    pub fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            removed_accounts: Vec::new(),
            removed_associations: Vec::new(),
            simulated: Vec::new(),
            errors: Vec::new(),
            fatal: None,
        }
    }

    pub fn error(&mut self, entity: impl Into<String>, error: impl ToString) {
        let entity = entity.into();
        let message = error.to_string();
        log::error!("Cluster {}: {entity}: {message}", self.cluster);
        self.errors.push(EntityError { entity, message });
    }

    pub fn mutation(&mut self, outcome: MutationOutcome) {
        if let MutationOutcome::Simulated(payload) = outcome {
            self.simulated.push(payload);
        }
    }

    pub fn is_ok(&self) -> bool {
        self.fatal.is_none() && self.errors.is_empty()
    }

    pub fn log_summary(&self) {
        match &self.fatal {
            Some(error) => log::error!("Cluster {} was not checked: {error}", self.cluster),
            None => log::info!(
                "Cluster {} checked: {} orphan accounts, {} orphan associations, {} errors",
                self.cluster,
                self.removed_accounts.len(),
                self.removed_associations.len(),
                self.errors.len()
            ),
        }
    }
}
