//! Fair-share factor derived from normalized shares and effective usage.
//!
//! Slurm reports the factor itself, but some versions and transports leave it at zero. In that
//! case a [`FairShareStrategy`] computes a replacement that is usable for sorting and reports.
use serde::{Deserialize, Serialize};

use crate::client::ShareRow;

pub trait FairShareStrategy: Send + Sync {
    /// Must return the same value for the same inputs, and must not increase with usage.
    fn factor(&self, normalized_share: f64, effective_usage: f64) -> f64;
}

/// `2^(-usage/share)`, the curve of the classic Slurm fair-share algorithm.
pub struct Classic;

impl FairShareStrategy for Classic {
    fn factor(&self, normalized_share: f64, effective_usage: f64) -> f64 {
        if normalized_share <= 0.0 {
            return 0.0;
        }
        2f64.powf(-(effective_usage.max(0.0)) / normalized_share)
    }
}

/// `1 - usage/share`, clamped to `[0, 1]`.
pub struct Linear;

impl FairShareStrategy for Linear {
    fn factor(&self, normalized_share: f64, effective_usage: f64) -> f64 {
        if normalized_share <= 0.0 {
            return 0.0;
        }
        (1.0 - effective_usage.max(0.0) / normalized_share).clamp(0.0, 1.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FairShareAlgorithm {
    #[default]
    Classic,
    Linear,
}

impl FairShareAlgorithm {
    pub fn strategy(&self) -> Box<dyn FairShareStrategy> {
        match self {
            FairShareAlgorithm::Classic => Box::new(Classic),
            FairShareAlgorithm::Linear => Box::new(Linear),
        }
    }
}

/// Fills in the fair-share factor of every row if the scheduler reported none at all.
/// Returns `true` if the rows were modified.
pub fn backfill(rows: &mut [ShareRow], strategy: &dyn FairShareStrategy) -> bool {
    if rows.is_empty() || rows.iter().any(|row| row.metrics.fair_share != 0.0) {
        return false;
    }
    for row in rows.iter_mut() {
        row.metrics.fair_share =
            strategy.factor(row.metrics.normalized_shares, row.metrics.effective_usage);
    }
    log::debug!("Fair-share factors were computed for {} share rows", rows.len());
    true
}
