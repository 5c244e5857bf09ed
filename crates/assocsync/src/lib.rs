//! Reconciliation of Slurm accounting associations with research allocation records.
#![deny(clippy::await_holding_refcell_ref)]

pub mod check;
pub mod common;
pub mod dump;
pub mod output;
pub mod report;
pub mod run;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::AssocSyncError;
pub type Result<T> = std::result::Result<T, Error>;
