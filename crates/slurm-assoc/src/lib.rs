//! Model, parsers and transports for Slurm accounting associations.
//!
//! The crate knows how to talk to one Slurm cluster, either through the
//! `sacctmgr`/`sshare`/`sreport`/`scontrol` command line tools executed over
//! SSH, or through the `slurmrestd` REST API. Both transports implement
//! [`client::AssociationClient`] and convert everything they read into the
//! typed association tree from [`model`].

pub mod client;
pub mod error;
pub mod fairshare;
pub mod model;
pub mod node;
pub mod parser;
pub mod partition;
pub mod spec;

pub use error::{SlurmError, SlurmResult};

pub type Map<K, V> = hashbrown::HashMap<K, V>;

/// Name of the structural root account of every cluster.
pub const ROOT_ACCOUNT: &str = "root";
