//! Transports that read and modify the accounting state of one Slurm cluster.
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::{Account, ShareMetrics};
use crate::node::Node;
use crate::partition::Partition;
use crate::spec::SpecSet;
use crate::{SlurmError, SlurmResult};

pub mod api;
pub mod cli;
pub mod command;

pub use api::{ApiClient, ApiSettings};
pub use cli::CliClient;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// `sacctmgr`, `sshare`, `sreport` and `scontrol` executed over SSH.
    Cli,
    /// `slurmrestd` REST API.
    Api,
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportKind::Cli => "cli",
            TransportKind::Api => "api",
        })
    }
}

/// Result of a mutating call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum MutationOutcome {
    Applied,
    /// Dry run: nothing was sent, the payload is the command line or request that would be.
    Simulated(String),
}

impl MutationOutcome {
    pub fn is_simulated(&self) -> bool {
        matches!(self, MutationOutcome::Simulated(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssociationRef {
    User { account: String, user: String },
    /// Numeric association id, only known to the REST API.
    Id(u64),
}

impl Display for AssociationRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRef::User { account, user } => write!(f, "{user}@{account}"),
            AssociationRef::Id(id) => write!(f, "association #{id}"),
        }
    }
}

/// One association as stored by the scheduler. `user` is `None` for the account association.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AssociationRecord {
    pub account: String,
    pub user: Option<String>,
    pub id: Option<u64>,
    pub specs: SpecSet,
}

impl AssociationRecord {
    /// Reference usable for removal, preferring the user pair over the numeric id.
    pub fn reference(&self) -> Option<AssociationRef> {
        match (&self.user, self.id) {
            (Some(user), _) => Some(AssociationRef::User {
                account: self.account.clone(),
                user: user.clone(),
            }),
            (None, Some(id)) => Some(AssociationRef::Id(id)),
            (None, None) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ShareRow {
    pub account: String,
    pub user: Option<String>,
    pub metrics: ShareMetrics,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UsageRow {
    pub account: String,
    pub user: Option<String>,
    pub hours: f64,
}

pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = SlurmResult<T>> + 'a>>;

/// Operations that both transports provide for a single cluster.
///
/// "Not found" answers are returned as empty results. Every mutating operation takes a `noop`
/// flag; when set, nothing is sent and [`MutationOutcome::Simulated`] carries the payload.
pub trait AssociationClient {
    fn cluster(&self) -> &str;

    fn transport(&self) -> TransportKind;

    /// Accounts of the cluster including root, optionally with their users and coordinators.
    fn list_accounts(&self, with_associations: bool, with_coordinators: bool)
    -> ClientFuture<'_, Vec<Account>>;

    fn list_partitions(&self) -> ClientFuture<'_, Vec<Partition>>;

    fn list_nodes(&self) -> ClientFuture<'_, Vec<Node>>;

    fn get_associations<'a>(
        &'a self,
        account: Option<&'a str>,
        user: Option<&'a str>,
    ) -> ClientFuture<'a, Vec<AssociationRecord>>;

    fn add_association<'a>(
        &'a self,
        account: &'a str,
        user: &'a str,
        specs: &'a SpecSet,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome>;

    fn remove_association<'a>(
        &'a self,
        association: &'a AssociationRef,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome>;

    fn add_account<'a>(
        &'a self,
        name: &'a str,
        specs: &'a SpecSet,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome>;

    fn remove_account<'a>(&'a self, name: &'a str, noop: bool)
    -> ClientFuture<'a, MutationOutcome>;

    /// Share rows, optionally restricted to the given accounts and users (empty means all).
    fn get_shares<'a>(
        &'a self,
        accounts: &'a [String],
        users: &'a [String],
    ) -> ClientFuture<'a, Vec<ShareRow>>;

    /// Sets the raw fair-share value of an account (`user` is `None`) or a user association.
    fn set_fairshare<'a>(
        &'a self,
        account: &'a str,
        user: Option<&'a str>,
        value: u32,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome>;

    /// Used CPU hours per account and user since `start`.
    fn get_usage(&self, start: NaiveDate) -> ClientFuture<'_, Vec<UsageRow>>;
}

/// Runs a transport call with a deadline. An elapsed deadline is a transport failure.
pub async fn with_deadline<T>(
    timeout: Duration,
    what: &str,
    future: impl Future<Output = SlurmResult<T>>,
) -> SlurmResult<T> {
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(SlurmError::Transport(format!(
            "{what} did not finish within {}s",
            timeout.as_secs_f64()
        ))),
    }
}

/// Lenient numeric parsing of tool output, where missing or non-numeric cells mean zero.
pub(crate) fn parse_number(value: Option<&String>) -> f64 {
    value
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::{AssociationRecord, AssociationRef, parse_number, with_deadline};
    use crate::SlurmError;
    use crate::spec::SpecSet;
    use std::time::Duration;

    #[tokio::test]
    async fn test_deadline_elapsed_is_transport_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        };
        let result: Result<(), _> =
            with_deadline(Duration::from_millis(10), "list accounts", slow).await;
        assert!(matches!(result, Err(SlurmError::Transport(_))));
    }

    #[tokio::test]
    async fn test_deadline_passes_result() {
        let result = with_deadline(Duration::from_secs(1), "x", async { Ok(5) }).await;
        assert_eq!(result.unwrap(), 5);
    }

    #[test]
    fn test_association_reference() {
        let mut record = AssociationRecord {
            account: "lab".to_string(),
            user: Some("alice".to_string()),
            id: Some(7),
            specs: SpecSet::new(),
        };
        assert_eq!(
            record.reference(),
            Some(AssociationRef::User {
                account: "lab".to_string(),
                user: "alice".to_string()
            })
        );
        record.user = None;
        assert_eq!(record.reference(), Some(AssociationRef::Id(7)));
        record.id = None;
        assert_eq!(record.reference(), None);
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(Some(&"0.25".to_string())), 0.25);
        assert_eq!(parse_number(Some(&" 3 ".to_string())), 3.0);
        assert_eq!(parse_number(Some(&"".to_string())), 0.0);
        assert_eq!(parse_number(Some(&"inf".to_string())), 0.0);
        assert_eq!(parse_number(None), 0.0);
    }
}
