//! Transport that drives the Slurm command line tools.
use chrono::NaiveDate;

use crate::client::command::{
    CommandOutput, CommandRunner, SacctmgrAction, check_command_output, command_line, is_settled,
};
use crate::client::{
    AssociationClient, AssociationRecord, AssociationRef, ClientFuture, MutationOutcome,
    ShareRow, TransportKind, UsageRow, parse_number,
};
use crate::model::{Account, Cluster, ShareMetrics};
use crate::node::Node;
use crate::parser::scontrol::{parse_nodes, parse_partitions};
use crate::parser::{parse_dump, parse_fixed_width};
use crate::partition::Partition;
use crate::spec::SpecSet;
use crate::{Map, SlurmError, SlurmResult};

const SACCTMGR: &str = "sacctmgr";
const SSHARE: &str = "sshare";
const SREPORT: &str = "sreport";
const SCONTROL: &str = "scontrol";

pub struct CliClient {
    cluster: String,
    runner: Box<dyn CommandRunner>,
    /// Directory with the Slurm binaries on the target host, `PATH` is used if missing.
    binary_dir: Option<String>,
}

impl CliClient {
    pub fn new(cluster: impl Into<String>, runner: Box<dyn CommandRunner>) -> Self {
        Self {
            cluster: cluster.into(),
            runner,
            binary_dir: None,
        }
    }

    pub fn with_binary_dir(mut self, binary_dir: Option<String>) -> Self {
        self.binary_dir = binary_dir;
        self
    }

    fn program(&self, tool: &str) -> String {
        match &self.binary_dir {
            Some(dir) => format!("{}/{tool}", dir.trim_end_matches('/')),
            None => tool.to_string(),
        }
    }

    async fn run_raw(&self, tool: &str, args: &[String]) -> SlurmResult<CommandOutput> {
        let program = self.program(tool);
        self.runner.run(&program, args).await
    }

    /// Runs a read-only command and returns its standard output.
    async fn query(&self, tool: &str, args: Vec<String>) -> SlurmResult<String> {
        let output = check_command_output(self.run_raw(tool, &args).await?)?;
        Ok(output.stdout)
    }

    /// Runs `sacctmgr -Q -i <args>`, or only describes it in a dry run.
    async fn mutate(
        &self,
        action: SacctmgrAction,
        args: Vec<String>,
        noop: bool,
    ) -> SlurmResult<MutationOutcome> {
        let args: Vec<String> = ["-Q", "-i"]
            .into_iter()
            .map(|arg| arg.to_string())
            .chain(args)
            .collect();
        if noop {
            let line = command_line(&self.program(SACCTMGR), &args);
            log::info!("[noop] {line}");
            return Ok(MutationOutcome::Simulated(line));
        }

        let output = self.run_raw(SACCTMGR, &args).await?;
        if is_settled(action, &output) {
            log::warn!(
                "sacctmgr {} on cluster {}: {}",
                args[2..].join(" "),
                self.cluster,
                output.stdout.trim()
            );
            return Ok(MutationOutcome::Applied);
        }
        check_command_output(output)?;
        Ok(MutationOutcome::Applied)
    }

    fn cluster_arg(&self) -> String {
        format!("cluster={}", self.cluster)
    }

    async fn dump(&self) -> SlurmResult<Cluster> {
        let output = self
            .query(
                SACCTMGR,
                vec![
                    "-Q".to_string(),
                    "dump".to_string(),
                    self.cluster.clone(),
                    "file=/dev/stdout".to_string(),
                ],
            )
            .await?;
        let cluster = parse_dump(&output)?;
        if cluster.name != self.cluster {
            return Err(SlurmError::MappingConflict(format!(
                "sacctmgr dump for cluster `{}` describes cluster `{}`",
                self.cluster, cluster.name
            )));
        }
        Ok(cluster)
    }

    /// Coordinators per account, from `sacctmgr show account withcoord`.
    async fn coordinators(&self) -> SlurmResult<Map<String, Vec<String>>> {
        let output = self
            .query(
                SACCTMGR,
                ["-n", "-P", "show", "account", "withcoord", "format=Account,Coordinators"]
                    .into_iter()
                    .map(|arg| arg.to_string())
                    .collect(),
            )
            .await?;
        Ok(output
            .lines()
            .filter_map(|line| line.split_once('|'))
            .map(|(account, coordinators)| {
                let coordinators = coordinators
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(|c| c.to_string())
                    .collect();
                (account.trim().to_string(), coordinators)
            })
            .collect())
    }

    async fn scontrol_show(&self, entity: &str) -> SlurmResult<String> {
        self.query(
            SCONTROL,
            vec![
                "-M".to_string(),
                self.cluster.clone(),
                "--oneliner".to_string(),
                "show".to_string(),
                entity.to_string(),
            ],
        )
        .await
    }
}

fn share_rows(text: &str) -> SlurmResult<Vec<ShareRow>> {
    Ok(parse_fixed_width(text)?
        .into_iter()
        .filter_map(|row| {
            let account = row.get("Account").filter(|a| !a.is_empty())?.clone();
            let user = row.get("User").filter(|u| !u.is_empty()).cloned();
            Some(ShareRow {
                account,
                user,
                metrics: ShareMetrics {
                    raw_shares: parse_number(row.get("RawShares")),
                    normalized_shares: parse_number(row.get("NormShares")),
                    raw_usage: parse_number(row.get("RawUsage")),
                    effective_usage: parse_number(row.get("EffectvUsage")),
                    fair_share: parse_number(row.get("FairShare")),
                },
            })
        })
        .collect())
}

fn usage_rows(text: &str) -> SlurmResult<Vec<UsageRow>> {
    Ok(parse_fixed_width(text)?
        .into_iter()
        .filter_map(|row| {
            let account = row.get("Account").filter(|a| !a.is_empty())?.clone();
            Some(UsageRow {
                account,
                user: row.get("Login").filter(|u| !u.is_empty()).cloned(),
                hours: parse_number(row.get("Used")),
            })
        })
        .collect())
}

fn flatten_associations(
    cluster: Cluster,
    account: Option<&str>,
    user: Option<&str>,
) -> Vec<AssociationRecord> {
    let mut records = Vec::new();
    for entry in cluster.into_accounts() {
        if account.is_some_and(|name| name != entry.name) {
            continue;
        }
        if user.is_none() {
            records.push(AssociationRecord {
                account: entry.name.clone(),
                user: None,
                id: None,
                specs: entry.specs.clone(),
            });
        }
        for association in entry.users() {
            if user.is_some_and(|name| name != association.name) {
                continue;
            }
            records.push(AssociationRecord {
                account: entry.name.clone(),
                user: Some(association.name.clone()),
                id: None,
                specs: association.specs.clone(),
            });
        }
    }
    records
}

impl AssociationClient for CliClient {
    fn cluster(&self) -> &str {
        &self.cluster
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Cli
    }

    fn list_accounts(
        &self,
        with_associations: bool,
        with_coordinators: bool,
    ) -> ClientFuture<'_, Vec<Account>> {
        Box::pin(async move {
            let mut accounts = self.dump().await?.into_accounts();
            if !with_associations {
                accounts.iter_mut().for_each(|account| account.clear_users());
            }
            if with_coordinators {
                let mut coordinators = self.coordinators().await?;
                for account in accounts.iter_mut() {
                    if let Some(list) = coordinators.remove(&account.name) {
                        account.coordinators = list;
                    }
                }
            }
            Ok(accounts)
        })
    }

    fn list_partitions(&self) -> ClientFuture<'_, Vec<Partition>> {
        Box::pin(async move { Ok(parse_partitions(&self.scontrol_show("partition").await?)) })
    }

    fn list_nodes(&self) -> ClientFuture<'_, Vec<Node>> {
        Box::pin(async move { Ok(parse_nodes(&self.scontrol_show("node").await?)) })
    }

    fn get_associations<'a>(
        &'a self,
        account: Option<&'a str>,
        user: Option<&'a str>,
    ) -> ClientFuture<'a, Vec<AssociationRecord>> {
        Box::pin(async move { Ok(flatten_associations(self.dump().await?, account, user)) })
    }

    fn add_association<'a>(
        &'a self,
        account: &'a str,
        user: &'a str,
        specs: &'a SpecSet,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome> {
        Box::pin(async move {
            let mut args = vec![
                "create".to_string(),
                "user".to_string(),
                format!("name={user}"),
                self.cluster_arg(),
                format!("account={account}"),
            ];
            args.extend(specs.to_strings());
            self.mutate(SacctmgrAction::Create, args, noop).await
        })
    }

    fn remove_association<'a>(
        &'a self,
        association: &'a AssociationRef,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome> {
        Box::pin(async move {
            let AssociationRef::User { account, user } = association else {
                return Err(SlurmError::Unsupported(format!(
                    "sacctmgr cannot remove {association}, an account and user are required"
                )));
            };
            let args = vec![
                "delete".to_string(),
                "user".to_string(),
                "where".to_string(),
                format!("name={user}"),
                self.cluster_arg(),
                format!("account={account}"),
            ];
            self.mutate(SacctmgrAction::Delete, args, noop).await
        })
    }

    fn add_account<'a>(
        &'a self,
        name: &'a str,
        specs: &'a SpecSet,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome> {
        Box::pin(async move {
            let mut args = vec![
                "create".to_string(),
                "account".to_string(),
                format!("name={name}"),
                self.cluster_arg(),
            ];
            args.extend(specs.to_strings());
            self.mutate(SacctmgrAction::Create, args, noop).await
        })
    }

    fn remove_account<'a>(
        &'a self,
        name: &'a str,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome> {
        Box::pin(async move {
            let args = vec![
                "delete".to_string(),
                "account".to_string(),
                "where".to_string(),
                format!("name={name}"),
                self.cluster_arg(),
            ];
            self.mutate(SacctmgrAction::Delete, args, noop).await
        })
    }

    fn get_shares<'a>(
        &'a self,
        accounts: &'a [String],
        users: &'a [String],
    ) -> ClientFuture<'a, Vec<ShareRow>> {
        Box::pin(async move {
            let mut args = vec![
                "-a".to_string(),
                "-l".to_string(),
                "-M".to_string(),
                self.cluster.clone(),
            ];
            if !accounts.is_empty() {
                args.extend(["-A".to_string(), accounts.join(",")]);
            }
            if !users.is_empty() {
                args.extend(["-u".to_string(), users.join(",")]);
            }
            share_rows(&self.query(SSHARE, args).await?)
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
            let mut args = vec!["modify".to_string()];
            match user {
                Some(user) => args.extend([
                    "user".to_string(),
                    "where".to_string(),
                    format!("name={user}"),
                    self.cluster_arg(),
                    format!("account={account}"),
                ]),
                None => args.extend([
                    "account".to_string(),
                    "where".to_string(),
                    format!("name={account}"),
                    self.cluster_arg(),
                ]),
            }
            args.extend(["set".to_string(), format!("fairshare={value}")]);
            self.mutate(SacctmgrAction::Modify, args, noop).await
        })
    }

    fn get_usage(&self, start: NaiveDate) -> ClientFuture<'_, Vec<UsageRow>> {
        Box::pin(async move {
            let args = vec![
                "-M".to_string(),
                self.cluster.clone(),
                "-t".to_string(),
                "hours".to_string(),
                "cluster".to_string(),
                "AccountUtilizationByUser".to_string(),
                format!("start={}", start.format("%Y-%m-%d")),
            ];
            usage_rows(&self.query(SREPORT, args).await?)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use chrono::NaiveDate;

    use super::CliClient;
    use crate::client::command::{CommandOutput, CommandRunner};
    use crate::client::{AssociationClient, AssociationRef, ClientFuture, MutationOutcome};
    use crate::spec::SpecSet;
    use crate::{Map, SlurmError};

    const DUMP: &str = "\
# To edit this file start with a cluster line for the new cluster
Cluster - 'alpha':Fairshare=1:QOS='normal'
Parent - 'root'
User - 'root':DefaultAccount='root':AdminLevel='Administrator':Fairshare=1
Account - 'lab1':Description='lab1':Organization='lab1':Fairshare=100
Account - 'lab2':Description='lab2':Organization='lab2':Fairshare=50
Parent - 'lab1'
User - 'alice':DefaultAccount='lab1':Fairshare=1
User - 'bob':DefaultAccount='lab1':Fairshare=1
Parent - 'lab2'
User - 'alice':Fairshare=1
";

    #[derive(Clone, Default)]
    struct FakeRunner {
        outputs: Rc<RefCell<Map<String, CommandOutput>>>,
        calls: Rc<RefCell<Vec<String>>>,
    }

    impl FakeRunner {
        fn respond(&self, program: &str, stdout: &str) {
            self.outputs.borrow_mut().insert(
                program.to_string(),
                CommandOutput {
                    success: true,
                    code: Some(0),
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                },
            );
        }

        fn fail(&self, program: &str, stdout: &str) {
            self.outputs.borrow_mut().insert(
                program.to_string(),
                CommandOutput {
                    success: false,
                    code: Some(1),
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                },
            );
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run<'a>(
            &'a self,
            program: &'a str,
            args: &'a [String],
        ) -> ClientFuture<'a, CommandOutput> {
            Box::pin(async move {
                self.calls
                    .borrow_mut()
                    .push(format!("{program} {}", args.join(" ")));
                let tool = program.rsplit('/').next().unwrap_or(program);
                Ok(self
                    .outputs
                    .borrow()
                    .get(tool)
                    .cloned()
                    .unwrap_or_default())
            })
        }
    }

    fn client() -> (CliClient, FakeRunner) {
        let runner = FakeRunner::default();
        runner.respond("sacctmgr", DUMP);
        (CliClient::new("alpha", Box::new(runner.clone())), runner)
    }

    #[tokio::test]
    async fn test_list_accounts_from_dump() {
        let (client, runner) = client();
        runner.respond("sacctmgr", DUMP);
        let accounts = client.list_accounts(true, false).await.unwrap();
        let names: Vec<&str> = accounts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["lab1", "lab2", "root"]);
        assert_eq!(accounts[0].user_names().collect::<Vec<_>>(), vec!["alice", "bob"]);
        assert_eq!(accounts[0].specs.get("Fairshare"), Some("100"));
        assert_eq!(
            runner.calls(),
            vec!["sacctmgr -Q dump alpha file=/dev/stdout"]
        );

        let accounts = client.list_accounts(false, false).await.unwrap();
        assert!(accounts.iter().all(|a| a.users().count() == 0));
    }

    #[tokio::test]
    async fn test_dump_of_other_cluster() {
        let (client, _) = client();
        let client = CliClient {
            cluster: "beta".to_string(),
            ..client
        };
        let result = client.list_accounts(true, false).await;
        assert!(matches!(result, Err(SlurmError::MappingConflict(_))));
    }

    #[tokio::test]
    async fn test_failed_dump_is_transport_error() {
        let (client, runner) = client();
        runner.fail("sacctmgr", "");
        let result = client.list_accounts(true, false).await;
        assert!(matches!(result, Err(SlurmError::Transport(_))));
    }

    #[tokio::test]
    async fn test_get_associations_filters() {
        let (client, _) = client();
        let records = client.get_associations(None, Some("alice")).await.unwrap();
        let pairs: Vec<(&str, Option<&str>)> = records
            .iter()
            .map(|r| (r.account.as_str(), r.user.as_deref()))
            .collect();
        assert_eq!(pairs, vec![("lab1", Some("alice")), ("lab2", Some("alice"))]);

        let records = client.get_associations(Some("lab1"), None).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].user, None);
    }

    #[tokio::test]
    async fn test_mutations_build_sacctmgr_commands() {
        let (client, runner) = client();
        let specs = SpecSet::parse_joined("Fairshare=parent", ':').unwrap();
        client
            .add_association("lab1", "carol", &specs, false)
            .await
            .unwrap();
        client
            .remove_association(
                &AssociationRef::User {
                    account: "lab1".to_string(),
                    user: "bob".to_string(),
                },
                false,
            )
            .await
            .unwrap();
        client.add_account("lab3", &SpecSet::new(), false).await.unwrap();
        client.remove_account("lab2", false).await.unwrap();
        client.set_fairshare("lab1", None, 100, false).await.unwrap();
        client
            .set_fairshare("lab1", Some("alice"), 5, false)
            .await
            .unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "sacctmgr -Q -i create user name=carol cluster=alpha account=lab1 Fairshare=parent",
                "sacctmgr -Q -i delete user where name=bob cluster=alpha account=lab1",
                "sacctmgr -Q -i create account name=lab3 cluster=alpha",
                "sacctmgr -Q -i delete account where name=lab2 cluster=alpha",
                "sacctmgr -Q -i modify account where name=lab1 cluster=alpha set fairshare=100",
                "sacctmgr -Q -i modify user where name=alice cluster=alpha account=lab1 set fairshare=5",
            ]
        );
    }

    #[tokio::test]
    async fn test_noop_does_not_run_anything() {
        let (client, runner) = client();
        let client = client.with_binary_dir(Some("/opt/slurm/bin/".to_string()));
        let outcome = client
            .add_association("lab1", "carol", &SpecSet::new(), true)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MutationOutcome::Simulated(
                "/opt/slurm/bin/sacctmgr -Q -i create user name=carol cluster=alpha account=lab1"
                    .to_string()
            )
        );
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_remove_missing_association_is_not_an_error() {
        let (client, runner) = client();
        runner.fail("sacctmgr", " Nothing deleted\n");
        let outcome = client
            .remove_association(
                &AssociationRef::User {
                    account: "lab1".to_string(),
                    user: "ghost".to_string(),
                },
                false,
            )
            .await
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Applied);
    }

    #[tokio::test]
    async fn test_failed_create_is_an_error() {
        let (client, runner) = client();
        runner.fail("sacctmgr", " Parent account lab9 doesn't exist.\n");
        let result = client
            .add_association("lab9", "carol", &SpecSet::new(), false)
            .await;
        assert!(matches!(result, Err(SlurmError::Transport(_))));

        let result = client.add_account("lab9", &SpecSet::new(), false).await;
        assert!(matches!(result, Err(SlurmError::Transport(_))));
    }

    #[tokio::test]
    async fn test_modify_of_missing_user_is_an_error() {
        let (client, runner) = client();
        runner.fail("sacctmgr", " User ghost doesn't exist.\n");
        let result = client.set_fairshare("lab1", Some("ghost"), 10, false).await;
        assert!(matches!(result, Err(SlurmError::Transport(_))));
    }

    #[tokio::test]
    async fn test_remove_by_id_is_unsupported() {
        let (client, _) = client();
        let result = client.remove_association(&AssociationRef::Id(3), false).await;
        assert!(matches!(result, Err(SlurmError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_coordinators() {
        let (client, runner) = client();
        // The dump and the coordinator query both run sacctmgr, each parser skips the other part.
        runner.respond("sacctmgr", &format!("{DUMP}lab1|alice,bob\nlab2|\n"));
        let accounts = client.list_accounts(true, true).await.unwrap();
        assert_eq!(accounts[0].coordinators, vec!["alice", "bob"]);
        assert!(accounts[1].coordinators.is_empty());
    }

    #[tokio::test]
    async fn test_get_shares() {
        let (client, runner) = client();
        runner.respond(
            "sshare",
            "\
CLUSTER: alpha
             Account       User  RawShares  NormShares    RawUsage  EffectvUsage  FairShare
-------------------- ---------- ---------- ----------- ----------- ------------- ----------
root                                          0.000000     1234567      1.000000
 lab1                                  100    0.666667        1000      0.008000   0.500000
  lab1                    alice          1    0.500000         800      0.006400   0.750000
",
        );
        let accounts = vec!["lab1".to_string()];
        let rows = client.get_shares(&accounts, &[]).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].account, "lab1");
        assert_eq!(rows[1].user, None);
        assert_eq!(rows[1].metrics.raw_shares, 100.0);
        assert_eq!(rows[2].user.as_deref(), Some("alice"));
        assert_eq!(rows[2].metrics.fair_share, 0.75);
        assert_eq!(runner.calls(), vec!["sshare -a -l -M alpha -A lab1"]);
    }

    #[tokio::test]
    async fn test_get_usage() {
        let (client, runner) = client();
        runner.respond(
            "sreport",
            "\
--------------------------------------------------------------------------------
Cluster/Account/User Utilization 2024-01-01T00:00:00 - 2024-10-16T23:59:59
Usage reported in CPU Hours
--------------------------------------------------------------------------------
  Cluster         Account     Login     Proper Name       Used
--------- --------------- --------- --------------- ----------
    alpha            lab1                                  920
    alpha            lab1     alice     Alice Smith        800
",
        );
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let rows = client.get_usage(start).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].user, None);
        assert_eq!(rows[0].hours, 920.0);
        assert_eq!(rows[1].user.as_deref(), Some("alice"));
        assert_eq!(
            runner.calls(),
            vec!["sreport -M alpha -t hours cluster AccountUtilizationByUser start=2024-01-01"]
        );
    }
}
