use std::path::PathBuf;

use clap::Parser;

use crate::output::Outputs;
use crate::run::RunOptions;
use crate::sync::Filter;

#[derive(clap::ValueEnum, Clone, Copy)]
pub enum ColorPolicy {
    /// Use colors if the stdout is detected to be a terminal.
    Auto,
    /// Always use colors.
    Always,
    /// Never use colors.
    Never,
}

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Path of the configuration file
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        global = true,
        env = "ASSOCSYNC_CONFIG",
        default_value = "/etc/assocsync/config.toml",
        help_heading("GLOBAL OPTIONS")
    )]
    pub config: PathBuf,

    /// Path of the JSON file with the allocation records
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        global = true,
        env = "ASSOCSYNC_STORE",
        default_value = "/var/lib/assocsync/store.json",
        help_heading("GLOBAL OPTIONS")
    )]
    pub store: PathBuf,

    /// Sets console color policy
    #[arg(
        long,
        default_value_t = ColorPolicy::Auto,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub colors: ColorPolicy,

    /// Sets output formatting
    #[arg(
        long,
        env = "ASSOCSYNC_OUTPUT_MODE",
        default_value_t = Outputs::CLI,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub output_mode: Outputs,

    /// Enables more detailed log output
    #[arg(
        long,
        short = 'v',
        env = "ASSOCSYNC_VERBOSE",
        global = true,
        help_heading("GLOBAL OPTIONS")
    )]
    pub verbose: bool,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version,
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Synchronize allocation records with the scheduler
    Sync(SyncOpts),
    /// Remove scheduler associations without an active allocation
    Check(CheckOpts),
    /// Print the association tree a cluster should have, in the `sacctmgr dump` format
    Dump(DumpOpts),
    /// Print fair-share data of a cluster
    Shares(SharesOpts),
    /// Set the raw fair-share value of an account or a user association
    Fairshare(FairshareOpts),
}

#[derive(Parser)]
pub struct TargetOpts {
    /// Process only this cluster
    #[arg(long)]
    pub cluster: Option<String>,

    /// Process only this account
    #[arg(long)]
    pub account: Option<String>,

    /// Process only this user
    #[arg(long)]
    pub user: Option<String>,
}

impl TargetOpts {
    pub fn filter(&self) -> Filter {
        Filter {
            account: self.account.clone(),
            user: self.user.clone(),
        }
    }
}

#[derive(Parser)]
pub struct SyncOpts {
    /// Compute the changes without applying them
    #[arg(long)]
    pub noop: bool,

    /// Create missing accounts and associations of active allocations
    #[arg(long)]
    pub push: bool,

    #[clap(flatten)]
    pub target: TargetOpts,
}

impl SyncOpts {
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            noop: self.noop,
            push: self.push,
            cluster: self.target.cluster.clone(),
            filter: self.target.filter(),
        }
    }
}

#[derive(Parser)]
pub struct CheckOpts {
    /// Report orphan associations without removing them
    #[arg(long)]
    pub noop: bool,

    #[clap(flatten)]
    pub target: TargetOpts,
}

impl CheckOpts {
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            noop: self.noop,
            push: false,
            cluster: self.target.cluster.clone(),
            filter: self.target.filter(),
        }
    }
}

#[derive(Parser)]
pub struct DumpOpts {
    /// Cluster to dump
    pub cluster: String,

    /// Write the dump into this file instead of stdout
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

#[derive(Parser)]
pub struct SharesOpts {
    /// Cluster to query
    pub cluster: String,

    /// Show only this account
    #[arg(long)]
    pub account: Option<String>,

    /// Show only this user
    #[arg(long)]
    pub user: Option<String>,
}

#[derive(Parser)]
pub struct FairshareOpts {
    /// Cluster to modify
    pub cluster: String,

    /// Account to modify
    pub account: String,

    /// New raw fair-share value
    pub value: u32,

    /// Modify the association of this user instead of the account
    #[arg(long)]
    pub user: Option<String>,

    /// Print the change without applying it
    #[arg(long)]
    pub noop: bool,
}

#[cfg(test)]
mod tests {
    use super::{RootOptions, SubCommand};
    use clap::Parser;

    #[test]
    fn test_parse_sync() {
        let opts = RootOptions::try_parse_from([
            "assocsync",
            "sync",
            "--noop",
            "--cluster",
            "alpha",
            "--account",
            "lab1",
            "--config",
            "/tmp/c.toml",
        ])
        .unwrap();
        assert_eq!(opts.common.config.to_str(), Some("/tmp/c.toml"));
        match opts.subcmd {
            SubCommand::Sync(sync) => {
                let options = sync.run_options();
                assert!(options.noop);
                assert!(!options.push);
                assert_eq!(options.cluster.as_deref(), Some("alpha"));
                assert_eq!(options.filter.account.as_deref(), Some("lab1"));
                assert!(options.filter.user.is_none());
            }
            _ => panic!("Expected sync"),
        }
    }

    #[test]
    fn test_parse_dump() {
        let opts = RootOptions::try_parse_from(["assocsync", "dump", "alpha", "-o", "out.txt"])
            .unwrap();
        match opts.subcmd {
            SubCommand::Dump(dump) => {
                assert_eq!(dump.cluster, "alpha");
                assert_eq!(dump.output.unwrap().to_str(), Some("out.txt"));
            }
            _ => panic!("Expected dump"),
        }
    }

    #[test]
    fn test_parse_fairshare() {
        let opts = RootOptions::try_parse_from([
            "assocsync",
            "fairshare",
            "alpha",
            "lab1",
            "250",
            "--user",
            "alice",
            "--noop",
        ])
        .unwrap();
        match opts.subcmd {
            SubCommand::Fairshare(fairshare) => {
                assert_eq!(fairshare.account, "lab1");
                assert_eq!(fairshare.value, 250);
                assert_eq!(fairshare.user.as_deref(), Some("alice"));
                assert!(fairshare.noop);
            }
            _ => panic!("Expected fairshare"),
        }
    }
}
