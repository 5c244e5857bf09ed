use std::fs::File;
use std::io::{BufWriter, IsTerminal, Write};

use anyhow::Context;
use clap::{CommandFactory, FromArgMatches};
use cli_table::ColorChoice;
use slurm_assoc::client::MutationOutcome;

use assocsync::common::cli::{
    CheckOpts, ColorPolicy, CommonOpts, DumpOpts, FairshareOpts, RootOptions, SharesOpts,
    SubCommand, SyncOpts,
};
use assocsync::common::config::Config;
use assocsync::common::setup::setup_logging;
use assocsync::output::{Output, create_output};
use assocsync::run::{run_check, run_dump, run_set_fairshare, run_shares, run_sync};
use assocsync::store::MemoryStore;
use assocsync::sync::Filter;

struct GlobalSettings {
    opts: CommonOpts,
    printer: Box<dyn Output>,
}

impl GlobalSettings {
    fn config(&self) -> anyhow::Result<Config> {
        Config::load(&self.opts.config)
            .with_context(|| format!("Cannot load {}", self.opts.config.display()))
    }

    fn store(&self) -> anyhow::Result<MemoryStore> {
        MemoryStore::load(&self.opts.store)
            .with_context(|| format!("Cannot load store {}", self.opts.store.display()))
    }
}

fn make_global_settings(opts: CommonOpts) -> GlobalSettings {
    let color_policy = match opts.colors {
        ColorPolicy::Always => ColorChoice::AlwaysAnsi,
        ColorPolicy::Auto => {
            if std::io::stdout().is_terminal() {
                ColorChoice::Auto
            } else {
                ColorChoice::Never
            }
        }
        ColorPolicy::Never => ColorChoice::Never,
    };
    let printer = create_output(opts.output_mode, color_policy);
    GlobalSettings { opts, printer }
}

async fn command_sync(gsettings: &GlobalSettings, opts: SyncOpts) -> anyhow::Result<bool> {
    let config = gsettings.config()?;
    let store = gsettings.store()?;
    let options = opts.run_options();
    let reports = run_sync(&config, &store, &options).await?;
    if !(config.noop || options.noop) {
        store
            .save(&gsettings.opts.store)
            .with_context(|| format!("Cannot save store {}", gsettings.opts.store.display()))?;
    }
    gsettings.printer.print_sync_reports(&reports);
    Ok(reports.iter().all(|report| report.is_ok()))
}

async fn command_check(gsettings: &GlobalSettings, opts: CheckOpts) -> anyhow::Result<bool> {
    let config = gsettings.config()?;
    let store = gsettings.store()?;
    let reports = run_check(&config, &store, &opts.run_options()).await?;
    gsettings.printer.print_check_reports(&reports);
    Ok(reports.iter().all(|report| report.is_ok()))
}

fn command_dump(gsettings: &GlobalSettings, opts: DumpOpts) -> anyhow::Result<bool> {
    let config = gsettings.config()?;
    let store = gsettings.store()?;
    match &opts.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Cannot create {}", path.display()))?;
            let mut output = BufWriter::new(file);
            run_dump(&config, &opts.cluster, &store, &mut output)?;
            output.flush()?;
        }
        None => {
            let mut output = std::io::stdout().lock();
            run_dump(&config, &opts.cluster, &store, &mut output)?;
        }
    }
    Ok(true)
}

async fn command_shares(gsettings: &GlobalSettings, opts: SharesOpts) -> anyhow::Result<bool> {
    let config = gsettings.config()?;
    let filter = Filter {
        account: opts.account,
        user: opts.user,
    };
    let rows = run_shares(&config, &opts.cluster, &filter).await?;
    gsettings.printer.print_shares(&opts.cluster, &rows);
    Ok(true)
}

async fn command_fairshare(
    gsettings: &GlobalSettings,
    opts: FairshareOpts,
) -> anyhow::Result<bool> {
    let config = gsettings.config()?;
    let outcome = run_set_fairshare(
        &config,
        &opts.cluster,
        &opts.account,
        opts.user.as_deref(),
        opts.value,
        opts.noop,
    )
    .await?;
    match outcome {
        MutationOutcome::Simulated(payload) => println!("[noop] {payload}"),
        MutationOutcome::Applied => log::info!(
            "Fair-share of {} on cluster {} set to {}",
            opts.user
                .as_deref()
                .map(|user| format!("{user}@{}", opts.account))
                .unwrap_or_else(|| opts.account.clone()),
            opts.cluster,
            opts.value
        ),
    }
    Ok(true)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> assocsync::Result<()> {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(top_opts.common.verbose);

    let gsettings = make_global_settings(top_opts.common);

    let result = match top_opts.subcmd {
        SubCommand::Sync(opts) => command_sync(&gsettings, opts).await,
        SubCommand::Check(opts) => command_check(&gsettings, opts).await,
        SubCommand::Dump(opts) => command_dump(&gsettings, opts),
        SubCommand::Shares(opts) => command_shares(&gsettings, opts).await,
        SubCommand::Fairshare(opts) => command_fairshare(&gsettings, opts).await,
    };

    match result {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(2),
        Err(e) => {
            log::error!("{e:?}");
            std::process::exit(1);
        }
    }
}
