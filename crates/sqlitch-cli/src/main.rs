//! The `sqlitch` command-line driver.
//!
//! Every subcommand is a thin wrapper that builds a `CoreContext`, loads the
//! plan and configuration through `sqlitch-core`, and maps the result onto
//! the process exit code: 0 for success, 1 for user errors, 2 for usage
//! errors.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "sqlitch", version)]
#[command(about = "Sensible database change management, compatible with Sqitch")]
pub struct Cli {
    /// Change to this directory before doing anything.
    #[arg(long, short = 'C', global = true, value_name = "DIR")]
    pub chdir: Option<PathBuf>,

    /// Path to the plan file (default: sqitch.plan in the project root).
    #[arg(long, global = true, value_name = "FILE")]
    pub plan_file: Option<PathBuf>,

    /// Database engine override.
    #[arg(long, global = true)]
    pub engine: Option<String>,

    /// Deployment target (URI or configured target alias).
    #[arg(long, global = true)]
    pub target: Option<String>,

    /// Registry URI override.
    #[arg(long, global = true)]
    pub registry: Option<String>,

    /// Increase verbosity (repeatable).
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only print errors.
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Emit structured JSON output where supported.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a project: plan, config, script directories, templates.
    ///
    /// The global `--engine` and `--target` options set the project's
    /// default engine and deployment target.
    Init {
        /// Project name (default: the project directory's name).
        project: Option<String>,
        /// Project URI recorded in the plan.
        #[arg(long)]
        uri: Option<String>,
    },
    /// Add a change to the plan and scaffold its scripts.
    Add {
        name: String,
        /// Required change (repeatable).
        #[arg(long = "requires", short = 'r', value_name = "CHANGE")]
        requires: Vec<String>,
        /// Conflicting change (repeatable).
        #[arg(long = "conflicts", short = 'x', value_name = "CHANGE")]
        conflicts: Vec<String>,
        /// Change note.
        #[arg(long, short = 'n')]
        note: Option<String>,
    },
    /// Add a tag to the plan, or list tags.
    Tag {
        name: Option<String>,
        /// Change to anchor the tag on (default: the latest change).
        #[arg(long)]
        change: Option<String>,
        /// Tag note.
        #[arg(long, short = 'n')]
        note: Option<String>,
    },
    /// Duplicate a tagged change for rework.
    Rework {
        name: String,
        #[arg(long = "requires", short = 'r', value_name = "CHANGE")]
        requires: Vec<String>,
        #[arg(long = "conflicts", short = 'x', value_name = "CHANGE")]
        conflicts: Vec<String>,
        #[arg(long, short = 'n')]
        note: Option<String>,
    },
    /// Deploy changes to the target database.
    Deploy {
        #[arg(value_name = "TARGET")]
        db_target: Option<String>,
        /// Deploy through this change.
        #[arg(long, value_name = "CHANGE")]
        to_change: Option<String>,
        /// Deploy through this tag.
        #[arg(long, value_name = "TAG")]
        to_tag: Option<String>,
    },
    /// Revert changes from the target database.
    Revert {
        #[arg(value_name = "TARGET")]
        db_target: Option<String>,
        /// Revert to this symbolic reference (everything after it).
        #[arg(long, value_name = "REF")]
        to: Option<String>,
        #[arg(long, value_name = "CHANGE")]
        to_change: Option<String>,
        #[arg(long, value_name = "TAG")]
        to_tag: Option<String>,
        /// Skip the confirmation prompt.
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Run verify scripts for deployed changes.
    Verify {
        #[arg(value_name = "TARGET")]
        db_target: Option<String>,
    },
    /// Report the deployment state of the target database.
    Status {
        #[arg(value_name = "TARGET")]
        db_target: Option<String>,
    },
    /// Show the registry event history.
    Log {
        #[arg(value_name = "TARGET")]
        db_target: Option<String>,
        /// Only show events of this type (repeatable): deploy, deploy_fail,
        /// revert, fail, merge.
        #[arg(long = "event", value_name = "TYPE")]
        events: Vec<String>,
        /// Only show events for this change.
        #[arg(long, value_name = "CHANGE")]
        change: Option<String>,
        /// Limit the number of events shown.
        #[arg(long, short = 'n', value_name = "COUNT")]
        limit: Option<usize>,
        /// Output format: human or json.
        #[arg(long, default_value = "human")]
        format: String,
    },
    /// Print the plan.
    Plan,
    /// Show a change's plan entry or one of its scripts.
    Show {
        /// One of: change, deploy, revert, verify.
        kind: String,
        name: String,
    },
    /// Get and set configuration options.
    Config {
        name: Option<String>,
        value: Option<String>,
        /// Operate on the local (project) scope.
        #[arg(long)]
        local: bool,
        /// Operate on the user scope.
        #[arg(long)]
        user: bool,
        /// Operate on the system scope.
        #[arg(long)]
        system: bool,
        /// List all options.
        #[arg(long)]
        list: bool,
        /// Remove the option.
        #[arg(long)]
        unset: bool,
    },
    /// Manage engine configuration.
    Engine {
        /// One of: add, alter, remove, list.
        action: Option<String>,
        name: Option<String>,
        uri: Option<String>,
    },
    /// Manage target configuration.
    Target {
        /// One of: add, alter, remove, show, list.
        action: Option<String>,
        name: Option<String>,
        uri: Option<String>,
    },
    /// Copy the plan, config, and scripts into a bundle directory.
    Bundle {
        /// Destination directory (default: bundle).
        #[arg(long, default_value = "bundle")]
        dest_dir: PathBuf,
    },
    /// Revert to a reference, then redeploy through the plan head.
    Rebase {
        #[arg(value_name = "TARGET")]
        db_target: Option<String>,
        /// Revert through this reference before redeploying.
        #[arg(long, value_name = "REF")]
        onto: Option<String>,
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Apply pending registry schema migrations.
    Upgrade {
        #[arg(value_name = "TARGET")]
        db_target: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match commands::run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("sqlitch: {err}");
            let code = sqlitch_core::error::exit_code_for(&err);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
