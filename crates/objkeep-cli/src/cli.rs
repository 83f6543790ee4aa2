use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use objkeep_core::objects::RequestSource;
use objkeep_core::MaintenanceTask;

pub const OBJKEEP_BEFORE_HELP: &str = concat!(
    "objkeep ",
    env!("CARGO_PKG_VERSION"),
    " – object store maintenance for virtualized git enlistments\n\n",
    "  run              Run one maintenance task now (fetch, loose-objects, pack-files,\n",
    "                   commit-graph, config, status).\n",
    "  download         Fetch one missing loose object from the object server.\n",
    "  watch            Run the scheduler; read task names from stdin until `stop`.\n",
);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    propagate_version = false,
    disable_help_subcommand = true,
    before_help = OBJKEEP_BEFORE_HELP
)]
pub struct ObjkeepCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)", global = true)]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[arg(long, help = "Disable colored human output", global = true)]
    pub no_color: bool,
    #[arg(
        short = 'C',
        long = "enlistment",
        value_name = "PATH",
        help = "Enlistment root (defaults to the current directory)",
        global = true
    )]
    pub enlistment: Option<PathBuf>,
    #[command(subcommand)]
    pub command: CommandCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    #[command(
        about = "Run one maintenance task in the foreground.",
        override_usage = "objkeep run <TASK> [--force]"
    )]
    Run(RunArgs),
    #[command(
        about = "Download a loose object into the object store.",
        override_usage = "objkeep download <OBJECT_ID> [--source SOURCE]"
    )]
    Download(DownloadArgs),
    #[command(
        about = "Start the maintenance scheduler and queue tasks read from stdin.",
        after_help = "Input lines:\n  loose-objects\n  pack-files --force\n  stop\n"
    )]
    Watch,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(value_name = "TASK", help = "fetch, loose-objects, pack-files, commit-graph, config or status")]
    pub task: MaintenanceTask,
    #[arg(long, help = "Ignore the last-run gate and running git processes")]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    #[arg(value_name = "OBJECT_ID", help = "40-character hex object id")]
    pub object_id: String,
    #[arg(long, value_enum, default_value_t = SourceArg::Command)]
    pub source: SourceArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceArg {
    FileAccess,
    GitSubprocess,
    Command,
}

impl From<SourceArg> for RequestSource {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::FileAccess => Self::FileAccess,
            SourceArg::GitSubprocess => Self::GitSubprocess,
            SourceArg::Command => Self::Command,
        }
    }
}

impl CommandCli {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Download(_) => "download",
            Self::Watch => "watch",
        }
    }
}
