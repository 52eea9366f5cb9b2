use clap::{Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "keyhelm")]
#[command(version)]
#[command(about = "Install, inspect and repair the kanata background services", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Inspect the service stack without changing anything
    Inspect(InspectArgs),

    /// Show a one-screen status dashboard
    Status,

    /// Install the full service stack (binary, driver services, daemon)
    Install(ConvergeArgs),

    /// Repair whatever diverged; a healthy system is a no-op
    Repair(RepairArgs),

    /// Unload all services and remove installed artifacts
    Uninstall(ConvergeArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser)]
pub struct InspectArgs {
    /// Emit the snapshot as JSON instead of the human dashboard
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser)]
pub struct ConvergeArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser)]
pub struct RepairArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Run a single named remediation action instead of a full repair
    #[arg(long, value_name = "ACTION")]
    pub only: Option<String>,
}
