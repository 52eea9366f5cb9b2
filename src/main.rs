mod actions;
mod cli;
mod commands;
mod context;
mod descriptor;
mod elevate;
mod engine;
mod error;
mod health;
mod paths;
mod plan;
mod report;
mod runner;
mod state;
#[cfg(test)]
mod testutil;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;

use actions::InstallIntent;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    match cli.command {
        Command::Inspect(args) => commands::inspect::run(&ctx, args.json),
        Command::Status => commands::inspect::status(&ctx),
        Command::Install(args) => {
            commands::converge::run(&ctx, InstallIntent::Install, args.yes, None)
        }
        Command::Repair(args) => commands::converge::run(
            &ctx,
            InstallIntent::Repair,
            args.yes,
            args.only.as_deref(),
        ),
        Command::Uninstall(args) => {
            commands::converge::run(&ctx, InstallIntent::Uninstall, args.yes, None)
        }
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    }
}
