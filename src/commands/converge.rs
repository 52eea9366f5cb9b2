use anyhow::{Context as _, Result};
use colored::Colorize;

use crate::Context;
use crate::actions::{AbstractAction, InstallIntent};
use crate::elevate::broker_from_env;
use crate::engine::InstallerEngine;
use crate::paths;
use crate::plan::{self, InstallPlan, PlanStatus};
use crate::report::InstallerReport;
use crate::ui;

/// Shared flow for install, repair and uninstall: snapshot, plan, confirm,
/// execute, report.
pub fn run(ctx: &Context, intent: InstallIntent, yes: bool, only: Option<&str>) -> Result<()> {
    let engine = InstallerEngine::new();
    let snapshot = engine.inspect_system();

    let action: Option<AbstractAction> = only.map(str::parse).transpose()?;
    let plan = match action {
        Some(action) => plan::build_plan(intent, &[action], &snapshot),
        None => engine.make_plan(intent, &snapshot),
    };

    if let PlanStatus::Blocked { requirement } = &plan.status {
        anyhow::bail!("Cannot proceed: {requirement}");
    }

    // An empty plan still goes through the engine: the post-execution
    // registration pass (broken-registration recovery, uninstall release)
    // is not recipe-shaped and must run regardless.
    if plan.recipes.is_empty() {
        let broker = broker_from_env();
        let report = engine.execute(&plan, broker.as_ref());
        if ctx.verbose > 0 {
            for line in &report.log {
                ui::dim(line);
            }
        }
        ui::success("System already converged; nothing to do.");
        return Ok(());
    }

    if !ctx.quiet {
        show_plan(&plan);
    }

    if plan.needs_elevation && !yes && !paths::automation_mode() {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!(
                "Execute {} recipe(s) with administrator access?",
                plan.recipes.len()
            ))
            .default(true)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            anyhow::bail!("Aborted by user");
        }
    }

    let broker = broker_from_env();
    // A targeted single-action run re-inspects right before execution so the
    // recipe reflects the system as it is now, not as it was when displayed.
    let report = match action {
        Some(action) => engine.run_single_action(action, broker.as_ref()),
        None => engine.execute(&plan, broker.as_ref()),
    };
    show_report(ctx, &report);

    if report.success {
        Ok(())
    } else {
        let reason = report
            .failure_reason
            .unwrap_or_else(|| "Execution failed.".to_string());
        anyhow::bail!(reason)
    }
}

fn show_plan(plan: &InstallPlan) {
    ui::header("Execution Plan");
    for (i, recipe) in plan.recipes.iter().enumerate() {
        ui::step(i + 1, plan.recipes.len(), &recipe.description);
        for command in &recipe.commands {
            ui::dim(&command.render());
        }
    }
    println!();
}

fn show_report(ctx: &Context, report: &InstallerReport) {
    for result in &report.results {
        let glyph = ui::check(result.success);
        let duration = format!("({} ms)", result.duration_ms).dimmed();
        println!("  {glyph} {} {duration}", result.description);
        if let Some(error) = &result.error {
            for line in error.lines() {
                println!("      {}", line.red());
            }
        }
    }

    if ctx.verbose > 0 {
        for line in &report.log {
            ui::dim(line);
        }
    }

    println!();
    if report.success {
        ui::success(&format!(
            "Converged: {} recipe(s) executed.",
            report.executed_count()
        ));
    } else {
        ui::error("Convergence failed.");
    }
}
