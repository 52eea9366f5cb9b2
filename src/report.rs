//! Immutable execution reports.

use serde::Serialize;

/// Outcome of one executed recipe.
#[derive(Debug, Clone, Serialize)]
pub struct RecipeResult {
    pub id: String,
    pub description: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Rendered commands, for diagnostics.
    pub commands: Vec<String>,
}

/// Produced once per `execute` call; never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct InstallerReport {
    pub success: bool,
    /// A complete sentence naming the failing recipe and the tail of the
    /// underlying output, when the run failed.
    pub failure_reason: Option<String>,
    pub results: Vec<RecipeResult>,
    /// Free-form execution log, including non-fatal diagnostics.
    pub log: Vec<String>,
}

impl InstallerReport {
    pub fn succeeded(results: Vec<RecipeResult>, log: Vec<String>) -> Self {
        Self {
            success: true,
            failure_reason: None,
            results,
            log,
        }
    }

    pub fn failed(reason: String, results: Vec<RecipeResult>, log: Vec<String>) -> Self {
        Self {
            success: false,
            failure_reason: Some(reason),
            results,
            log,
        }
    }

    pub fn executed_count(&self) -> usize {
        self.results.len()
    }
}

/// Last `max_lines` lines of command output, enough to file a precise bug
/// report without re-running anything.
pub fn output_tail(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() <= max_lines {
        output.trim().to_string()
    } else {
        lines[lines.len() - max_lines..].join("\n")
    }
}
