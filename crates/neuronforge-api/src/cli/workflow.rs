//! `nforge validate`, `nforge run`, and `nforge resume`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use neuronforge_core::event::EventBus;
use neuronforge_core::workflow::controller::ControlHandle;
use neuronforge_core::workflow::definition::load_workflow_file;
use neuronforge_core::workflow::executor::{EngineError, WorkflowRun};
use neuronforge_infra::state_store::FileStateStore;
use neuronforge_types::event::WorkflowEvent;
use neuronforge_types::execution::{ExecutionResult, StepStatus};
use neuronforge_types::step::WorkflowDocument;
use neuronforge_types::validation::DagValidationResult;

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn handle_validate(state: &AppState, file: &Path, json: bool) -> Result<()> {
    let doc = load_document(file)?;
    let report = state.engine.validate(&doc.steps);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&doc, &report, state.config.max_parallel_steps);
    }

    if !report.is_valid {
        bail!("{}", report.summary());
    }
    Ok(())
}

fn print_report(doc: &WorkflowDocument, report: &DagValidationResult, max_parallel: usize) {
    println!();
    if report.is_valid {
        println!(
            "  {} Workflow '{}' is valid ({} steps)",
            style("✓").green().bold(),
            style(&doc.name).cyan(),
            doc.steps.len()
        );
    } else {
        println!(
            "  {} Workflow '{}' is invalid",
            style("✗").red().bold(),
            style(&doc.name).cyan()
        );
        for issue in &report.errors {
            println!("    {} {issue}", style("-").red());
        }
    }
    for warning in &report.warnings {
        println!("    {} {warning}", style("!").yellow());
    }

    let batches = report.parallelization_opportunities.as_deref().unwrap_or_default();
    if batches.is_empty() {
        println!();
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new("Batch").fg(Color::Cyan), Cell::new("Steps")]);
    for batch in batches {
        table.add_row(vec![Cell::new(batch.batch_number), Cell::new(batch.steps.join(", "))]);
    }

    println!();
    println!("{table}");
    if let Some(path) = &report.critical_path {
        println!("  Critical path: {}", path.join(" -> "));
    }
    if let Some(merges) = report.merge_points.as_ref().filter(|m| !m.is_empty()) {
        println!("  Merge points: {}", merges.join(", "));
    }
    println!("  Up to {max_parallel} steps run at once.");
    println!();
}

// ---------------------------------------------------------------------------
// Run / resume
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: &AppState,
    file: &Path,
    input: Option<&str>,
    state_dir: Option<&Path>,
    json: bool,
) -> Result<()> {
    let doc = load_document(file)?;
    let input = match input {
        Some(raw) => serde_json::from_str::<Value>(raw).context("Invalid JSON input")?,
        None => doc.input.clone().unwrap_or(Value::Null),
    };

    let mut run = state.engine.new_run(doc.steps, input).map_err(describe_engine_error)?;
    if !json {
        println!();
        println!(
            "  {} Running '{}' ({})",
            style("*").green().bold(),
            style(&doc.name).cyan(),
            style(run.execution_id()).dim()
        );
    }

    drive_and_report(state, &mut run, state_dir, json).await
}

pub async fn handle_resume(
    state: &AppState,
    file: &Path,
    execution_id: Uuid,
    state_dir: &Path,
    json: bool,
) -> Result<()> {
    let doc = load_document(file)?;
    let store = FileStateStore::new(state_dir);
    let exported = store
        .load(execution_id)
        .await
        .with_context(|| format!("Failed to load state for {execution_id}"))?;

    let mut run = state
        .engine
        .resume_from(doc.steps, exported)
        .map_err(describe_engine_error)?;
    let previous = run.status();
    run.reopen().map_err(describe_engine_error)?;

    if !json {
        println!();
        println!(
            "  {} Resuming '{}' ({}, was {}, {} step(s) kept)",
            style("*").green().bold(),
            style(&doc.name).cyan(),
            style(execution_id).dim(),
            previous,
            run.controller().step_results().count()
        );
    }

    drive_and_report(state, &mut run, Some(state_dir), json).await
}

async fn drive_and_report(state: &AppState, run: &mut WorkflowRun, state_dir: Option<&Path>, json: bool) -> Result<()> {
    let progress = (!json).then(|| spawn_progress(state.engine.events(), run.execution_id()));
    let interrupt = spawn_interrupt_handler(run.handle(), json);

    let driven = state.engine.drive(run).await;

    interrupt.abort();
    if let Some(progress) = progress {
        progress.abort();
    }

    if let Some(dir) = state_dir {
        let store = FileStateStore::new(dir);
        let path = store
            .save(&run.export_state())
            .await
            .context("Failed to save run state")?;
        if !json {
            println!("  State saved to {}", style(path.display()).dim());
        }
    }

    let result = driven.map_err(describe_engine_error)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result, state_dir.is_some());
    }

    if !result.success {
        bail!(
            "Workflow ended {}: {}",
            result.status,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// First Ctrl+C stops at the next batch boundary, the second aborts in-flight
/// steps.
fn spawn_interrupt_handler(handle: ControlHandle, json: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        if !json {
            eprintln!("  {} Stopping after the current batch (Ctrl+C again to abort)", style("!").yellow());
        }
        handle.stop();

        if tokio::signal::ctrl_c().await.is_ok() {
            handle.abort();
        }
    })
}

fn spawn_progress(events: &EventBus, execution_id: Uuid) -> JoinHandle<()> {
    let mut events = events.subscribe_run(execution_id);
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            print_event(&event);
        }
    })
}

fn print_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::BatchStarted { batch, steps, .. } => {
            eprintln!("  {} batch {batch}: {}", style("→").dim(), steps.join(", "));
        }
        WorkflowEvent::StepCompleted {
            step_id, duration_ms, ..
        } => {
            eprintln!("    {} {step_id} ({duration_ms} ms)", style("✓").green());
        }
        WorkflowEvent::StepFailed {
            step_id,
            error,
            will_retry,
            ..
        } => {
            let note = if *will_retry { " (retrying)" } else { "" };
            eprintln!("    {} {step_id}: {error}{note}", style("✗").red());
        }
        WorkflowEvent::StepSkipped { step_id, reason, .. } => {
            eprintln!("    {} {step_id}: {reason}", style("-").yellow());
        }
        WorkflowEvent::RunPaused { .. } => eprintln!("  {} paused", style("‖").yellow()),
        WorkflowEvent::RunResumed { .. } => eprintln!("  {} resumed", style("▶").green()),
        _ => {}
    }
}

fn print_result(result: &ExecutionResult, saved: bool) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Time (ms)"),
            Cell::new("Tokens"),
            Cell::new("Error"),
        ]);

    for step in result.results.values() {
        let status = match step.status {
            StepStatus::Completed => Cell::new(step.status).fg(Color::Green),
            StepStatus::Failed => Cell::new(step.status).fg(Color::Red),
            _ => Cell::new(step.status).fg(Color::Yellow),
        };
        let error = step
            .error
            .as_ref()
            .map(|e| e.to_string().chars().take(60).collect::<String>())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&step.step_id),
            status,
            Cell::new(step.attempts),
            Cell::new(step.execution_time_ms),
            Cell::new(step.tokens_used),
            Cell::new(error),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    let marker = if result.success {
        style("✓").green().bold()
    } else {
        style("✗").red().bold()
    };
    println!(
        "  {marker} {} in {} ms: {} completed, {} failed, {} skipped, {} tokens",
        result.status,
        result.total_execution_time_ms,
        result.steps_completed,
        result.steps_failed,
        result.steps_skipped,
        result.total_tokens_used
    );
    if let Some(error) = &result.error {
        println!("  Error: {}", style(error).red());
    }
    if !result.output.is_null() {
        let output = serde_json::to_string_pretty(&result.output).unwrap_or_else(|_| result.output.to_string());
        println!();
        println!("  Output:");
        for line in output.lines() {
            println!("    {line}");
        }
    }
    if !result.success && saved {
        println!();
        println!(
            "  Continue with: {}",
            style(format!("nforge resume <file> --execution-id {} --state-dir <dir>", result.execution_id)).dim()
        );
    }
    println!();
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_document(file: &Path) -> Result<WorkflowDocument> {
    load_workflow_file(file).with_context(|| format!("Failed to load workflow {}", file.display()))
}

fn describe_engine_error(err: EngineError) -> anyhow::Error {
    match err {
        EngineError::Invalid(report) => anyhow::anyhow!("{}", report.summary()),
        other => anyhow::anyhow!("Workflow could not run: {other}"),
    }
}
