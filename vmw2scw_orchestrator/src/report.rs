//! Post-batch markdown report (§2 ReportGenerator, §6 "Report document").

use std::collections::HashMap;

use vmw2scw_types::{BatchState, Stage, VmStatus};

fn status_label(state: &BatchState) -> &'static str {
    match state.status {
        vmw2scw_types::BatchStatus::Pending => "pending",
        vmw2scw_types::BatchStatus::Running => "running",
        vmw2scw_types::BatchStatus::Paused => "paused",
        vmw2scw_types::BatchStatus::Complete => "complete",
        vmw2scw_types::BatchStatus::Failed => "failed",
        vmw2scw_types::BatchStatus::Partial => "partial",
    }
}

fn duration_label(state: &BatchState) -> String {
    match (state.started_at, state.completed_at) {
        (Some(start), Some(end)) => {
            let secs = (end.as_second() - start.as_second()).max(0);
            let mins = secs as f64 / 60.0;
            format!("{mins:.1} min")
        }
        _ => "n/a".to_string(),
    }
}

/// Build the resume command an operator can copy to retry a failed VM
/// (§6 "Failed Migrations table").
fn resume_command(batch_id: &str) -> String {
    format!("vmw2scw batch resume --batch-id {batch_id}")
}

/// Generate the full markdown report for a terminal (or in-flight)
/// [`BatchState`] (§6 "Report document").
pub fn generate_report(state: &BatchState) -> String {
    let mut out = String::new();

    out.push_str(&format!("# Batch Migration Report: {}\n\n", state.batch_id));
    out.push_str(&format!("- **Date**: {}\n", state.started_at.map(|t| t.to_string()).unwrap_or_else(|| "n/a".to_string())));
    out.push_str(&format!("- **Duration**: {}\n", duration_label(state)));
    out.push_str(&format!("- **Status**: {}\n\n", status_label(state)));

    let succeeded: Vec<_> = state.jobs.iter().filter(|j| j.status == VmStatus::Complete).collect();
    let failed: Vec<_> = state.jobs.iter().filter(|j| j.status == VmStatus::Failed).collect();
    let skipped = state.jobs.iter().filter(|j| j.status == VmStatus::Skipped).count();

    out.push_str("## Summary\n\n");
    out.push_str("| Total VMs | Succeeded | Failed | Skipped |\n");
    out.push_str("|---|---|---|---|\n");
    out.push_str(&format!(
        "| {} | {} | {} | {} |\n\n",
        state.jobs.len(),
        succeeded.len(),
        failed.len(),
        skipped
    ));

    out.push_str("## Successful Migrations\n\n");
    out.push_str("| VM | Target Type | OS | Duration | Image ID |\n");
    out.push_str("|---|---|---|---|---|\n");
    for job in &succeeded {
        let duration = job
            .stage_timings
            .values()
            .sum::<f64>();
        out.push_str(&format!(
            "| {} | {} | {:?} | {:.1}s | {} |\n",
            job.vm_name,
            job.target_type,
            job.os_family,
            duration,
            job.artifacts.target_image_id.as_deref().unwrap_or("")
        ));
    }
    out.push('\n');

    out.push_str("## Failed Migrations\n\n");
    out.push_str("| VM | Failed Stage | Error | Resume Command |\n");
    out.push_str("|---|---|---|---|\n");
    for job in &failed {
        let stage = job.error_stage.map(|s| s.name()).unwrap_or("unknown");
        let error = job.error.as_deref().unwrap_or("unknown error");
        let truncated: String = error.chars().take(500).collect();
        out.push_str(&format!(
            "| {} | {} | {} | `{}` |\n",
            job.vm_name,
            stage,
            truncated,
            resume_command(state.batch_id.as_str())
        ));
    }
    out.push('\n');

    out.push_str("## Stage Timing Analysis\n\n");
    out.push_str("| Stage | Avg | Min | Max |\n");
    out.push_str("|---|---|---|---|\n");
    let mut by_stage: HashMap<&str, Vec<f64>> = HashMap::new();
    for job in &succeeded {
        for (stage, secs) in &job.stage_timings {
            by_stage.entry(stage.as_str()).or_default().push(*secs);
        }
    }
    // Stable stage ordering: iterate the nominal order rather than a
    // hash-map's arbitrary iteration order.
    let mut ordered_stage_names: Vec<&str> = Vec::new();
    for stage in Stage::WINDOWS_ORDER {
        if !ordered_stage_names.contains(&stage.name()) {
            ordered_stage_names.push(stage.name());
        }
    }
    for stage_name in ordered_stage_names {
        let Some(samples) = by_stage.get(stage_name) else { continue };
        if samples.is_empty() {
            continue;
        }
        let avg = samples.iter().sum::<f64>() / samples.len() as f64;
        let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        out.push_str(&format!("| {stage_name} | {avg:.1}s | {min:.1}s | {max:.1}s |\n"));
    }

    out
}
