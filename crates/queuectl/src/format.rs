//! Plain-text rendering for CLI output.

use std::fmt::Write;

use queuectl_core::{Job, JobState, MAX_LIST_LIMIT, QueueDefaults, StateCounts};

use crate::supervisor::WorkerHandle;

/// Commands longer than this are shortened in listings.
const COMMAND_WIDTH: usize = 28;

/// Characters kept before the ellipsis.
const COMMAND_PREFIX: usize = 25;

/// Shorten a command for a listing column.
pub fn shorten_command(command: &str) -> String {
    if command.chars().count() > COMMAND_WIDTH {
        let prefix: String = command.chars().take(COMMAND_PREFIX).collect();
        format!("{prefix}...")
    } else {
        command.to_string()
    }
}

/// Render a job listing for `state`.
pub fn render_jobs(state: JobState, jobs: &[Job]) -> String {
    if jobs.is_empty() {
        return format!("No jobs found with state: {state}\n");
    }

    let mut out = String::new();
    let _ = writeln!(out, "--- Jobs [{state}] (max {MAX_LIST_LIMIT}) ---");
    let _ = writeln!(out, "{:<20}{:<30}Attempts", "ID", "Command");
    let _ = writeln!(out, "{}", "-".repeat(60));
    for job in jobs {
        let _ = writeln!(
            out,
            "{:<20}{:<30}{}",
            job.id,
            shorten_command(&job.command),
            job.attempts
        );
    }
    out
}

/// Render job counts and the recorded workers.
pub fn render_status(counts: &StateCounts, workers: &[WorkerHandle], alive: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "--- Job Queue Status ---");
    for (state, count) in counts.iter() {
        let _ = writeln!(out, "{:<12}: {count}", state.as_str());
    }

    let _ = writeln!(out, "\n--- Workers ---");
    let _ = writeln!(out, "{:<12}: {}", "Recorded", workers.len());
    let _ = writeln!(out, "{:<12}: {alive}", "Alive");
    if !workers.is_empty() {
        let pids: Vec<String> = workers.iter().map(|w| w.pid.to_string()).collect();
        let _ = writeln!(out, "PIDs: {}", pids.join(", "));
    }
    out
}

/// Render the defaults new jobs would receive.
pub fn render_defaults(defaults: &QueueDefaults) -> String {
    format!(
        "{:<22}= {}\n{:<22}= {}\n",
        "default_max_retries",
        defaults.max_retries,
        "default_base_backoff",
        defaults.base_backoff_seconds
    )
}
