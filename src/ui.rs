use console::style;

use crate::orchestrator::PollState;
use crate::pipeline::{Pipeline, PipelineStore};

/// One line per tracked pipeline, for the `status` subcommand.
pub fn print_pipeline(pipeline: &Pipeline) {
    let progress = format!("{}/{}", pipeline.completed.len(), pipeline.agents.len());
    let current = match pipeline.current_agent() {
        Some(agent) => format!("{} {}", style("▶").green().bold(), style(agent).yellow()),
        None => format!("{}", style("✓ complete").green().bold()),
    };
    println!(
        "  {}  #{:<6} {}  {}",
        style(&pipeline.status).cyan().bold(),
        pipeline.issue_id,
        style(progress).dim(),
        current,
    );
}

pub fn print_store(store: &PipelineStore) {
    let issue_ids = store.issue_ids();
    if issue_ids.is_empty() {
        println!("{}", style("no pipelines tracked").dim());
        return;
    }
    for issue_id in issue_ids {
        if let Some(pipeline) = store.get(issue_id) {
            print_pipeline(pipeline);
        }
    }
}

pub fn print_poll_state(state: &PollState) {
    println!(
        "{}  ticks={}  errors={}",
        style("poll").bold(),
        state.ticks,
        if state.errors == 0 {
            style(state.errors).green().to_string()
        } else {
            style(state.errors).red().to_string()
        },
    );
    if let Some(last_error) = &state.last_error {
        println!("  {} {}", style("last error:").dim(), last_error);
    }
}
