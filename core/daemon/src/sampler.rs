//! Tier-3 source: raw terminal output snapshots.

use std::process::Command;

use chrono::{DateTime, Utc};

use crate::db::EntityRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSample {
    pub captured_at: DateTime<Utc>,
    pub text: String,
}

pub trait OutputSampler: Send + Sync {
    /// `None` when the entity has no reachable output channel.
    fn sample(&self, entity: &EntityRecord) -> Option<OutputSample>;
}

/// Captures the visible contents of the entity's tmux pane.
#[derive(Debug, Clone, Default)]
pub struct TmuxPaneSampler;

impl OutputSampler for TmuxPaneSampler {
    fn sample(&self, entity: &EntityRecord) -> Option<OutputSample> {
        let target = entity
            .terminal_target
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())?;
        let captured_at = Utc::now();
        let text = run_tmux(["capture-pane", "-p", "-t", target])?;
        Some(OutputSample { captured_at, text })
    }
}

fn run_tmux<const N: usize>(args: [&str; N]) -> Option<String> {
    match Command::new("tmux").args(args).output() {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).to_string())
        }
        _ => None,
    }
}
