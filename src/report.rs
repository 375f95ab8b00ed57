use crate::{
    budget::{BudgetReport, Rejection},
    stats::{Cost, StatsSnapshot},
};
use serde::{Deserialize, Serialize};

/// Final accounting for one dispatch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub admitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Admitted, then stopped by cancellation before the call started.
    pub cancelled_before_start: u64,
    /// Never reached the inference boundary: not admitted, or cancelled
    /// after admission.
    pub never_started: u64,
    /// Called, but the result row could not be written.
    pub unwritten: u64,
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: Cost,
    pub duration_seconds: f64,
    pub avg_seconds_per_record: f64,
    pub was_cancelled: bool,
}

impl RunSummary {
    pub fn from_snapshot(total: usize, snap: &StatsSnapshot, was_cancelled: bool) -> Self {
        let total_u = total as u64;
        let never_started = total_u.saturating_sub(snap.admitted) + snap.cancelled;
        let completed = snap.completed();
        let avg_seconds_per_record = if completed > 0 {
            snap.elapsed_seconds / completed as f64
        } else {
            0.0
        };

        Self {
            total,
            admitted: snap.admitted,
            succeeded: snap.succeeded,
            failed: snap.failed,
            cancelled_before_start: snap.cancelled,
            never_started,
            unwritten: snap.unwritten,
            input_tokens: snap.input_tokens,
            cached_input_tokens: snap.cached_input_tokens,
            output_tokens: snap.output_tokens,
            total_cost: snap.total_cost,
            duration_seconds: snap.elapsed_seconds,
            avg_seconds_per_record,
            was_cancelled,
        }
    }

    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }
}

/// Printable outcome of a budget check.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub job: String,
    pub model: String,
    pub records: usize,
    pub admissible: bool,
    pub available_context: usize,
    pub shared_context_tokens: usize,
    pub max_record_tokens: usize,
    pub max_request_tokens: usize,
    pub rejected: Vec<Rejection>,
}

impl ValidationReport {
    pub fn new(job: &str, model: &str, budget: &BudgetReport) -> Self {
        Self {
            job: job.to_string(),
            model: model.to_string(),
            records: budget.validated.len() + budget.rejected.len(),
            admissible: budget.is_admissible(),
            available_context: budget.available_context,
            shared_context_tokens: budget.shared_context_tokens,
            max_record_tokens: budget.max_record_tokens,
            max_request_tokens: budget.max_request_tokens(),
            rejected: budget.rejected.clone(),
        }
    }
}
