use serde::{Deserialize, Serialize};

use crate::types::RiskLevel;

/// User-facing notifications raised by the coordinator.
///
/// Each tracked job produces exactly one `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    /// The job record was created and the worker triggered.
    #[serde(rename_all = "camelCase")]
    Submitted { job_id: String },

    /// Generation finished with a result.
    #[serde(rename_all = "camelCase")]
    Completed {
        job_id: String,
        hazard_count: usize,
        highest_risk: Option<RiskLevel>,
    },

    /// Submission or generation failed. `job_id` is `None` when the job
    /// record was never created.
    #[serde(rename_all = "camelCase")]
    Failed {
        job_id: Option<String>,
        error: String,
    },
}

impl Notification {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Notification::Submitted { job_id } | Notification::Completed { job_id, .. } => {
                Some(job_id)
            }
            Notification::Failed { job_id, .. } => job_id.as_deref(),
        }
    }

    /// One-line text suitable for a toast.
    pub fn message(&self) -> String {
        match self {
            Notification::Submitted { .. } => "RAMS generation started".to_string(),
            Notification::Completed { hazard_count, .. } => {
                format!("RAMS generated with {} hazards identified", hazard_count)
            }
            Notification::Failed { error, .. } => format!("RAMS generation failed: {}", error),
        }
    }
}
