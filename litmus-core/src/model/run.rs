//! Run records and their lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Progress counter; `completed` never decreases within a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.completed, self.total)
    }
}

/// One execution of a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    #[serde(rename = "run_id")]
    pub id: String,

    pub template_id: String,

    #[serde(default)]
    pub status: RunStatus,

    #[serde(default)]
    pub progress: Progress,

    /// Bumped on every external restart
    #[serde(default)]
    pub generation: u64,

    /// Identifies this incarnation of the run. Replaced on restart and new
    /// for a run recreated after a delete; writes carrying another epoch are
    /// rejected.
    #[serde(default)]
    pub epoch: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Run {
    /// A fresh, not yet started run
    pub fn new(id: impl Into<String>, template_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            template_id: template_id.into(),
            status: RunStatus::NotStarted,
            progress: Progress::default(),
            generation: 0,
            epoch: Uuid::new_v4().to_string(),
            start_time: None,
            end_time: None,
            failure_reason: None,
        }
    }
}
