//! What actions and steps produced, and how it is persisted.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wayfarer_agent::{HistoryRecord, PageState, SurfaceId};

use crate::model::ProposedAction;
use crate::signal::CancelCause;
use crate::{Error, Result};

/// Outcome of one action. Built by the constructors below and read-only
/// afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    #[serde(default)]
    is_done: bool,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    extracted_content: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    include_in_memory: bool,
    #[serde(default)]
    interacted_element: Option<HistoryRecord>,
}

impl ActionResult {
    /// The task is finished.
    pub fn done(text: impl Into<String>, success: bool) -> Self {
        Self {
            is_done: true,
            success: Some(success),
            extracted_content: Some(text.into()),
            include_in_memory: true,
            ..Default::default()
        }
    }

    /// Succeeded with a message for the planner.
    pub fn extracted(content: impl Into<String>, include_in_memory: bool) -> Self {
        Self {
            extracted_content: Some(content.into()),
            include_in_memory,
            ..Default::default()
        }
    }

    pub fn failed(error: &Error) -> Self {
        Self {
            error: Some(error.to_string()),
            include_in_memory: true,
            ..Default::default()
        }
    }

    /// Attach the element the action touched.
    pub fn with_interacted(mut self, record: Option<HistoryRecord>) -> Self {
        self.interacted_element = record;
        self
    }

    pub fn is_done(&self) -> bool {
        self.is_done
    }

    pub fn success(&self) -> Option<bool> {
        self.success
    }

    pub fn extracted_content(&self) -> Option<&str> {
        self.extracted_content.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn include_in_memory(&self) -> bool {
        self.include_in_memory
    }

    pub fn interacted_element(&self) -> Option<&HistoryRecord> {
        self.interacted_element.as_ref()
    }
}

/// Terminal status of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed(String),
    Cancelled(CancelCause),
}

/// Everything one step did, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepHistoryRecord {
    pub step: usize,
    /// Raw model output, before repair.
    pub model_output_raw: String,
    /// The batch as executed, after preprocessing.
    pub actions: Vec<ProposedAction>,
    /// One entry per action that ran; may be shorter than `actions`.
    pub action_results: Vec<ActionResult>,
    pub status: StepStatus,
    pub surface_id: Option<SurfaceId>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Snapshot the batch ran against. Not persisted.
    #[serde(skip)]
    pub state: Option<Arc<PageState>>,
}

impl StepHistoryRecord {
    pub fn is_done(&self) -> bool {
        self.action_results.iter().any(|r| r.is_done())
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// A session's step records, as saved to and loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentHistory {
    pub steps: Vec<StepHistoryRecord>,
}

impl AgentHistory {
    pub fn new(steps: Vec<StepHistoryRecord>) -> Self {
        Self { steps }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.steps.iter().any(|s| s.is_done())
    }

    /// Text of the `done` action, if the task finished.
    pub fn final_result(&self) -> Option<&str> {
        self.steps
            .iter()
            .flat_map(|s| s.action_results.iter())
            .find(|r| r.is_done())
            .and_then(|r| r.extracted_content())
    }

    pub fn action_count(&self) -> usize {
        self.steps.iter().map(|s| s.action_results.len()).sum()
    }

    pub fn errors(&self) -> Vec<&str> {
        self.steps
            .iter()
            .flat_map(|s| s.action_results.iter())
            .filter_map(|r| r.error())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(results: Vec<ActionResult>, status: StepStatus) -> StepHistoryRecord {
        let now = Utc::now();
        StepHistoryRecord {
            step: 1,
            model_output_raw: "{}".into(),
            actions: vec![ProposedAction::new("done", json!({"text": "ok"}))],
            action_results: results,
            status,
            surface_id: Some(SurfaceId::new("t1")),
            url: Some("https://example.com/".into()),
            title: Some("Example".into()),
            started_at: now,
            finished_at: now,
            state: None,
        }
    }

    #[test]
    fn test_constructors() {
        let done = ActionResult::done("all good", true);
        assert!(done.is_done());
        assert_eq!(done.success(), Some(true));
        assert_eq!(done.extracted_content(), Some("all good"));

        let failed = ActionResult::failed(&Error::ElementNotFound("index 4".into()));
        assert!(failed.is_error());
        assert!(failed.error().unwrap().contains("index 4"));
        assert!(!failed.is_done());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_value(StepStatus::Cancelled(CancelCause::User)).unwrap(),
            json!({"status": "cancelled", "detail": "user"})
        );
        assert_eq!(
            serde_json::to_value(StepStatus::Completed).unwrap(),
            json!({"status": "completed"})
        );
    }

    #[test]
    fn test_history_save_load() {
        let history = AgentHistory::new(vec![
            record(
                vec![ActionResult::failed(&Error::Timeout("slow".into()))],
                StepStatus::Failed("boom".into()),
            ),
            record(vec![ActionResult::done("42", true)], StepStatus::Completed),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        history.save(&path).unwrap();

        let loaded = AgentHistory::load(&path).unwrap();
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.steps[0].status, StepStatus::Failed("boom".into()));
        assert!(loaded.steps[0].state.is_none());
        assert!(loaded.is_done());
        assert_eq!(loaded.final_result(), Some("42"));
        assert_eq!(loaded.action_count(), 2);
        assert_eq!(loaded.errors().len(), 1);
    }
}
