//! # wayfarer-runner
//!
//! Step execution loop for LLM browser agents. A [`Navigator`] turns one
//! model invocation into an ordered batch of actions, runs them against a
//! fixed page snapshot, and records everything it did for later replay.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wayfarer_runner::{Config, Runner};
//!
//! # #[tokio::main]
//! # async fn main() -> wayfarer_runner::Result<()> {
//! let config = Config::load("plan.yaml")?;
//! let runner = Runner::new(&config.browser).await?;
//! let (result, history) = runner.run(&config).await?;
//! println!("Success: {}", result.success);
//! history.save("history.json")?;
//! runner.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod actions;
pub mod config;
pub mod events;
pub mod model;
pub mod navigator;
pub mod policy;
pub mod prompt;
pub mod result;
mod runner;
pub mod signal;

pub use actions::{ActionInput, ActionKind, Registry};
pub use config::{BrowserConfig, Config, ParamDef, Params, PlanStep, TaskSettings};
pub use events::{EventBus, EventKind, ExecutionEvent};
pub use model::{ModelClient, ModelReply, ProposedAction, ScriptedModel};
pub use navigator::{Navigator, NavigatorBuilder, Phase, StepOutcome};
pub use policy::UrlPolicy;
pub use prompt::{PromptBuilder, PromptError, TextPromptBuilder};
pub use result::{ActionResult, AgentHistory, StepHistoryRecord, StepStatus};
pub use runner::{RunResult, Runner};
pub use signal::{CancelCause, CancelHandle, StepSignal};

/// Result type for wayfarer-runner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while planning, executing or replaying actions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Arguments failed schema validation. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The addressed element is not on the page (any more).
    #[error("element not found: {0}")]
    ElementNotFound(String),

    /// Navigation to a disallowed destination. Aborts the batch.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// The bound surface is gone.
    #[error("surface unavailable: {0}")]
    SurfaceUnavailable(String),

    /// A deadline or an internal operation bound elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The user aborted the step.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("too many failures: {failures} actions failed (limit {limit})")]
    TooManyFailures { failures: usize, limit: usize },

    #[error("action failed: {0}")]
    ActionFailed(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors that abort the current batch instead of becoming a failed result.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::PolicyViolation(_) | Error::SurfaceUnavailable(_)
        )
    }

    /// Errors a later attempt (re-planning or replay retry) may get past.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ElementNotFound(_) | Error::ActionFailed(_) | Error::Timeout(_)
        )
    }
}

impl From<wayfarer_agent::Error> for Error {
    fn from(e: wayfarer_agent::Error) -> Self {
        match e {
            wayfarer_agent::Error::SurfaceUnavailable(m) => Error::SurfaceUnavailable(m),
            wayfarer_agent::Error::ElementNotFound(m) => Error::ElementNotFound(m),
            wayfarer_agent::Error::Json(e) => Error::Json(e),
            other => Error::ActionFailed(other.to_string()),
        }
    }
}
