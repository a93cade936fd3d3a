use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use wayfarer_agent::{EokaHost, SurfaceHost, SurfaceOwners};

use crate::config::{BrowserConfig, Config, TaskSettings};
use crate::events::EventBus;
use crate::model::ScriptedModel;
use crate::navigator::Navigator;
use crate::policy::normalize_url;
use crate::result::{ActionResult, AgentHistory};
use crate::Result;

/// Result of running a plan or replaying a history.
#[derive(Debug)]
pub struct RunResult {
    /// Finished without error and the `done` action reported success.
    pub success: bool,
    /// A `done` action ran.
    pub done: bool,
    /// Error message if failed.
    pub error: Option<String>,
    pub steps_executed: usize,
    pub actions_executed: usize,
    /// Total duration in milliseconds.
    pub duration_ms: u64,
    /// Text of the `done` action.
    pub final_result: Option<String>,
}

/// Drives navigators for the CLI: one scripted run per plan.
pub struct Runner {
    host: Arc<dyn SurfaceHost>,
    browser: Option<Arc<EokaHost>>,
    events: EventBus,
    owners: SurfaceOwners,
}

impl Runner {
    /// Launch a browser with `config`.
    pub async fn new(config: &BrowserConfig) -> Result<Self> {
        debug!(
            "Launching browser (headless: {}, proxy: {:?})",
            config.headless, config.proxy
        );
        let browser = Arc::new(EokaHost::launch_with(&config.launch_options()).await?);
        let mut runner = Self::with_host(browser.clone());
        runner.browser = Some(browser);
        Ok(runner)
    }

    /// Run against an existing host. [`close`](Self::close) leaves it alone.
    pub fn with_host(host: Arc<dyn SurfaceHost>) -> Self {
        Self {
            host,
            browser: None,
            events: EventBus::default(),
            owners: SurfaceOwners::new(),
        }
    }

    pub fn host(&self) -> &Arc<dyn SurfaceHost> {
        &self.host
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run every planned step through a navigator, then one more so the
    /// scripted model can report `done`.
    pub async fn run(&self, config: &Config) -> Result<(RunResult, AgentHistory)> {
        let start = Instant::now();
        let url = normalize_url(&config.target.url);
        config.settings.url_policy.check(&url)?;

        info!("Navigating to: {}", url);
        let surface = self.host.open(&url).await?;

        let model = Arc::new(ScriptedModel::from_plan(config));
        let mut navigator = Navigator::builder(config.task_text(), self.host.clone(), model)
            .settings(config.settings.clone())
            .events(self.events.clone())
            .owners(self.owners.clone())
            .surface(surface)
            .build()?;

        let mut error = None;
        let mut done = false;
        for _ in 0..=config.steps.len() {
            match navigator.execute_step().await {
                Ok(outcome) if outcome.done => {
                    done = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Step {} failed: {}", navigator.step(), e);
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        let history = navigator.agent_history();
        let done_success = history
            .steps
            .iter()
            .flat_map(|s| s.action_results.iter())
            .find(|r| r.is_done())
            .and_then(|r| r.success())
            .unwrap_or(false);

        let result = RunResult {
            success: error.is_none() && done && done_success,
            done,
            error,
            steps_executed: history.steps.len(),
            actions_executed: history.action_count(),
            duration_ms: start.elapsed().as_millis() as u64,
            final_result: history.final_result().map(str::to_string),
        };
        Ok((result, history))
    }

    /// Replay a saved history on a fresh surface.
    pub async fn replay(
        &self,
        history: &AgentHistory,
        settings: TaskSettings,
    ) -> Result<(RunResult, Vec<ActionResult>)> {
        let start = Instant::now();
        let mut builder = Navigator::builder(
            "replay",
            self.host.clone(),
            Arc::new(ScriptedModel::default()),
        )
        .events(self.events.clone())
        .owners(self.owners.clone());

        // Start where the recording started.
        if let Some(url) = history.steps.first().and_then(|s| s.url.as_deref()) {
            settings.url_policy.check(url)?;
            info!("Navigating to: {}", url);
            builder = builder.surface(self.host.open(url).await?);
        }
        let mut navigator = builder.settings(settings).build()?;

        let total = history.steps.len();
        info!("Replaying {} steps", total);
        let mut results = Vec::new();
        let mut error = None;
        for (i, record) in history.steps.iter().enumerate() {
            match navigator.execute_replay_step(record, i, total).await {
                Ok(step_results) => results.extend(step_results),
                Err(e) => {
                    warn!("Replay stopped at step {}/{}: {}", i + 1, total, e);
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        let failed = results.iter().filter(|r| r.is_error()).count();
        let final_result = results
            .iter()
            .find(|r| r.is_done())
            .and_then(|r| r.extracted_content())
            .map(str::to_string);
        let result = RunResult {
            success: error.is_none() && failed == 0,
            done: final_result.is_some(),
            error: error.or_else(|| {
                (failed > 0).then(|| format!("{} replayed actions failed", failed))
            }),
            steps_executed: history.steps.len(),
            actions_executed: results.len(),
            duration_ms: start.elapsed().as_millis() as u64,
            final_result,
        };
        Ok((result, results))
    }

    /// Close the browser if this runner launched it.
    pub async fn close(self) -> Result<()> {
        if let Some(browser) = self.browser {
            browser.shutdown().await?;
        }
        Ok(())
    }
}
