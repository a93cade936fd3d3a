use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use wayfarer_agent::{find_current, PageState};

use super::Navigator;
use crate::actions::ActionContext;
use crate::config::TaskSettings;
use crate::events::EventKind;
use crate::result::{ActionResult, AgentHistory, StepHistoryRecord};
use crate::signal::StepSignal;
use crate::{Error, Result};

impl Navigator {
    /// Re-run a recorded step against the live page.
    ///
    /// Index actions are re-resolved from the element each one touched when
    /// it was recorded. A retryable failure is retried up to
    /// `replay.max_retries` times; if the step still fails it is either
    /// skipped (one failed result) or the error is returned, per
    /// `replay.skip_failures`.
    pub async fn execute_replay_step(
        &mut self,
        record: &StepHistoryRecord,
        index: usize,
        total: usize,
    ) -> Result<Vec<ActionResult>> {
        let settings = self.settings.snapshot();
        let attempts = settings.replay.max_retries.max(1);
        let delay = Duration::from_millis(settings.replay.delay_ms);
        self.emit(
            EventKind::StepStarted,
            format!("replaying step {}/{}", index + 1, total),
        );

        let mut last_error = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                info!("Retry attempt {}/{}", attempt, attempts);
                let pause = StepSignal::compose(self.cancel.token(), None);
                if let Err(e) = pause.sleep(delay).await {
                    return Err(self.replay_cancelled(e));
                }
            }

            let signal = StepSignal::compose(self.cancel.token(), settings.step_timeout());
            match self.replay_once(record, &settings, &signal).await {
                Ok(results) => {
                    self.emit(
                        EventKind::StepOk,
                        format!("replayed step {}/{}", index + 1, total),
                    );
                    return Ok(results);
                }
                Err(e) if signal.is_fired() => return Err(self.replay_cancelled(e)),
                Err(e) if e.is_fatal() => {
                    self.emit(EventKind::StepFailed, e.to_string());
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "Replay of step {}/{} failed (attempt {}/{}): {}",
                        index + 1,
                        total,
                        attempt,
                        attempts,
                        e
                    );
                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| Error::ActionFailed("replay made no attempt".into()));
        self.emit(EventKind::StepFailed, error.to_string());
        if settings.replay.skip_failures {
            warn!("Skipping step {}/{}: {}", index + 1, total, error);
            Ok(vec![ActionResult::failed(&error)])
        } else {
            Err(error)
        }
    }

    /// The replay was aborted: clear the cancel so the navigator stays usable.
    fn replay_cancelled(&self, e: Error) -> Error {
        self.cancel.reset();
        self.emit(EventKind::StepCancelled, e.to_string());
        e
    }

    /// Replay every step of `history` in order. Stops at the first step
    /// that returns an error.
    pub async fn replay_history(&mut self, history: &AgentHistory) -> Result<Vec<ActionResult>> {
        let total = history.steps.len();
        let mut results = Vec::new();
        for (i, record) in history.steps.iter().enumerate() {
            results.extend(self.execute_replay_step(record, i, total).await?);
        }
        Ok(results)
    }

    async fn replay_once(
        &mut self,
        record: &StepHistoryRecord,
        settings: &TaskSettings,
        signal: &StepSignal,
    ) -> Result<Vec<ActionResult>> {
        let mut results = Vec::new();
        let mut state: Option<Arc<PageState>> = None;

        for (i, action) in record.actions.iter().enumerate() {
            // Actions past the recorded results never ran.
            let Some(original) = record.action_results.get(i) else {
                break;
            };
            if original.is_error() {
                debug!("Skipping {}: it failed when recorded", action.name);
                continue;
            }
            signal.check()?;

            let mut input = self.registry.validate(&action.name, &action.args)?;
            let kind = input.kind();

            if self.surface.is_none() && !kind.is_surface_free() {
                self.open_blank(signal).await?;
            }

            if let Some(index) = input.index() {
                let historical = original.interacted_element().ok_or_else(|| {
                    Error::ElementNotFound(format!(
                        "no element recorded for {} [{}]",
                        action.name, index
                    ))
                })?;
                // The page may have changed without navigating; always look again.
                self.cache.invalidate();
                let current = self
                    .ensure_state(settings, signal)
                    .await?
                    .ok_or_else(|| Error::SurfaceUnavailable("no surface bound".into()))?;
                let found = find_current(historical, &current).ok_or_else(|| {
                    Error::ElementNotFound(format!(
                        "{} [{}]: recorded <{}> not found on {}",
                        action.name, index, historical.tag, current.url
                    ))
                })?;
                if found.index != index {
                    info!("Replay: element [{}] is now [{}]", index, found.index);
                    input.set_index(found.index);
                }
                state = Some(current);
            }

            debug!("Replaying {}", action.name);
            let ctx = ActionContext {
                host: self.host.clone(),
                surface: self.surface.clone(),
                state: state.clone(),
                signal: signal.clone(),
                settings: settings.clone(),
            };
            let outcome = self.registry.dispatch_input(input, &ctx).await?;
            if self.apply_outcome(&outcome) {
                state = None;
            }

            let done = outcome.result.is_done();
            results.push(outcome.result);
            if done {
                break;
            }
            if i + 1 < record.actions.len() {
                signal.sleep(settings.delays.after(kind)).await?;
            }
        }
        Ok(results)
    }
}

