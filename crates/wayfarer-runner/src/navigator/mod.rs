//! The step execution loop.
//!
//! A [`Navigator`] owns one bound surface and walks every step through
//! `BuildingState → Invoking → Preprocessing → Executing → Recording`. All
//! actions of a batch run against the snapshot taken at the start of the
//! step; if an earlier action changes the page, later index actions are
//! re-resolved through the history matcher before they run.

mod preprocess;
mod replay;

pub use preprocess::{preprocess, Preprocess};

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wayfarer_agent::dom::truncate;
use wayfarer_agent::history::record_for_index;
use wayfarer_agent::{
    find_current, state_signature, PageState, SnapshotOptions, StateCache, Surface, SurfaceEvent,
    SurfaceHost, SurfaceId, SurfaceOwners,
};

use crate::actions::{ActionContext, ActionInput, ActionKind, ActionOutcome, Registry};
use crate::config::{SettingsSource, TaskSettings};
use crate::events::{EventBus, EventKind, ExecutionEvent};
use crate::model::{parse_reply, ModelClient, ModelReply, ProposedAction};
use crate::prompt::{PromptBuilder, PromptContext, PromptError, TextPromptBuilder};
use crate::result::{ActionResult, AgentHistory, StepHistoryRecord, StepStatus};
use crate::signal::{CancelCause, CancelHandle, StepSignal};
use crate::{Error, Result};

/// Memory entries carried into the prompt.
const MEMORY_LIMIT: usize = 20;
/// Longest single memory entry.
const MEMORY_ENTRY_CHARS: usize = 500;

/// Where a navigator is in its step cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    BuildingState,
    Invoking,
    Preprocessing,
    Executing,
    Recording,
    /// The last step was cancelled. The navigator stays usable.
    Cancelled,
    /// The last step failed. The navigator stays usable.
    Failed,
}

/// Result of [`Navigator::execute_step`].
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// A `done` action ran.
    pub done: bool,
    pub status: StepStatus,
}

// =========================================================================
// Builder
// =========================================================================

pub struct NavigatorBuilder {
    task: String,
    host: Arc<dyn SurfaceHost>,
    model: Arc<dyn ModelClient>,
    id: Option<String>,
    registry: Option<Registry>,
    prompt: Option<Arc<dyn PromptBuilder>>,
    settings: Option<Arc<dyn SettingsSource>>,
    events: Option<EventBus>,
    owners: Option<SurfaceOwners>,
    surface: Option<Arc<dyn Surface>>,
}

impl NavigatorBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn prompt(mut self, prompt: Arc<dyn PromptBuilder>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn settings(mut self, settings: impl SettingsSource + 'static) -> Self {
        self.settings = Some(Arc::new(settings));
        self
    }

    pub fn shared_settings(mut self, settings: Arc<dyn SettingsSource>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Ownership registry shared with other navigators on the same host.
    pub fn owners(mut self, owners: SurfaceOwners) -> Self {
        self.owners = Some(owners);
        self
    }

    /// Start bound to `surface`.
    pub fn surface(mut self, surface: Arc<dyn Surface>) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn build(self) -> Result<Navigator> {
        let registry = self.registry.unwrap_or_else(Registry::with_defaults);
        let prompt = self
            .prompt
            .unwrap_or_else(|| Arc::new(TextPromptBuilder::new(&registry)));
        let id = self.id.unwrap_or_else(|| {
            let uuid = uuid::Uuid::new_v4().simple().to_string();
            format!("nav-{}", &uuid[..8])
        });
        let surface_events = self.host.events();

        let mut navigator = Navigator {
            id,
            task: self.task,
            host: self.host,
            surface: None,
            cache: StateCache::new(),
            registry: Arc::new(registry),
            model: self.model,
            prompt,
            settings: self
                .settings
                .unwrap_or_else(|| Arc::new(TaskSettings::default())),
            events: self.events.unwrap_or_default(),
            owners: self.owners.unwrap_or_default(),
            surface_events,
            cancel: CancelHandle::new(),
            history: Vec::new(),
            memory: Vec::new(),
            read_signatures: HashSet::new(),
            pending_refresh: None,
            step: 0,
            phase: Phase::Idle,
        };
        if let Some(surface) = self.surface {
            navigator.bind(surface)?;
        }
        Ok(navigator)
    }
}

// =========================================================================
// Navigator
// =========================================================================

/// One execution loop. Every per-run cache lives in its fields; instances
/// share nothing but the host, the event bus and the ownership registry.
pub struct Navigator {
    id: String,
    task: String,
    host: Arc<dyn SurfaceHost>,
    surface: Option<Arc<dyn Surface>>,
    cache: StateCache,
    registry: Arc<Registry>,
    model: Arc<dyn ModelClient>,
    prompt: Arc<dyn PromptBuilder>,
    settings: Arc<dyn SettingsSource>,
    events: EventBus,
    owners: SurfaceOwners,
    surface_events: broadcast::Receiver<SurfaceEvent>,
    cancel: CancelHandle,
    history: Vec<StepHistoryRecord>,
    memory: Vec<String>,
    /// Signatures of pages a paginated read already ran against.
    read_signatures: HashSet<String>,
    pending_refresh: Option<JoinHandle<()>>,
    step: usize,
    phase: Phase,
}

/// What a step produced so far. Survives an early return so the record is
/// written whatever happened.
#[derive(Default)]
struct StepRun {
    raw: String,
    actions: Vec<ProposedAction>,
    results: Vec<ActionResult>,
    state: Option<Arc<PageState>>,
    done: bool,
}

impl Navigator {
    pub fn builder(
        task: impl Into<String>,
        host: Arc<dyn SurfaceHost>,
        model: Arc<dyn ModelClient>,
    ) -> NavigatorBuilder {
        NavigatorBuilder {
            task: task.into(),
            host,
            model,
            id: None,
            registry: None,
            prompt: None,
            settings: None,
            events: None,
            owners: None,
            surface: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of steps started so far.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn surface(&self) -> Option<&Arc<dyn Surface>> {
        self.surface.as_ref()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn history(&self) -> &[StepHistoryRecord] {
        &self.history
    }

    /// Copy of the step records, ready to save.
    pub fn agent_history(&self) -> AgentHistory {
        AgentHistory::new(self.history.clone())
    }

    pub fn memory(&self) -> &[String] {
        &self.memory
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Handle for aborting the running step from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Bind to `surface`, claiming it in the ownership registry.
    pub fn bind(&mut self, surface: Arc<dyn Surface>) -> Result<()> {
        let id = surface.id().clone();
        if !self.owners.claim(&id, &self.id) {
            let owner = self.owners.owner_of(&id).unwrap_or_default();
            return Err(Error::SurfaceUnavailable(format!(
                "surface {} is owned by {}",
                id, owner
            )));
        }
        if self.surface.as_ref().map(|s| s.id()) != Some(&id) {
            info!("[{}] Bound to surface {}", self.id, id);
            self.cache.invalidate();
        }
        self.surface = Some(surface);
        Ok(())
    }

    /// Snapshot of the bound surface if one is cached. Never touches the page.
    pub fn get_cached_state(&self) -> Option<Arc<PageState>> {
        let surface = self.surface.as_ref()?;
        self.cache.get_cached_for(surface.id())
    }

    /// Fresh snapshot of the bound surface.
    pub async fn get_state(&mut self) -> Result<Arc<PageState>> {
        let surface = self
            .surface
            .clone()
            .ok_or_else(|| Error::SurfaceUnavailable("no surface bound".into()))?;
        let options = snapshot_options(&self.settings.snapshot());
        match self.cache.update(surface.as_ref(), &options).await {
            Ok(state) => Ok(state),
            Err(e) => {
                let e = Error::from(e);
                if matches!(e, Error::SurfaceUnavailable(_)) {
                    self.surface_lost();
                }
                Err(e)
            }
        }
    }

    /// Run one step: plan, execute the batch, record. A failed or cancelled
    /// step is recorded and returned as `Err`; the navigator stays usable.
    pub async fn execute_step(&mut self) -> Result<StepOutcome> {
        let settings = self.settings.snapshot();
        self.step += 1;
        let step = self.step;
        let signal = StepSignal::compose(self.cancel.token(), settings.step_timeout());

        self.drain_surface_events();
        info!("[{}] Step {}", self.id, step);
        self.emit(EventKind::StepStarted, format!("step {} started", step));

        let started_at = Utc::now();
        let mut run = StepRun::default();
        let result = self.run_step(step, &settings, &signal, &mut run).await;

        self.set_phase(Phase::Recording);
        let status = match &result {
            Ok(()) => StepStatus::Completed,
            Err(Error::Cancelled(_)) | Err(Error::Timeout(_)) if signal.is_fired() => {
                StepStatus::Cancelled(signal.cause().unwrap_or(CancelCause::User))
            }
            Err(e) => StepStatus::Failed(e.to_string()),
        };
        if let Err(Error::SurfaceUnavailable(_)) = &result {
            self.surface_lost();
        }

        let (surface_id, url, title) = match &run.state {
            Some(s) => (
                Some(s.surface_id.clone()),
                Some(s.url.clone()),
                Some(s.title.clone()),
            ),
            None => (self.surface.as_ref().map(|s| s.id().clone()), None, None),
        };
        let record = StepHistoryRecord {
            step,
            model_output_raw: std::mem::take(&mut run.raw),
            actions: std::mem::take(&mut run.actions),
            action_results: std::mem::take(&mut run.results),
            status: status.clone(),
            surface_id,
            url,
            title,
            started_at,
            finished_at: Utc::now(),
            state: run.state.take(),
        };
        self.remember(&record);
        let ran_any = !record.action_results.is_empty();
        self.history.push(record);

        match &status {
            StepStatus::Completed => {
                info!("[{}] Step {} completed", self.id, step);
                self.emit(EventKind::StepOk, format!("step {} completed", step));
                self.set_phase(Phase::Idle);
            }
            StepStatus::Cancelled(cause) => {
                warn!("[{}] Step {} cancelled ({:?})", self.id, step, cause);
                self.emit(EventKind::StepCancelled, format!("step {} cancelled", step));
                self.set_phase(Phase::Cancelled);
                self.cancel.reset();
            }
            StepStatus::Failed(msg) => {
                warn!("[{}] Step {} failed: {}", self.id, step, msg);
                self.emit(EventKind::StepFailed, msg.clone());
                self.set_phase(Phase::Failed);
            }
        }

        if ran_any && !matches!(status, StepStatus::Cancelled(_)) {
            self.refresh_speculatively(&settings);
        }

        result.map(|()| StepOutcome {
            done: run.done,
            status,
        })
    }

    async fn run_step(
        &mut self,
        step: usize,
        settings: &TaskSettings,
        signal: &StepSignal,
        run: &mut StepRun,
    ) -> Result<()> {
        self.set_phase(Phase::BuildingState);
        let state = self.ensure_state(settings, signal).await?;
        run.state = state.clone();

        let ctx = PromptContext {
            task: &self.task,
            step,
            state: state.as_deref(),
            memory: &self.memory,
            use_vision: settings.use_vision,
        };
        let messages = match self.prompt.build(&ctx) {
            Ok(messages) => messages,
            Err(PromptError::NoSurfaceBound) => {
                debug!("[{}] No surface bound, using placeholder prompt", self.id);
                self.prompt.placeholder(&ctx)
            }
            Err(e) => return Err(Error::Model(e.to_string())),
        };

        self.set_phase(Phase::Invoking);
        let reply = signal.guard(self.model.invoke(&messages, signal)).await?;
        run.raw = match &reply {
            ModelReply::Structured(v) => v.to_string(),
            ModelReply::Raw(text) => text.clone(),
        };
        let (output, _) = parse_reply(reply)?;
        if let Some(brain) = &output.current_state {
            if !brain.next_goal.is_empty() {
                info!("[{}] Next goal: {}", self.id, brain.next_goal);
            }
        }

        self.set_phase(Phase::Preprocessing);
        let signature_seen = state
            .as_deref()
            .is_some_and(|s| self.read_signatures.contains(&state_signature(s)));
        let actions = preprocess(
            output.action,
            &Preprocess {
                max_actions: settings.max_actions_per_step,
                cold_start: self.surface.is_none(),
                signature_seen,
            },
        );
        run.actions = actions.clone();

        self.set_phase(Phase::Executing);
        self.execute_batch(&actions, state, settings, signal, run)
            .await
    }

    async fn execute_batch(
        &mut self,
        actions: &[ProposedAction],
        batch_state: Option<Arc<PageState>>,
        settings: &TaskSettings,
        signal: &StepSignal,
        run: &mut StepRun,
    ) -> Result<()> {
        let mut state = batch_state.clone();
        // An earlier action of this batch changed the page or the surface.
        let mut stale = false;
        // Snapshot taken since the last change, for remapping stale indices.
        let mut fresh: Option<Arc<PageState>> = None;
        let mut failures = 0usize;
        let last = actions.len().saturating_sub(1);

        for (i, action) in actions.iter().enumerate() {
            signal.check()?;
            self.drain_surface_events();
            debug!("[{}] Executing action {}: {}", self.id, i + 1, action.name);
            self.emit(
                EventKind::ActionStarted,
                format!("{} {}", action.name, action.args),
            );

            let kind = ActionKind::from_name(&action.name);
            let attempt = self
                .run_action(
                    action,
                    batch_state.as_deref(),
                    &mut state,
                    &mut fresh,
                    &mut stale,
                    settings,
                    signal,
                )
                .await;

            match attempt {
                Ok(outcome) => {
                    let message = outcome
                        .result
                        .extracted_content()
                        .map(|c| truncate(c, 200))
                        .unwrap_or_else(|| action.name.clone());
                    self.emit(EventKind::ActionOk, message);

                    if kind.is_some_and(|k| k.is_paginated_read()) && !stale {
                        if let Some(s) = batch_state.as_deref() {
                            self.read_signatures.insert(state_signature(s));
                        }
                    }
                    if self.apply_outcome(&outcome) {
                        stale = true;
                        fresh = None;
                    }

                    let done = outcome.result.is_done();
                    run.results.push(outcome.result);
                    if done {
                        info!("[{}] Task done", self.id);
                        run.done = true;
                        return Ok(());
                    }
                }
                // An interrupted action leaves no result behind.
                Err(e) if signal.is_fired() => return Err(e),
                Err(e) => {
                    warn!("[{}] Action {} failed: {}", self.id, action.name, e);
                    run.results.push(ActionResult::failed(&e));
                    self.emit(EventKind::ActionFailed, e.to_string());
                    if e.is_fatal() {
                        return Err(e);
                    }
                    failures += 1;
                    if failures > settings.max_failures {
                        return Err(Error::TooManyFailures {
                            failures,
                            limit: settings.max_failures,
                        });
                    }
                }
            }

            if i < last {
                let delay = match kind {
                    Some(k) => settings.delays.after(k),
                    None => std::time::Duration::from_millis(settings.delays.default_ms),
                };
                signal.sleep(delay).await?;
            }
        }
        Ok(())
    }

    /// Validate, bind a surface if needed, re-resolve a stale index, dispatch.
    ///
    /// Once the batch is stale every index action is remapped from the batch
    /// snapshot into `fresh`, which is rebuilt only after the page changes.
    #[allow(clippy::too_many_arguments)]
    async fn run_action(
        &mut self,
        action: &ProposedAction,
        batch_state: Option<&PageState>,
        state: &mut Option<Arc<PageState>>,
        fresh: &mut Option<Arc<PageState>>,
        stale: &mut bool,
        settings: &TaskSettings,
        signal: &StepSignal,
    ) -> Result<ActionOutcome> {
        let mut input = self.registry.validate(&action.name, &action.args)?;

        if self.surface.is_none() && !input.kind().is_surface_free() {
            self.open_blank(signal).await?;
            *stale = true;
            *fresh = None;
        }

        if *stale {
            if let Some(index) = input.index() {
                let current = match fresh.clone() {
                    Some(current) => current,
                    None => {
                        let current = self
                            .ensure_state(settings, signal)
                            .await?
                            .ok_or_else(|| Error::SurfaceUnavailable("no surface bound".into()))?;
                        *fresh = Some(current.clone());
                        current
                    }
                };
                self.remap(&mut input, index, batch_state, &current)?;
                *state = Some(current);
            }
        }

        let ctx = ActionContext {
            host: self.host.clone(),
            surface: self.surface.clone(),
            state: state.clone(),
            signal: signal.clone(),
            settings: settings.clone(),
        };
        let index = input.index();
        let mut outcome = self.registry.dispatch_input(input, &ctx).await?;
        if let (Some(index), Some(current)) = (index, state.as_deref()) {
            if outcome.result.interacted_element().is_none() {
                let result = std::mem::take(&mut outcome.result);
                outcome.result = result.with_interacted(record_for_index(current, index));
            }
        }
        Ok(outcome)
    }

    /// Point an index action at the element the model saw in the batch
    /// snapshot, as found in `fresh`.
    fn remap(
        &self,
        input: &mut ActionInput,
        index: u32,
        batch_state: Option<&PageState>,
        fresh: &PageState,
    ) -> Result<()> {
        let gone = || {
            Error::ElementNotFound(format!(
                "element [{}] is no longer on the page after an earlier action changed it",
                index
            ))
        };
        let batch_state = batch_state.ok_or_else(gone)?;
        if batch_state.surface_id != fresh.surface_id {
            return Err(Error::ElementNotFound(format!(
                "element [{}] belongs to surface {}, now on {}",
                index, batch_state.surface_id, fresh.surface_id
            )));
        }
        let record = record_for_index(batch_state, index).ok_or_else(gone)?;
        let found = find_current(&record, fresh).ok_or_else(gone)?;
        if found.index != index {
            info!(
                "[{}] Element [{}] is now [{}] ({:?})",
                self.id, index, found.index, found.kind
            );
            input.set_index(found.index);
        }
        Ok(())
    }

    /// React to an action's side effects. Returns true if the batch snapshot
    /// no longer describes the bound surface.
    fn apply_outcome(&mut self, outcome: &ActionOutcome) -> bool {
        let mut stale = false;

        for id in &outcome.opened {
            if self.owners.claim(id, &self.id) {
                self.emit_for(
                    EventKind::SurfaceCreated,
                    Some(id.clone()),
                    format!("surface {} opened", id),
                );
            } else {
                debug!("[{}] Surface {} already owned, not adopting", self.id, id);
            }
        }

        if outcome.navigated {
            self.cache.invalidate();
            stale = true;
        }

        if let Some(id) = &outcome.switch_to {
            match self.host.surface(id) {
                Some(surface) => match self.bind(surface) {
                    Ok(()) => stale = true,
                    Err(e) => warn!("[{}] Not switching: {}", self.id, e),
                },
                None => warn!("[{}] Surface {} vanished before switching", self.id, id),
            }
        } else if self.surface.as_ref().is_some_and(|s| s.is_closed()) {
            self.surface_lost();
            stale = true;
        }
        stale
    }

    async fn open_blank(&mut self, signal: &StepSignal) -> Result<()> {
        let host = self.host.clone();
        let surface = signal
            .guard(async move { host.open("about:blank").await.map_err(Error::from) })
            .await?;
        let id = surface.id().clone();
        self.bind(surface)?;
        self.emit_for(
            EventKind::SurfaceCreated,
            Some(id.clone()),
            format!("surface {} opened", id),
        );
        Ok(())
    }

    /// Cached snapshot of the bound surface, rebuilding it if needed.
    /// `None` when nothing is bound.
    async fn ensure_state(
        &mut self,
        settings: &TaskSettings,
        signal: &StepSignal,
    ) -> Result<Option<Arc<PageState>>> {
        let Some(surface) = self.surface.clone() else {
            return Ok(None);
        };
        if let Some(pending) = self.pending_refresh.take() {
            signal
                .guard(async {
                    let _ = pending.await;
                    Ok(())
                })
                .await?;
        }
        if let Some(state) = self.cache.get_cached_for(surface.id()) {
            debug!("[{}] Using cached state", self.id);
            return Ok(Some(state));
        }

        let cache = self.cache.clone();
        let options = snapshot_options(settings);
        let built = signal
            .guard(async move {
                cache
                    .update(surface.as_ref(), &options)
                    .await
                    .map_err(Error::from)
            })
            .await;
        match built {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                if matches!(e, Error::SurfaceUnavailable(_)) {
                    self.surface_lost();
                }
                Err(e)
            }
        }
    }

    /// Rebuild the snapshot off the critical path; the next step awaits it.
    fn refresh_speculatively(&mut self, settings: &TaskSettings) {
        let Some(surface) = self.surface.clone() else {
            return;
        };
        if surface.is_closed() {
            return;
        }
        debug!("[{}] Refreshing state in background", self.id);
        self.pending_refresh = Some(
            self.cache
                .refresh_in_background(surface, snapshot_options(settings)),
        );
    }

    fn drain_surface_events(&mut self) {
        loop {
            match self.surface_events.try_recv() {
                Ok(event) => {
                    self.cache.handle_event(&event);
                    match &event {
                        SurfaceEvent::Closed(id) => {
                            if self.surface.as_ref().map(|s| s.id()) == Some(id) {
                                self.surface_lost();
                            } else if self.owners.owner_of(id).as_deref() == Some(self.id.as_str()) {
                                self.owners.release(id);
                            }
                        }
                        SurfaceEvent::NavigatedExternally { id, url } => {
                            debug!("[{}] Surface {} navigated to {}", self.id, id, url);
                        }
                    }
                }
                Err(TryRecvError::Lagged(n)) => {
                    warn!("[{}] Missed {} surface events", self.id, n);
                    self.cache.invalidate();
                }
                Err(_) => break,
            }
        }
    }

    fn surface_lost(&mut self) {
        if let Some(surface) = self.surface.take() {
            warn!("[{}] Surface {} is gone, unbinding", self.id, surface.id());
            self.owners.release(surface.id());
            self.cache.invalidate();
        }
    }

    fn remember(&mut self, record: &StepHistoryRecord) {
        for (action, result) in record.actions.iter().zip(&record.action_results) {
            if let Some(err) = result.error() {
                self.memory.push(format!("{} failed: {}", action.name, err));
            } else if result.include_in_memory() {
                if let Some(content) = result.extracted_content() {
                    self.memory.push(truncate(content, MEMORY_ENTRY_CHARS));
                }
            }
        }
        if self.memory.len() > MEMORY_LIMIT {
            let excess = self.memory.len() - MEMORY_LIMIT;
            self.memory.drain(..excess);
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!("[{}] {:?} -> {:?}", self.id, self.phase, phase);
        self.phase = phase;
    }

    fn emit(&self, kind: EventKind, message: impl Into<String>) {
        self.emit_for(kind, self.surface.as_ref().map(|s| s.id().clone()), message);
    }

    fn emit_for(&self, kind: EventKind, surface_id: Option<SurfaceId>, message: impl Into<String>) {
        self.events.emit(ExecutionEvent {
            kind,
            navigator: self.id.clone(),
            step: self.step,
            surface_id,
            message: message.into(),
        });
    }
}

fn snapshot_options(settings: &TaskSettings) -> SnapshotOptions {
    SnapshotOptions {
        include_screenshot: settings.use_vision,
        focus_index: None,
        viewport_expansion: settings.viewport_expansion,
    }
}
