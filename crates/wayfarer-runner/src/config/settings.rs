use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::actions::ActionKind;
use crate::policy::UrlPolicy;

/// Per-task execution settings. Read once at the start of every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    /// Deadline for a whole step, model call included. `None` disables it.
    pub step_timeout_ms: Option<u64>,
    /// Longer batches are truncated.
    pub max_actions_per_step: usize,
    /// A batch aborts once more than this many actions failed.
    pub max_failures: usize,
    /// Attach an annotated screenshot to the model input.
    pub use_vision: bool,
    /// Pixels beyond the viewport still indexed; negative indexes the whole page.
    pub viewport_expansion: i64,
    pub delays: Delays,
    /// Bound on each individual document operation.
    pub click_timeout_ms: u64,
    pub url_policy: UrlPolicy,
    pub replay: ReplaySettings,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            step_timeout_ms: Some(180_000),
            max_actions_per_step: 10,
            max_failures: 3,
            use_vision: false,
            viewport_expansion: 500,
            delays: Delays::default(),
            click_timeout_ms: 10_000,
            url_policy: UrlPolicy::default(),
            replay: ReplaySettings::default(),
        }
    }
}

impl TaskSettings {
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.click_timeout_ms.max(1))
    }
}

/// Settle time after each action, by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Delays {
    pub navigation_ms: u64,
    pub interaction_ms: u64,
    pub input_ms: u64,
    pub default_ms: u64,
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            navigation_ms: 1000,
            interaction_ms: 500,
            input_ms: 200,
            default_ms: 100,
        }
    }
}

impl Delays {
    pub fn after(&self, kind: ActionKind) -> Duration {
        use ActionKind::*;
        let ms = match kind {
            Done | Wait | CacheContent => 0,
            SearchGoogle | GoToUrl | GoBack | OpenTab | SwitchTab | CloseTab | NextPage => {
                self.navigation_ms
            }
            ClickElement | SelectDropdownOption | SendKeys => self.interaction_ms,
            InputText => self.input_ms,
            _ => self.default_ms,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySettings {
    /// Attempts per recorded step, at least one.
    pub max_retries: u32,
    pub delay_ms: u64,
    /// Move on after a step exhausts its retries instead of failing.
    pub skip_failures: bool,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 1000,
            skip_failures: true,
        }
    }
}

/// Where a navigator reads its [`TaskSettings`] from.
pub trait SettingsSource: Send + Sync {
    fn snapshot(&self) -> TaskSettings;
}

impl SettingsSource for TaskSettings {
    fn snapshot(&self) -> TaskSettings {
        self.clone()
    }
}

/// Settings that can be changed between steps.
impl SettingsSource for Arc<RwLock<TaskSettings>> {
    fn snapshot(&self) -> TaskSettings {
        self.read().clone()
    }
}
