use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{handlers::BuiltinHandler, ActionContext, ActionInput, ActionKind, ActionOutcome};
use crate::{Error, Result};

/// Runs one validated action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn call(&self, input: ActionInput, ctx: &ActionContext) -> Result<ActionOutcome>;
}

/// A registered action: kind, parameter schema and handler.
#[derive(Clone)]
pub struct Action {
    pub kind: ActionKind,
    pub description: String,
    handler: Arc<dyn ActionHandler>,
}

impl Action {
    pub fn new(kind: ActionKind, handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            kind,
            description: kind.description().to_string(),
            handler,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn has_index(&self) -> bool {
        self.kind.has_index()
    }

    pub fn schema(&self) -> Option<Value> {
        super::schema(self.kind)
    }
}

/// Name → action lookup. Built before a task starts and not changed during a
/// step.
#[derive(Clone, Default)]
pub struct Registry {
    actions: BTreeMap<&'static str, Action>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All built-in actions.
    pub fn with_defaults() -> Self {
        let builtin: Arc<dyn ActionHandler> = Arc::new(BuiltinHandler);
        let mut registry = Self::new();
        for kind in ActionKind::ALL {
            registry.register(Action::new(kind, builtin.clone()));
        }
        registry
    }

    /// Add or replace an action.
    pub fn register(&mut self, action: Action) -> &mut Self {
        self.actions.insert(action.name(), action);
        self
    }

    /// Remove an action so the planner can no longer use it.
    pub fn unregister(&mut self, name: &str) -> Option<Action> {
        self.actions.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.actions.keys().copied()
    }

    /// Resolve `name` and validate `raw` against its schema.
    pub fn validate(&self, name: &str, raw: &Value) -> Result<ActionInput> {
        let action = self
            .get(name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown action '{}'", name)))?;
        super::validate(action.kind, raw)
    }

    /// Validate then run.
    pub async fn dispatch(&self, name: &str, raw: &Value, ctx: &ActionContext) -> Result<ActionOutcome> {
        let input = self.validate(name, raw)?;
        self.dispatch_input(input, ctx).await
    }

    /// Run an already validated input.
    pub async fn dispatch_input(&self, input: ActionInput, ctx: &ActionContext) -> Result<ActionOutcome> {
        let kind = input.kind();
        let action = self
            .get(kind.name())
            .ok_or_else(|| Error::InvalidInput(format!("unknown action '{}'", kind.name())))?;
        debug!("Dispatching {} {}", kind.name(), input.args());
        action.handler.call(input, ctx).await
    }

    /// `{name: schema}` for every registered action with parameters.
    pub fn schemas(&self) -> Value {
        let map = self
            .actions
            .values()
            .map(|a| (a.name().to_string(), a.schema().unwrap_or(Value::Null)))
            .collect();
        Value::Object(map)
    }

    /// Action reference for prompts, one line per action.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for action in self.actions.values() {
            let params = action
                .schema()
                .and_then(|s| s.get("properties").cloned())
                .and_then(|p| p.as_object().map(|o| o.keys().cloned().collect::<Vec<_>>()))
                .unwrap_or_default();
            if params.is_empty() {
                out.push_str(&format!("- {}: {}\n", action.name(), action.description));
            } else {
                out.push_str(&format!(
                    "- {}({}): {}\n",
                    action.name(),
                    params.join(", "),
                    action.description
                ));
            }
        }
        out
    }
}
