//! Model boundary: the client trait, reply parsing and JSON repair.

use std::collections::VecDeque;
use std::fmt;
use std::sync::OnceLock;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::Config;
use crate::signal::StepSignal;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Base64 PNG attached to the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            image: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            image: None,
        }
    }
}

/// What a model returned: already-structured JSON, or text to parse.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    Structured(Value),
    Raw(String),
}

/// Language model used to plan each step.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Provider errors propagate unchanged; implementations should give up
    /// once `signal` fires.
    async fn invoke(&self, messages: &[Message], signal: &StepSignal) -> Result<ModelReply>;
}

// =========================================================================
// Parsed output
// =========================================================================

/// One action as the planner wrote it: `{"click_element": {"index": 3}}`,
/// or a bare name for parameterless actions.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedAction {
    pub name: String,
    pub args: Value,
}

impl ProposedAction {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Identity for deduplication: name plus canonical arguments.
    pub fn key(&self) -> String {
        format!("{}:{}", self.name, self.args)
    }
}

impl Serialize for ProposedAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.name, &self.args)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ProposedAction {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ProposedActionVisitor)
    }
}

struct ProposedActionVisitor;

impl<'de> Visitor<'de> for ProposedActionVisitor {
    type Value = ProposedAction;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an action name or a map with a single action key")
    }

    fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(ProposedAction::new(value, Value::Object(Default::default())))
    }

    fn visit_map<M>(self, mut map: M) -> std::result::Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let name: String = map
            .next_key()?
            .ok_or_else(|| de::Error::custom("expected action name key"))?;
        let args: Value = map.next_value()?;
        if map.next_key::<String>()?.is_some() {
            return Err(de::Error::custom(format!(
                "action '{}' must be the only key of its map",
                name
            )));
        }
        let args = match args {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        Ok(ProposedAction::new(name, args))
    }
}

/// The planner's self-assessment, kept for memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentBrain {
    pub evaluation_previous_goal: String,
    pub memory: String,
    pub next_goal: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    #[serde(default)]
    pub current_state: Option<AgentBrain>,
    #[serde(default)]
    pub action: Vec<ProposedAction>,
}

/// Turn a reply into actions, repairing malformed JSON when needed.
/// Returns the parsed output and the raw text for the step record.
pub fn parse_reply(reply: ModelReply) -> Result<(AgentOutput, String)> {
    match reply {
        ModelReply::Structured(value) => {
            let raw = value.to_string();
            let output = serde_json::from_value(value)
                .map_err(|e| Error::Model(format!("unexpected output shape: {}", e)))?;
            Ok((output, raw))
        }
        ModelReply::Raw(text) => {
            if let Ok(output) = serde_json::from_str::<AgentOutput>(&text) {
                return Ok((output, text));
            }
            let repaired = repair_json(&text)
                .ok_or_else(|| Error::Model("no JSON object in model output".into()))?;
            debug!("Repaired model output: {}", repaired);
            match serde_json::from_str::<AgentOutput>(&repaired) {
                Ok(output) => Ok((output, text)),
                Err(e) => {
                    warn!("Model output could not be repaired: {}", e);
                    Err(Error::Model(format!("unparseable model output: {}", e)))
                }
            }
        }
    }
}

fn fence() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)(?:```|$)").ok())
        .as_ref()
}

fn trailing_comma() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",(\s*[}\]])").ok()).as_ref()
}

/// Best-effort fix-up of almost-JSON: strip code fences, cut to the
/// outermost object, drop trailing commas, close unterminated strings and
/// brackets. `None` if there is no object at all.
pub fn repair_json(raw: &str) -> Option<String> {
    let mut text = raw.trim();
    if let Some(inner) = fence()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1))
    {
        text = inner.as_str().trim();
    }

    let start = text.find('{')?;
    let body = outermost_object(&text[start..]);

    let body = match trailing_comma() {
        Some(re) => re.replace_all(body, "$1").into_owned(),
        None => body.to_string(),
    };

    Some(balance(&body))
}

/// Prefix of `s` (which starts with `{`) up to the brace closing it, or all
/// of `s` if it never closes.
fn outermost_object(s: &str) -> &str {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &s[..=i];
                }
            }
            _ => {}
        }
    }
    s
}

/// Close whatever is still open at the end of `s`.
fn balance(s: &str) -> String {
    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in s.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop();
            }
            _ => {}
        }
    }

    let mut out = s.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    if out.ends_with(',') {
        out.pop();
    }
    while let Some(c) = closers.pop() {
        out.push(c);
    }
    out
}

// =========================================================================
// Scripted model
// =========================================================================

/// Replays canned replies in order. Once exhausted it answers with `done`.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ModelReply>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    pub fn new(replies: impl IntoIterator<Item = ModelReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// One reply per planned step of `config`.
    pub fn from_plan(config: &Config) -> Self {
        Self::new(config.steps.iter().map(|step| {
            ModelReply::Structured(json!({
                "current_state": {
                    "evaluation_previous_goal": "",
                    "memory": "",
                    "next_goal": step.goal.clone().unwrap_or_default(),
                },
                "action": step.actions,
            }))
        }))
    }

    /// Queue a batch of actions.
    pub fn push_actions(&self, actions: Vec<ProposedAction>) {
        self.replies
            .lock()
            .push_back(ModelReply::Structured(json!({ "action": actions })));
    }

    pub fn push(&self, reply: ModelReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }

    /// Messages received so far, one entry per invocation.
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn invoke(&self, messages: &[Message], signal: &StepSignal) -> Result<ModelReply> {
        signal.check()?;
        self.calls.lock().push(messages.to_vec());
        let next = self.replies.lock().pop_front();
        Ok(next.unwrap_or_else(|| {
            ModelReply::Structured(json!({
                "action": [{"done": {"text": "plan finished", "success": true}}]
            }))
        }))
    }
}
