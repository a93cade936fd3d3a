//! The action set: kinds, typed parameters, validation and dispatch.

mod handlers;
pub mod registry;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

pub use handlers::{ActionContext, ActionOutcome, BuiltinHandler};
pub use registry::{Action, ActionHandler, Registry};

/// Every action the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Done,
    SearchGoogle,
    GoToUrl,
    GoBack,
    Wait,
    ClickElement,
    InputText,
    SwitchTab,
    OpenTab,
    CloseTab,
    CacheContent,
    ExtractContent,
    ExtractGoogleResults,
    ScrollDown,
    ScrollUp,
    NextPage,
    ScrollToText,
    SendKeys,
    GetDropdownOptions,
    SelectDropdownOption,
}

impl ActionKind {
    pub const ALL: [ActionKind; 20] = [
        ActionKind::Done,
        ActionKind::SearchGoogle,
        ActionKind::GoToUrl,
        ActionKind::GoBack,
        ActionKind::Wait,
        ActionKind::ClickElement,
        ActionKind::InputText,
        ActionKind::SwitchTab,
        ActionKind::OpenTab,
        ActionKind::CloseTab,
        ActionKind::CacheContent,
        ActionKind::ExtractContent,
        ActionKind::ExtractGoogleResults,
        ActionKind::ScrollDown,
        ActionKind::ScrollUp,
        ActionKind::NextPage,
        ActionKind::ScrollToText,
        ActionKind::SendKeys,
        ActionKind::GetDropdownOptions,
        ActionKind::SelectDropdownOption,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Done => "done",
            ActionKind::SearchGoogle => "search_google",
            ActionKind::GoToUrl => "go_to_url",
            ActionKind::GoBack => "go_back",
            ActionKind::Wait => "wait",
            ActionKind::ClickElement => "click_element",
            ActionKind::InputText => "input_text",
            ActionKind::SwitchTab => "switch_tab",
            ActionKind::OpenTab => "open_tab",
            ActionKind::CloseTab => "close_tab",
            ActionKind::CacheContent => "cache_content",
            ActionKind::ExtractContent => "extract_content",
            ActionKind::ExtractGoogleResults => "extract_google_results",
            ActionKind::ScrollDown => "scroll_down",
            ActionKind::ScrollUp => "scroll_up",
            ActionKind::NextPage => "next_page",
            ActionKind::ScrollToText => "scroll_to_text",
            ActionKind::SendKeys => "send_keys",
            ActionKind::GetDropdownOptions => "get_dropdown_options",
            ActionKind::SelectDropdownOption => "select_dropdown_option",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ActionKind::Done => "Finish the task and report the result",
            ActionKind::SearchGoogle => "Search Google in the current tab",
            ActionKind::GoToUrl => "Navigate the current tab to a URL",
            ActionKind::GoBack => "Go back in history",
            ActionKind::Wait => "Wait for a number of seconds",
            ActionKind::ClickElement => "Click the element with the given index",
            ActionKind::InputText => "Type text into the input with the given index",
            ActionKind::SwitchTab => "Switch to another tab by id",
            ActionKind::OpenTab => "Open a URL in a new tab",
            ActionKind::CloseTab => "Close a tab by id",
            ActionKind::CacheContent => "Remember a finding for later steps",
            ActionKind::ExtractContent => "Extract the page text for a goal",
            ActionKind::ExtractGoogleResults => "List the results of a Google results page",
            ActionKind::ScrollDown => "Scroll down by pixels, one page if omitted",
            ActionKind::ScrollUp => "Scroll up by pixels, one page if omitted",
            ActionKind::NextPage => "Go to the next page of results",
            ActionKind::ScrollToText => "Scroll to the first occurrence of text",
            ActionKind::SendKeys => "Press keys, e.g. Enter or Control+a",
            ActionKind::GetDropdownOptions => "List the options of a select element",
            ActionKind::SelectDropdownOption => "Select an option by its text",
        }
    }

    /// Takes an element index that replay must rewrite.
    pub fn has_index(&self) -> bool {
        matches!(
            self,
            ActionKind::ClickElement
                | ActionKind::InputText
                | ActionKind::GetDropdownOptions
                | ActionKind::SelectDropdownOption
        )
    }

    /// Reads the page without changing it.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            ActionKind::ExtractContent
                | ActionKind::ExtractGoogleResults
                | ActionKind::CacheContent
                | ActionKind::GetDropdownOptions
        )
    }

    /// A read whose repetition on an unchanged page means the planner wants
    /// the next page of results.
    pub fn is_paginated_read(&self) -> bool {
        matches!(self, ActionKind::ExtractGoogleResults)
    }

    /// Moves the bound surface somewhere else or opens a new one.
    pub fn is_navigation(&self) -> bool {
        matches!(
            self,
            ActionKind::SearchGoogle | ActionKind::GoToUrl | ActionKind::OpenTab
        )
    }

    /// Runs without a bound surface.
    pub fn is_surface_free(&self) -> bool {
        matches!(
            self,
            ActionKind::Done | ActionKind::Wait | ActionKind::CacheContent | ActionKind::OpenTab
        )
    }

    /// True for kinds with no parameters at all.
    pub fn is_unit(&self) -> bool {
        matches!(
            self,
            ActionKind::GoBack | ActionKind::ExtractGoogleResults | ActionKind::NextPage
        )
    }
}

// =========================================================================
// Parameters
// =========================================================================

fn default_true() -> bool {
    true
}

fn default_wait() -> u64 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DoneParams {
    /// Final answer or summary.
    pub text: String,
    #[serde(default = "default_true")]
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SearchGoogleParams {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct UrlParams {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WaitParams {
    #[serde(default = "default_wait")]
    pub seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct IndexParams {
    /// Interaction index from the element list.
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct InputTextParams {
    pub index: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TabParams {
    pub tab_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CacheContentParams {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExtractContentParams {
    /// What to look for in the page text.
    pub goal: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ScrollParams {
    /// Pixels; one viewport height if omitted.
    #[serde(default)]
    pub amount: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TextParams {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SendKeysParams {
    pub keys: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SelectOptionParams {
    pub index: u32,
    /// Exact option text from get_dropdown_options.
    pub text: String,
}

/// A validated action, ready for its handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionInput {
    Done(DoneParams),
    SearchGoogle(SearchGoogleParams),
    GoToUrl(UrlParams),
    GoBack,
    Wait(WaitParams),
    ClickElement(IndexParams),
    InputText(InputTextParams),
    SwitchTab(TabParams),
    OpenTab(UrlParams),
    CloseTab(TabParams),
    CacheContent(CacheContentParams),
    ExtractContent(ExtractContentParams),
    ExtractGoogleResults,
    ScrollDown(ScrollParams),
    ScrollUp(ScrollParams),
    NextPage,
    ScrollToText(TextParams),
    SendKeys(SendKeysParams),
    GetDropdownOptions(IndexParams),
    SelectDropdownOption(SelectOptionParams),
}

impl ActionInput {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionInput::Done(_) => ActionKind::Done,
            ActionInput::SearchGoogle(_) => ActionKind::SearchGoogle,
            ActionInput::GoToUrl(_) => ActionKind::GoToUrl,
            ActionInput::GoBack => ActionKind::GoBack,
            ActionInput::Wait(_) => ActionKind::Wait,
            ActionInput::ClickElement(_) => ActionKind::ClickElement,
            ActionInput::InputText(_) => ActionKind::InputText,
            ActionInput::SwitchTab(_) => ActionKind::SwitchTab,
            ActionInput::OpenTab(_) => ActionKind::OpenTab,
            ActionInput::CloseTab(_) => ActionKind::CloseTab,
            ActionInput::CacheContent(_) => ActionKind::CacheContent,
            ActionInput::ExtractContent(_) => ActionKind::ExtractContent,
            ActionInput::ExtractGoogleResults => ActionKind::ExtractGoogleResults,
            ActionInput::ScrollDown(_) => ActionKind::ScrollDown,
            ActionInput::ScrollUp(_) => ActionKind::ScrollUp,
            ActionInput::NextPage => ActionKind::NextPage,
            ActionInput::ScrollToText(_) => ActionKind::ScrollToText,
            ActionInput::SendKeys(_) => ActionKind::SendKeys,
            ActionInput::GetDropdownOptions(_) => ActionKind::GetDropdownOptions,
            ActionInput::SelectDropdownOption(_) => ActionKind::SelectDropdownOption,
        }
    }

    pub fn index(&self) -> Option<u32> {
        match self {
            ActionInput::ClickElement(p) | ActionInput::GetDropdownOptions(p) => Some(p.index),
            ActionInput::InputText(p) => Some(p.index),
            ActionInput::SelectDropdownOption(p) => Some(p.index),
            _ => None,
        }
    }

    /// Point an index action at another element. No-op for other kinds.
    pub fn set_index(&mut self, index: u32) {
        match self {
            ActionInput::ClickElement(p) | ActionInput::GetDropdownOptions(p) => p.index = index,
            ActionInput::InputText(p) => p.index = index,
            ActionInput::SelectDropdownOption(p) => p.index = index,
            _ => {}
        }
    }

    /// Arguments as JSON, in the shape [`validate`] accepts.
    pub fn args(&self) -> Value {
        let out = match self {
            ActionInput::Done(p) => serde_json::to_value(p),
            ActionInput::SearchGoogle(p) => serde_json::to_value(p),
            ActionInput::GoToUrl(p) | ActionInput::OpenTab(p) => serde_json::to_value(p),
            ActionInput::Wait(p) => serde_json::to_value(p),
            ActionInput::ClickElement(p) | ActionInput::GetDropdownOptions(p) => {
                serde_json::to_value(p)
            }
            ActionInput::InputText(p) => serde_json::to_value(p),
            ActionInput::SwitchTab(p) | ActionInput::CloseTab(p) => serde_json::to_value(p),
            ActionInput::CacheContent(p) => serde_json::to_value(p),
            ActionInput::ExtractContent(p) => serde_json::to_value(p),
            ActionInput::ScrollDown(p) | ActionInput::ScrollUp(p) => serde_json::to_value(p),
            ActionInput::ScrollToText(p) => serde_json::to_value(p),
            ActionInput::SendKeys(p) => serde_json::to_value(p),
            ActionInput::SelectDropdownOption(p) => serde_json::to_value(p),
            ActionInput::GoBack | ActionInput::ExtractGoogleResults | ActionInput::NextPage => {
                Ok(Value::Object(Default::default()))
            }
        };
        out.unwrap_or_default()
    }
}

fn parse<T: serde::de::DeserializeOwned>(kind: ActionKind, raw: &Value) -> Result<T> {
    let raw = match raw {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(raw).map_err(|e| Error::InvalidInput(format!("{}: {}", kind.name(), e)))
}

fn non_empty(kind: ActionKind, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidInput(format!(
            "{}: '{}' must not be empty",
            kind.name(),
            field
        )));
    }
    Ok(())
}

/// Check raw arguments against the kind's schema.
///
/// Parameterless kinds ignore whatever they were given.
pub fn validate(kind: ActionKind, raw: &Value) -> Result<ActionInput> {
    let input = match kind {
        ActionKind::GoBack => ActionInput::GoBack,
        ActionKind::ExtractGoogleResults => ActionInput::ExtractGoogleResults,
        ActionKind::NextPage => ActionInput::NextPage,
        ActionKind::Done => ActionInput::Done(parse(kind, raw)?),
        ActionKind::SearchGoogle => {
            let p: SearchGoogleParams = parse(kind, raw)?;
            non_empty(kind, "query", &p.query)?;
            ActionInput::SearchGoogle(p)
        }
        ActionKind::GoToUrl | ActionKind::OpenTab => {
            let p: UrlParams = parse(kind, raw)?;
            non_empty(kind, "url", &p.url)?;
            if kind == ActionKind::GoToUrl {
                ActionInput::GoToUrl(p)
            } else {
                ActionInput::OpenTab(p)
            }
        }
        ActionKind::Wait => ActionInput::Wait(parse(kind, raw)?),
        ActionKind::ClickElement => ActionInput::ClickElement(parse(kind, raw)?),
        ActionKind::InputText => ActionInput::InputText(parse(kind, raw)?),
        ActionKind::SwitchTab => ActionInput::SwitchTab(parse(kind, raw)?),
        ActionKind::CloseTab => ActionInput::CloseTab(parse(kind, raw)?),
        ActionKind::CacheContent => ActionInput::CacheContent(parse(kind, raw)?),
        ActionKind::ExtractContent => ActionInput::ExtractContent(parse(kind, raw)?),
        ActionKind::ScrollDown => ActionInput::ScrollDown(parse(kind, raw)?),
        ActionKind::ScrollUp => ActionInput::ScrollUp(parse(kind, raw)?),
        ActionKind::ScrollToText => {
            let p: TextParams = parse(kind, raw)?;
            non_empty(kind, "text", &p.text)?;
            ActionInput::ScrollToText(p)
        }
        ActionKind::SendKeys => {
            let p: SendKeysParams = parse(kind, raw)?;
            non_empty(kind, "keys", &p.keys)?;
            ActionInput::SendKeys(p)
        }
        ActionKind::GetDropdownOptions => ActionInput::GetDropdownOptions(parse(kind, raw)?),
        ActionKind::SelectDropdownOption => ActionInput::SelectDropdownOption(parse(kind, raw)?),
    };
    Ok(input)
}

/// JSON schema of a kind's parameters; `None` for parameterless kinds.
pub fn schema(kind: ActionKind) -> Option<Value> {
    let schema = match kind {
        ActionKind::GoBack | ActionKind::ExtractGoogleResults | ActionKind::NextPage => {
            return None
        }
        ActionKind::Done => schemars::schema_for!(DoneParams),
        ActionKind::SearchGoogle => schemars::schema_for!(SearchGoogleParams),
        ActionKind::GoToUrl | ActionKind::OpenTab => schemars::schema_for!(UrlParams),
        ActionKind::Wait => schemars::schema_for!(WaitParams),
        ActionKind::ClickElement | ActionKind::GetDropdownOptions => {
            schemars::schema_for!(IndexParams)
        }
        ActionKind::InputText => schemars::schema_for!(InputTextParams),
        ActionKind::SwitchTab | ActionKind::CloseTab => schemars::schema_for!(TabParams),
        ActionKind::CacheContent => schemars::schema_for!(CacheContentParams),
        ActionKind::ExtractContent => schemars::schema_for!(ExtractContentParams),
        ActionKind::ScrollDown | ActionKind::ScrollUp => schemars::schema_for!(ScrollParams),
        ActionKind::ScrollToText => schemars::schema_for!(TextParams),
        ActionKind::SendKeys => schemars::schema_for!(SendKeysParams),
        ActionKind::SelectDropdownOption => schemars::schema_for!(SelectOptionParams),
    };
    serde_json::to_value(schema).ok()
}
