//! Model input composition.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use wayfarer_agent::PageState;

use crate::actions::Registry;
use crate::model::Message;

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    /// Recoverable: the navigator substitutes a placeholder prompt.
    #[error("no surface bound")]
    NoSurfaceBound,

    #[error("prompt error: {0}")]
    Other(String),
}

/// Inputs for one model invocation.
pub struct PromptContext<'a> {
    pub task: &'a str,
    pub step: usize,
    pub state: Option<&'a PageState>,
    /// Results carried over from earlier steps, oldest first.
    pub memory: &'a [String],
    pub use_vision: bool,
}

/// Builds the message list for a step.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, ctx: &PromptContext<'_>) -> Result<Vec<Message>, PromptError>;

    /// Input used when [`build`](Self::build) reports
    /// [`PromptError::NoSurfaceBound`].
    fn placeholder(&self, ctx: &PromptContext<'_>) -> Vec<Message> {
        vec![Message::user(format!(
            "Task: {}\nStep {}\n{}\n{}",
            ctx.task,
            ctx.step,
            NO_PAGE,
            memory_section(ctx.memory)
        ))]
    }
}

const NO_PAGE: &str = "No page is open. Start with go_to_url, open_tab or search_google.";

/// Plain-text prompt: a system message describing the actions, then the
/// indexed element list.
pub struct TextPromptBuilder {
    system: String,
}

impl TextPromptBuilder {
    pub fn new(registry: &Registry) -> Self {
        Self {
            system: format!(
                "You control a web browser to complete a task.\n\
                 Each turn you see the current page as a list of interactive elements, \
                 each prefixed by its [index]. Reply with JSON only:\n\
                 {{\"current_state\": {{\"evaluation_previous_goal\": \"...\", \"memory\": \"...\", \"next_goal\": \"...\"}}, \
                 \"action\": [{{\"action_name\": {{...params}}}}]}}\n\
                 Actions in one reply run in order against the same page; the indices stay \
                 valid until the page navigates. Use done when the task is complete.\n\n\
                 Available actions:\n{}",
                registry.describe()
            ),
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system
    }

    fn page_section(state: &PageState) -> String {
        let mut out = format!("Current url: {}\nTitle: {}\n", state.url, state.title);

        let above = state.pixels_above();
        let below = state.pixels_below();
        let list = state.element_list();

        out.push_str("Interactive elements:\n");
        if above > 0.0 {
            out.push_str(&format!("... {} pixels above ...\n", above as i64));
        } else {
            out.push_str("[Start of page]\n");
        }
        if list.is_empty() {
            out.push_str("(none)\n");
        } else {
            out.push_str(&list);
            if !list.ends_with('\n') {
                out.push('\n');
            }
        }
        if below > 0.0 {
            out.push_str(&format!("... {} pixels below ...\n", below as i64));
        } else {
            out.push_str("[End of page]\n");
        }
        out
    }
}

fn memory_section(memory: &[String]) -> String {
    if memory.is_empty() {
        return String::new();
    }
    let mut out = String::from("Memory:\n");
    for item in memory {
        out.push_str("- ");
        out.push_str(item);
        out.push('\n');
    }
    out
}

impl PromptBuilder for TextPromptBuilder {
    fn build(&self, ctx: &PromptContext<'_>) -> Result<Vec<Message>, PromptError> {
        let state = ctx.state.ok_or(PromptError::NoSurfaceBound)?;

        let mut user = Message::user(format!(
            "Task: {}\nStep {}\n{}{}",
            ctx.task,
            ctx.step,
            Self::page_section(state),
            memory_section(ctx.memory)
        ));
        if ctx.use_vision {
            user.image = state.screenshot.as_ref().map(|png| BASE64.encode(png));
        }

        Ok(vec![Message::system(self.system.clone()), user])
    }

    fn placeholder(&self, ctx: &PromptContext<'_>) -> Vec<Message> {
        vec![
            Message::system(self.system.clone()),
            Message::user(format!(
                "Task: {}\nStep {}\n{}\n{}",
                ctx.task,
                ctx.step,
                NO_PAGE,
                memory_section(ctx.memory)
            )),
        ]
    }
}
