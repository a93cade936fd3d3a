//! # wayfarer-tools
//!
//! Action-execution engine for LLM browser agents. Use the crates directly,
//! or serve them to any MCP client with [`mcp::WayfarerServer`].
//!
//! - [`agent`]: indexed page snapshots, the state cache and element
//!   re-identification.
//! - [`runner`]: the step loop, action registry, cancellation and replay.

pub mod mcp;

pub use wayfarer_agent as agent;
pub use wayfarer_runner as runner;

pub use mcp::WayfarerServer;
pub use wayfarer_agent::{EokaHost, PageState, SurfaceHost};
pub use wayfarer_runner::{
    ActionResult, AgentHistory, Error, Navigator, ProposedAction, Result, TaskSettings,
};
