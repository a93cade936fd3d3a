//! # wayfarer-agent
//!
//! Page-state layer for LLM browser agents: turn a live document into an
//! indexed snapshot, keep one cached snapshot per surface, and re-identify
//! elements across snapshots.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wayfarer_agent::{EokaHost, SnapshotOptions, StateCache, SurfaceHost};
//!
//! # #[tokio::main]
//! # async fn main() -> wayfarer_agent::Result<()> {
//! let host = EokaHost::launch().await?;
//! let surface = host.open("https://example.com").await?;
//!
//! // Snapshot → read element list → act by index
//! let cache = StateCache::new();
//! let state = cache.update(surface.as_ref(), &SnapshotOptions::default()).await?;
//! println!("{}", state.element_list());
//!
//! host.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod annotate;
pub mod browser;
pub mod cache;
pub mod dom;
pub mod history;
pub mod ownership;
pub mod snapshot;
pub mod surface;

pub use browser::{EokaHost, EokaSurface, LaunchOptions};
pub use cache::StateCache;
pub use dom::{DomNode, DomTree, ElementNode, NodeId, Rect, TextNode};
pub use history::{find_current, state_signature, HistoryRecord, Match, MatchKind};
pub use ownership::SurfaceOwners;
pub use snapshot::{PageState, RawCapture, RawNode, SnapshotBuilder, SnapshotOptions};
pub use surface::{
    ElementTarget, Highlight, Surface, SurfaceEvent, SurfaceHost, SurfaceId, SurfaceInfo,
};

/// Errors from the page-state layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The surface was closed or its target detached.
    #[error("surface unavailable: {0}")]
    SurfaceUnavailable(String),

    /// An element could not be located on the live surface.
    #[error("element not found: {0}")]
    ElementNotFound(String),

    /// The capture script ran but produced something unusable.
    #[error("capture failed: {0}")]
    Capture(String),

    #[error("browser error: {0}")]
    Browser(#[from] eoka::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
