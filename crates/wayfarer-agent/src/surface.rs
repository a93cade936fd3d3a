//! Surface abstraction: one browser tab the engine can observe and drive.
//!
//! The execution loop only ever talks to [`Surface`] and [`SurfaceHost`];
//! [`crate::browser`] provides the Chrome-backed implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::dom::Rect;
use crate::snapshot::RawCapture;
use crate::Result;

/// Opaque surface identifier (the CDP target id for Chrome tabs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SurfaceId(pub String);

impl SurfaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Summary of an open surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceInfo {
    pub id: SurfaceId,
    pub url: String,
    pub title: String,
}

/// Lifecycle notifications published by a [`SurfaceHost`].
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceEvent {
    /// The surface is gone; further access yields `SurfaceUnavailable`.
    Closed(SurfaceId),
    /// The surface navigated without the engine asking it to.
    NavigatedExternally { id: SurfaceId, url: String },
}

impl SurfaceEvent {
    pub fn surface_id(&self) -> &SurfaceId {
        match self {
            SurfaceEvent::Closed(id) => id,
            SurfaceEvent::NavigatedExternally { id, .. } => id,
        }
    }
}

/// How an action addresses an element on the live surface.
///
/// Both locators are derived from the snapshot; implementations try the CSS
/// path first and fall back to the XPath.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementTarget {
    pub index: u32,
    pub css: String,
    pub xpath: String,
    pub rect: Option<Rect>,
}

/// A numbered box drawn over a screenshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Highlight {
    pub index: u32,
    pub rect: Rect,
}

/// A single live document.
#[async_trait]
pub trait Surface: Send + Sync {
    fn id(&self) -> &SurfaceId;

    /// True once the surface was closed or detached.
    fn is_closed(&self) -> bool;

    /// Walk the live document. `viewport_expansion` is the number of pixels
    /// above and below the viewport still counted as in view; negative means
    /// the whole page.
    async fn capture(&self, viewport_expansion: i64) -> Result<RawCapture>;

    /// PNG screenshot, with numbered boxes for `highlights` if any.
    async fn screenshot(&self, highlights: &[Highlight]) -> Result<Vec<u8>>;

    async fn url(&self) -> Result<String>;
    async fn title(&self) -> Result<String>;

    async fn navigate(&self, url: &str) -> Result<()>;
    async fn go_back(&self) -> Result<()>;
    async fn reload(&self) -> Result<()>;

    async fn click(&self, target: &ElementTarget) -> Result<()>;
    /// Clear and type into an element.
    async fn input_text(&self, target: &ElementTarget, text: &str) -> Result<()>;

    /// Scroll vertically by `dy` pixels (negative scrolls up).
    async fn scroll_by(&self, dy: i64) -> Result<()>;
    /// Scroll the first element containing `text` into view. `Ok(false)` if
    /// no such text is on the page.
    async fn scroll_to_text(&self, text: &str) -> Result<bool>;

    /// Press a key or chord, e.g. `Enter`, `Control+a`.
    async fn send_keys(&self, keys: &str) -> Result<()>;

    /// Visible text content of the page.
    async fn text(&self) -> Result<String>;

    /// `(value, text)` pairs of a `<select>`.
    async fn dropdown_options(&self, target: &ElementTarget) -> Result<Vec<(String, String)>>;
    /// Select an option by visible text or value.
    async fn select_option(&self, target: &ElementTarget, option: &str) -> Result<()>;

    /// Evaluate an expression and return its JSON value.
    async fn evaluate(&self, js: &str) -> Result<serde_json::Value>;

    /// Best-effort wait for network and DOM to settle after an action.
    async fn wait_for_stable(&self) -> Result<()>;
}

/// Owner of the surfaces of one browser.
#[async_trait]
pub trait SurfaceHost: Send + Sync {
    /// Open a new surface at `url`.
    async fn open(&self, url: &str) -> Result<Arc<dyn Surface>>;

    /// All live surfaces, including ones opened by the page itself.
    async fn surfaces(&self) -> Result<Vec<SurfaceInfo>>;

    /// Handle to a known surface.
    fn surface(&self, id: &SurfaceId) -> Option<Arc<dyn Surface>>;

    /// Bring a surface to the front.
    async fn activate(&self, id: &SurfaceId) -> Result<Arc<dyn Surface>>;

    async fn close(&self, id: &SurfaceId) -> Result<()>;

    /// Subscribe to lifecycle events.
    fn events(&self) -> broadcast::Receiver<SurfaceEvent>;
}
