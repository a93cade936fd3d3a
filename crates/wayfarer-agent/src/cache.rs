//! Per-surface state cache.
//!
//! Holds the current [`PageState`] behind an `Arc` swap. Readers clone the
//! `Arc` and never block writers; a rebuild installs a new snapshot, it never
//! mutates the old one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::snapshot::{PageState, SnapshotBuilder, SnapshotOptions};
use crate::surface::{Surface, SurfaceEvent, SurfaceId};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    current: RwLock<Option<Arc<PageState>>>,
    /// Bumped on every invalidation; a rebuild that started under an older
    /// generation must not install its result.
    generation: AtomicU64,
    closed: Mutex<HashSet<SurfaceId>>,
}

/// Cheap to clone; clones share the same snapshot slot.
#[derive(Clone, Default)]
pub struct StateCache {
    inner: Arc<Inner>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot, if one is cached and still valid.
    pub fn get_cached(&self) -> Option<Arc<PageState>> {
        self.inner.current.read().clone()
    }

    /// The cached snapshot, only if it belongs to `surface`.
    pub fn get_cached_for(&self, surface: &SurfaceId) -> Option<Arc<PageState>> {
        self.get_cached().filter(|s| &s.surface_id == surface)
    }

    /// Current generation. Changes whenever the cache is invalidated.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Rebuild from the live surface and install the result.
    pub async fn update(
        &self,
        surface: &dyn Surface,
        options: &SnapshotOptions,
    ) -> Result<Arc<PageState>> {
        self.ensure_open(surface.id())?;
        let state = Arc::new(SnapshotBuilder::build(surface, options).await?);
        *self.inner.current.write() = Some(state.clone());
        debug!(surface = %surface.id(), "state cache updated");
        Ok(state)
    }

    /// Drop the cached snapshot. The next read must rebuild.
    pub fn invalidate(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *self.inner.current.write() = None;
        debug!("state cache invalidated");
    }

    /// Rebuild in the background. Installs the result only if nothing
    /// invalidated the cache in the meantime; failures leave the cache as is.
    pub fn refresh_in_background(
        &self,
        surface: Arc<dyn Surface>,
        options: SnapshotOptions,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        let started = self.generation();
        tokio::spawn(async move {
            if cache.ensure_open(surface.id()).is_err() {
                return;
            }
            match SnapshotBuilder::build(surface.as_ref(), &options).await {
                Ok(state) => {
                    let mut slot = cache.inner.current.write();
                    if cache.generation() == started {
                        *slot = Some(Arc::new(state));
                        debug!(surface = %surface.id(), "speculative refresh installed");
                    }
                }
                Err(e) => debug!(surface = %surface.id(), error = %e, "speculative refresh failed"),
            }
        })
    }

    /// Apply a lifecycle event from the surface host.
    pub fn handle_event(&self, event: &SurfaceEvent) {
        let id = event.surface_id();
        let affects_cached = self
            .get_cached()
            .map_or(false, |s| &s.surface_id == id);
        if let SurfaceEvent::Closed(id) = event {
            self.inner.closed.lock().insert(id.clone());
        }
        if affects_cached {
            self.invalidate();
        }
    }

    /// True if a `Closed` event was seen for `id`.
    pub fn is_closed(&self, id: &SurfaceId) -> bool {
        self.inner.closed.lock().contains(id)
    }

    fn ensure_open(&self, id: &SurfaceId) -> Result<()> {
        if self.is_closed(id) {
            return Err(Error::SurfaceUnavailable(id.to_string()));
        }
        Ok(())
    }
}
