//! Surface ownership registry shared between concurrent navigators.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::surface::SurfaceId;

/// Which navigator owns which surface. First claim wins.
#[derive(Clone, Default)]
pub struct SurfaceOwners {
    inner: Arc<Mutex<HashMap<SurfaceId, String>>>,
}

impl SurfaceOwners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `surface` for `owner`. Returns false if someone else holds it.
    pub fn claim(&self, surface: &SurfaceId, owner: &str) -> bool {
        let mut map = self.inner.lock();
        match map.get(surface) {
            Some(current) => current == owner,
            None => {
                map.insert(surface.clone(), owner.to_string());
                true
            }
        }
    }

    pub fn owner_of(&self, surface: &SurfaceId) -> Option<String> {
        self.inner.lock().get(surface).cloned()
    }

    pub fn release(&self, surface: &SurfaceId) {
        self.inner.lock().remove(surface);
    }

    /// Surfaces held by `owner`, sorted.
    pub fn owned_by(&self, owner: &str) -> Vec<SurfaceId> {
        let mut ids: Vec<SurfaceId> = self
            .inner
            .lock()
            .iter()
            .filter(|(_, o)| o.as_str() == owner)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_claim_wins() {
        let owners = SurfaceOwners::new();
        let tab = SurfaceId::new("t1");
        assert!(owners.claim(&tab, "nav-a"));
        assert!(!owners.claim(&tab, "nav-b"));
        assert!(owners.claim(&tab, "nav-a"));
        assert_eq!(owners.owner_of(&tab).as_deref(), Some("nav-a"));
    }

    #[test]
    fn test_release_and_owned_by() {
        let owners = SurfaceOwners::new();
        owners.claim(&SurfaceId::new("t2"), "nav-a");
        owners.claim(&SurfaceId::new("t1"), "nav-a");
        owners.claim(&SurfaceId::new("t3"), "nav-b");
        assert_eq!(
            owners.owned_by("nav-a"),
            vec![SurfaceId::new("t1"), SurfaceId::new("t2")]
        );
        owners.release(&SurfaceId::new("t1"));
        assert_eq!(owners.owned_by("nav-a"), vec![SurfaceId::new("t2")]);
        assert!(owners.claim(&SurfaceId::new("t1"), "nav-b"));
    }
}
