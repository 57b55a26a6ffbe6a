//! The current forward target.

use std::sync::{Arc, PoisonError, RwLock};

use url::Url;

/// Where unintercepted traffic goes, if anywhere.
///
/// Readers get a snapshot; a concurrent `store` never exposes a torn value.
#[derive(Debug, Default)]
pub struct ForwardTarget {
    current: RwLock<Option<Arc<Url>>>,
}

impl ForwardTarget {
    /// An empty target.
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the current target, if one is set.
    pub fn load(&self) -> Option<Arc<Url>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the target. Requests routed after this returns see `url`.
    pub fn store(&self, url: Url) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(url));
    }

    /// Forgets the target, so requests fall back to the bootstrap files.
    pub fn clear(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_replaces_and_clear_empties() {
        let target = ForwardTarget::new();
        assert!(target.load().is_none());
        target.store(Url::parse("http://one.test/").unwrap());
        let snapshot = target.load().unwrap();
        target.store(Url::parse("http://two.test/").unwrap());
        assert_eq!(snapshot.host_str(), Some("one.test"));
        assert_eq!(target.load().unwrap().host_str(), Some("two.test"));
        target.clear();
        assert!(target.load().is_none());
    }
}
