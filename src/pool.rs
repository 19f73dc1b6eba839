//! Set of live backend connections shared by workers and supervisors.

use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::backend::{Backend, BackendKind};

#[derive(Default)]
pub struct BackendPool {
    members: RwLock<Vec<Arc<dyn Backend>>>,
}

impl BackendPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, backend: Arc<dyn Backend>) {
        let size = {
            let mut members = self.members.write();
            members.push(backend.clone());
            members.len()
        };
        info!(backend = %backend.name(), kind = %backend.kind(), pool_size = size, "backend_added");
    }

    /// Remove by identity. Returns whether the backend was a member.
    pub fn remove(&self, backend: &Arc<dyn Backend>) -> bool {
        let (removed, size) = {
            let mut members = self.members.write();
            let before = members.len();
            members.retain(|m| !Arc::ptr_eq(m, backend));
            (members.len() != before, members.len())
        };
        if removed {
            info!(backend = %backend.name(), pool_size = size, "backend_removed");
        }
        removed
    }

    /// Point-in-time copy; later membership changes do not affect it.
    pub fn snapshot(&self) -> Vec<Arc<dyn Backend>> {
        self.members.read().clone()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_kind(&self, kind: BackendKind) -> bool {
        self.members.read().iter().any(|m| m.kind() == kind)
    }

    pub fn names(&self) -> Vec<String> {
        self.members.read().iter().map(|m| m.name().to_string()).collect()
    }

    /// Ask every member to load its default model, concurrently.
    pub async fn ensure_models_loaded(&self) {
        let members = self.snapshot();
        let results = join_all(members.iter().map(|m| m.ensure_model_loaded())).await;
        for (member, result) in members.iter().zip(results) {
            match result {
                Ok(true) => info!(backend = %member.name(), "model_ready"),
                Ok(false) => warn!(backend = %member.name(), "model_not_loaded"),
                Err(e) => warn!(backend = %member.name(), error = %e, "model_load_failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockMode};
    use crate::config::BackendConfig;

    fn mock(name: &str, kind: BackendKind) -> Arc<MockBackend> {
        Arc::new(MockBackend::new(BackendConfig::new(name, "mock://", kind), MockMode::Echo))
    }

    #[tokio::test]
    async fn add_remove_by_identity() {
        let pool = BackendPool::new();
        let a: Arc<dyn Backend> = mock("a", BackendKind::Completion);
        let twin: Arc<dyn Backend> = mock("a", BackendKind::Completion);
        pool.add(a.clone());
        pool.add(twin.clone());
        assert_eq!(pool.len(), 2);

        assert!(pool.remove(&a));
        assert!(!pool.remove(&a));
        assert_eq!(pool.names(), vec!["a"]);
        assert!(Arc::ptr_eq(&pool.snapshot()[0], &twin));
    }

    #[tokio::test]
    async fn snapshot_survives_removal() {
        let pool = BackendPool::new();
        let a: Arc<dyn Backend> = mock("a", BackendKind::Chat);
        pool.add(a.clone());
        let snap = pool.snapshot();
        pool.remove(&a);
        assert_eq!(snap.len(), 1);
        assert!(pool.is_empty());
        assert!(!pool.has_kind(BackendKind::Chat));
    }

    #[tokio::test]
    async fn broadcasts_model_loading() {
        let pool = BackendPool::new();
        let a = mock("a", BackendKind::Completion);
        let b = mock("b", BackendKind::Metered);
        pool.add(a.clone());
        pool.add(b.clone());
        pool.ensure_models_loaded().await;
        assert_eq!(a.ensure_calls(), 1);
        assert_eq!(b.ensure_calls(), 1);
        assert!(pool.has_kind(BackendKind::Metered));
    }
}
