use serde::Serialize;
use tracing::warn;

use crate::store::{StoreKey, TaskStore, load};
use crate::types::{PlanningRecord, ProcessingStatus, TaskStatus};

/// The three independent signals that can end a task. Any one of them is enough.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompletionEvidence {
    /// A control surface declared the session complete.
    pub session_done: bool,
    /// The planner's last answer said the goal is reached.
    pub planner_done: bool,
    /// Processing was marked completed outside the normal iteration flow.
    pub processing_done: bool,
}

impl CompletionEvidence {
    /// Read every signal from the store. A key that cannot be read counts as not done.
    pub async fn gather(store: &dyn TaskStore) -> Self {
        let session_done = read::<TaskStatus>(store, StoreKey::SessionStatus)
            .await
            .is_some_and(|s| s == TaskStatus::Completed);
        let planner_done = read::<PlanningRecord>(store, StoreKey::LastResult)
            .await
            .is_some_and(|r| r.is_done);
        let processing_done = read::<ProcessingStatus>(store, StoreKey::ProcessingStatus)
            .await
            .is_some_and(|p| p == ProcessingStatus::Completed);
        Self {
            session_done,
            planner_done,
            processing_done,
        }
    }

    pub fn is_done(&self) -> bool {
        self.session_done || self.planner_done || self.processing_done
    }

    pub fn sources(&self) -> Vec<&'static str> {
        [
            (self.session_done, "session"),
            (self.planner_done, "planner"),
            (self.processing_done, "processing"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect()
    }
}

async fn read<T: serde::de::DeserializeOwned>(store: &dyn TaskStore, key: StoreKey) -> Option<T> {
    match load(store, key).await {
        Ok(value) => value,
        Err(e) => {
            warn!("ignoring unreadable {key}: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, save};
    use serde_json::json;

    #[tokio::test]
    async fn test_nothing_stored_is_not_done() {
        let store = MemoryStore::new();
        let evidence = CompletionEvidence::gather(&store).await;
        assert!(!evidence.is_done());
        assert!(evidence.sources().is_empty());
    }

    #[tokio::test]
    async fn test_any_single_signal_is_done() {
        let store = MemoryStore::new();
        save(
            &store,
            StoreKey::LastResult,
            &PlanningRecord {
                iteration: 3,
                is_done: true,
                results: vec![],
            },
        )
        .await
        .unwrap();
        let evidence = CompletionEvidence::gather(&store).await;
        assert!(evidence.is_done());
        assert_eq!(evidence.sources(), vec!["planner"]);

        let store = MemoryStore::new();
        save(&store, StoreKey::SessionStatus, &TaskStatus::Completed).await.unwrap();
        save(&store, StoreKey::ProcessingStatus, &ProcessingStatus::Completed).await.unwrap();
        let evidence = CompletionEvidence::gather(&store).await;
        assert_eq!(evidence.sources(), vec!["session", "processing"]);
    }

    #[tokio::test]
    async fn test_garbage_counts_as_not_done() {
        let store = MemoryStore::new();
        store.set(StoreKey::SessionStatus, json!(42)).await.unwrap();
        store.set(StoreKey::ProcessingStatus, json!("waiting_for_server")).await.unwrap();
        assert!(!CompletionEvidence::gather(&store).await.is_done());
    }
}
