//! Persisted per-step flow states.

use std::sync::Arc;

use opencode_types::{Event, EventKind, FlowState};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Result;
use crate::db::Storage;
use crate::pubsub::Broker;

pub struct FlowStateService {
    storage: Arc<dyn Storage>,
    broker: Broker<FlowState>,
}

impl FlowStateService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            broker: Broker::new(),
        }
    }

    /// Insert or replace the state keyed by its step session.
    pub async fn save(&self, state: &FlowState) -> Result<()> {
        let existed = self.storage.get_flow_state(&state.session_id).await?.is_some();
        self.storage.upsert_flow_state(state).await?;
        debug!(
            target: "opencode::flow",
            session_id = %state.session_id,
            step = %state.step_id,
            status = state.status.as_str(),
            "Flow state saved"
        );
        let kind = if existed { EventKind::Updated } else { EventKind::Created };
        self.broker.publish(kind, state.clone()).await;
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<FlowState>> {
        self.storage.get_flow_state(session_id).await
    }

    /// States of every step under a root session, oldest first.
    pub async fn list(&self, root_session_id: &str) -> Result<Vec<FlowState>> {
        self.storage.list_flow_states(root_session_id).await
    }

    pub async fn delete_root(&self, root_session_id: &str) -> Result<u64> {
        let states = self.list(root_session_id).await?;
        let deleted = self.storage.delete_flow_states(root_session_id).await?;
        for state in states {
            self.broker.publish(EventKind::Deleted, state).await;
        }
        Ok(deleted)
    }

    pub fn subscribe(&self, cancel: &CancellationToken) -> mpsc::Receiver<Event<FlowState>> {
        self.broker.subscribe(cancel)
    }

    pub fn shutdown(&self) {
        self.broker.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStorage;
    use crate::session::SessionService;
    use opencode_types::{FlowStatus, now_unix};
    use serde_json::Map;

    #[tokio::test]
    async fn test_save_publishes_created_then_updated() {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let sessions = SessionService::new(storage.clone(), "proj");
        sessions.create_with_id("p-f-a", "step").await.unwrap();
        let states = FlowStateService::new(storage);
        let cancel = CancellationToken::new();
        let mut events = states.subscribe(&cancel);

        let mut state = FlowState {
            session_id: "p-f-a".into(),
            root_session_id: "p-f-a".into(),
            flow_id: "f".into(),
            step_id: "a".into(),
            status: FlowStatus::Running,
            args: Map::new(),
            output: String::new(),
            is_struct_output: false,
            created_at: now_unix(),
            updated_at: now_unix(),
        };
        states.save(&state).await.unwrap();
        state.status = FlowStatus::Completed;
        state.output = "done".into();
        states.save(&state).await.unwrap();

        assert_eq!(events.recv().await.unwrap().kind, EventKind::Created);
        let updated = events.recv().await.unwrap();
        assert_eq!(updated.kind, EventKind::Updated);
        assert_eq!(updated.payload.status, FlowStatus::Completed);

        let listed = states.list("p-f-a").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].output, "done");
        assert_eq!(states.delete_root("p-f-a").await.unwrap(), 1);
        assert!(states.get("p-f-a").await.unwrap().is_none());
    }
}
