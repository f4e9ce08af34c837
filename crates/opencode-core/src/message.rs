//! Message store.

use std::sync::Arc;

use opencode_types::{ContentPart, Event, EventKind, Message, Role, new_id, now_unix};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::db::Storage;
use crate::pubsub::Broker;
use crate::{CoreError, Result};

/// Persists messages and publishes every change, including each part append.
pub struct MessageService {
    storage: Arc<dyn Storage>,
    broker: Broker<Message>,
}

impl MessageService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            broker: Broker::new(),
        }
    }

    pub async fn create(
        &self,
        session_id: &str,
        role: Role,
        parts: Vec<ContentPart>,
        model: Option<String>,
    ) -> Result<Message> {
        let now = now_unix();
        let finished_at = parts.iter().find_map(|p| match p {
            ContentPart::Finish(f) => Some(f.time),
            _ => None,
        });
        let message = Message {
            id: new_id(),
            session_id: session_id.to_string(),
            role,
            parts,
            model,
            created_at: now,
            updated_at: now,
            finished_at,
        };
        self.storage.insert_message(&message).await?;
        debug!(
            target: "opencode::session",
            session_id = %session_id,
            message_id = %message.id,
            role = %role,
            "Message created"
        );
        self.broker.publish(EventKind::Created, message.clone()).await;
        Ok(message)
    }

    /// Persist the message's parts and finish time.
    pub async fn update(&self, message: &Message) -> Result<()> {
        let mut message = message.clone();
        message.updated_at = now_unix();
        self.storage.update_message(&message).await?;
        self.broker.publish(EventKind::Updated, message).await;
        Ok(())
    }

    /// Append one part to a stored message.
    pub async fn append(&self, id: &str, part: ContentPart) -> Result<Message> {
        let mut message = self.get(id).await?;
        let appended = match part {
            ContentPart::Finish(finish) => message.add_finish(finish.reason, finish.time),
            part => message.push_part(part),
        };
        if !appended {
            return Err(CoreError::InvalidArgs(format!(
                "message {id} is already finished"
            )));
        }
        self.update(&message).await?;
        Ok(message)
    }

    pub async fn get(&self, id: &str) -> Result<Message> {
        self.storage
            .get_message(id)
            .await?
            .ok_or_else(|| CoreError::MessageNotFound(id.to_string()))
    }

    /// Messages of a session, oldest first.
    pub async fn list(&self, session_id: &str) -> Result<Vec<Message>> {
        self.storage.list_messages(session_id).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let message = self
            .storage
            .delete_message(id)
            .await?
            .ok_or_else(|| CoreError::MessageNotFound(id.to_string()))?;
        self.broker.publish(EventKind::Deleted, message).await;
        Ok(())
    }

    pub async fn delete_session_messages(&self, session_id: &str) -> Result<()> {
        let messages = self.storage.list_messages(session_id).await?;
        self.storage.delete_session_messages(session_id).await?;
        for message in messages {
            self.broker.publish(EventKind::Deleted, message).await;
        }
        Ok(())
    }

    pub fn subscribe(&self, cancel: &CancellationToken) -> mpsc::Receiver<Event<Message>> {
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
    use opencode_types::{Finish, FinishReason};

    async fn services() -> (SessionService, MessageService, String) {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let sessions = SessionService::new(storage.clone(), "proj");
        let messages = MessageService::new(storage);
        let session = sessions.create("t").await.unwrap();
        (sessions, messages, session.id)
    }

    #[tokio::test]
    async fn test_list_is_oldest_first() {
        let (_, messages, sid) = services().await;
        for i in 0..5 {
            messages
                .create(&sid, Role::User, vec![ContentPart::text(format!("m{i}"))], None)
                .await
                .unwrap();
        }
        let listed = messages.list(&sid).await.unwrap();
        let contents: Vec<_> = listed.iter().map(|m| m.content()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_append_publishes_updates_and_rejects_after_finish() {
        let (_, messages, sid) = services().await;
        let cancel = CancellationToken::new();
        let mut rx = messages.subscribe(&cancel);

        let msg = messages
            .create(&sid, Role::Assistant, Vec::new(), Some("gpt-4o".into()))
            .await
            .unwrap();
        messages
            .append(&msg.id, ContentPart::text("hello"))
            .await
            .unwrap();
        messages
            .append(
                &msg.id,
                ContentPart::Finish(Finish {
                    reason: FinishReason::EndTurn,
                    time: 7,
                }),
            )
            .await
            .unwrap();
        assert!(messages.append(&msg.id, ContentPart::text("x")).await.is_err());

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Created);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Updated);
        let last = rx.recv().await.unwrap();
        assert_eq!(last.kind, EventKind::Updated);
        assert_eq!(last.payload.finished_at, Some(7));
    }

    #[tokio::test]
    async fn test_message_count_matches_rows() {
        let (sessions, messages, sid) = services().await;
        let a = messages.create(&sid, Role::User, Vec::new(), None).await.unwrap();
        messages.create(&sid, Role::User, Vec::new(), None).await.unwrap();
        messages.delete(&a.id).await.unwrap();
        let session = sessions.get(&sid).await.unwrap();
        assert_eq!(session.message_count, messages.list(&sid).await.unwrap().len() as i64);

        messages.delete_session_messages(&sid).await.unwrap();
        assert_eq!(sessions.get(&sid).await.unwrap().message_count, 0);
    }
}
