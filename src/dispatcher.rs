//! Command Dispatcher
//!
//! Maps one inbound envelope to one Record Store / Batch Accumulator call
//! and exactly one reply envelope. Failures become the reply's `error`.

use crate::batch::BatchAccumulator;
use crate::core::Result;
use crate::protocol::{Command, Envelope};
use crate::store::RecordStore;
use chrono::Utc;
use tracing::debug;

#[derive(Clone)]
pub struct CommandDispatcher {
    store: RecordStore,
    batches: BatchAccumulator,
}

impl CommandDispatcher {
    pub fn new(store: RecordStore, batches: BatchAccumulator) -> Self {
        Self { store, batches }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn batches(&self) -> &BatchAccumulator {
        &self.batches
    }

    pub async fn dispatch(&self, request: &Envelope) -> Envelope {
        let reply = Envelope::reply_to(request);
        let outcome = match Command::from_envelope(request, Utc::now()) {
            Ok(command) => self.execute(command, reply.clone()).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(reply) => reply,
            Err(e) => {
                debug!(action = %request.action, key = request.key(), error = %e, "Command failed");
                reply.with_error(e)
            }
        }
    }

    async fn execute(&self, command: Command, reply: Envelope) -> Result<Envelope> {
        match command {
            Command::Set(new) => {
                self.store.set(new).await?;
                Ok(reply)
            }
            Command::AddBatch { key, payload } => {
                self.batches.append(&key, payload).await?;
                Ok(reply)
            }
            Command::Get { key } => {
                let record = self.store.get(&key).await?;
                let mut reply = reply.with_data(record.payload);
                reply.due_at = Some(record.due_at);
                reply.ack_hold = record.ack_hold;
                reply.schedule = record.schedule;
                Ok(reply)
            }
            Command::Find { pattern } => {
                let payloads = self.store.find_by_key_pattern(&pattern).await?;
                Ok(reply.with_data(serde_json::to_string(&payloads)?))
            }
            Command::Delete { key } => {
                self.store.delete(&key).await?;
                Ok(reply)
            }
            Command::Reset => {
                self.store.delete_all().await?;
                Ok(reply)
            }
            Command::Keys => {
                let keys = self.store.list_keys().await;
                Ok(reply.with_data(serde_json::to_string(&keys)?))
            }
            Command::Increment { key, delta } => {
                let value = self.store.increment(&key, delta).await?;
                Ok(reply.with_data(value.to_string()))
            }
            Command::Decrement { key, delta } => {
                let value = self.store.decrement(&key, delta).await?;
                Ok(reply.with_data(value.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::KronDB;
    use crate::protocol::Action;
    use serde_json::json;

    fn dispatcher() -> CommandDispatcher {
        let db = KronDB::new();
        CommandDispatcher::new(RecordStore::new(db.clone()), BatchAccumulator::new(db))
    }

    fn request(value: serde_json::Value) -> Envelope {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let dispatcher = dispatcher();
        let reply = dispatcher
            .dispatch(&request(json!({"action": "SET", "key": "a", "data": "1", "id": 1})))
            .await;
        assert_eq!(reply.action, Action::Response);
        assert_eq!(reply.error, None);
        assert_eq!(reply.id, Some(json!(1)));

        let reply = dispatcher
            .dispatch(&request(json!({"action": "GET", "key": "a", "id": 2})))
            .await;
        assert_eq!(reply.action, Action::Get);
        assert_eq!(reply.data.as_deref(), Some("1"));
        assert!(reply.due_at.is_some());
        assert_eq!(reply.id, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_set_errors_come_back_as_response() {
        let dispatcher = dispatcher();
        let reply = dispatcher.dispatch(&request(json!({"action": "SET"}))).await;
        assert_eq!(reply.action, Action::Response);
        assert!(reply.error.unwrap().contains("key must not be empty"));

        let reply = dispatcher
            .dispatch(&request(json!({"action": "SCHEDULE", "key": "s", "schedule": "sometimes"})))
            .await;
        assert_eq!(reply.action, Action::Response);
        assert!(reply.error.unwrap().starts_with("Invalid schedule"));
    }

    #[tokio::test]
    async fn test_get_missing_and_pattern() {
        let dispatcher = dispatcher();
        let reply = dispatcher.dispatch(&request(json!({"action": "GET", "key": "nope"}))).await;
        assert_eq!(reply.action, Action::Get);
        assert_eq!(reply.error.as_deref(), Some("Key 'nope' not found"));

        for (key, data) in [("user:1", "alice"), ("user:2", "bob"), ("job:1", "x")] {
            dispatcher
                .dispatch(&request(json!({"action": "SET", "key": key, "data": data})))
                .await;
        }
        let reply = dispatcher
            .dispatch(&request(json!({"action": "GET", "pattern": "^user:"})))
            .await;
        assert_eq!(reply.data.as_deref(), Some(r#"["alice","bob"]"#));
    }

    #[tokio::test]
    async fn test_keys_delete_reset() {
        let dispatcher = dispatcher();
        for key in ["b", "a"] {
            dispatcher
                .dispatch(&request(json!({"action": "SET", "key": key, "data": "v"})))
                .await;
        }
        let reply = dispatcher.dispatch(&request(json!({"action": "KEYS"}))).await;
        assert_eq!(reply.action, Action::Keys);
        assert_eq!(reply.data.as_deref(), Some(r#"["a","b"]"#));

        let reply = dispatcher.dispatch(&request(json!({"action": "DELETE", "key": "a"}))).await;
        assert_eq!((reply.action, reply.error), (Action::Delete, None));

        let reply = dispatcher.dispatch(&request(json!({"action": "RESET"}))).await;
        assert_eq!((reply.action, reply.error), (Action::Reset, None));

        let reply = dispatcher.dispatch(&request(json!({"action": "KEYS"}))).await;
        assert_eq!(reply.data.as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn test_increment_and_decrement() {
        let dispatcher = dispatcher();
        dispatcher
            .dispatch(&request(json!({"action": "SET", "key": "n", "data": "10"})))
            .await;

        let reply = dispatcher
            .dispatch(&request(json!({"action": "INCREMENT", "key": "n", "data": "5"})))
            .await;
        assert_eq!((reply.action, reply.data.as_deref()), (Action::Increment, Some("15")));

        let reply = dispatcher
            .dispatch(&request(json!({"action": "DECREMENT", "key": "n", "data": "20"})))
            .await;
        assert_eq!((reply.action, reply.data.as_deref()), (Action::Decrement, Some("-5")));

        let reply = dispatcher
            .dispatch(&request(json!({"action": "INCREMENT", "key": "n", "data": "x"})))
            .await;
        assert_eq!(reply.action, Action::Increment);
        assert!(reply.error.is_some());
    }

    #[tokio::test]
    async fn test_add_batch() {
        let dispatcher = dispatcher();
        let reply = dispatcher
            .dispatch(&request(json!({"action": "ADD-BATCH", "key": "b", "data": "x"})))
            .await;
        assert_eq!((reply.action, reply.error), (Action::Response, None));
        assert_eq!(dispatcher.batches().pending("b").await.len(), 1);

        let reply = dispatcher.dispatch(&request(json!({"action": "ADD-BATCH", "data": "x"}))).await;
        assert!(reply.error.is_some());
    }

    #[tokio::test]
    async fn test_server_message_sent_as_command() {
        let reply = dispatcher().dispatch(&request(json!({"action": "EXPIRED", "key": "a"}))).await;
        assert_eq!(reply.action, Action::Response);
        assert!(reply.error.is_some());
    }
}
