//! In-process [`Backend`] for tests and local demos.
//!
//! Rows live in memory, every write is pushed to matching subscribers,
//! and individual calls can be made to fail.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::backend::{record_id, Backend, RowEvent, Subscription, SubscriptionHandle};
use crate::error::BackendError;

/// A recorded `update_record` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedUpdate {
    pub table: String,
    pub id: String,
    pub fields: Value,
}

/// A recorded `invoke_function` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub name: String,
    pub payload: Value,
}

type InvokeHook = Arc<dyn Fn(&MemoryBackend, &str, &Value) + Send + Sync>;

struct Subscriber {
    key: u64,
    table: String,
    row_id: String,
    event: RowEvent,
    tx: mpsc::UnboundedSender<Value>,
}

#[derive(Default)]
struct MemoryState {
    rows: HashMap<String, HashMap<String, Value>>,
    subscribers: Vec<Subscriber>,
    next_key: u64,
    next_id: u64,
    create_calls: usize,
    updates: Vec<RecordedUpdate>,
    invocations: Vec<Invocation>,
    fail_create: Option<String>,
    fail_invoke: Option<String>,
    fail_subscribe: Option<String>,
    fail_update: Option<String>,
}

impl MemoryState {
    fn deliver(&mut self, table: &str, row_id: &str, event: RowEvent, row: &Value) -> usize {
        // Drop subscribers whose receiver is gone.
        self.subscribers.retain(|s| !s.tx.is_closed());
        self.subscribers
            .iter()
            .filter(|s| s.table == table && s.row_id == row_id && s.event.matches(event))
            .filter(|s| s.tx.send(row.clone()).is_ok())
            .count()
    }

    fn merge(&mut self, table: &str, row_id: &str, patch: Value) -> Value {
        let row = self
            .rows
            .entry(table.to_string())
            .or_default()
            .entry(row_id.to_string())
            .or_insert_with(|| {
                let mut fields = Map::new();
                fields.insert("id".into(), Value::String(row_id.to_string()));
                Value::Object(fields)
            });
        if let (Value::Object(target), Value::Object(patch)) = (&mut *row, patch) {
            for (k, v) in patch {
                target.insert(k, v);
            }
        }
        row.clone()
    }
}

/// Shared in-memory backend. Clones share the same rows and subscribers.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    id_prefix: Option<String>,
    on_invoke: Option<InvokeHook>,
}

impl MemoryBackend {
    /// New backend assigning random UUID row ids.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign ids `{prefix}-1`, `{prefix}-2`, ... instead of UUIDs.
    pub fn with_sequential_ids(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }

    /// Run `hook` after every successful `invoke_function`, outside any lock.
    /// Use it to simulate the remote worker.
    pub fn on_invoke<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MemoryBackend, &str, &Value) + Send + Sync + 'static,
    {
        self.on_invoke = Some(Arc::new(hook));
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `create_record` fail with `message`.
    pub fn fail_next_create(&self, message: impl Into<String>) {
        self.lock().fail_create = Some(message.into());
    }

    /// Make the next `invoke_function` fail with `message`.
    pub fn fail_next_invoke(&self, message: impl Into<String>) {
        self.lock().fail_invoke = Some(message.into());
    }

    /// Make the next `subscribe_to_row_updates` fail with `message`.
    pub fn fail_next_subscribe(&self, message: impl Into<String>) {
        self.lock().fail_subscribe = Some(message.into());
    }

    /// Make every `update_record` fail with `message` until cleared.
    pub fn fail_updates(&self, message: Option<String>) {
        self.lock().fail_update = message;
    }

    /// Simulate a write by the remote worker: merge `patch` into the row and
    /// push the full row to subscribers. Returns how many received it.
    pub fn push_update(&self, table: &str, id: &str, patch: Value) -> usize {
        let mut state = self.lock();
        let row = state.merge(table, id, patch);
        state.deliver(table, id, RowEvent::Update, &row)
    }

    /// Push a row snapshot as-is, without touching the stored row.
    pub fn push_raw(&self, table: &str, id: &str, row: Value) -> usize {
        self.lock().deliver(table, id, RowEvent::Update, &row)
    }

    /// End every stream for one row from the backend side, as a dropped
    /// socket would. Returns how many were closed.
    pub fn close_subscriptions(&self, table: &str, id: &str) -> usize {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state
            .subscribers
            .retain(|s| !(s.table == table && s.row_id == id));
        before - state.subscribers.len()
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Value> {
        self.lock().rows.get(table)?.get(id).cloned()
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock()
            .rows
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.lock().updates.clone()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().invocations.clone()
    }

    /// Subscriptions that have not been released.
    pub fn active_subscriptions(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }

    /// Live subscriptions for one row.
    pub fn active_subscriptions_for(&self, table: &str, id: &str) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state
            .subscribers
            .iter()
            .filter(|s| s.table == table && s.row_id == id)
            .count()
    }
}

impl Backend for MemoryBackend {
    async fn create_record(&self, table: &str, fields: Value) -> Result<Value, BackendError> {
        let mut state = self.lock();
        state.create_calls += 1;
        if let Some(message) = state.fail_create.take() {
            return Err(BackendError::Other(message));
        }

        let mut fields = match fields {
            Value::Object(map) => map,
            other => {
                return Err(BackendError::InvalidResponse(format!(
                    "Record fields must be an object, got {}",
                    other
                )))
            }
        };

        let id = match record_id(&Value::Object(fields.clone())) {
            Some(id) => id,
            None => {
                state.next_id += 1;
                match &self.id_prefix {
                    Some(prefix) => format!("{}-{}", prefix, state.next_id),
                    None => uuid::Uuid::new_v4().to_string(),
                }
            }
        };
        fields.insert("id".into(), Value::String(id.clone()));
        fields
            .entry("created_at")
            .or_insert_with(|| Value::String(chrono::Utc::now().to_rfc3339()));

        let row = Value::Object(fields);
        state
            .rows
            .entry(table.to_string())
            .or_default()
            .insert(id.clone(), row.clone());
        state.deliver(table, &id, RowEvent::Insert, &row);
        Ok(row)
    }

    async fn update_record(&self, table: &str, id: &str, fields: Value) -> Result<(), BackendError> {
        let mut state = self.lock();
        if let Some(message) = state.fail_update.clone() {
            return Err(BackendError::Other(message));
        }
        state.updates.push(RecordedUpdate {
            table: table.to_string(),
            id: id.to_string(),
            fields: fields.clone(),
        });
        let row = state.merge(table, id, fields);
        state.deliver(table, id, RowEvent::Update, &row);
        Ok(())
    }

    async fn subscribe_to_row_updates(
        &self,
        table: &str,
        id: &str,
        event: RowEvent,
    ) -> Result<Subscription, BackendError> {
        let mut state = self.lock();
        if let Some(message) = state.fail_subscribe.take() {
            return Err(BackendError::WebSocket(message));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.next_key += 1;
        let key = state.next_key;
        state.subscribers.push(Subscriber {
            key,
            table: table.to_string(),
            row_id: id.to_string(),
            event,
            tx,
        });

        let shared = Arc::clone(&self.state);
        let handle = SubscriptionHandle::new(move || {
            let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
            state.subscribers.retain(|s| s.key != key);
        });
        Ok(Subscription::new(rx, handle))
    }

    async fn invoke_function(&self, name: &str, payload: Value) -> Result<(), BackendError> {
        {
            let mut state = self.lock();
            if let Some(message) = state.fail_invoke.take() {
                return Err(BackendError::Other(message));
            }
            state.invocations.push(Invocation {
                name: name.to_string(),
                payload: payload.clone(),
            });
        }
        if let Some(hook) = &self.on_invoke {
            hook(self, name, &payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_assigns_sequential_ids() {
        let backend = MemoryBackend::new().with_sequential_ids("job");
        let a = backend.create_record("jobs", json!({"x": 1})).await.unwrap();
        let b = backend.create_record("jobs", json!({"x": 2})).await.unwrap();
        assert_eq!(a["id"], "job-1");
        assert_eq!(b["id"], "job-2");
        assert!(a.get("created_at").is_some());
        assert_eq!(backend.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_push_reaches_subscriber_until_released() {
        let backend = MemoryBackend::new().with_sequential_ids("job");
        backend.create_record("jobs", json!({"status": "pending"})).await.unwrap();

        let sub = backend
            .subscribe_to_row_updates("jobs", "job-1", RowEvent::Update)
            .await
            .unwrap();
        let (mut rx, mut handle) = sub.into_parts();

        assert_eq!(backend.push_update("jobs", "job-1", json!({"progress": 10})), 1);
        let row = rx.recv().await.unwrap();
        assert_eq!(row["progress"], 10);
        assert_eq!(row["status"], "pending");

        handle.unsubscribe();
        assert_eq!(backend.active_subscriptions(), 0);
        assert_eq!(backend.push_update("jobs", "job-1", json!({"progress": 20})), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_subscriptions_ends_stream() {
        let backend = MemoryBackend::new();
        let sub = backend
            .subscribe_to_row_updates("jobs", "j", RowEvent::Update)
            .await
            .unwrap();
        let (mut rx, handle) = sub.into_parts();

        assert_eq!(backend.close_subscriptions("jobs", "j"), 1);
        assert!(rx.recv().await.is_none());
        assert!(handle.is_active());
        drop(handle);
        assert_eq!(backend.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures_fire_once() {
        let backend = MemoryBackend::new();
        backend.fail_next_create("network timeout");
        let err = backend.create_record("jobs", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "network timeout");
        assert!(backend.create_record("jobs", json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_invoke_hook_runs() {
        let backend = MemoryBackend::new().on_invoke(|b, name, payload| {
            b.push_update("jobs", payload["jobId"].as_str().unwrap_or(""), json!({"seen": name}));
        });
        backend.invoke_function("generate-rams", json!({"jobId": "j"})).await.unwrap();
        assert_eq!(backend.row("jobs", "j").unwrap()["seen"], "generate-rams");
        assert_eq!(backend.invocations().len(), 1);
    }
}
