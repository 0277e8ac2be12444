use serde_json::Value;
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;

use crate::error::BackendError;

/// Which row writes a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowEvent {
    Insert,
    Update,
    Any,
}

impl RowEvent {
    /// Wire name used by the realtime protocol.
    pub fn as_str(&self) -> &str {
        match self {
            RowEvent::Insert => "INSERT",
            RowEvent::Update => "UPDATE",
            RowEvent::Any => "*",
        }
    }

    pub fn matches(&self, event: RowEvent) -> bool {
        *self == RowEvent::Any || *self == event
    }
}

/// Releases a live row subscription.
///
/// Releasing is idempotent and also happens when the handle is dropped,
/// so a subscription never outlives its owner.
pub struct SubscriptionHandle {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Stop receiving updates. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

/// A live stream of full-row snapshots for one row.
///
/// The stream ends once the handle is released.
#[derive(Debug)]
pub struct Subscription {
    pub updates: mpsc::UnboundedReceiver<Value>,
    pub handle: SubscriptionHandle,
}

impl Subscription {
    pub fn new(updates: mpsc::UnboundedReceiver<Value>, handle: SubscriptionHandle) -> Self {
        Self { updates, handle }
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<Value>, SubscriptionHandle) {
        (self.updates, self.handle)
    }
}

/// The persistence/notification service a coordinator talks to.
///
/// Every call is a single attempt; retries are the implementor's business.
///
/// # Example
///
/// ```ignore
/// struct Recording;
///
/// impl Backend for Recording {
///     async fn create_record(&self, _table: &str, mut fields: Value) -> Result<Value, BackendError> {
///         fields["id"] = "job-1".into();
///         Ok(fields)
///     }
///     // ...
/// }
/// ```
pub trait Backend: Send + Sync + 'static {
    /// Insert a row and return it with its assigned `id`.
    fn create_record(
        &self,
        table: &str,
        fields: Value,
    ) -> impl Future<Output = Result<Value, BackendError>> + Send;

    /// Patch the row with the given `id`.
    fn update_record(
        &self,
        table: &str,
        id: &str,
        fields: Value,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Start receiving full-row snapshots for writes to one row.
    fn subscribe_to_row_updates(
        &self,
        table: &str,
        id: &str,
        event: RowEvent,
    ) -> impl Future<Output = Result<Subscription, BackendError>> + Send;

    /// Trigger a remote function. Only the success of the invocation itself
    /// is reported, not the outcome of the work it starts.
    fn invoke_function(
        &self,
        name: &str,
        payload: Value,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// Extract a row's `id` as a string (string or numeric column).
pub fn record_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_handle_releases_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut handle = SubscriptionHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.is_active());
        handle.unsubscribe();
        handle.unsubscribe();
        drop(handle);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_releases_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        {
            let _handle = SubscriptionHandle::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_row_event_matching() {
        assert!(RowEvent::Any.matches(RowEvent::Insert));
        assert!(RowEvent::Update.matches(RowEvent::Update));
        assert!(!RowEvent::Update.matches(RowEvent::Insert));
        assert_eq!(RowEvent::Any.as_str(), "*");
    }

    #[test]
    fn test_record_id() {
        assert_eq!(record_id(&json!({"id": "job-1"})), Some("job-1".into()));
        assert_eq!(record_id(&json!({"id": 42})), Some("42".into()));
        assert_eq!(record_id(&json!({"id": ""})), None);
        assert_eq!(record_id(&json!({"name": "x"})), None);
    }
}
