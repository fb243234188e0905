//! In-process remote store with fault injection

use super::{split_path, Document, RemoteError, RemoteErrorCode, RemoteResult, RemoteStore};
use crate::protocol::ChangeEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use trek_common::Clock;

/// Field the server stamps on every write
pub const SERVER_TIMESTAMP_FIELD: &str = "lastSyncedAt";

#[derive(Default)]
struct RemoteState {
    docs: BTreeMap<String, Document>,
    writes: HashMap<String, usize>,
    calls: usize,
    unreachable: bool,
    failures: VecDeque<RemoteErrorCode>,
    latency: Option<Duration>,
    subscribers: Vec<(String, mpsc::UnboundedSender<ChangeEvent>)>,
}

impl RemoteState {
    fn notify(&mut self, collection: &str, event: ChangeEvent) {
        self.subscribers.retain(|(watched, tx)| {
            if watched != collection {
                return true;
            }
            tx.send(event.clone()).is_ok()
        });
    }
}

/// Remote document store living in memory.
///
/// Behaves like the hosted store for merge writes, server timestamps and
/// change feeds, and lets tests script outages and failures.
#[derive(Default)]
pub struct MemoryRemoteStore {
    state: Mutex<RemoteState>,
    server_clock: Clock,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every call fails with `Unavailable` while unreachable
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Fail the next `times` calls with `code`
    pub fn fail_next(&self, code: RemoteErrorCode, times: usize) {
        let mut state = self.lock();
        for _ in 0..times {
            state.failures.push_back(code);
        }
    }

    /// Delay every call by `latency` before it takes effect
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    pub fn document(&self, path: &str) -> Option<Document> {
        self.lock().docs.get(path).cloned()
    }

    /// Documents directly inside `collection`
    pub fn documents_in(&self, collection: &str) -> Vec<(String, Document)> {
        self.lock()
            .docs
            .iter()
            .filter(|(path, _)| split_path(path).0 == collection)
            .map(|(path, doc)| (split_path(path).1.to_string(), doc.clone()))
            .collect()
    }

    pub fn write_count(&self, path: &str) -> usize {
        self.lock().writes.get(path).copied().unwrap_or(0)
    }

    pub fn total_writes(&self) -> usize {
        self.lock().writes.values().sum()
    }

    /// Remote calls attempted so far, including failed ones
    pub fn call_count(&self) -> usize {
        self.lock().calls
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state.subscribers.len()
    }

    /// Replace a document as another client would, notifying watchers.
    /// Bypasses fault injection and call counting.
    pub fn put_raw(&self, path: &str, doc: Document) {
        let mut state = self.lock();
        let existed = state.docs.insert(path.to_string(), doc.clone()).is_some();
        let (collection, id) = split_path(path);
        let event = if existed {
            ChangeEvent::modified(id, doc)
        } else {
            ChangeEvent::added(id, doc)
        };
        state.notify(collection, event);
    }

    /// Delete a document as another client would, notifying watchers
    pub fn remove_raw(&self, path: &str) -> bool {
        let mut state = self.lock();
        let removed = state.docs.remove(path);
        let (collection, id) = split_path(path);
        match removed {
            Some(doc) => {
                state.notify(collection, ChangeEvent::removed(id, Some(doc)));
                true
            }
            None => false,
        }
    }

    async fn enter(&self) -> RemoteResult<()> {
        let latency = self.lock().latency;
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.calls += 1;
        if state.unreachable {
            return Err(RemoteError::new(
                RemoteErrorCode::Unavailable,
                "remote store unreachable",
            ));
        }
        if let Some(code) = state.failures.pop_front() {
            return Err(RemoteError::new(code, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, path: &str) -> RemoteResult<Option<Document>> {
        self.enter().await?;
        Ok(self.lock().docs.get(path).cloned())
    }

    async fn set_merge(&self, path: &str, doc: Document) -> RemoteResult<DateTime<Utc>> {
        self.enter().await?;

        let committed_at = self.server_clock.tick();
        let stamp = serde_json::to_value(committed_at)
            .map_err(|e| RemoteError::new(RemoteErrorCode::Internal, e.to_string()))?;

        let mut state = self.lock();
        let existed = state.docs.contains_key(path);
        let stored = state.docs.entry(path.to_string()).or_default();
        for (field, value) in doc {
            if value.is_null() {
                stored.remove(&field);
            } else {
                stored.insert(field, value);
            }
        }
        stored.insert(SERVER_TIMESTAMP_FIELD.to_string(), stamp);
        let snapshot = stored.clone();
        *state.writes.entry(path.to_string()).or_insert(0) += 1;

        let (collection, id) = split_path(path);
        let event = if existed {
            ChangeEvent::modified(id, snapshot)
        } else {
            ChangeEvent::added(id, snapshot)
        };
        state.notify(collection, event);

        Ok(committed_at)
    }

    async fn delete(&self, path: &str) -> RemoteResult<()> {
        self.enter().await?;

        let mut state = self.lock();
        let removed = state
            .docs
            .remove(path)
            .ok_or_else(|| RemoteError::not_found(path))?;
        *state.writes.entry(path.to_string()).or_insert(0) += 1;

        let (collection, id) = split_path(path);
        state.notify(collection, ChangeEvent::removed(id, Some(removed)));
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> RemoteResult<Vec<(String, Document)>> {
        self.enter().await?;
        Ok(self
            .documents_in(collection)
            .into_iter()
            .filter(|(_, doc)| doc.get(field) == Some(value))
            .collect())
    }

    async fn list(&self, collection: &str) -> RemoteResult<Vec<(String, Document)>> {
        self.enter().await?;
        Ok(self.documents_in(collection))
    }

    async fn subscribe(
        &self,
        collection: &str,
    ) -> RemoteResult<mpsc::UnboundedReceiver<ChangeEvent>> {
        self.enter().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        for (path, doc) in &state.docs {
            let (parent, id) = split_path(path);
            if parent == collection {
                // receiver is held locally, send cannot fail
                let _ = tx.send(ChangeEvent::added(id, doc.clone()));
            }
        }
        state.subscribers.push((collection.to_string(), tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChangeKind;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_set_merge_keeps_unspecified_fields() {
        let remote = MemoryRemoteStore::new();
        remote
            .set_merge("trips/t1", doc(json!({"name": "A", "extra": 1})))
            .await
            .unwrap();
        remote
            .set_merge("trips/t1", doc(json!({"name": "B"})))
            .await
            .unwrap();

        let stored = remote.document("trips/t1").unwrap();
        assert_eq!(stored["name"], json!("B"));
        assert_eq!(stored["extra"], json!(1));
        assert!(stored.contains_key(SERVER_TIMESTAMP_FIELD));
        assert_eq!(remote.write_count("trips/t1"), 2);
    }

    #[tokio::test]
    async fn test_set_merge_null_deletes_field() {
        let remote = MemoryRemoteStore::new();
        remote
            .set_merge("families/f1", doc(json!({"shareCode": "ABC123", "name": "Smiths"})))
            .await
            .unwrap();
        remote
            .set_merge("families/f1", doc(json!({"shareCode": null})))
            .await
            .unwrap();

        let stored = remote.document("families/f1").unwrap();
        assert!(!stored.contains_key("shareCode"));
        assert_eq!(stored["name"], json!("Smiths"));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let remote = MemoryRemoteStore::new();
        let err = remote.delete("trips/nope").await.unwrap_err();
        assert_eq!(err.code, RemoteErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let remote = MemoryRemoteStore::new();
        remote.fail_next(RemoteErrorCode::ResourceExhausted, 1);
        let err = remote.get("trips/t1").await.unwrap_err();
        assert_eq!(err.code, RemoteErrorCode::ResourceExhausted);
        assert!(remote.get("trips/t1").await.unwrap().is_none());

        remote.set_reachable(false);
        let err = remote.get("trips/t1").await.unwrap_err();
        assert_eq!(err.code, RemoteErrorCode::Unavailable);
        assert_eq!(remote.call_count(), 3);
    }

    #[tokio::test]
    async fn test_subscription_replays_then_streams() {
        let remote = MemoryRemoteStore::new();
        remote.put_raw("families/f1/members/u1", doc(json!({"role": "captain"})));

        let mut rx = remote.subscribe("families/f1/members").await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, ChangeKind::Added);
        assert_eq!(first.doc_id, "u1");

        remote.remove_raw("families/f1/members/u1");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, ChangeKind::Removed);

        // other collections are not delivered
        remote.put_raw("families/f2/members/u9", doc(json!({})));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_query_by_field() {
        let remote = MemoryRemoteStore::new();
        remote.put_raw("trips/a", doc(json!({"userId": "u1"})));
        remote.put_raw("trips/b", doc(json!({"userId": "u2"})));
        remote.put_raw("games/c", doc(json!({"userId": "u1"})));

        let found = remote.query("trips", "userId", &json!("u1")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "a");
    }
}
