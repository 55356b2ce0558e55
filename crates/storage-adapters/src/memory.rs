//! # In-memory document store
//!
//! Implements [`DocumentStore`] over concurrent maps with the same
//! optimistic-concurrency contract a managed document database offers:
//! versioned documents, precondition-checked commits and size-limited
//! batches. Commits serialize on a single lock, so every commit is atomic
//! with respect to every other commit.
//!
//! The fault plan lets tests force conflicts, failing reads and failing
//! batches without a real backend.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::DateTime;
use dashmap::DashMap;
use domains::{lookup, Direction, Document, DocumentStore, Precondition, Query, Record, StoreError, Write};
use serde_json::Value;
use tokio::sync::Mutex;

/// The ceiling most managed document stores put on one commit.
pub const DEFAULT_MAX_BATCH_WRITES: usize = 500;

#[derive(Default)]
struct FaultPlan {
    /// Number of upcoming transactional commits to reject as conflicts.
    conflicts: usize,
    failing_reads: HashSet<(String, String)>,
    /// 1-based ordinals (counted over the store's lifetime) of batch commits that fail.
    failing_batches: HashSet<usize>,
}

pub struct InMemoryDocumentStore {
    collections: DashMap<String, BTreeMap<String, Document>>,
    versions: AtomicU64,
    commit_lock: Mutex<()>,
    max_batch_writes: usize,
    faults: StdMutex<FaultPlan>,
    commits: AtomicUsize,
    batch_calls: AtomicUsize,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::with_batch_limit(DEFAULT_MAX_BATCH_WRITES)
    }

    pub fn with_batch_limit(max_batch_writes: usize) -> Self {
        Self {
            collections: DashMap::new(),
            versions: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
            max_batch_writes,
            faults: StdMutex::new(FaultPlan::default()),
            commits: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
        }
    }

    /// Seeds a record directly, bypassing fault injection and counters.
    pub async fn put<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let write = Write::set(record)?;
        let _guard = self.commit_lock.lock().await;
        self.apply(write);
        Ok(())
    }

    /// Decodes every document in a collection, ordered by id.
    pub fn all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        self.documents(R::COLLECTION).iter().map(|d| d.decode()).collect()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Successful transactional commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(AtomicOrdering::SeqCst)
    }

    /// Batch commits attempted so far, including failed ones.
    pub fn batch_commit_count(&self) -> usize {
        self.batch_calls.load(AtomicOrdering::SeqCst)
    }

    /// Rejects the next `n` transactional commits with `StoreError::Conflict`.
    pub fn inject_conflicts(&self, n: usize) {
        self.with_faults(|f| f.conflicts += n);
    }

    /// Makes every read of `collection/id` fail with `StoreError::Unavailable`.
    pub fn fail_reads_of(&self, collection: &str, id: &str) {
        self.with_faults(|f| {
            f.failing_reads.insert((collection.to_string(), id.to_string()));
        });
    }

    /// Makes the `nth` batch commit from now (1-based) fail.
    pub fn fail_batch_commit(&self, nth: usize) {
        let ordinal = self.batch_commit_count() + nth;
        self.with_faults(|f| {
            f.failing_batches.insert(ordinal);
        });
    }

    fn with_faults<T>(&self, f: impl FnOnce(&mut FaultPlan) -> T) -> T {
        let mut plan = self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut plan)
    }

    fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    fn current_version(&self, collection: &str, id: &str) -> Option<u64> {
        self.collections.get(collection).and_then(|c| c.get(id).map(|d| d.version))
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, AtomicOrdering::SeqCst) + 1
    }

    /// Caller must hold `commit_lock`.
    fn apply(&self, write: Write) {
        let version = self.next_version();
        match write {
            Write::Set { collection, id, data } => {
                self.collections
                    .entry(collection)
                    .or_default()
                    .insert(id.clone(), Document { id, version, data });
            }
            Write::Merge { collection, id, fields } => {
                let mut docs = self.collections.entry(collection).or_default();
                let doc = docs.entry(id.clone()).or_insert_with(|| Document {
                    id,
                    version,
                    data: Value::Object(Default::default()),
                });
                if let Value::Object(body) = &mut doc.data {
                    body.extend(fields);
                } else {
                    doc.data = Value::Object(fields);
                }
                doc.version = version;
            }
            Write::Delete { collection, id } => {
                if let Some(mut docs) = self.collections.get_mut(&collection) {
                    docs.remove(&id);
                }
            }
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let failing = self.with_faults(|f| {
            f.failing_reads.contains(&(collection.to_string(), id.to_string()))
        });
        if failing {
            return Err(StoreError::Unavailable(format!("read of {collection}/{id} failed")));
        }
        Ok(self.collections.get(collection).and_then(|c| c.get(id).cloned()))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let mut docs: Vec<Document> = self
            .documents(&query.collection)
            .into_iter()
            .filter(|d| query.matches(&d.data))
            .collect();

        if let Some((field, direction)) = &query.order_by {
            docs.sort_by(|a, b| {
                let ord = compare_values(lookup(&a.data, field), lookup(&b.data, field))
                    .then_with(|| a.id.cmp(&b.id));
                match direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }

        if let Some(cursor) = &query.start_after {
            docs = match &query.order_by {
                // Documents are id-ordered, so the cursor need not still exist.
                None => docs.into_iter().filter(|d| d.id > *cursor).collect(),
                Some(_) => match docs.iter().position(|d| d.id == *cursor) {
                    Some(pos) => docs.split_off(pos + 1),
                    None => Vec::new(),
                },
            };
        }

        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    async fn commit(
        &self,
        preconditions: Vec<Precondition>,
        writes: Vec<Write>,
    ) -> Result<(), StoreError> {
        if writes.len() > self.max_batch_writes {
            return Err(StoreError::BatchTooLarge { ops: writes.len(), limit: self.max_batch_writes });
        }

        let _guard = self.commit_lock.lock().await;

        let injected = self.with_faults(|f| {
            if f.conflicts > 0 {
                f.conflicts -= 1;
                true
            } else {
                false
            }
        });
        if injected {
            let target = preconditions.first();
            tracing::debug!("injected commit conflict");
            return Err(StoreError::Conflict {
                collection: target.map(|p| p.collection.clone()).unwrap_or_default(),
                id: target.map(|p| p.id.clone()).unwrap_or_default(),
            });
        }

        for pre in &preconditions {
            if self.current_version(&pre.collection, &pre.id) != pre.expected_version {
                return Err(StoreError::Conflict {
                    collection: pre.collection.clone(),
                    id: pre.id.clone(),
                });
            }
        }

        for write in writes {
            self.apply(write);
        }
        self.commits.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn commit_batch(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let ordinal = self.batch_calls.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        if writes.len() > self.max_batch_writes {
            return Err(StoreError::BatchTooLarge { ops: writes.len(), limit: self.max_batch_writes });
        }
        if self.with_faults(|f| f.failing_batches.remove(&ordinal)) {
            return Err(StoreError::Unavailable(format!("batch commit #{ordinal} failed")));
        }

        let _guard = self.commit_lock.lock().await;
        for write in writes {
            self.apply(write);
        }
        Ok(())
    }

    fn max_batch_writes(&self) -> usize {
        self.max_batch_writes
    }
}

/// Orders field values the way a document store sorts mixed JSON:
/// missing < null < bool < number < string. Strings that parse as RFC 3339
/// timestamps compare chronologically.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            (Value::Number(x), Value::Number(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
            (Value::String(x), Value::String(y)) => {
                match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                    (Ok(dx), Ok(dy)) => dx.cmp(&dy),
                    _ => x.cmp(y),
                }
            }
            _ => rank(a).cmp(&rank(b)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(collection: &str, id: &str, data: Value) -> Write {
        Write::Set { collection: collection.into(), id: id.into(), data }
    }

    #[tokio::test]
    async fn test_stale_precondition_is_a_conflict() {
        let store = InMemoryDocumentStore::new();
        store.commit_batch(vec![set("posts", "p1", json!({ "n": 1 }))]).await.unwrap();
        let seen = store.get("posts", "p1").await.unwrap().unwrap();

        store.commit_batch(vec![set("posts", "p1", json!({ "n": 2 }))]).await.unwrap();

        let err = store
            .commit(
                vec![Precondition {
                    collection: "posts".into(),
                    id: "p1".into(),
                    expected_version: Some(seen.version),
                }],
                vec![set("posts", "p1", json!({ "n": 3 }))],
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        let doc = store.get("posts", "p1").await.unwrap().unwrap();
        assert_eq!(doc.data["n"], json!(2));
    }

    #[tokio::test]
    async fn test_missing_precondition_detects_concurrent_create() {
        let store = InMemoryDocumentStore::new();
        store.commit_batch(vec![set("votes", "v1", json!({}))]).await.unwrap();
        let result = store
            .commit(
                vec![Precondition { collection: "votes".into(), id: "v1".into(), expected_version: None }],
                vec![set("votes", "v1", json!({ "x": 1 }))],
            )
            .await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_merge_keeps_unlisted_fields() {
        let store = InMemoryDocumentStore::new();
        store
            .commit_batch(vec![set("posts", "p1", json!({ "title": "t", "stats": { "upvotes": 0 } }))])
            .await
            .unwrap();
        let merge = Write::merge("posts", "p1", json!({ "stats": { "upvotes": 1 } })).unwrap();
        store.commit(Vec::new(), vec![merge]).await.unwrap();

        let doc = store.get("posts", "p1").await.unwrap().unwrap();
        assert_eq!(doc.data["title"], json!("t"));
        assert_eq!(doc.data["stats"]["upvotes"], json!(1));
    }

    #[tokio::test]
    async fn test_query_orders_filters_and_pages() {
        let store = InMemoryDocumentStore::new();
        store
            .commit_batch(vec![
                set("comments", "a", json!({ "postId": "p1", "createdAt": "2024-05-01T10:00:00.5Z" })),
                set("comments", "b", json!({ "postId": "p1", "createdAt": "2024-05-01T10:00:00Z" })),
                set("comments", "c", json!({ "postId": "p2", "createdAt": "2024-05-01T09:00:00Z" })),
                set("comments", "d", json!({ "postId": "p1", "createdAt": "2024-05-01T11:00:00Z" })),
            ])
            .await
            .unwrap();

        let q = Query::collection("comments")
            .where_eq("postId", "p1")
            .order_by("createdAt", Direction::Ascending);
        let ids: Vec<_> = store.query(&q).await.unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["b", "a", "d"]);

        let page = store.query(&q.clone().limit(1).start_after(Some("a".into()))).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "d");
    }

    #[tokio::test]
    async fn test_batch_over_limit_is_rejected() {
        let store = InMemoryDocumentStore::with_batch_limit(2);
        let writes = (0..3).map(|i| set("n", &i.to_string(), json!({}))).collect();
        let err = store.commit_batch(writes).await.unwrap_err();
        assert_eq!(err, StoreError::BatchTooLarge { ops: 3, limit: 2 });
        assert!(store.is_empty("n"));
    }

    #[tokio::test]
    async fn test_fault_plan_fails_only_the_scheduled_batch() {
        let store = InMemoryDocumentStore::new();
        store.fail_batch_commit(2);
        tokio_test::assert_ok!(store.commit_batch(vec![set("n", "1", json!({}))]).await);
        tokio_test::assert_err!(store.commit_batch(vec![set("n", "2", json!({}))]).await);
        tokio_test::assert_ok!(store.commit_batch(vec![set("n", "3", json!({}))]).await);
        assert_eq!(store.len("n"), 2);
        assert_eq!(store.batch_commit_count(), 3);
    }
}
