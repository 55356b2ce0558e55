//! # Core Traits (Ports)
//!
//! The document-store contract every storage adapter implements, plus the
//! store-agnostic query, write and transaction types built on top of it.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::StoreError;

/// A typed entity persisted in a named collection.
pub trait Record: Serialize + DeserializeOwned {
    const COLLECTION: &'static str;

    fn doc_id(&self) -> String;
}

/// A stored document together with its optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    /// Bumped on every write. Never reused for the same id while it exists.
    pub version: u64,
    pub data: Value,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Resolves a dotted field path (`content.sourceId`) inside a document body.
pub fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |current, key| current.get(key))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Equality predicate on a field path.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
    /// Pagination cursor: resume after the document with this id.
    pub start_after: Option<String>,
}

impl Query {
    pub fn collection(name: &str) -> Self {
        Self {
            collection: name.to_string(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
            start_after: None,
        }
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter { field: field.to_string(), value: value.into() });
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some((field.to_string(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, cursor: Option<String>) -> Self {
        self.start_after = cursor;
        self
    }

    /// True when every filter matches the document body.
    pub fn matches(&self, data: &Value) -> bool {
        self.filters
            .iter()
            .all(|f| lookup(data, &f.field).is_some_and(|v| *v == f.value))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Replace the whole document, creating it if absent.
    Set { collection: String, id: String, data: Value },
    /// Overwrite the listed top-level fields, creating the document if absent.
    Merge { collection: String, id: String, fields: Map<String, Value> },
    Delete { collection: String, id: String },
}

impl Write {
    pub fn set<R: Record>(record: &R) -> Result<Self, StoreError> {
        Ok(Write::Set {
            collection: R::COLLECTION.to_string(),
            id: record.doc_id(),
            data: serde_json::to_value(record)?,
        })
    }

    /// `fields` must serialize to a JSON object.
    pub fn merge(collection: &str, id: &str, fields: Value) -> Result<Self, StoreError> {
        match fields {
            Value::Object(fields) => Ok(Write::Merge {
                collection: collection.to_string(),
                id: id.to_string(),
                fields,
            }),
            other => Err(StoreError::Serialization(format!(
                "merge payload must be an object, got {other}"
            ))),
        }
    }

    pub fn delete(collection: &str, id: &str) -> Self {
        Write::Delete { collection: collection.to_string(), id: id.to_string() }
    }

    pub fn collection(&self) -> &str {
        match self {
            Write::Set { collection, .. }
            | Write::Merge { collection, .. }
            | Write::Delete { collection, .. } => collection,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Write::Set { id, .. } | Write::Merge { id, .. } | Write::Delete { id, .. } => id,
        }
    }
}

/// What a transactional commit requires of a document it previously read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub collection: String,
    pub id: String,
    /// `None` means the document must still not exist.
    pub expected_version: Option<u64>,
}

/// Data persistence contract for a schemaless document store.
///
/// Implementations must apply `commit` atomically: either every precondition
/// holds and every write lands, or nothing changes and `StoreError::Conflict`
/// is returned.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Atomic, precondition-checked commit used by transactions.
    async fn commit(
        &self,
        preconditions: Vec<Precondition>,
        writes: Vec<Write>,
    ) -> Result<(), StoreError>;

    /// Atomic batch without preconditions. Fails with `BatchTooLarge` above
    /// `max_batch_writes()`.
    async fn commit_batch(&self, writes: Vec<Write>) -> Result<(), StoreError>;

    /// Backend ceiling on writes per commit.
    fn max_batch_writes(&self) -> usize;
}

/// Optimistic read-modify-write unit.
///
/// Reads go straight to the store and remember the version they observed.
/// Writes are buffered and submitted together with those versions on
/// [`Transaction::commit`]. A concurrent writer turns the commit into
/// `StoreError::Conflict`, and the caller reruns the whole body.
pub struct Transaction<'a> {
    store: &'a dyn DocumentStore,
    seen: HashSet<(String, String)>,
    preconditions: Vec<Precondition>,
    writes: Vec<Write>,
}

impl<'a> Transaction<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self { store, seen: HashSet::new(), preconditions: Vec::new(), writes: Vec::new() }
    }

    pub async fn get(&mut self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let doc = self.store.get(collection, id).await?;
        if self.seen.insert((collection.to_string(), id.to_string())) {
            self.preconditions.push(Precondition {
                collection: collection.to_string(),
                id: id.to_string(),
                expected_version: doc.as_ref().map(|d| d.version),
            });
        }
        Ok(doc)
    }

    pub async fn get_record<R: Record>(&mut self, id: &str) -> Result<Option<R>, StoreError> {
        match self.get(R::COLLECTION, id).await? {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }

    pub fn set<R: Record>(&mut self, record: &R) -> Result<(), StoreError> {
        self.writes.push(Write::set(record)?);
        Ok(())
    }

    pub fn merge(&mut self, collection: &str, id: &str, fields: Value) -> Result<(), StoreError> {
        self.writes.push(Write::merge(collection, id, fields)?);
        Ok(())
    }

    pub fn delete(&mut self, collection: &str, id: &str) {
        self.writes.push(Write::delete(collection, id));
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.store.commit(self.preconditions, self.writes).await
    }
}
