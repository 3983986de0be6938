//! Document store adapter
//!
//! The template and snapshot stores persist through this trait. Backends
//! only need single-document atomicity: filters match on top-level field
//! equality and an update touches one document as a unit.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Field name holding a document's generated identifier
pub const ID_FIELD: &str = "_id";

/// Document store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Duplicate key in {collection}: {key}")]
    DuplicateKey { collection: String, key: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed document in {collection}: {reason}")]
    Malformed { collection: String, reason: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Equality filter over top-level document fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter(Map<String, Value>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field == value`
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn matches(&self, doc: &Value) -> bool {
        doc.as_object().is_some_and(|fields| self.matches_fields(fields))
    }

    fn matches_fields(&self, doc: &Map<String, Value>) -> bool {
        self.0
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }
}

/// A single-document update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    set: Map<String, Value>,
    inc: Vec<(String, i64)>,
    add_to_set: Vec<(String, Value)>,
    pull: Vec<(String, Value)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    pub fn inc(mut self, field: impl Into<String>, by: i64) -> Self {
        self.inc.push((field.into(), by));
        self
    }

    /// Append `value` to the array at `field` unless already present
    pub fn add_to_set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.add_to_set.push((field.into(), value.into()));
        self
    }

    /// Remove every occurrence of `value` from the array at `field`
    pub fn pull(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.pull.push((field.into(), value.into()));
        self
    }

    fn apply(&self, doc: &mut Map<String, Value>) {
        for (field, value) in &self.set {
            doc.insert(field.clone(), value.clone());
        }
        for (field, by) in &self.inc {
            let current = doc.get(field).and_then(Value::as_i64).unwrap_or(0);
            doc.insert(field.clone(), Value::from(current + by));
        }
        for (field, value) in &self.add_to_set {
            let slot = doc
                .entry(field.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let Value::Array(items) = slot {
                if !items.contains(value) {
                    items.push(value.clone());
                }
            }
        }
        for (field, value) in &self.pull {
            if let Some(Value::Array(items)) = doc.get_mut(field) {
                items.retain(|item| item != value);
            }
        }
    }
}

/// Generic document store over named collections.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reject future inserts whose values for `fields` collide with an existing document.
    async fn ensure_unique_index(&self, collection: &str, fields: &[&str]) -> StoreResult<()>;

    async fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Option<Value>>;

    async fn find_many(&self, collection: &str, filter: &Filter) -> StoreResult<Vec<Value>>;

    /// Insert a document, returning its `_id` (generated when absent).
    async fn insert_one(&self, collection: &str, doc: Value) -> StoreResult<String>;

    /// Update the first matching document. Returns the number matched (0 or 1).
    async fn update_one(&self, collection: &str, filter: &Filter, update: &Update)
        -> StoreResult<u64>;

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> StoreResult<u64>;

    /// Update the first match, or insert `filter` fields plus `update` when none match.
    async fn upsert(&self, collection: &str, filter: &Filter, update: &Update) -> StoreResult<()>;

    /// Atomically add `by` to an integer field and return the new value.
    async fn increment(
        &self,
        collection: &str,
        filter: &Filter,
        field: &str,
        by: i64,
    ) -> StoreResult<Option<i64>>;
}

// ── MemoryDocumentStore ──

#[derive(Default)]
struct Collection {
    docs: Vec<Map<String, Value>>,
    unique: Vec<Vec<String>>,
}

impl Collection {
    fn index_key(fields: &[String], doc: &Map<String, Value>) -> Option<String> {
        let parts: Option<Vec<String>> = fields
            .iter()
            .map(|f| doc.get(f).map(|v| v.to_string()))
            .collect();
        parts.map(|p| p.join("|"))
    }

    /// Find a unique-index violation `doc` would cause, skipping the document at `skip`.
    fn violation(&self, doc: &Map<String, Value>, skip: Option<usize>) -> Option<String> {
        for fields in &self.unique {
            let Some(key) = Self::index_key(fields, doc) else {
                continue;
            };
            let clash = self.docs.iter().enumerate().any(|(i, other)| {
                Some(i) != skip && Self::index_key(fields, other).as_deref() == Some(key.as_str())
            });
            if clash {
                return Some(key);
            }
        }
        None
    }
}

/// In-memory DocumentStore for testing and single-process deployments.
pub struct MemoryDocumentStore {
    inner: RwLock<HashMap<String, Collection>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
        StoreError::Unavailable(format!("Lock: {}", e))
    }

    fn as_object(collection: &str, doc: Value) -> StoreResult<Map<String, Value>> {
        match doc {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::Malformed {
                collection: collection.to_string(),
                reason: format!("expected an object, got {}", other),
            }),
        }
    }

    fn update_matching(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        limit: Option<usize>,
    ) -> StoreResult<u64> {
        let mut store = self.inner.write().map_err(Self::poisoned)?;
        let coll = store.entry(collection.to_string()).or_default();

        let targets: Vec<usize> = coll
            .docs
            .iter()
            .enumerate()
            .filter(|(_, doc)| filter.matches_fields(doc))
            .map(|(i, _)| i)
            .take(limit.unwrap_or(usize::MAX))
            .collect();

        // Validate every change before applying any of them.
        let mut staged = Vec::with_capacity(targets.len());
        for &i in &targets {
            let mut doc = coll.docs[i].clone();
            update.apply(&mut doc);
            if let Some(key) = coll.violation(&doc, Some(i)) {
                return Err(StoreError::DuplicateKey {
                    collection: collection.to_string(),
                    key,
                });
            }
            staged.push((i, doc));
        }

        let matched = staged.len() as u64;
        for (i, doc) in staged {
            coll.docs[i] = doc;
        }
        Ok(matched)
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn ensure_unique_index(&self, collection: &str, fields: &[&str]) -> StoreResult<()> {
        let mut store = self.inner.write().map_err(Self::poisoned)?;
        let coll = store.entry(collection.to_string()).or_default();
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        if !coll.unique.contains(&fields) {
            coll.unique.push(fields);
        }
        Ok(())
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Option<Value>> {
        let store = self.inner.read().map_err(Self::poisoned)?;
        Ok(store.get(collection).and_then(|coll| {
            coll.docs
                .iter()
                .find(|doc| filter.matches_fields(doc))
                .map(|doc| Value::Object(doc.clone()))
        }))
    }

    async fn find_many(&self, collection: &str, filter: &Filter) -> StoreResult<Vec<Value>> {
        let store = self.inner.read().map_err(Self::poisoned)?;
        Ok(store
            .get(collection)
            .map(|coll| {
                coll.docs
                    .iter()
                    .filter(|doc| filter.matches_fields(doc))
                    .map(|doc| Value::Object(doc.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_one(&self, collection: &str, doc: Value) -> StoreResult<String> {
        let mut doc = Self::as_object(collection, doc)?;
        let id = match doc.get(ID_FIELD).and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                id
            }
        };

        let mut store = self.inner.write().map_err(Self::poisoned)?;
        let coll = store.entry(collection.to_string()).or_default();

        let id_taken = coll
            .docs
            .iter()
            .any(|d| d.get(ID_FIELD).and_then(Value::as_str) == Some(id.as_str()));
        let violation = if id_taken {
            Some(id.clone())
        } else {
            coll.violation(&doc, None)
        };
        if let Some(key) = violation {
            return Err(StoreError::DuplicateKey {
                collection: collection.to_string(),
                key,
            });
        }

        coll.docs.push(doc);
        Ok(id)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> StoreResult<u64> {
        self.update_matching(collection, filter, update, Some(1))
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> StoreResult<u64> {
        self.update_matching(collection, filter, update, None)
    }

    async fn upsert(&self, collection: &str, filter: &Filter, update: &Update) -> StoreResult<()> {
        // Held across check and insert so two upserts cannot both insert.
        let mut store = self.inner.write().map_err(Self::poisoned)?;
        let coll = store.entry(collection.to_string()).or_default();

        match coll
            .docs
            .iter()
            .position(|doc| filter.matches_fields(doc))
        {
            Some(i) => {
                let mut doc = coll.docs[i].clone();
                update.apply(&mut doc);
                if let Some(key) = coll.violation(&doc, Some(i)) {
                    return Err(StoreError::DuplicateKey {
                        collection: collection.to_string(),
                        key,
                    });
                }
                coll.docs[i] = doc;
            }
            None => {
                let mut doc = filter.0.clone();
                doc.insert(
                    ID_FIELD.to_string(),
                    Value::String(uuid::Uuid::new_v4().to_string()),
                );
                update.apply(&mut doc);
                if let Some(key) = coll.violation(&doc, None) {
                    return Err(StoreError::DuplicateKey {
                        collection: collection.to_string(),
                        key,
                    });
                }
                coll.docs.push(doc);
            }
        }
        Ok(())
    }

    async fn increment(
        &self,
        collection: &str,
        filter: &Filter,
        field: &str,
        by: i64,
    ) -> StoreResult<Option<i64>> {
        let mut store = self.inner.write().map_err(Self::poisoned)?;
        let Some(coll) = store.get_mut(collection) else {
            return Ok(None);
        };
        let Some(doc) = coll
            .docs
            .iter_mut()
            .find(|doc| filter.matches_fields(doc))
        else {
            return Ok(None);
        };
        let next = doc.get(field).and_then(Value::as_i64).unwrap_or(0) + by;
        doc.insert(field.to_string(), Value::from(next));
        Ok(Some(next))
    }
}
