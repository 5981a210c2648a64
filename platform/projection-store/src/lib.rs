//! # Projection Store Abstraction
//!
//! A platform-level abstraction over a document-oriented store used for
//! read-model projections.
//!
//! ## Why This Lives in Tier 1
//!
//! Projection handlers are the bulk of a consumer service; keeping them
//! against a narrow store interface means the service module carries no
//! store-product dependency and every handler is testable against the
//! in-memory implementation.
//!
//! ## Model
//!
//! Documents are JSON objects grouped into named collections, created on
//! demand. The write vocabulary is deliberately small: exactly the three
//! primitives projection handlers need:
//!
//! - **upsert** (`update_one` with `upsert = true`): merge fields into the
//!   document matched by a filter, inserting it when absent;
//! - **positional array update**: mutate the first element of an embedded
//!   array matched by a filter predicate, addressed with a `$` path segment;
//! - **array push**: append an element to an embedded array.
//!
//! Filters are conjunctions of dotted-path equality predicates; a path that
//! traverses an array matches any element, and the index of the first match
//! is what a later `$` segment in an update path resolves to.

mod memory;

pub use memory::MemoryProjectionStore;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;

/// A stored document: a JSON object, keyed within its collection by domain
/// fields (the store also assigns an `_id` on insert).
pub type Document = Map<String, Value>;

/// Conjunction of dotted-path equality predicates.
///
/// # Example
/// ```rust
/// use projection_store::Filter;
/// use serde_json::json;
///
/// let filter = Filter::new()
///     .eq("loanAccountId", json!("ACC1"))
///     .eq("repaymentSchedule.payments.paymentNumber", json!(1));
/// assert_eq!(filter.clauses().len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality predicate on a dotted path.
    pub fn eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((path.into(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }
}

/// Update description applied by [`ProjectionStore::update_one`].
///
/// Sections mirror the operators projection handlers rely on:
/// `set` (dotted paths, `$` positional segment allowed), `set_on_insert`
/// (applied only when an upsert inserts), `push` (array append) and `inc`
/// (integer counters).
#[derive(Debug, Clone, Default)]
pub struct UpdateDocument {
    set: Vec<(String, Value)>,
    set_on_insert: Vec<(String, Value)>,
    push: Vec<(String, Value)>,
    inc: Vec<(String, i64)>,
}

impl UpdateDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field at a dotted path. A `$` segment addresses the array
    /// element matched by the filter.
    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((path.into(), value.into()));
        self
    }

    /// Set a field only when the update inserts a new document.
    pub fn set_on_insert(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_on_insert.push((path.into(), value.into()));
        self
    }

    /// Append a value to the array at a dotted path, creating it if absent.
    pub fn push(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push.push((path.into(), value.into()));
        self
    }

    /// Increment the integer at a dotted path, treating absence as 0.
    pub fn inc(mut self, path: impl Into<String>, by: i64) -> Self {
        self.inc.push((path.into(), by));
        self
    }

    pub fn set_entries(&self) -> &[(String, Value)] {
        &self.set
    }

    pub fn set_on_insert_entries(&self) -> &[(String, Value)] {
        &self.set_on_insert
    }

    pub fn push_entries(&self) -> &[(String, Value)] {
        &self.push
    }

    pub fn inc_entries(&self) -> &[(String, i64)] {
        &self.inc
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.set_on_insert.is_empty()
            && self.push.is_empty()
            && self.inc.is_empty()
    }
}

/// Outcome of an `update_one` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResult {
    /// Documents matched by the filter (0 or 1)
    pub matched_count: u64,
    /// Matched documents actually changed by the update
    pub modified_count: u64,
    /// `_id` of the document inserted by an upsert, when one was
    pub upserted_id: Option<String>,
}

/// Errors that can occur when using the projection store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("positional operator used without a matching array predicate: {0}")]
    PositionalWithoutMatch(String),

    #[error("path conflicts with existing value: {0}")]
    PathConflict(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type for projection store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Document store narrowed to the projection write/read vocabulary.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Return the first document in `collection` matching `filter`.
    async fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Option<Document>>;

    /// Insert a document, assigning an `_id` when absent; returns the id.
    async fn insert_one(&self, collection: &str, document: Document) -> StoreResult<String>;

    /// Apply `update` to the first document matching `filter`.
    ///
    /// With `upsert`, a non-matching filter inserts a new document seeded
    /// from the filter's plain equality paths, then `set_on_insert`, then
    /// the remaining sections.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateDocument,
        upsert: bool,
    ) -> StoreResult<UpdateResult>;
}

impl fmt::Debug for dyn ProjectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProjectionStore")
    }
}
