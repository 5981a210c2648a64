//! In-memory implementation of the ProjectionStore trait for testing and development

use crate::{
    Document, Filter, ProjectionStore, StoreError, StoreResult, UpdateDocument, UpdateResult,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Array path → index of the first element matched by the filter.
///
/// Produced while matching a filter and consumed by `$` segments in update
/// paths.
type ArrayPositions = HashMap<String, usize>;

/// ProjectionStore implementation backed by process memory
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that assert on projected state
///
/// Collections are created on demand. Documents keep insertion order, so
/// `find_one`/`update_one` resolve ties deterministically.
#[derive(Clone, Default)]
pub struct MemoryProjectionStore {
    collections: Arc<Mutex<HashMap<String, Vec<Value>>>>,
}

impl MemoryProjectionStore {
    /// Create a new, empty in-memory projection store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Vec<Value>>>> {
        self.collections
            .lock()
            .map_err(|_| StoreError::Backend("projection store lock poisoned".to_string()))
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Match one equality clause against a value, descending dotted-path
/// segments. An array anywhere on the path matches any element; the index
/// of the first matching element is recorded under the array's own path.
fn clause_matches(
    current: &Value,
    segs: &[&str],
    target: &Value,
    path_so_far: &mut Vec<String>,
    positions: &mut ArrayPositions,
) -> bool {
    let Some((seg, rest)) = segs.split_first() else {
        return values_equal(current, target)
            || matches!(current, Value::Array(items) if items.iter().any(|i| values_equal(i, target)));
    };

    match current {
        Value::Object(map) => match map.get(*seg) {
            Some(next) => {
                path_so_far.push((*seg).to_string());
                let matched = clause_matches(next, rest, target, path_so_far, positions);
                path_so_far.pop();
                matched
            }
            None => false,
        },
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                if clause_matches(item, segs, target, path_so_far, positions) {
                    positions.entry(path_so_far.join(".")).or_insert(i);
                    return true;
                }
            }
            false
        }
        _ => false,
    }
}

/// Match a whole filter, returning the array positions its clauses pinned.
fn document_matches(doc: &Value, filter: &Filter) -> Option<ArrayPositions> {
    let mut positions = ArrayPositions::new();
    for (path, target) in filter.clauses() {
        let segs: Vec<&str> = path.split('.').collect();
        let mut path_so_far = Vec::new();
        if !clause_matches(doc, &segs, target, &mut path_so_far, &mut positions) {
            return None;
        }
    }
    Some(positions)
}

/// Descend to the value holding the final path segment, creating
/// intermediate objects and resolving `$` segments along the way.
fn navigate<'a>(
    root: &'a mut Value,
    init: &[&str],
    positions: &ArrayPositions,
    full_path: &str,
) -> StoreResult<&'a mut Value> {
    let mut current = root;
    let mut consumed: Vec<&str> = Vec::new();
    for seg in init.iter().copied() {
        current = if seg == "$" {
            let key = consumed.join(".");
            let idx = *positions
                .get(&key)
                .ok_or_else(|| StoreError::PositionalWithoutMatch(full_path.to_string()))?;
            match current {
                Value::Array(items) => items
                    .get_mut(idx)
                    .ok_or_else(|| StoreError::PositionalWithoutMatch(full_path.to_string()))?,
                _ => return Err(StoreError::PathConflict(full_path.to_string())),
            }
        } else {
            match current {
                Value::Object(map) => {
                    let entry = map.entry(seg.to_string()).or_insert(Value::Null);
                    if entry.is_null() {
                        *entry = Value::Object(Map::new());
                    }
                    match entry {
                        Value::Object(_) | Value::Array(_) => entry,
                        _ => return Err(StoreError::PathConflict(full_path.to_string())),
                    }
                }
                _ => return Err(StoreError::PathConflict(full_path.to_string())),
            }
        };
        consumed.push(seg);
    }
    Ok(current)
}

fn split_path(path: &str) -> StoreResult<(Vec<&str>, &str)> {
    let segs: Vec<&str> = path.split('.').collect();
    match segs.split_last() {
        Some((last, init)) => Ok((init.to_vec(), *last)),
        None => Err(StoreError::PathConflict(path.to_string())),
    }
}

fn set_path(
    root: &mut Value,
    path: &str,
    value: Value,
    positions: &ArrayPositions,
) -> StoreResult<()> {
    let (init, last) = split_path(path)?;
    let parent = navigate(root, &init, positions, path)?;
    if last == "$" {
        let key = init.join(".");
        let idx = *positions
            .get(&key)
            .ok_or_else(|| StoreError::PositionalWithoutMatch(path.to_string()))?;
        match parent {
            Value::Array(items) if idx < items.len() => {
                items[idx] = value;
                Ok(())
            }
            _ => Err(StoreError::PositionalWithoutMatch(path.to_string())),
        }
    } else {
        match parent {
            Value::Object(map) => {
                map.insert(last.to_string(), value);
                Ok(())
            }
            _ => Err(StoreError::PathConflict(path.to_string())),
        }
    }
}

fn push_path(
    root: &mut Value,
    path: &str,
    value: Value,
    positions: &ArrayPositions,
) -> StoreResult<()> {
    let (init, last) = split_path(path)?;
    let parent = navigate(root, &init, positions, path)?;
    match parent {
        Value::Object(map) => {
            let entry = map.entry(last.to_string()).or_insert(Value::Null);
            if entry.is_null() {
                *entry = Value::Array(Vec::new());
            }
            match entry {
                Value::Array(items) => {
                    items.push(value);
                    Ok(())
                }
                _ => Err(StoreError::PathConflict(path.to_string())),
            }
        }
        _ => Err(StoreError::PathConflict(path.to_string())),
    }
}

fn inc_path(root: &mut Value, path: &str, by: i64, positions: &ArrayPositions) -> StoreResult<()> {
    let (init, last) = split_path(path)?;
    let parent = navigate(root, &init, positions, path)?;
    match parent {
        Value::Object(map) => {
            let entry = map.entry(last.to_string()).or_insert(Value::Null);
            let current = match entry {
                Value::Null => 0,
                Value::Number(n) => n
                    .as_i64()
                    .ok_or_else(|| StoreError::PathConflict(path.to_string()))?,
                _ => return Err(StoreError::PathConflict(path.to_string())),
            };
            *entry = Value::from(current + by);
            Ok(())
        }
        _ => Err(StoreError::PathConflict(path.to_string())),
    }
}

/// Apply the non-insert sections of an update to a document in place.
fn apply_update(
    doc: &mut Value,
    update: &UpdateDocument,
    positions: &ArrayPositions,
) -> StoreResult<()> {
    for (path, value) in update.set_entries() {
        set_path(doc, path, value.clone(), positions)?;
    }
    for (path, value) in update.push_entries() {
        push_path(doc, path, value.clone(), positions)?;
    }
    for (path, by) in update.inc_entries() {
        inc_path(doc, path, *by, positions)?;
    }
    Ok(())
}

#[async_trait]
impl ProjectionStore for MemoryProjectionStore {
    async fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Option<Document>> {
        let collections = self.lock()?;
        let Some(docs) = collections.get(collection) else {
            return Ok(None);
        };
        for doc in docs {
            if document_matches(doc, filter).is_some() {
                return Ok(doc.as_object().cloned());
            }
        }
        Ok(None)
    }

    async fn insert_one(&self, collection: &str, mut document: Document) -> StoreResult<String> {
        let id = match document.get("_id").and_then(Value::as_str) {
            Some(existing) => existing.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                document.insert("_id".to_string(), Value::String(id.clone()));
                id
            }
        };
        let mut collections = self.lock()?;
        collections
            .entry(collection.to_string())
            .or_default()
            .push(Value::Object(document));
        Ok(id)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateDocument,
        upsert: bool,
    ) -> StoreResult<UpdateResult> {
        let mut collections = self.lock()?;
        let docs = collections.entry(collection.to_string()).or_default();

        for doc in docs.iter_mut() {
            if let Some(positions) = document_matches(doc, filter) {
                let before = doc.clone();
                apply_update(doc, update, &positions)?;
                return Ok(UpdateResult {
                    matched_count: 1,
                    modified_count: u64::from(*doc != before),
                    upserted_id: None,
                });
            }
        }

        if !upsert {
            return Ok(UpdateResult::default());
        }

        // Upsert insert: seed from the filter's equality paths, then the
        // insert-only section, then the rest.
        let mut doc = Value::Object(Map::new());
        let no_positions = ArrayPositions::new();
        for (path, value) in filter.clauses() {
            set_path(&mut doc, path, value.clone(), &no_positions)?;
        }
        for (path, value) in update.set_on_insert_entries() {
            set_path(&mut doc, path, value.clone(), &no_positions)?;
        }
        apply_update(&mut doc, update, &no_positions)?;

        let id = Uuid::new_v4().to_string();
        if let Value::Object(map) = &mut doc {
            map.entry("_id".to_string())
                .or_insert(Value::String(id.clone()));
        }
        docs.push(doc);
        Ok(UpdateResult {
            matched_count: 0,
            modified_count: 0,
            upserted_id: Some(id),
        })
    }
}
