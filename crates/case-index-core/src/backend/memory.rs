//! In-memory [`IndexBackend`] for tests.
//!
//! Documents live in a `HashMap` behind `std::sync::RwLock`. Failures can be
//! scripted: queued errors are returned by the next bulk calls before any
//! write happens, and selected ids can be rejected per item.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use super::{BackendError, BulkItem, BulkOutcome, IndexBackend};

#[derive(Default)]
struct Calls {
    bulk_attempts: usize,
    /// Ids of every successful bulk write, in call order.
    batches: Vec<Vec<String>>,
    clear_calls: Vec<Vec<String>>,
}

pub struct InMemoryBackend {
    indices: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    scripted_failures: Mutex<VecDeque<BackendError>>,
    rejected_ids: RwLock<HashSet<String>>,
    calls: Mutex<Calls>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(HashMap::new()),
            scripted_failures: Mutex::new(VecDeque::new()),
            rejected_ids: RwLock::new(HashSet::new()),
            calls: Mutex::new(Calls::default()),
        }
    }

    /// Make the next bulk call fail with `err` (queued in order).
    pub fn fail_next_bulk(&self, err: BackendError) {
        lock(&self.scripted_failures).push_back(err);
    }

    /// Reject the document with this id on every bulk write.
    pub fn reject_id(&self, id: impl Into<String>) {
        write(&self.rejected_ids).insert(id.into());
    }

    pub fn bulk_attempts(&self) -> usize {
        lock(&self.calls).bulk_attempts
    }

    /// Ids of each successful bulk write, in order.
    pub fn batches(&self) -> Vec<Vec<String>> {
        lock(&self.calls).batches.clone()
    }

    pub fn clear_calls(&self) -> Vec<Vec<String>> {
        lock(&self.calls).clear_calls.clone()
    }

    pub fn get(&self, index: &str, id: &str) -> Option<Value> {
        read(&self.indices).get(index)?.get(id).cloned()
    }

    /// All documents of `index`, ordered by id.
    pub fn documents(&self, index: &str) -> BTreeMap<String, Value> {
        read(&self.indices).get(index).cloned().unwrap_or_default()
    }

    /// Number of documents in `index` flagged latest for `group_id`.
    pub fn latest_count(&self, index: &str, group_id: &str) -> usize {
        read(&self.indices)
            .get(index)
            .map(|docs| {
                docs.values()
                    .filter(|d| d.get("group_id").and_then(Value::as_str) == Some(group_id))
                    .filter(|d| d.get("is_latest") == Some(&Value::Bool(true)))
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl IndexBackend for InMemoryBackend {
    async fn bulk_index(
        &self,
        index: &str,
        items: &[BulkItem],
    ) -> Result<BulkOutcome, BackendError> {
        lock(&self.calls).bulk_attempts += 1;
        if let Some(err) = lock(&self.scripted_failures).pop_front() {
            return Err(err);
        }

        let rejected_ids = read(&self.rejected_ids);
        let mut outcome = BulkOutcome::default();
        let mut written = Vec::with_capacity(items.len());
        {
            let mut indices = write(&self.indices);
            let docs = indices.entry(index.to_string()).or_default();
            for item in items {
                if rejected_ids.contains(&item.id) {
                    outcome.rejected += 1;
                    outcome.errors.push(format!("{}: mapper_parsing_exception", item.id));
                    continue;
                }
                docs.insert(item.id.clone(), item.body.clone());
                written.push(item.id.clone());
                outcome.indexed += 1;
            }
        }
        lock(&self.calls).batches.push(written);
        Ok(outcome)
    }

    async fn clear_latest(&self, index: &str, group_ids: &[String]) -> Result<(), BackendError> {
        lock(&self.calls).clear_calls.push(group_ids.to_vec());
        let groups: HashSet<&str> = group_ids.iter().map(String::as_str).collect();
        let mut indices = write(&self.indices);
        if let Some(docs) = indices.get_mut(index) {
            for doc in docs.values_mut() {
                let in_group = doc
                    .get("group_id")
                    .and_then(Value::as_str)
                    .is_some_and(|g| groups.contains(g));
                if in_group {
                    if let Value::Object(map) = doc {
                        map.insert("is_latest".into(), Value::Bool(false));
                    }
                }
            }
        }
        Ok(())
    }
}
