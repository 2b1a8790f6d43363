//! In-memory remote system for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::Value;

use crate::api::{RemoteError, RestApi};
use crate::entity::Entity;
use crate::query::{Projection, Query};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub entity: String,
    pub id: i64,
    pub association: String,
    pub ids: Vec<i64>,
}

#[derive(Default)]
pub struct MockApi {
    records: Mutex<HashMap<String, Vec<Entity>>>,
    next_id: AtomicI64,
    pub searches: AtomicUsize,
    pub inserts: AtomicUsize,
    pub updates: AtomicUsize,
    pub deletes: AtomicUsize,
    pub associations: Mutex<Vec<Association>>,
    pub queries: Mutex<Vec<Query>>,
    /// Writes containing this string value fail with HTTP 500.
    pub reject_value: Option<String>,
}

impl MockApi {
    pub fn new() -> Self {
        Self { next_id: AtomicI64::new(1000), ..Self::default() }
    }

    pub fn with_records(self, entity: &str, records: Vec<Value>) -> Self {
        if let Ok(mut all) = self.records.lock() {
            all.entry(entity.to_string()).or_default().extend(records.into_iter().filter_map(Entity::from_value));
        }
        self
    }

    pub fn records(&self, entity: &str) -> Vec<Entity> {
        self.records.lock().unwrap().get(entity).cloned().unwrap_or_default()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn check_rejected(&self, record: &Entity) -> Result<(), RemoteError> {
        if let Some(rejected) = &self.reject_value {
            if record.as_map().values().any(|v| v.as_str() == Some(rejected.as_str())) {
                return Err(RemoteError::Status { status: 500, message: format!("rejected value '{}'", rejected) });
            }
        }
        Ok(())
    }
}

/// Evaluates the `a AND (b OR c)` shape produced by the query builder against one record.
fn matches(query: &str, record: &Entity) -> bool {
    query.split(" AND ").all(|clause| {
        let clause = clause.trim().trim_start_matches('(').trim_end_matches(')');
        clause.split(" OR ").any(|term| term_matches(term.trim(), record))
    })
}

fn term_matches(term: &str, record: &Entity) -> bool {
    let (name, value) = match term.split_once(':').or_else(|| term.split_once('=')) {
        Some(pair) => pair,
        None => return false,
    };
    let value = value.trim().trim_matches('"').trim_matches('\'');
    let name = if name == "noteID" { "id" } else { name };
    match record.get(name) {
        Some(Value::Array(_)) | Some(Value::Object(_)) | None => record.string_value(name, "\u{1f}").map_or(false, |v| v.split('\u{1f}').any(|part| part == value)),
        Some(_) => record.string_value(name, ";").as_deref() == Some(value),
    }
}

impl RestApi for MockApi {
    fn search(&self, entity: &str, query: &Query, _projection: &Projection) -> Result<Vec<Entity>, RemoteError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.clone());
        let all = self.records.lock().unwrap();
        Ok(all.get(entity).map(|records| records.iter().filter(|r| matches(query.text(), r)).cloned().collect()).unwrap_or_default())
    }

    fn insert(&self, entity: &str, record: &Entity) -> Result<i64, RemoteError> {
        self.check_rejected(record)?;
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = record.clone();
        stored.set_id(id);
        self.records.lock().unwrap().entry(entity.to_string()).or_default().push(stored);
        Ok(id)
    }

    fn update(&self, entity: &str, id: i64, record: &Entity) -> Result<i64, RemoteError> {
        self.check_rejected(record)?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        let mut all = self.records.lock().unwrap();
        let existing = all
            .get_mut(entity)
            .and_then(|records| records.iter_mut().find(|r| r.id() == Some(id)))
            .ok_or_else(|| RemoteError::Status { status: 404, message: format!("{} {} not found", entity, id) })?;
        for (key, value) in record.as_map() {
            existing.insert(key, value.clone());
        }
        Ok(id)
    }

    fn delete(&self, entity: &str, id: i64) -> Result<(), RemoteError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if let Some(records) = self.records.lock().unwrap().get_mut(entity) {
            records.retain(|r| r.id() != Some(id));
        }
        Ok(())
    }

    fn associate(&self, entity: &str, id: i64, association: &str, ids: &[i64]) -> Result<(), RemoteError> {
        self.associations.lock().unwrap().push(Association {
            entity: entity.to_string(),
            id,
            association: association.to_string(),
            ids: ids.to_vec(),
        });
        Ok(())
    }
}
