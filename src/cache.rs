//! Run-scoped memo of remote existence lookups.
//!
//! Every lookup is keyed by a [`CacheKey`]: the entity, the exist-field criteria with
//! to-many values sorted, and the requested projection. A second index holds the
//! entities a single to-many value resolved to, so a multi-value lookup can be answered
//! from values cached by earlier, different lookups. That index is only written when
//! every returned entity can be attributed to exactly one requested value; whenever
//! that is in doubt the cache answers with a miss and the caller goes to the network.
//!
//! Each key also owns a lock. Callers hold it from the lookup through any write that
//! changes the answer, so rows with equal criteria reach the remote system once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use log::debug;

use crate::entity::{Entity, EntitySchema, FieldType};
use crate::field::Field;
use crate::query::Projection;

/// Canonical, order-independent identity of one lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    entity: String,
    criteria: Vec<(String, Vec<String>)>,
    projection: Projection,
}

impl CacheKey {
    pub fn new(entity: &EntitySchema, exist_fields: &[Field], delimiter: &str, projection: &Projection) -> Self {
        let mut criteria: Vec<(String, Vec<String>)> = exist_fields
            .iter()
            .map(|field| (field.query_name().to_string(), canonical_values(field, delimiter)))
            .collect();
        criteria.sort();
        Self { entity: entity.name().to_string(), criteria, projection: projection.clone() }
    }
}

/// To-many values sorted and deduplicated; scalar cells as-is.
fn canonical_values(field: &Field, delimiter: &str) -> Vec<String> {
    let mut values: Vec<String> = field.values(delimiter).into_iter().map(str::to_string).collect();
    if field.is_to_many() {
        values.sort();
        values.dedup();
    }
    values
}

/// The entities that one value of a to-many lookup resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ValueKey {
    entity: String,
    projection: Projection,
    field: String,
    value: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub entries: usize,
}

pub struct LookupCache {
    delimiter: String,
    wildcard_matching: bool,
    exact: DashMap<CacheKey, Arc<Vec<Entity>>>,
    by_value: DashMap<ValueKey, Arc<Vec<Entity>>>,
    key_locks: DashMap<CacheKey, Arc<Mutex<()>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl LookupCache {
    pub fn new(delimiter: &str, wildcard_matching: bool) -> Self {
        Self {
            delimiter: delimiter.to_string(),
            wildcard_matching,
            exact: DashMap::new(),
            by_value: DashMap::new(),
            key_locks: DashMap::new(),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn key(&self, entity: &EntitySchema, exist_fields: &[Field], projection: &Projection) -> CacheKey {
        CacheKey::new(entity, exist_fields, &self.delimiter, projection)
    }

    /// The lock shared by every lookup with an equivalent key.
    pub fn key_lock(&self, entity: &EntitySchema, exist_fields: &[Field], projection: &Projection) -> Arc<Mutex<()>> {
        let key = self.key(entity, exist_fields, projection);
        Arc::clone(self.key_locks.entry(key).or_default().value())
    }

    /// Returns the entities a previous equivalent lookup produced, or `None` when
    /// the answer is not known with certainty.
    pub fn lookup(&self, entity: &EntitySchema, exist_fields: &[Field], projection: &Projection) -> Option<Arc<Vec<Entity>>> {
        let key = self.key(entity, exist_fields, projection);
        let found = self.exact.get(&key).map(|entry| Arc::clone(entry.value())).or_else(|| self.synthesize(entity, exist_fields, projection));

        match &found {
            Some(entities) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit for {} {:?}: {} record(s)", key.entity, key.criteria, entities.len());
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Cache miss for {} {:?}", key.entity, key.criteria);
            }
        }
        found
    }

    /// Records the result of a remote lookup. Storing the same key again replaces the entry.
    pub fn store(&self, entity: &EntitySchema, exist_fields: &[Field], projection: &Projection, entities: Vec<Entity>) {
        let entities = Arc::new(entities);
        if let Some(field) = self.decomposable(exist_fields, projection) {
            if let Some(per_value) = self.attribute(field, &entities) {
                for (value, matched) in per_value {
                    let key = ValueKey {
                        entity: entity.name().to_string(),
                        projection: projection.clone(),
                        field: field.query_name().to_string(),
                        value,
                    };
                    self.by_value.insert(key, Arc::new(matched));
                }
            }
        }
        let key = self.key(entity, exist_fields, projection);
        self.exact.insert(key, entities);
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.exact.len(),
        }
    }

    /// The single to-many exist field whose values may be served one at a time.
    ///
    /// Requires the discriminating field to be part of the projection, and is refused
    /// for string fields in wildcard mode, where a pattern cannot be mapped back to the
    /// values it matched.
    fn decomposable<'a>(&self, exist_fields: &'a [Field], projection: &Projection) -> Option<&'a Field> {
        let [field] = exist_fields else {
            return None;
        };
        if !field.is_to_many() {
            return None;
        }
        if self.wildcard_matching && field.field_type() == FieldType::String {
            return None;
        }
        if !projection.covers(field.query_name()) {
            return None;
        }
        Some(field)
    }

    /// Groups returned entities under the requested value each one carries. Gives up if
    /// any entity lacks the value or carries one that was not requested.
    fn attribute(&self, field: &Field, entities: &[Entity]) -> Option<HashMap<String, Vec<Entity>>> {
        let requested: HashSet<&str> = field.values(&self.delimiter).into_iter().collect();
        let mut per_value: HashMap<String, Vec<Entity>> = HashMap::new();
        for entity in entities {
            let value = field.discriminating_value(entity, &self.delimiter)?;
            if !requested.contains(value.as_str()) {
                return None;
            }
            per_value.entry(value).or_default().push(entity.clone());
        }
        Some(per_value)
    }

    fn synthesize(&self, entity: &EntitySchema, exist_fields: &[Field], projection: &Projection) -> Option<Arc<Vec<Entity>>> {
        let field = self.decomposable(exist_fields, projection)?;
        let mut seen = HashSet::new();
        let mut combined = Vec::new();
        for value in field.values(&self.delimiter) {
            if !seen.insert(value) {
                continue;
            }
            let key = ValueKey {
                entity: entity.name().to_string(),
                projection: projection.clone(),
                field: field.query_name().to_string(),
                value: value.to_string(),
            };
            let matched = self.by_value.get(&key)?;
            combined.extend(matched.value().iter().cloned());
        }
        Some(Arc::new(combined))
    }
}
