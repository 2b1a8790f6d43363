use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, PoisonError};

use clap::ValueEnum;
use log::{debug, warn};
use thiserror::Error;

use crate::api::{RemoteError, RestApi};
use crate::cache::LookupCache;
use crate::config::LoaderConfig;
use crate::entity::{Entity, EntitySchema, ID};
use crate::field::{Field, FieldError};
use crate::query::{self, Projection, QueryError};
use crate::record::{criteria_message, Record};
use crate::sink::{ResultSink, RowResult};
use crate::totals::{Action, ActionTotals};

/// Not sent on update; the remote system rejects changes to it.
const USERNAME: &str = "username";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Command {
    Load,
    Delete,
    Export,
}

impl Command {
    pub fn name(self) -> &'static str {
        match self {
            Command::Load => "load",
            Command::Delete => "delete",
            Command::Export => "export",
        }
    }

    pub fn requires_exist_fields(self) -> bool {
        self != Command::Load
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("No Matching {entity} Records Exist with ExistField criteria of: {criteria}")]
    NoMatch { entity: String, criteria: String },
    #[error("Multiple Records Exist. Found {count} {entity} records with the same ExistField criteria of: {criteria}")]
    MultipleRecords { entity: String, count: usize, criteria: String },
    #[error("Error occurred: {association} does not exist with {field} of the following values:\n{missing}")]
    MissingAssociations { association: String, field: String, missing: String },
    #[error("Error occurred: found {found} {association} records for {expected} distinct {field} values")]
    DuplicateAssociations { association: String, field: String, found: usize, expected: usize },
    #[error("Cannot {command} {entity}: the row has no values for its exist fields")]
    MissingCriteria { command: Command, entity: String },
}

/// Everything a task shares with the rest of the run.
pub struct TaskContext {
    pub command: Command,
    pub config: Arc<LoaderConfig>,
    pub api: Arc<dyn RestApi>,
    pub cache: Arc<LookupCache>,
    pub totals: Arc<ActionTotals>,
    pub sink: Arc<dyn ResultSink>,
}

impl TaskContext {
    fn delimiter(&self) -> &str {
        &self.config.list_delimiter
    }

    /// Cache first, then the remote system. Rows with an equivalent lookup wait for the
    /// first one, so each distinct lookup is sent once.
    fn find(&self, entity: &EntitySchema, criteria: &[Field], projection: &Projection) -> Result<Arc<Vec<Entity>>, TaskError> {
        let lock = self.cache.key_lock(entity, criteria, projection);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.find_locked(entity, criteria, projection)
    }

    /// [`find`](Self::find) for a caller already holding the key lock.
    fn find_locked(&self, entity: &EntitySchema, criteria: &[Field], projection: &Projection) -> Result<Arc<Vec<Entity>>, TaskError> {
        if let Some(found) = self.cache.lookup(entity, criteria, projection) {
            return Ok(found);
        }
        let query = query::build(entity, criteria, self.delimiter(), self.config.wildcard_matching)?;
        let found = self.api.search(entity.name(), &query, projection)?;
        debug!("{} lookup '{}' matched {} record(s)", entity.name(), query, found.len());
        self.cache.store(entity, criteria, projection, found.clone());
        Ok(Arc::new(found))
    }

    /// Exactly one match, or the matching error.
    fn find_one(&self, entity: &EntitySchema, criteria: &[Field], projection: &Projection) -> Result<Entity, TaskError> {
        let found = self.find(entity, criteria, projection)?;
        exactly_one(entity, criteria, &found)
    }
}

fn exactly_one(entity: &EntitySchema, criteria: &[Field], found: &[Entity]) -> Result<Entity, TaskError> {
    match found {
        [only] => Ok(only.clone()),
        [] => Err(TaskError::NoMatch { entity: entity.name().to_string(), criteria: criteria_message(criteria) }),
        many => Err(TaskError::MultipleRecords {
            entity: entity.name().to_string(),
            count: many.len(),
            criteria: criteria_message(criteria),
        }),
    }
}

struct Outcome {
    action: Action,
    id: i64,
    values: Option<Vec<String>>,
}

/// One input row and the command to apply to it.
pub struct Task {
    record: Record,
    context: Arc<TaskContext>,
}

impl Task {
    pub fn new(record: Record, context: Arc<TaskContext>) -> Self {
        Self { record, context }
    }

    /// Executes the row and reports its outcome. Never fails: errors become FAILURE results.
    pub fn run(self) {
        let mut saved_id = None;
        let result = match self.execute(&mut saved_id) {
            Ok(outcome) => RowResult {
                row_number: self.record.number(),
                action: outcome.action,
                id: Some(outcome.id),
                message: String::new(),
                values: outcome.values.unwrap_or_else(|| self.record.values().to_vec()),
            },
            Err(e) => {
                warn!("Row {} failed: {}", self.record.number(), e);
                RowResult {
                    row_number: self.record.number(),
                    action: Action::Failure,
                    id: saved_id,
                    message: e.to_string(),
                    values: self.record.values().to_vec(),
                }
            }
        };
        self.context.totals.increment(result.action);
        self.context.sink.write(result);
    }

    fn execute(&self, saved_id: &mut Option<i64>) -> Result<Outcome, TaskError> {
        match self.context.command {
            Command::Load => self.load(saved_id),
            Command::Delete => self.delete(),
            Command::Export => self.export(),
        }
    }

    /// Exist fields that carry a value.
    fn criteria(&self) -> Vec<Field> {
        self.record.exist_fields().into_iter().filter(|f| !f.is_empty()).collect()
    }

    fn load(&self, saved_id: &mut Option<i64>) -> Result<Outcome, TaskError> {
        let ctx = &self.context;
        let entity = self.record.entity();
        let criteria = self.criteria();
        let projection = self.record.projection();

        let mut outgoing = Entity::new();
        for field in self.record.to_one_fields() {
            if !field.is_empty() {
                self.set_to_one(field, &mut outgoing)?;
            }
        }

        // Held until the row's own insert is cached, so a concurrent row with the same
        // criteria updates that record instead of inserting a second one.
        let lock = (!criteria.is_empty()).then(|| ctx.cache.key_lock(entity, &criteria, &projection));
        let guard = lock.as_ref().map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner));

        let existing = if criteria.is_empty() {
            None
        } else {
            let found = ctx.find_locked(entity, &criteria, &projection)?;
            match found.as_slice() {
                [] => None,
                [only] => only.id(),
                many => {
                    return Err(TaskError::MultipleRecords {
                        entity: entity.name().to_string(),
                        count: many.len(),
                        criteria: criteria_message(&criteria),
                    })
                }
            }
        };

        for field in self.record.fields() {
            if field.is_empty() || field.is_to_many() || field.is_to_one() {
                continue;
            }
            if existing.is_some() && field.name().eq_ignore_ascii_case(USERNAME) {
                continue;
            }
            let value = field.parse(&ctx.config.date_format)?;
            field.set_on(&mut outgoing, value.to_json());
        }

        let (action, id) = match existing {
            Some(id) => {
                ctx.api.update(entity.name(), id, &outgoing)?;
                (Action::Update, id)
            }
            None => {
                let id = ctx.api.insert(entity.name(), &outgoing)?;
                if !criteria.is_empty() {
                    ctx.cache.store(entity, &criteria, &projection, vec![Entity::with_id(id)]);
                }
                (Action::Insert, id)
            }
        };
        drop(guard);
        *saved_id = Some(id);
        debug!("Row {}: {} {} {}", self.record.number(), action, entity.name(), id);

        for field in self.record.to_many_fields(ctx.config.process_empty_associations) {
            self.associate(field, id)?;
        }
        Ok(Outcome { action, id, values: None })
    }

    fn set_to_one(&self, field: &Field, outgoing: &mut Entity) -> Result<(), TaskError> {
        let ctx = &self.context;
        let value = field.parse(&ctx.config.date_format)?;
        if field.name() == ID {
            field.set_on(outgoing, value.to_json());
            return Ok(());
        }
        let Some(lookup) = field.lookup_field() else {
            return Ok(());
        };
        let projection = Projection::new([ID]).corrected();
        let found = ctx.find_one(field.field_entity(), std::slice::from_ref(&lookup), &projection)?;
        if let Some(id) = found.id() {
            field.set_on(outgoing, id.into());
        }
        Ok(())
    }

    /// Resolves every value of a to-many column to an id and links them to the saved entity.
    fn associate(&self, field: &Field, id: i64) -> Result<(), TaskError> {
        let ctx = &self.context;
        let association = field.association().unwrap_or_else(|| field.column());
        if field.is_empty() {
            debug!("Row {}: nothing to associate for empty {}", self.record.number(), field.column());
            return Ok(());
        }
        field.parse_values(ctx.delimiter(), &ctx.config.date_format)?;
        let Some(lookup) = field.lookup_field() else {
            return Ok(());
        };

        let projection = Projection::new([ID, lookup.name()]).corrected();
        let found = ctx.find(field.field_entity(), std::slice::from_ref(&lookup), &projection)?;

        let mut requested: Vec<&str> = Vec::new();
        for value in lookup.values(ctx.delimiter()) {
            if !requested.contains(&value) {
                requested.push(value);
            }
        }

        if ctx.config.wildcard_matching {
            if found.is_empty() {
                return Err(missing_associations(association, lookup.name(), &requested));
            }
        } else {
            let returned: HashSet<String> = found.iter().filter_map(|e| lookup.discriminating_value(e, ctx.delimiter())).collect();
            let missing: Vec<&str> = requested.iter().copied().filter(|v| !returned.contains(*v)).collect();
            if !missing.is_empty() {
                return Err(missing_associations(association, lookup.name(), &missing));
            }
            if found.len() > requested.len() {
                return Err(TaskError::DuplicateAssociations {
                    association: association.to_string(),
                    field: lookup.name().to_string(),
                    found: found.len(),
                    expected: requested.len(),
                });
            }
        }

        let ids: Vec<i64> = found.iter().filter_map(Entity::id).collect();
        ctx.api.associate(self.record.entity().name(), id, association, &ids)?;
        debug!("Row {}: associated {} {} record(s)", self.record.number(), ids.len(), association);
        Ok(())
    }

    fn delete(&self) -> Result<Outcome, TaskError> {
        let ctx = &self.context;
        let entity = self.record.entity();
        let criteria = match self.record.field(ID).filter(|f| !f.is_empty()) {
            Some(id_field) => vec![id_field.clone()],
            None => self.criteria(),
        };
        if criteria.is_empty() {
            return Err(TaskError::MissingCriteria { command: Command::Delete, entity: entity.name().to_string() });
        }
        let projection = Projection::new([ID]).corrected();
        let lock = ctx.cache.key_lock(entity, &criteria, &projection);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let found = exactly_one(entity, &criteria, &ctx.find_locked(entity, &criteria, &projection)?)?;
        let id = found.id().ok_or_else(|| TaskError::NoMatch { entity: entity.name().to_string(), criteria: criteria_message(&criteria) })?;
        ctx.api.delete(entity.name(), id)?;
        // Later rows with the same criteria must no longer see the deleted record.
        ctx.cache.store(entity, &criteria, &projection, Vec::new());
        Ok(Outcome { action: Action::Delete, id, values: None })
    }

    fn export(&self) -> Result<Outcome, TaskError> {
        let ctx = &self.context;
        let entity = self.record.entity();
        let criteria = self.criteria();
        if criteria.is_empty() {
            return Err(TaskError::MissingCriteria { command: Command::Export, entity: entity.name().to_string() });
        }
        let found = ctx.find_one(entity, &criteria, &self.record.projection())?;
        let id = found.id().unwrap_or_default();
        let values = self.record.values_from(&found, ctx.delimiter());
        Ok(Outcome { action: Action::Export, id, values: Some(values) })
    }
}

fn missing_associations(association: &str, field: &str, values: &[&str]) -> TaskError {
    let missing: Vec<String> = values.iter().map(|v| format!("\t{}", v)).collect();
    TaskError::MissingAssociations { association: association.to_string(), field: field.to_string(), missing: missing.join("\n") }
}
