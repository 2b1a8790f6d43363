use std::sync::Arc;

use log::warn;

use crate::config::ConfigError;
use crate::entity::{AssociationKind, Entity, EntityRegistry, EntitySchema, FieldType, ADDRESS};
use crate::field::{Cardinality, Field, FieldBinding};
use crate::query::Projection;

/// Address sub-fields that are only valid behind an `address.` prefix.
const ADDRESS_FIELDS: [&str; 7] = ["address1", "address2", "city", "state", "zip", "countryID", "countryName"];

/// One line of input, numbered from 1 after the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub number: usize,
    pub values: Vec<String>,
}

impl Row {
    pub fn new(number: usize, values: Vec<String>) -> Self {
        Self { number, values }
    }
}

/// Column bindings for one input file, resolved once from the header row.
#[derive(Debug, Clone)]
pub struct RecordLayout {
    entity: Arc<EntitySchema>,
    headers: Vec<String>,
    bindings: Vec<Option<Arc<FieldBinding>>>,
}

impl RecordLayout {
    pub fn new(entity: Arc<EntitySchema>, headers: &[String], exist_fields: &[String], registry: &EntityRegistry) -> Result<Self, ConfigError> {
        let is_exist = |column: &str| exist_fields.iter().any(|f| f.eq_ignore_ascii_case(column));
        let mut bindings = Vec::with_capacity(headers.len());

        for header in headers {
            let column = header.trim();
            if column.is_empty() {
                warn!("Ignoring blank column header in {} input", entity.name());
                bindings.push(None);
                continue;
            }
            let binding = match column.split_once('.') {
                Some((prefix, rest)) => bind_association(&entity, column, prefix, rest, is_exist(column), registry)?,
                None => bind_direct(&entity, column, is_exist(column))?,
            };
            bindings.push(Some(Arc::new(binding)));
        }

        for exist_field in exist_fields {
            if !headers.iter().any(|h| h.trim().eq_ignore_ascii_case(exist_field)) {
                warn!("Exist field '{}' for {} is not a column in the input", exist_field, entity.name());
            }
        }

        Ok(Self { entity, headers: headers.to_vec(), bindings })
    }

    pub fn entity(&self) -> &Arc<EntitySchema> {
        &self.entity
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn record(&self, row: Row) -> Record {
        let mut values = row.values;
        values.resize(self.headers.len(), String::new());
        let mut fields = Vec::with_capacity(values.len());
        let mut positions = Vec::with_capacity(values.len());
        for (binding, value) in self.bindings.iter().zip(values.iter()) {
            match binding {
                Some(binding) => {
                    positions.push(Some(fields.len()));
                    fields.push(Field::new(Arc::clone(binding), value.trim()));
                }
                None => positions.push(None),
            }
        }
        Record { entity: Arc::clone(&self.entity), number: row.number, fields, positions, values }
    }
}

fn bind_direct(entity: &Arc<EntitySchema>, column: &str, exist: bool) -> Result<FieldBinding, ConfigError> {
    if entity.name() != ADDRESS {
        if let Some(address_field) = ADDRESS_FIELDS.iter().find(|f| f.eq_ignore_ascii_case(column)) {
            return Err(ConfigError::BareAddressField { column: address_field.to_string() });
        }
    }
    let (name, field_type) = match entity.field_type(column) {
        Some((name, field_type)) => (name.to_string(), field_type),
        None => {
            warn!("Unknown field '{}' on {}; treating it as a string", column, entity.name());
            (column.to_string(), FieldType::String)
        }
    };
    Ok(FieldBinding::direct(&name, &name, field_type, Arc::clone(entity), exist))
}

fn bind_association(
    entity: &Arc<EntitySchema>,
    column: &str,
    prefix: &str,
    rest: &str,
    exist: bool,
    registry: &EntityRegistry,
) -> Result<FieldBinding, ConfigError> {
    let (association_name, association) = entity.association(prefix).ok_or_else(|| ConfigError::UnknownAssociation {
        entity: entity.name().to_string(),
        association: prefix.to_string(),
        column: column.to_string(),
    })?;
    let field_entity = registry.resolve(&association.entity)?;
    let (name, field_type) = match field_entity.field_type(rest) {
        Some((name, field_type)) => (name.to_string(), field_type),
        None => {
            warn!("Unknown field '{}' on {}; treating it as a string", rest, field_entity.name());
            (rest.to_string(), FieldType::String)
        }
    };
    let cardinality = match association.kind {
        AssociationKind::Compound => Cardinality::Compound,
        AssociationKind::ToOne => Cardinality::ToOne,
        AssociationKind::ToMany => Cardinality::ToMany,
    };
    let canonical = format!("{}.{}", association_name, name);
    Ok(FieldBinding::associated(&canonical, association_name, &name, field_type, cardinality, field_entity, exist))
}

/// One row bound to its entity.
#[derive(Debug, Clone)]
pub struct Record {
    entity: Arc<EntitySchema>,
    number: usize,
    fields: Vec<Field>,
    /// Index into `fields` for each input column; `None` for ignored columns.
    positions: Vec<Option<usize>>,
    values: Vec<String>,
}

impl Record {
    pub fn entity(&self) -> &Arc<EntitySchema> {
        &self.entity
    }

    pub fn number(&self) -> usize {
        self.number
    }

    /// Fields in column order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// The raw input cells, including ignored columns.
    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn field(&self, column: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.column().eq_ignore_ascii_case(column))
    }

    pub fn exist_fields(&self) -> Vec<Field> {
        self.fields.iter().filter(|f| f.is_exist_field()).cloned().collect()
    }

    pub fn to_one_fields(&self) -> Vec<&Field> {
        self.fields.iter().filter(|f| f.is_to_one()).collect()
    }

    /// To-many columns; empty cells are skipped unless `process_empty` is set.
    pub fn to_many_fields(&self, process_empty: bool) -> Vec<&Field> {
        self.fields.iter().filter(|f| f.is_to_many() && (process_empty || !f.is_empty())).collect()
    }

    /// Fields requested when looking up the row's own entity: direct field names and
    /// association base names.
    pub fn projection(&self) -> Projection {
        Projection::new(self.fields.iter().map(|f| f.association().unwrap_or_else(|| f.name()).to_string())).corrected()
    }

    /// One cell per input column read back from a remote entity. Ignored columns stay empty.
    pub fn values_from(&self, entity: &Entity, delimiter: &str) -> Vec<String> {
        self.positions
            .iter()
            .map(|&position| {
                position
                    .and_then(|i| self.fields.get(i))
                    .and_then(|field| field.string_value_from(entity, delimiter))
                    .unwrap_or_default()
            })
            .collect()
    }
}

/// `field=value AND ...`, for error messages.
pub fn criteria_message(fields: &[Field]) -> String {
    let parts: Vec<String> = fields.iter().map(|f| format!("{}={}", f.column(), f.value())).collect();
    parts.join(" AND ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn layout(entity: &str, columns: &[&str], exist: &[&str]) -> Result<RecordLayout, ConfigError> {
        let registry = EntityRegistry::builtin();
        RecordLayout::new(registry.get(entity).unwrap(), &headers(columns), &headers(exist), &registry)
    }

    #[test]
    fn binds_columns_by_kind() {
        let layout = layout(
            "Candidate",
            &["externalID", "Email", "address.city", "owner.id", "primarySkills.name", "customBlob"],
            &["externalid"],
        )
        .unwrap();
        let record = layout.record(Row::new(1, headers(&["ext-1", "a@b.com", "Austin", "5", "Java;Rust", "x"])));

        let fields = record.fields();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[0].column(), "externalID");
        assert!(fields[0].is_exist_field());
        assert_eq!(fields[1].column(), "email");
        assert_eq!(fields[2].query_name(), "address.city");
        assert!(fields[3].is_to_one());
        assert_eq!(fields[3].field_type(), FieldType::Integer);
        assert!(fields[4].is_to_many());
        assert_eq!(fields[4].field_entity().name(), "Skill");
        assert_eq!(fields[5].field_type(), FieldType::String);

        assert_eq!(record.exist_fields().len(), 1);
        assert_eq!(criteria_message(&record.exist_fields()), "externalID=ext-1");
        assert_eq!(record.to_one_fields().len(), 1);
        assert_eq!(record.to_many_fields(false).len(), 1);
    }

    #[test]
    fn projection_uses_association_base_names() {
        let layout = layout("Candidate", &["email", "address.city", "address.zip", "primarySkills.name"], &["email"]).unwrap();
        let record = layout.record(Row::new(1, headers(&["a@b.com", "Austin", "78701", "Java"])));
        assert_eq!(record.projection().to_string(), "address,email,id,primarySkills");
    }

    #[test]
    fn empty_to_many_cells_are_optional() {
        let layout = layout("Candidate", &["email", "primarySkills.name"], &["email"]).unwrap();
        let record = layout.record(Row::new(3, headers(&["a@b.com", " "])));
        assert!(record.to_many_fields(false).is_empty());
        assert_eq!(record.to_many_fields(true).len(), 1);
    }

    #[test]
    fn short_rows_are_padded() {
        let layout = layout("Candidate", &["email", "lastName"], &[]).unwrap();
        let record = layout.record(Row::new(2, headers(&["a@b.com"])));
        assert_eq!(record.values(), ["a@b.com".to_string(), String::new()]);
        assert_eq!(record.field("lastname").unwrap().value(), "");
        assert!(record.exist_fields().is_empty());
    }

    #[test]
    fn export_values_follow_column_order() {
        let layout = layout("Candidate", &["email", "", "address.city", "primarySkills.name"], &["email"]).unwrap();
        let record = layout.record(Row::new(1, headers(&["a@b.com", "ignored", "", ""])));
        let remote = Entity::from_value(serde_json::json!({
            "id": 4,
            "email": "a@b.com",
            "address": {"city": "Austin"},
            "primarySkills": {"total": 2, "data": [{"id": 1, "name": "Java"}, {"id": 2, "name": "Rust"}]}
        }))
        .unwrap();
        assert_eq!(record.values_from(&remote, ";"), headers(&["a@b.com", "", "Austin", "Java;Rust"]));
    }

    #[test]
    fn rejects_bad_headers() {
        let err = layout("Candidate", &["city"], &[]).unwrap_err();
        assert_eq!(err.to_string(), "Invalid address field format: 'city' Must use 'address.city' in csv header");

        let err = layout("Candidate", &["spaceship.name"], &[]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownAssociation { ref association, .. } if association == "spaceship"));
    }
}
