use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::entity::{Entity, EntitySchema, FieldType, ID};

#[derive(Debug, Error)]
pub enum FieldError {
    #[error("Invalid {field_type} value '{value}' for field '{column}': {reason}")]
    Parse { column: String, value: String, field_type: FieldType, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    Direct,
    /// Nested value object such as `address.city`.
    Compound,
    ToOne,
    ToMany,
}

/// Writes an already converted value onto an outgoing entity.
pub type Setter = fn(&mut Entity, &FieldBinding, Value);

fn set_direct(entity: &mut Entity, binding: &FieldBinding, value: Value) {
    entity.insert(&binding.name, value);
}

fn set_compound(entity: &mut Entity, binding: &FieldBinding, value: Value) {
    if let Some(association) = &binding.association {
        entity.insert_nested(association, &binding.name, value);
    }
}

fn set_to_one(entity: &mut Entity, binding: &FieldBinding, id: Value) {
    if let Some(association) = &binding.association {
        let mut link = Map::new();
        link.insert(ID.to_string(), id);
        entity.insert(association, Value::Object(link));
    }
}

/// One CSV column resolved against an entity schema. Built once per run from the header row.
#[derive(Debug, Clone)]
pub struct FieldBinding {
    column: String,
    association: Option<String>,
    name: String,
    field_type: FieldType,
    cardinality: Cardinality,
    field_entity: Arc<EntitySchema>,
    exist: bool,
    setter: Option<Setter>,
}

impl FieldBinding {
    pub fn direct(column: &str, name: &str, field_type: FieldType, entity: Arc<EntitySchema>, exist: bool) -> Self {
        Self {
            column: column.to_string(),
            association: None,
            name: name.to_string(),
            field_type,
            cardinality: Cardinality::Direct,
            field_entity: entity,
            exist,
            setter: Some(set_direct),
        }
    }

    pub fn associated(
        column: &str,
        association: &str,
        name: &str,
        field_type: FieldType,
        cardinality: Cardinality,
        field_entity: Arc<EntitySchema>,
        exist: bool,
    ) -> Self {
        let setter: Option<Setter> = match cardinality {
            Cardinality::Direct => Some(set_direct),
            Cardinality::Compound => Some(set_compound),
            Cardinality::ToOne => Some(set_to_one),
            Cardinality::ToMany => None,
        };
        Self {
            column: column.to_string(),
            association: Some(association.to_string()),
            name: name.to_string(),
            field_type,
            cardinality,
            field_entity,
            exist,
            setter,
        }
    }

    /// The binding used to find the associated entity itself: the association's field
    /// becomes a direct exist field on the associated entity, keeping to-many splitting.
    pub fn lookup(&self) -> Option<FieldBinding> {
        let cardinality = match self.cardinality {
            Cardinality::ToOne => Cardinality::Direct,
            Cardinality::ToMany => Cardinality::ToMany,
            _ => return None,
        };
        Some(Self {
            column: self.name.clone(),
            association: None,
            name: self.name.clone(),
            field_type: self.field_type,
            cardinality,
            field_entity: Arc::clone(&self.field_entity),
            exist: true,
            setter: Some(set_direct),
        })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn association(&self) -> Option<&str> {
        self.association.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn field_entity(&self) -> &Arc<EntitySchema> {
        &self.field_entity
    }

    pub fn is_exist_field(&self) -> bool {
        self.exist
    }

    /// Name used in lookup criteria: the full column for direct, compound and to-one
    /// fields, the bare field name for to-many fields.
    pub fn query_name(&self) -> &str {
        match self.cardinality {
            Cardinality::ToMany => &self.name,
            _ => &self.column,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Decimal(BigDecimal),
    DateTime(NaiveDateTime),
    Object(Value),
}

impl FieldValue {
    pub fn parse(raw: &str, field_type: FieldType, date_format: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        match field_type {
            FieldType::String => Ok(FieldValue::String(raw.to_string())),
            FieldType::Integer => trimmed.parse::<i64>().map(FieldValue::Integer).map_err(|e| e.to_string()),
            FieldType::Boolean => match trimmed.to_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Ok(FieldValue::Boolean(true)),
                "false" | "0" | "no" | "n" => Ok(FieldValue::Boolean(false)),
                _ => Err("expected true/false, yes/no or 1/0".to_string()),
            },
            FieldType::Decimal => BigDecimal::from_str(&trimmed.replace(',', ""))
                .map(FieldValue::Decimal)
                .map_err(|e| e.to_string()),
            FieldType::DateTime => parse_date_time(trimmed, date_format).map(FieldValue::DateTime),
            FieldType::Object => serde_json::from_str(trimmed).map(FieldValue::Object).map_err(|e| e.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::String(s) => Value::String(s.clone()),
            FieldValue::Integer(i) => Value::from(*i),
            FieldValue::Boolean(b) => Value::Bool(*b),
            FieldValue::Decimal(d) => {
                let text = d.to_string();
                serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text))
            }
            FieldValue::DateTime(dt) => Value::from(dt.and_utc().timestamp_millis()),
            FieldValue::Object(v) => v.clone(),
        }
    }
}

fn parse_date_time(value: &str, format: &str) -> Result<NaiveDateTime, String> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
        return Ok(dt);
    }
    let date = NaiveDate::parse_from_str(value, format).map_err(|e| format!("{} (expected format '{}')", e, format))?;
    date.and_hms_opt(0, 0, 0).ok_or_else(|| format!("invalid date '{}'", value))
}

/// One cell of a row together with the binding of its column.
#[derive(Debug, Clone)]
pub struct Field {
    binding: Arc<FieldBinding>,
    value: String,
}

impl Field {
    pub fn new(binding: Arc<FieldBinding>, value: impl Into<String>) -> Self {
        Self { binding, value: value.into() }
    }

    pub fn binding(&self) -> &Arc<FieldBinding> {
        &self.binding
    }

    pub fn column(&self) -> &str {
        self.binding.column()
    }

    pub fn name(&self) -> &str {
        self.binding.name()
    }

    pub fn association(&self) -> Option<&str> {
        self.binding.association()
    }

    pub fn query_name(&self) -> &str {
        self.binding.query_name()
    }

    pub fn field_type(&self) -> FieldType {
        self.binding.field_type()
    }

    pub fn field_entity(&self) -> &Arc<EntitySchema> {
        self.binding.field_entity()
    }

    pub fn is_exist_field(&self) -> bool {
        self.binding.is_exist_field()
    }

    pub fn is_to_many(&self) -> bool {
        self.binding.cardinality() == Cardinality::ToMany
    }

    pub fn is_to_one(&self) -> bool {
        self.binding.cardinality() == Cardinality::ToOne
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value.trim().is_empty()
    }

    /// The individual values of the cell: delimiter-split for to-many fields, the whole cell otherwise.
    pub fn values(&self, delimiter: &str) -> Vec<&str> {
        if self.is_to_many() {
            self.value.split(delimiter).map(str::trim).filter(|v| !v.is_empty()).collect()
        } else {
            vec![self.value.as_str()]
        }
    }

    pub fn parse(&self, date_format: &str) -> Result<FieldValue, FieldError> {
        self.parse_one(&self.value, date_format)
    }

    /// Type-parses every delimited element independently.
    pub fn parse_values(&self, delimiter: &str, date_format: &str) -> Result<Vec<FieldValue>, FieldError> {
        self.values(delimiter).into_iter().map(|v| self.parse_one(v, date_format)).collect()
    }

    fn parse_one(&self, raw: &str, date_format: &str) -> Result<FieldValue, FieldError> {
        FieldValue::parse(raw, self.field_type(), date_format).map_err(|reason| FieldError::Parse {
            column: self.column().to_string(),
            value: raw.to_string(),
            field_type: self.field_type(),
            reason,
        })
    }

    /// The same cell re-targeted at the associated entity, for resolving to-one and to-many links.
    pub fn lookup_field(&self) -> Option<Field> {
        self.binding.lookup().map(|binding| Field::new(Arc::new(binding), self.value.clone()))
    }

    /// Applies the column's setter. Returns false for columns that have no setter (to-many).
    pub fn set_on(&self, entity: &mut Entity, value: Value) -> bool {
        match self.binding.setter {
            Some(setter) => {
                setter(entity, &self.binding, value);
                true
            }
            None => false,
        }
    }

    /// Reads this column's value back out of a remote entity.
    pub fn string_value_from(&self, entity: &Entity, delimiter: &str) -> Option<String> {
        entity.string_value(self.column(), delimiter)
    }

    /// Reads the value the lookup criteria compared against, used to attribute lookup results to input values.
    pub fn discriminating_value(&self, entity: &Entity, delimiter: &str) -> Option<String> {
        entity.string_value(self.query_name(), delimiter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRegistry;
    use serde_json::json;

    fn skill_lookup(value: &str) -> Field {
        let skill = EntityRegistry::builtin().get("Skill").unwrap();
        let binding = FieldBinding::associated("primarySkills.name", "primarySkills", "name", FieldType::String, Cardinality::ToMany, skill, false);
        Field::new(Arc::new(binding), value)
    }

    #[test]
    fn to_many_values_split_and_trim() {
        let field = skill_lookup("Java; Rust ;;Go");
        assert_eq!(field.values(";"), vec!["Java", "Rust", "Go"]);
        assert_eq!(field.query_name(), "name");
    }

    #[test]
    fn scalar_values_are_not_split() {
        let registry = EntityRegistry::builtin();
        let binding = FieldBinding::direct("email", "email", FieldType::String, registry.get("Candidate").unwrap(), true);
        let field = Field::new(Arc::new(binding), "a;b@example.com");
        assert_eq!(field.values(";"), vec!["a;b@example.com"]);
        assert_eq!(field.query_name(), "email");
    }

    #[test]
    fn each_to_many_element_is_parsed() {
        let registry = EntityRegistry::builtin();
        let binding = FieldBinding::associated("primarySkills.id", "primarySkills", "id", FieldType::Integer, Cardinality::ToMany, registry.get("Skill").unwrap(), false);
        let field = Field::new(Arc::new(binding), "1;2;x");
        let err = field.parse_values(";", "%m/%d/%Y").unwrap_err();
        assert!(err.to_string().contains("'x'"), "{}", err);

        let field = Field::new(Arc::clone(field.binding()), "1;2");
        assert_eq!(field.parse_values(";", "%m/%d/%Y").unwrap(), vec![FieldValue::Integer(1), FieldValue::Integer(2)]);
    }

    #[test]
    fn parses_scalar_types() {
        let fmt = "%m/%d/%Y";
        assert_eq!(FieldValue::parse(" 42 ", FieldType::Integer, fmt), Ok(FieldValue::Integer(42)));
        assert_eq!(FieldValue::parse("Yes", FieldType::Boolean, fmt), Ok(FieldValue::Boolean(true)));
        assert_eq!(FieldValue::parse("0", FieldType::Boolean, fmt), Ok(FieldValue::Boolean(false)));
        assert!(FieldValue::parse("maybe", FieldType::Boolean, fmt).is_err());
        assert_eq!(FieldValue::parse("1,250.50", FieldType::Decimal, fmt).unwrap().to_json(), json!(1250.50));

        let date = FieldValue::parse("01/02/2020", FieldType::DateTime, fmt).unwrap();
        assert_eq!(date.to_json(), json!(1577923200000i64));
    }

    #[test]
    fn setters_follow_cardinality() {
        let registry = EntityRegistry::builtin();
        let address = registry.get("Address").unwrap();
        let owner = registry.get("CorporateUser").unwrap();
        let city = Field::new(Arc::new(FieldBinding::associated("address.city", "address", "city", FieldType::String, Cardinality::Compound, address, false)), "Austin");
        let owner_id = Field::new(Arc::new(FieldBinding::associated("owner.id", "owner", "id", FieldType::Integer, Cardinality::ToOne, owner, false)), "5");

        let mut entity = Entity::new();
        assert!(city.set_on(&mut entity, json!("Austin")));
        assert!(owner_id.set_on(&mut entity, json!(5)));
        assert!(!skill_lookup("Java").set_on(&mut entity, json!([1])));

        assert_eq!(entity.get("address"), Some(&json!({"city": "Austin"})));
        assert_eq!(entity.get("owner"), Some(&json!({"id": 5})));
        assert_eq!(city.string_value_from(&entity, ";").as_deref(), Some("Austin"));
    }

    #[test]
    fn lookup_field_targets_associated_entity() {
        let lookup = skill_lookup("Java;Rust").lookup_field().unwrap();
        assert_eq!(lookup.column(), "name");
        assert!(lookup.is_to_many());
        assert!(lookup.is_exist_field());
        assert_eq!(lookup.field_entity().name(), "Skill");
    }
}
