use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{ConfigError, LoaderConfig};

pub const ID: &str = "id";
pub const ADDRESS: &str = "Address";

/// Scalar type of a field as the remote system stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Boolean,
    Decimal,
    DateTime,
    /// Nested or free-form JSON. Settable, but never usable as lookup criteria.
    Object,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "String",
            FieldType::Integer => "Integer",
            FieldType::Boolean => "Boolean",
            FieldType::Decimal => "Decimal",
            FieldType::DateTime => "DateTime",
            FieldType::Object => "Object",
        };
        f.write_str(name)
    }
}

/// Which lookup grammar an entity answers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStyle {
    Search,
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationKind {
    Compound,
    ToOne,
    ToMany,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Association {
    pub kind: AssociationKind,
    pub entity: String,
}

#[derive(Debug, Clone)]
pub struct EntitySchema {
    name: String,
    style: LookupStyle,
    search_id: Option<String>,
    fields: HashMap<String, (String, FieldType)>,
    associations: HashMap<String, (String, Association)>,
}

impl PartialEq for EntitySchema {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for EntitySchema {}

impl EntitySchema {
    pub fn new(name: &str, style: LookupStyle) -> Self {
        let schema = Self {
            name: name.to_string(),
            style,
            search_id: None,
            fields: HashMap::new(),
            associations: HashMap::new(),
        };
        schema.field(ID, FieldType::Integer)
    }

    pub fn field(mut self, name: &str, field_type: FieldType) -> Self {
        self.add_field(name, field_type);
        self
    }

    pub fn fields(mut self, fields: &[(&str, FieldType)]) -> Self {
        for (name, field_type) in fields {
            self.add_field(name, *field_type);
        }
        self
    }

    pub fn strings(self, names: &[&str]) -> Self {
        let fields: Vec<(&str, FieldType)> = names.iter().map(|n| (*n, FieldType::String)).collect();
        self.fields(&fields)
    }

    pub fn compound(mut self, name: &str) -> Self {
        self.add_association(name, Association { kind: AssociationKind::Compound, entity: ADDRESS.to_string() });
        self
    }

    pub fn to_one(mut self, name: &str, entity: &str) -> Self {
        self.add_association(name, Association { kind: AssociationKind::ToOne, entity: entity.to_string() });
        self
    }

    pub fn to_many(mut self, name: &str, entity: &str) -> Self {
        self.add_association(name, Association { kind: AssociationKind::ToMany, entity: entity.to_string() });
        self
    }

    pub fn search_id(mut self, name: &str) -> Self {
        self.search_id = Some(name.to_string());
        self
    }

    pub fn add_field(&mut self, name: &str, field_type: FieldType) {
        self.fields.insert(name.to_lowercase(), (name.to_string(), field_type));
    }

    pub fn add_association(&mut self, name: &str, association: Association) {
        self.associations.insert(name.to_lowercase(), (name.to_string(), association));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn style(&self) -> LookupStyle {
        self.style
    }

    pub fn is_searchable(&self) -> bool {
        self.style == LookupStyle::Search
    }

    /// The name the search index uses for this entity's identifier.
    pub fn search_id_name(&self) -> &str {
        self.search_id.as_deref().unwrap_or(ID)
    }

    /// Case-insensitive lookup returning the canonical field name and its type.
    pub fn field_type(&self, name: &str) -> Option<(&str, FieldType)> {
        self.fields.get(&name.to_lowercase()).map(|(canonical, ty)| (canonical.as_str(), *ty))
    }

    pub fn association(&self, name: &str) -> Option<(&str, &Association)> {
        self.associations.get(&name.to_lowercase()).map(|(canonical, assoc)| (canonical.as_str(), assoc))
    }
}

#[derive(Debug, Clone)]
pub struct EntityRegistry {
    schemas: HashMap<String, Arc<EntitySchema>>,
}

impl EntityRegistry {
    pub fn builtin() -> Self {
        let schemas = builtin_schemas()
            .into_iter()
            .map(|schema| (schema.name().to_lowercase(), Arc::new(schema)))
            .collect();
        Self { schemas }
    }

    /// Built-in schemas extended with the fields and associations declared in the run configuration.
    pub fn from_config(config: &LoaderConfig) -> Result<Self, ConfigError> {
        let mut schemas: HashMap<String, EntitySchema> = builtin_schemas()
            .into_iter()
            .map(|schema| (schema.name().to_lowercase(), schema))
            .collect();

        for (entity_name, entity_config) in &config.entities {
            let schema = schemas
                .get_mut(&entity_name.to_lowercase())
                .ok_or_else(|| ConfigError::UnknownEntity(entity_name.clone()))?;
            for (field, field_type) in &entity_config.fields {
                debug!("Adding field {}.{} ({})", schema.name(), field, field_type);
                schema.add_field(field, *field_type);
            }
            for (name, association) in &entity_config.associations {
                debug!("Adding association {}.{} -> {}", schema.name(), name, association.entity);
                schema.add_association(name, association.clone());
            }
        }

        for schema in schemas.values() {
            for (name, association) in schema.associations.values() {
                if !schemas.contains_key(&association.entity.to_lowercase()) {
                    return Err(ConfigError::UnknownAssociationEntity {
                        entity: schema.name().to_string(),
                        association: name.clone(),
                        target: association.entity.clone(),
                    });
                }
            }
        }

        Ok(Self { schemas: schemas.into_iter().map(|(k, v)| (k, Arc::new(v))).collect() })
    }

    pub fn get(&self, name: &str) -> Option<Arc<EntitySchema>> {
        self.schemas.get(&name.to_lowercase()).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<EntitySchema>, ConfigError> {
        self.get(name).ok_or_else(|| ConfigError::UnknownEntity(name.to_string()))
    }

    /// The longest entity name the file name starts with, ignoring case. The name must end
    /// at a non-letter, so `CandidateWorkHistory.csv` does not match Candidate.
    pub fn for_file_name(&self, path: &Path) -> Option<Arc<EntitySchema>> {
        let file_name = path.file_name()?.to_string_lossy().to_lowercase();
        self.schemas
            .iter()
            .filter(|(key, _)| {
                file_name
                    .strip_prefix(key.as_str())
                    .map_or(false, |rest| !rest.starts_with(|c: char| c.is_ascii_alphabetic()))
            })
            .max_by_key(|(key, _)| key.len())
            .map(|(_, schema)| Arc::clone(schema))
    }
}

fn builtin_schemas() -> Vec<EntitySchema> {
    use FieldType::*;
    use LookupStyle::*;

    let person = [
        ("firstName", String), ("lastName", String), ("middleName", String), ("name", String),
        ("email", String), ("email2", String), ("phone", String), ("mobile", String),
        ("status", String), ("externalID", String), ("occupation", String), ("source", String),
        ("dateAdded", DateTime), ("isDeleted", Boolean),
        ("customText1", String), ("customText2", String), ("customText3", String),
        ("customInt1", Integer), ("customFloat1", Decimal), ("customDate1", DateTime),
    ];

    vec![
        EntitySchema::new("Candidate", Search)
            .fields(&person)
            .fields(&[("dateOfBirth", DateTime), ("salary", Decimal), ("dayRate", Decimal), ("description", String), ("username", String)])
            .compound("address")
            .compound("secondaryAddress")
            .to_one("owner", "CorporateUser")
            .to_one("category", "Category")
            .to_many("primarySkills", "Skill")
            .to_many("secondarySkills", "Skill")
            .to_many("categories", "Category")
            .to_many("specialties", "Specialty")
            .to_many("businessSectors", "BusinessSector"),
        EntitySchema::new("ClientContact", Search)
            .fields(&person)
            .fields(&[("division", String), ("type", String), ("comments", String)])
            .compound("address")
            .to_one("clientCorporation", "ClientCorporation")
            .to_one("owner", "CorporateUser")
            .to_many("categories", "Category")
            .to_many("businessSectors", "BusinessSector"),
        EntitySchema::new("ClientCorporation", Search)
            .strings(&["name", "status", "phone", "externalID", "companyURL", "industryList", "notes"])
            .fields(&[("annualRevenue", Decimal), ("numEmployees", Integer), ("dateAdded", DateTime)])
            .compound("address")
            .compound("billingAddress")
            .to_many("businessSectors", "BusinessSector"),
        EntitySchema::new("JobOrder", Search)
            .strings(&["title", "status", "employmentType", "externalID", "description", "source"])
            .fields(&[("isOpen", Boolean), ("numOpenings", Integer), ("salary", Decimal), ("startDate", DateTime), ("dateAdded", DateTime)])
            .compound("address")
            .to_one("clientContact", "ClientContact")
            .to_one("clientCorporation", "ClientCorporation")
            .to_one("owner", "CorporateUser")
            .to_many("skills", "Skill")
            .to_many("categories", "Category")
            .to_many("businessSectors", "BusinessSector"),
        EntitySchema::new("Placement", Search)
            .strings(&["status", "employmentType", "externalID", "comments"])
            .fields(&[("dateBegin", DateTime), ("dateEnd", DateTime), ("salary", Decimal), ("payRate", Decimal), ("clientBillRate", Decimal)])
            .to_one("candidate", "Candidate")
            .to_one("jobOrder", "JobOrder"),
        EntitySchema::new("Note", Search)
            .search_id("noteID")
            .strings(&["action", "comments", "externalID"])
            .fields(&[("dateAdded", DateTime), ("isDeleted", Boolean)])
            .to_one("commentingPerson", "CorporateUser")
            .to_one("jobOrder", "JobOrder")
            .to_many("candidates", "Candidate")
            .to_many("clientContacts", "ClientContact"),
        EntitySchema::new("Lead", Search)
            .fields(&person)
            .compound("address")
            .to_one("owner", "CorporateUser")
            .to_one("clientCorporation", "ClientCorporation")
            .to_many("categories", "Category"),
        EntitySchema::new("Opportunity", Search)
            .strings(&["title", "status", "type", "externalID", "description"])
            .fields(&[("dealValue", Decimal), ("expectedCloseDate", DateTime), ("isOpen", Boolean)])
            .to_one("clientContact", "ClientContact")
            .to_one("clientCorporation", "ClientCorporation")
            .to_one("owner", "CorporateUser")
            .to_many("categories", "Category"),
        EntitySchema::new("Skill", Query).strings(&["name"]).field("enabled", Boolean),
        EntitySchema::new("Category", Query).strings(&["name", "occupation", "type"]).field("enabled", Boolean),
        EntitySchema::new("Specialty", Query).strings(&["name"]).field("enabled", Boolean),
        EntitySchema::new("BusinessSector", Query).strings(&["name"]),
        EntitySchema::new("CorporateUser", Query)
            .strings(&["firstName", "lastName", "name", "email", "username", "externalID"])
            .field("enabled", Boolean),
        EntitySchema::new("Tearsheet", Query)
            .strings(&["name", "description"])
            .field("isPrivate", Boolean)
            .to_many("candidates", "Candidate")
            .to_many("clientContacts", "ClientContact"),
        EntitySchema::new(ADDRESS, Query)
            .strings(&["address1", "address2", "city", "state", "zip", "countryName"])
            .field("countryID", Integer),
    ]
}

/// A record as exchanged with the remote system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(Map<String, Value>);

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: i64) -> Self {
        let mut entity = Self::new();
        entity.set_id(id);
        entity
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<i64> {
        match self.0.get(ID)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn set_id(&mut self, id: i64) {
        self.0.insert(ID.to_string(), Value::from(id));
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    /// Sets `parent.key`, creating the parent object when absent.
    pub fn insert_nested(&mut self, parent: &str, key: &str, value: Value) {
        let slot = self.0.entry(parent.to_string()).or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        if let Value::Object(map) = slot {
            map.insert(key.to_string(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Renders the value at a dotted path as text. To-many envelopes (`{"data": [...]}`)
    /// and arrays are flattened and joined with `delimiter`.
    pub fn string_value(&self, path: &str, delimiter: &str) -> Option<String> {
        let segments: Vec<&str> = path.split('.').collect();
        let (head, rest) = segments.split_first()?;
        let mut out = Vec::new();
        collect_strings(self.0.get(*head)?, rest, &mut out);
        if out.is_empty() {
            None
        } else {
            Some(out.join(delimiter))
        }
    }
}

fn collect_strings(value: &Value, segments: &[&str], out: &mut Vec<String>) {
    if let Some(items) = value.get("data").and_then(Value::as_array) {
        for item in items {
            collect_strings(item, segments, out);
        }
        return;
    }
    if let Value::Array(items) = value {
        for item in items {
            collect_strings(item, segments, out);
        }
        return;
    }
    match segments.split_first() {
        None => match value {
            Value::Null => {}
            Value::String(s) => out.push(s.clone()),
            Value::Number(n) => out.push(n.to_string()),
            Value::Bool(b) => out.push(b.to_string()),
            other => out.push(other.to_string()),
        },
        Some((head, rest)) => {
            if let Some(next) = value.get(*head) {
                collect_strings(next, rest, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookups_are_case_insensitive() {
        let registry = EntityRegistry::builtin();
        let candidate = registry.get("candidate").unwrap();
        assert_eq!(candidate.name(), "Candidate");
        assert_eq!(candidate.field_type("EXTERNALID"), Some(("externalID", FieldType::String)));
        assert_eq!(candidate.association("primaryskills").map(|(n, a)| (n, a.kind)), Some(("primarySkills", AssociationKind::ToMany)));
    }

    #[test]
    fn custom_object_entities_are_unknown() {
        let registry = EntityRegistry::builtin();
        let err = registry.resolve("PersonCustomObjectInstance1").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEntity(ref name) if name == "PersonCustomObjectInstance1"));
        assert!(registry.for_file_name(Path::new("ClientCorporationCustomObjectInstance2.csv")).is_none());
    }

    #[test]
    fn entity_from_file_name_prefers_longest_match() {
        let registry = EntityRegistry::builtin();
        let name = |file: &str| registry.for_file_name(Path::new(file)).map(|s| s.name().to_string());
        assert_eq!(name("data/Candidate.csv").as_deref(), Some("Candidate"));
        assert_eq!(name("clientcorporation_2.csv.gz").as_deref(), Some("ClientCorporation"));
        assert_eq!(name("CLIENTCONTACT-export.csv").as_deref(), Some("ClientContact"));
        assert_eq!(name("2024.csv"), None);
    }

    #[test]
    fn note_searches_by_note_id() {
        let registry = EntityRegistry::builtin();
        assert_eq!(registry.get("Note").unwrap().search_id_name(), "noteID");
        assert_eq!(registry.get("Candidate").unwrap().search_id_name(), "id");
        assert!(!registry.get("Skill").unwrap().is_searchable());
    }

    #[test]
    fn string_value_flattens_to_many_envelopes() {
        let entity = Entity::from_value(json!({
            "id": 7,
            "address": {"city": "St. Louis"},
            "primarySkills": {"total": 2, "data": [{"id": 1, "name": "Java"}, {"id": 2, "name": "Rust"}]},
            "salary": 1250.5,
            "owner": null
        }))
        .unwrap();

        assert_eq!(entity.id(), Some(7));
        assert_eq!(entity.string_value("address.city", ";").as_deref(), Some("St. Louis"));
        assert_eq!(entity.string_value("primarySkills.name", ";").as_deref(), Some("Java;Rust"));
        assert_eq!(entity.string_value("salary", ";").as_deref(), Some("1250.5"));
        assert_eq!(entity.string_value("owner", ";"), None);
        assert_eq!(entity.string_value("missing", ";"), None);
    }

    #[test]
    fn insert_nested_builds_parent_object() {
        let mut entity = Entity::new();
        entity.insert_nested("address", "city", json!("Austin"));
        entity.insert_nested("address", "zip", json!("78701"));
        assert_eq!(entity.get("address"), Some(&json!({"city": "Austin", "zip": "78701"})));
    }

    #[test]
    fn config_cannot_extend_unknown_entities() {
        let yaml = "entities:\n  Spaceship:\n    exist_fields: [name]\n";
        let config: LoaderConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(EntityRegistry::from_config(&config), Err(ConfigError::UnknownEntity(name)) if name == "Spaceship"));
    }
}
