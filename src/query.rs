use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::entity::{EntitySchema, FieldType, ID};
use crate::field::Field;

pub const ALL_FIELDS: &str = "*";
/// Larger field lists overflow the request line; fall back to every field instead.
const MAX_NUM_FIELDS: usize = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Failed to create lucene search string for: '{field}' with unsupported field type: {field_type}")]
    UnsupportedSearchType { field: String, field_type: FieldType },
    #[error("Failed to create query where clause for: '{field}' with unsupported field type: {field_type}")]
    UnsupportedWhereType { field: String, field_type: FieldType },
}

/// The set of fields requested back from a lookup. Ordering never matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Projection(BTreeSet<String>);

impl Projection {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    pub fn all() -> Self {
        Self::new([ALL_FIELDS])
    }

    /// Adds `id` and collapses oversized lists to `*`.
    pub fn corrected(mut self) -> Self {
        if self.0.contains(ALL_FIELDS) {
            return Self::all();
        }
        if self.0.len() > MAX_NUM_FIELDS {
            return Self::all();
        }
        self.0.insert(ID.to_string());
        self
    }

    pub fn is_all(&self) -> bool {
        self.0.contains(ALL_FIELDS)
    }

    /// Whether entities fetched with this projection carry the value at `path`.
    pub fn covers(&self, path: &str) -> bool {
        if self.is_all() || self.0.contains(path) {
            return true;
        }
        match path.split_once('.') {
            Some((root, _)) => self.0.contains(root),
            None => false,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.fields().collect();
        f.write_str(&joined.join(","))
    }
}

/// A lookup in whichever grammar the target entity supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Search-index syntax: `email:"a@b.com" AND (name:"Java" OR name:"Rust")`.
    Search(String),
    /// Relational where clause: `email='a@b.com' AND (name='Java' OR name='Rust')`.
    Where(String),
}

impl Query {
    pub fn text(&self) -> &str {
        match self {
            Query::Search(s) | Query::Where(s) => s,
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

pub fn build(entity: &EntitySchema, exist_fields: &[Field], delimiter: &str, wildcard_matching: bool) -> Result<Query, QueryError> {
    if entity.is_searchable() {
        search_string(exist_fields, delimiter, wildcard_matching).map(Query::Search)
    } else {
        where_clause(exist_fields, delimiter, wildcard_matching).map(Query::Where)
    }
}

/// All fields AND'ed; to-many fields become a parenthesized OR of their values.
pub fn search_string(exist_fields: &[Field], delimiter: &str, wildcard_matching: bool) -> Result<String, QueryError> {
    let clauses = exist_fields
        .iter()
        .map(|field| {
            let entity = field.field_entity();
            if field.is_to_many() {
                let terms = field
                    .values(delimiter)
                    .into_iter()
                    .map(|value| search_term(field.query_name(), value, field.field_type(), entity, wildcard_matching))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("({})", terms.join(" OR ")))
            } else {
                search_term(field.query_name(), field.value(), field.field_type(), entity, wildcard_matching)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(clauses.join(" AND "))
}

pub fn where_clause(exist_fields: &[Field], delimiter: &str, wildcard_matching: bool) -> Result<String, QueryError> {
    let clauses = exist_fields
        .iter()
        .map(|field| {
            if field.is_to_many() {
                let terms = field
                    .values(delimiter)
                    .into_iter()
                    .map(|value| where_term(field.query_name(), value, field.field_type(), wildcard_matching))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("({})", terms.join(" OR ")))
            } else {
                where_term(field.query_name(), field.value(), field.field_type(), wildcard_matching)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(clauses.join(" AND "))
}

pub fn search_term(field: &str, value: &str, field_type: FieldType, entity: &EntitySchema, wildcard_matching: bool) -> Result<String, QueryError> {
    let field = if field == ID { entity.search_id_name() } else { field };
    match field_type {
        FieldType::Integer | FieldType::Decimal | FieldType::Boolean | FieldType::DateTime => Ok(format!("{}:{}", field, value)),
        FieldType::String if wildcard_matching => Ok(format!("{}: {}", field, value)),
        FieldType::String => Ok(format!("{}:\"{}\"", field, value)),
        FieldType::Object => Err(QueryError::UnsupportedSearchType { field: field.to_string(), field_type }),
    }
}

pub fn where_term(field: &str, value: &str, field_type: FieldType, wildcard_matching: bool) -> Result<String, QueryError> {
    match field_type {
        FieldType::Integer | FieldType::Decimal => Ok(format!("{}={}", field, value)),
        FieldType::Boolean => {
            let flag = value.trim() == "1" || value.trim().eq_ignore_ascii_case("true");
            Ok(format!("{}={}", field, flag))
        }
        FieldType::String if wildcard_matching => {
            if has_unescaped_asterisk(value) {
                Ok(format!("{} like '{}'", field, value.replace('*', "%")))
            } else {
                Ok(format!("{}='{}'", field, value.replace("\\*", "*")))
            }
        }
        FieldType::String => Ok(format!("{}='{}'", field, value)),
        // The cell carries its own comparison operator: `>2020-01-01`, `=2020-01-01`.
        FieldType::DateTime => Ok(format!("{}{}", field, value)),
        FieldType::Object => Err(QueryError::UnsupportedWhereType { field: field.to_string(), field_type }),
    }
}

/// True when some `*` follows a character other than a backslash. A leading `*` is literal.
fn has_unescaped_asterisk(value: &str) -> bool {
    let chars: Vec<char> = value.chars().collect();
    chars.windows(2).any(|pair| pair[1] == '*' && pair[0] != '\\')
}
