//! Resource schemas: field types, presence rules, and config validation.
//!
//! Every resource type registered with the provider describes its fields
//! here. The engine validates user configuration against the schema before
//! any handler runs, and uses the `sensitive` flag to redact key material
//! from anything shown to the user.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

/// Placeholder written in place of sensitive attribute values.
pub const REDACTED: &str = "[REDACTED]";

// ---------------------------------------------------------------------------
// Field definitions
// ---------------------------------------------------------------------------

/// Value type of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Int,
    Bool,
    /// List of strings.
    StringList,
}

impl FieldType {
    /// Whether `value` is acceptable for this type.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Bool => value.is_boolean(),
            Self::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Int => write!(f, "int"),
            Self::Bool => write!(f, "bool"),
            Self::StringList => write!(f, "list(string)"),
        }
    }
}

/// Who supplies a field's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    /// Must be set in configuration.
    Required,
    /// May be set in configuration.
    Optional,
    /// Set only by the handler.
    Computed,
    /// May be set in configuration; otherwise the handler fills it in.
    OptionalComputed,
}

impl Presence {
    pub fn is_configurable(self) -> bool {
        !matches!(self, Self::Computed)
    }
}

/// Schema of a single field.
#[derive(Debug, Clone, Serialize)]
pub struct FieldSchema {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub ty: FieldType,
    pub presence: Presence,
    /// Value holds key material and must never be displayed.
    pub sensitive: bool,
    /// Changing the value requires replacing the remote object.
    pub force_new: bool,
    pub description: &'static str,
}

impl FieldSchema {
    const fn new(
        name: &'static str,
        ty: FieldType,
        presence: Presence,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            ty,
            presence,
            sensitive: false,
            force_new: false,
            description,
        }
    }

    pub const fn required(name: &'static str, ty: FieldType, description: &'static str) -> Self {
        Self::new(name, ty, Presence::Required, description)
    }

    pub const fn optional(name: &'static str, ty: FieldType, description: &'static str) -> Self {
        Self::new(name, ty, Presence::Optional, description)
    }

    pub const fn computed(name: &'static str, ty: FieldType, description: &'static str) -> Self {
        Self::new(name, ty, Presence::Computed, description)
    }

    pub const fn optional_computed(
        name: &'static str,
        ty: FieldType,
        description: &'static str,
    ) -> Self {
        Self::new(name, ty, Presence::OptionalComputed, description)
    }

    pub const fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub const fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Resource schema
// ---------------------------------------------------------------------------

/// Lifecycle offered by a resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Created, updated, and deleted by the provider.
    Managed,
    /// Read-only lookup refreshed on every apply.
    Data,
}

/// Errors returned by [`ResourceSchema::validate_config`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("{resource}: unknown field '{field}'")]
    UnknownField { resource: String, field: String },

    #[error("{resource}: missing required field '{field}'")]
    MissingField { resource: String, field: String },

    #[error("{resource}: field '{field}' is computed and cannot be set")]
    ComputedField { resource: String, field: String },

    #[error("{resource}: field '{field}' must be of type {expected}")]
    TypeMismatch {
        resource: String,
        field: String,
        expected: FieldType,
    },
}

/// Full schema of a resource type.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSchema {
    pub type_name: &'static str,
    pub kind: ResourceKind,
    /// Whether `import` may adopt an existing remote object by id.
    pub importable: bool,
    pub description: &'static str,
    pub fields: Vec<FieldSchema>,
}

impl ResourceSchema {
    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Names of fields flagged sensitive.
    pub fn sensitive_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().filter(|f| f.sensitive).map(|f| f.name)
    }

    /// Check user configuration against the schema.
    ///
    /// `null` values are treated as absent.
    pub fn validate_config(&self, config: &Map<String, Value>) -> Result<(), SchemaError> {
        for (key, value) in config {
            let field = self.field(key).ok_or_else(|| SchemaError::UnknownField {
                resource: self.type_name.to_owned(),
                field: key.clone(),
            })?;
            if value.is_null() {
                continue;
            }
            if !field.presence.is_configurable() {
                return Err(SchemaError::ComputedField {
                    resource: self.type_name.to_owned(),
                    field: key.clone(),
                });
            }
            if !field.ty.matches(value) {
                return Err(SchemaError::TypeMismatch {
                    resource: self.type_name.to_owned(),
                    field: key.clone(),
                    expected: field.ty,
                });
            }
        }

        for field in self.fields.iter().filter(|f| f.presence == Presence::Required) {
            if config.get(field.name).is_none_or(Value::is_null) {
                return Err(SchemaError::MissingField {
                    resource: self.type_name.to_owned(),
                    field: field.name.to_owned(),
                });
            }
        }

        Ok(())
    }

    /// Copy of `attributes` with every sensitive value replaced by
    /// [`REDACTED`]. Absent and null values are left alone.
    pub fn redact(&self, attributes: &Map<String, Value>) -> Map<String, Value> {
        let mut out = attributes.clone();
        for name in self.sensitive_fields() {
            if let Some(value) = out.get_mut(name)
                && !value.is_null()
            {
                *value = Value::String(REDACTED.to_owned());
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ResourceSchema {
        ResourceSchema {
            type_name: "test_thing",
            kind: ResourceKind::Managed,
            importable: false,
            description: "test",
            fields: vec![
                FieldSchema::required("name", FieldType::String, "name").force_new(),
                FieldSchema::optional("count", FieldType::Int, "count"),
                FieldSchema::optional_computed("tags", FieldType::StringList, "tags"),
                FieldSchema::computed("secret", FieldType::String, "secret").sensitive(),
            ],
        }
    }

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn field_type_matches() {
        assert!(FieldType::String.matches(&json!("x")));
        assert!(!FieldType::String.matches(&json!(1)));
        assert!(FieldType::Int.matches(&json!(3)));
        assert!(!FieldType::Int.matches(&json!(3.5)));
        assert!(FieldType::Bool.matches(&json!(true)));
        assert!(FieldType::StringList.matches(&json!(["a", "b"])));
        assert!(FieldType::StringList.matches(&json!([])));
        assert!(!FieldType::StringList.matches(&json!(["a", 1])));
    }

    #[test]
    fn builder_flags() {
        let f = FieldSchema::computed("k", FieldType::String, "").sensitive().force_new();
        assert!(f.sensitive);
        assert!(f.force_new);
        assert_eq!(f.presence, Presence::Computed);
    }

    #[test]
    fn validate_accepts_minimal_config() {
        schema()
            .validate_config(&config(json!({ "name": "a" })))
            .unwrap();
    }

    #[test]
    fn validate_accepts_full_config() {
        schema()
            .validate_config(&config(json!({ "name": "a", "count": 2, "tags": ["x"] })))
            .unwrap();
    }

    #[test]
    fn validate_rejects_unknown_field() {
        let err = schema()
            .validate_config(&config(json!({ "name": "a", "bogus": 1 })))
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownField { ref field, .. } if field == "bogus"));
    }

    #[test]
    fn validate_rejects_missing_required() {
        let err = schema().validate_config(&config(json!({}))).unwrap_err();
        assert!(matches!(err, SchemaError::MissingField { ref field, .. } if field == "name"));
        assert_eq!(
            err.to_string(),
            "test_thing: missing required field 'name'"
        );
    }

    #[test]
    fn validate_treats_null_required_as_missing() {
        let err = schema()
            .validate_config(&config(json!({ "name": null })))
            .unwrap_err();
        assert!(matches!(err, SchemaError::MissingField { .. }));
    }

    #[test]
    fn validate_rejects_computed_field() {
        let err = schema()
            .validate_config(&config(json!({ "name": "a", "secret": "s" })))
            .unwrap_err();
        assert!(matches!(err, SchemaError::ComputedField { .. }));
    }

    #[test]
    fn validate_rejects_type_mismatch() {
        let err = schema()
            .validate_config(&config(json!({ "name": "a", "count": "two" })))
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::TypeMismatch {
                resource: "test_thing".into(),
                field: "count".into(),
                expected: FieldType::Int,
            }
        );
        assert!(err.to_string().contains("must be of type int"));
    }

    #[test]
    fn redact_replaces_sensitive_values_only() {
        let attrs = config(json!({ "name": "a", "secret": "hunter2" }));
        let redacted = schema().redact(&attrs);
        assert_eq!(redacted["name"], json!("a"));
        assert_eq!(redacted["secret"], json!(REDACTED));
        // Input left as is.
        assert_eq!(attrs["secret"], json!("hunter2"));
    }

    #[test]
    fn redact_leaves_null_sensitive_values() {
        let attrs = config(json!({ "name": "a", "secret": null }));
        let redacted = schema().redact(&attrs);
        assert!(redacted["secret"].is_null());
    }

    #[test]
    fn schema_serializes_for_display() {
        let value = serde_json::to_value(schema()).unwrap();
        assert_eq!(value["kind"], json!("managed"));
        assert_eq!(value["fields"][0]["type"], json!("string"));
        assert_eq!(value["fields"][3]["sensitive"], json!(true));
    }
}
