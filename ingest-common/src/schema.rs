use serde_json::{Map, Value};
use tracing::warn;

use crate::error::ValidationError;
use crate::time::parse_iso8601;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Object,
    Array,
    /// An ISO-8601 date or date-time string.
    Timestamp,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Timestamp => value.as_str().and_then(parse_iso8601).is_some(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Timestamp => "ISO-8601 timestamp",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    /// Accepted values for enum-like string fields. Empty means any value.
    pub allowed: &'static [&'static str],
    /// Reject empty strings and empty arrays.
    pub non_empty: bool,
}

impl FieldRule {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            allowed: &[],
            non_empty: true,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            allowed: &[],
            non_empty: false,
        }
    }

    pub const fn one_of(mut self, allowed: &'static [&'static str]) -> Self {
        self.allowed = allowed;
        self
    }
}

/// Optional identifiers every class accepts.
pub const COMMON_OPTIONAL_FIELDS: [FieldRule; 4] = [
    FieldRule::optional("id", FieldKind::String),
    FieldRule::optional("timestamp", FieldKind::Timestamp),
    FieldRule::optional("correlationId", FieldKind::String),
    FieldRule::optional("metadata", FieldKind::Object),
];

/// Field rules of one event class.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub fields: &'static [FieldRule],
}

impl Schema {
    pub const fn new(fields: &'static [FieldRule]) -> Self {
        Self { fields }
    }

    /// Check every rule before returning, then report the first failing category:
    /// missing fields, then wrong types, then invalid enum values, then other constraints.
    /// Optional fields (including the common identifiers) with a wrong type are logged and
    /// left out of the returned object.
    pub fn validate(&self, raw: &Value) -> Result<Map<String, Value>, ValidationError> {
        let object = raw.as_object().ok_or_else(|| {
            ValidationError::Malformed("envelope must be a JSON object".to_owned())
        })?;

        let mut missing = Vec::new();
        let mut wrong_type = Vec::new();
        let mut invalid_value = None;
        let mut constraint = None;
        let mut ignored = Vec::new();

        for rule in self.fields.iter().chain(COMMON_OPTIONAL_FIELDS.iter()) {
            let value = match object.get(rule.name) {
                None | Some(Value::Null) => {
                    if rule.required {
                        missing.push(rule.name.to_owned());
                    }
                    continue;
                }
                Some(value) => value,
            };

            if !rule.kind.matches(value) {
                if rule.required {
                    wrong_type.push(rule.name.to_owned());
                } else {
                    warn!(
                        field = rule.name,
                        expected = rule.kind.name(),
                        "ignoring optional field with unexpected type"
                    );
                    ignored.push(rule.name);
                }
                continue;
            }

            if rule.non_empty && is_empty(value) {
                match rule.kind {
                    FieldKind::Array => {
                        constraint
                            .get_or_insert_with(|| format!("{} must not be empty", rule.name));
                    }
                    _ => missing.push(rule.name.to_owned()),
                }
                continue;
            }

            if !rule.allowed.is_empty() {
                let value = value.as_str().unwrap_or_default();
                if !rule.allowed.contains(&value) {
                    invalid_value.get_or_insert_with(|| ValidationError::InvalidValue {
                        field: rule.name.to_owned(),
                        value: value.to_owned(),
                        allowed: rule.allowed.iter().map(|s| s.to_string()).collect(),
                    });
                }
            }
        }

        if !missing.is_empty() {
            return Err(ValidationError::MissingFields(missing));
        }
        if !wrong_type.is_empty() {
            return Err(ValidationError::InvalidTypes(wrong_type));
        }
        if let Some(error) = invalid_value {
            return Err(error);
        }
        if let Some(message) = constraint {
            return Err(ValidationError::Constraint(message));
        }

        let mut object = object.clone();
        for name in ignored {
            object.remove(name);
        }
        Ok(object)
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCHEMA: Schema = Schema::new(&[
        FieldRule::required("type", FieldKind::String),
        FieldRule::required("payload", FieldKind::Object),
        FieldRule::required("kind", FieldKind::String).one_of(&["a", "b"]),
        FieldRule::required("items", FieldKind::Array),
        FieldRule::optional("note", FieldKind::String),
    ]);

    #[test]
    fn accepts_valid_input() {
        let raw = json!({"type": "t", "payload": {}, "kind": "a", "items": [1]});
        assert!(SCHEMA.validate(&raw).is_ok());
    }

    #[test]
    fn reports_all_missing_fields_first() {
        // kind is also invalid, but missing fields win.
        let raw = json!({"type": "", "kind": "z", "items": [1]});
        assert_eq!(
            SCHEMA.validate(&raw),
            Err(ValidationError::MissingFields(vec![
                "type".to_owned(),
                "payload".to_owned()
            ]))
        );
    }

    #[test]
    fn null_and_array_payloads_are_rejected() {
        let raw = json!({"type": "t", "payload": null, "kind": "a", "items": [1]});
        assert_eq!(
            SCHEMA.validate(&raw),
            Err(ValidationError::MissingFields(vec!["payload".to_owned()]))
        );

        let raw = json!({"type": "t", "payload": [1, 2], "kind": "a", "items": [1]});
        assert_eq!(
            SCHEMA.validate(&raw),
            Err(ValidationError::InvalidTypes(vec!["payload".to_owned()]))
        );
    }

    #[test]
    fn enum_values_are_checked() {
        let raw = json!({"type": "t", "payload": {}, "kind": "c", "items": [1]});
        assert_eq!(
            SCHEMA.validate(&raw),
            Err(ValidationError::InvalidValue {
                field: "kind".to_owned(),
                value: "c".to_owned(),
                allowed: vec!["a".to_owned(), "b".to_owned()],
            })
        );
    }

    #[test]
    fn empty_arrays_violate_constraint() {
        let raw = json!({"type": "t", "payload": {}, "kind": "a", "items": []});
        assert_eq!(
            SCHEMA.validate(&raw),
            Err(ValidationError::Constraint("items must not be empty".to_owned()))
        );
    }

    #[test]
    fn optional_fields_with_wrong_type_only_warn() {
        let raw = json!({
            "type": "t", "payload": {}, "kind": "b", "items": [1],
            "note": 42, "id": 7, "timestamp": "yesterday", "metadata": "x"
        });
        let object = SCHEMA.validate(&raw).unwrap();
        for ignored in ["note", "id", "timestamp", "metadata"] {
            assert!(!object.contains_key(ignored), "{ignored} was kept");
        }
        assert_eq!(object["kind"], "b");
    }

    #[test]
    fn iso8601_timestamps_are_kept() {
        for timestamp in ["2024-04-30T08:00:00", "2024-04-30T08:00:00+0100", "2024-04-30"] {
            let raw = json!({
                "type": "t", "payload": {}, "kind": "a", "items": [1], "timestamp": timestamp
            });
            let object = SCHEMA.validate(&raw).unwrap();
            assert_eq!(object["timestamp"], timestamp);
        }
    }

    #[test]
    fn non_objects_are_malformed() {
        assert!(matches!(
            SCHEMA.validate(&json!([1, 2])),
            Err(ValidationError::Malformed(_))
        ));
    }
}
