//! Catalog, secret and set attribute validation.
//!
//! Attributes arrive as free-form JSON objects. Each validator reports every
//! problem it finds, keyed by the attribute path, instead of stopping at the
//! first one.

use std::sync::LazyLock;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};

pub const ATTR_PROJECT: &str = "project";
pub const ATTR_ZONE: &str = "zone";
pub const ATTR_FILTERS: &str = "filters";
pub const ATTR_FILTER: &str = "filter";
pub const ATTR_INSTANCE_GROUP: &str = "instance_group";

pub const SECRET_CLIENT_EMAIL: &str = "client_email";
pub const SECRET_PRIVATE_KEY: &str = "private_key";
pub const SECRET_PRIVATE_KEY_ID: &str = "private_key_id";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {scope}: {}", .problems.join(", "))]
pub struct ValidationError {
    pub scope: &'static str,
    pub problems: Vec<String>,
}

/// Attributes of a Google Cloud host catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogAttributes {
    pub project: String,
    pub zone: String,
}

impl CatalogAttributes {
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let value = present_fields(value);
        check(&CATALOG_SCHEMA, &value)?;
        let attrs: Self = decode("attributes", value)?;
        Ok(Self {
            project: attrs.project.trim().to_string(),
            zone: attrs.zone.trim().to_string(),
        })
    }
}

/// Service account key material. Absent secrets mean the plugin relies on
/// the environment's default credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceAccountSecrets {
    pub client_email: String,
    pub private_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_id: Option<String>,
}

impl ServiceAccountSecrets {
    /// `None` when no secrets were supplied.
    pub fn from_value(value: Option<&Value>) -> Result<Option<Self>, ValidationError> {
        let Some(value) = value else {
            return Ok(None);
        };
        let value = present_fields(value);
        if value.as_object().is_some_and(Map::is_empty) {
            return Ok(None);
        }
        check(&SECRETS_SCHEMA, &value)?;
        let secrets: Self = decode("secrets", value)?;
        Ok(Some(Self {
            client_email: secrets.client_email.trim().to_string(),
            private_key: secrets.private_key.trim().to_string(),
            private_key_id: secrets
                .private_key_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
        }))
    }
}

/// Attributes of a host set within a catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetAttributes {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_group: Option<String>,
}

impl SetAttributes {
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let value = present_fields(value);
        check(&SET_SCHEMA, &value)?;
        let attrs: Self = decode("attributes", value)?;
        Ok(Self {
            filters: attrs
                .filters
                .iter()
                .map(|f| f.trim().to_string())
                .collect(),
            instance_group: attrs
                .instance_group
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty()),
        })
    }
}

// `\S` rejects blank strings; patterns are unanchored searches.
fn catalog_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            ATTR_PROJECT: {"type": "string", "pattern": "\\S"},
            ATTR_ZONE: {"type": "string", "pattern": "\\S"}
        },
        "required": [ATTR_PROJECT, ATTR_ZONE],
        "additionalProperties": false
    })
}

fn secrets_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            SECRET_CLIENT_EMAIL: {"type": "string", "pattern": "^\\s*[^@\\s]+@[^@\\s]+\\s*$"},
            SECRET_PRIVATE_KEY: {"type": "string", "pattern": "\\S"},
            SECRET_PRIVATE_KEY_ID: {"type": "string"}
        },
        "required": [SECRET_CLIENT_EMAIL, SECRET_PRIVATE_KEY],
        "additionalProperties": false
    })
}

fn set_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            ATTR_FILTERS: {
                "type": "array",
                "items": {"type": "string", "pattern": "\\S"}
            },
            ATTR_INSTANCE_GROUP: {"type": "string"}
        },
        "additionalProperties": false
    })
}

type CompiledSchema = LazyLock<Result<AttributeSchema, String>>;

static CATALOG_SCHEMA: CompiledSchema =
    LazyLock::new(|| AttributeSchema::compile("attributes", catalog_schema()));
static SECRETS_SCHEMA: CompiledSchema =
    LazyLock::new(|| AttributeSchema::compile("secrets", secrets_schema()));
static SET_SCHEMA: CompiledSchema =
    LazyLock::new(|| AttributeSchema::compile("attributes", set_schema()));

/// Compiled JSON Schema plus the field lists used to report missing and
/// unexpected fields one by one.
struct AttributeSchema {
    scope: &'static str,
    validator: jsonschema::Validator,
    properties: Vec<String>,
    required: Vec<String>,
}

impl AttributeSchema {
    fn compile(scope: &'static str, schema: Value) -> Result<Self, String> {
        let names = |key: &str| -> Vec<String> {
            match schema.get(key) {
                Some(Value::Object(obj)) => obj.keys().cloned().collect(),
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
                _ => Vec::new(),
            }
        };
        let properties = names("properties");
        let required = names("required");

        let validator = jsonschema::validator_for(&schema).map_err(|e| {
            tracing::error!(scope, error = %e, "Failed to compile attribute schema");
            format!("{scope} schema does not compile: {e}")
        })?;

        Ok(Self {
            scope,
            validator,
            properties,
            required,
        })
    }

    fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        if self.validator.is_valid(value) {
            return Ok(());
        }

        let mut problems = Vec::new();
        let mut seen_required = false;
        let mut seen_additional = false;

        for error in self.validator.iter_errors(value) {
            let msg = error.to_string();

            if msg.contains("is a required property") {
                if !seen_required {
                    seen_required = true;
                    let obj = value.as_object();
                    for field in &self.required {
                        if !obj.is_some_and(|o| o.contains_key(field)) {
                            problems.push(format!("{}.{field}: required", self.scope));
                        }
                    }
                }
                continue;
            }

            if msg.contains("Additional properties") {
                if !seen_additional {
                    seen_additional = true;
                    if let Some(obj) = value.as_object() {
                        for key in obj.keys().filter(|k| !self.properties.contains(*k)) {
                            problems.push(format!("{}.{key}: unrecognized field", self.scope));
                        }
                    }
                }
                continue;
            }

            let path = error.instance_path().to_string().replace('/', ".");
            problems.push(format!("{}{path}: {msg}", self.scope));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                scope: self.scope,
                problems,
            })
        }
    }
}

fn check(schema: &CompiledSchema, value: &Value) -> Result<(), ValidationError> {
    match &**schema {
        Ok(schema) => schema.validate(value),
        Err(e) => Err(ValidationError {
            scope: "schema",
            problems: vec![e.clone()],
        }),
    }
}

fn decode<T: DeserializeOwned>(scope: &'static str, value: Value) -> Result<T, ValidationError> {
    serde_json::from_value(value).map_err(|e| ValidationError {
        scope,
        problems: vec![format!("{scope}: {e}")],
    })
}

/// Absent attributes and null entries both mean "not set".
fn present_fields(value: &Value) -> Value {
    match value {
        Value::Null => Value::Object(Map::new()),
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Trim string attributes and fold a lone `filter` string into `filters`.
pub fn normalize(attributes: Value) -> Value {
    let Value::Object(map) = attributes else {
        return attributes;
    };

    let mut out = Map::with_capacity(map.len());
    for (key, value) in map {
        let filter_key = key == ATTR_FILTER || key == ATTR_FILTERS;
        match value {
            Value::String(f) if filter_key => {
                push_filters(&mut out, vec![Value::String(f.trim().to_string())]);
            }
            Value::Array(items) if key == ATTR_FILTERS => {
                push_filters(&mut out, items);
            }
            Value::String(s) => {
                out.insert(key, Value::String(s.trim().to_string()));
            }
            other => {
                out.insert(key, other);
            }
        }
    }
    Value::Object(out)
}

fn push_filters(out: &mut Map<String, Value>, items: Vec<Value>) {
    let entry = out
        .entry(ATTR_FILTERS)
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(list) = entry {
        list.extend(items);
    }
}
