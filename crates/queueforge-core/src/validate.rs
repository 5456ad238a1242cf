//! Payload validator: rejects unknown keys, coerces strings to typed values
//! where unambiguous, fills defaults, fails on missing required keys or
//! out-of-range/unknown-enum values, and always produces the same
//! byte-stable canonical object for the same input — needed downstream for
//! dedup-key hashing and for idempotent re-validation.

use serde_json::{Map, Number, Value};

use crate::error::QueueError;

/// One property of a definition's queue-eligible parameter set.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Enum(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub default: Option<Value>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            default: None,
            minimum: None,
            maximum: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_range(mut self, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        self.minimum = minimum;
        self.maximum = maximum;
        self
    }
}

/// A definition's declared queue-eligible parameter set.
///
/// Properties are kept in declaration order; that order is what makes
/// `normalize` deterministic across runs (insertion order, no extras).
#[derive(Debug, Clone, Default)]
pub struct PayloadSchema {
    pub properties: Vec<ParamSpec>,
    pub additional_properties: bool,
}

impl PayloadSchema {
    pub fn new(properties: Vec<ParamSpec>) -> Self {
        Self { properties, additional_properties: false }
    }

    /// Parses a [`crate::model::JobDefinition::arg_schema`] document — a
    /// JSON-Schema-subset object of the shape `{"properties": {name: {type,
    /// enum?, minimum?, maximum?, default?}}, "required": [...]}` — into a
    /// [`PayloadSchema`]. Property order follows the object's key order, so
    /// two definitions with the same properties in a different JSON key
    /// order normalize to the same canonical output only if their
    /// `arg_schema` was written in the same order; callers that persist
    /// `arg_schema` should keep a stable key order at the source.
    pub fn from_arg_schema(schema: &Map<String, Value>) -> Result<Self, QueueError> {
        let properties = schema
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let required: Vec<String> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let additional_properties = schema
            .get("additional_properties")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut specs = Vec::with_capacity(properties.len());
        for (name, prop) in &properties {
            let prop = prop.as_object().ok_or_else(|| {
                QueueError::Validation(format!("arg_schema property {name} must be an object"))
            })?;
            let param_type = match prop.get("enum").and_then(Value::as_array) {
                Some(choices) => ParamType::Enum(
                    choices.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
                ),
                None => match prop.get("type").and_then(Value::as_str).unwrap_or("string") {
                    "integer" => ParamType::Integer,
                    "number" => ParamType::Number,
                    "boolean" => ParamType::Boolean,
                    _ => ParamType::String,
                },
            };
            let mut spec = ParamSpec::new(name.clone(), param_type);
            if required.iter().any(|r| r == name) {
                spec = spec.required();
            }
            if let Some(default) = prop.get("default") {
                spec = spec.with_default(default.clone());
            }
            let minimum = prop.get("minimum").and_then(Value::as_f64);
            let maximum = prop.get("maximum").and_then(Value::as_f64);
            if minimum.is_some() || maximum.is_some() {
                spec = spec.with_range(minimum, maximum);
            }
            specs.push(spec);
        }

        Ok(Self { properties: specs, additional_properties })
    }
}

fn coerce_bool(value: &Value, field: &str) -> Result<bool, QueueError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.to_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => Ok(true),
            "0" | "false" | "no" | "n" | "off" => Ok(false),
            _ => Err(QueueError::Validation(format!("{field} must be a boolean"))),
        },
        Value::Number(n) if n.as_i64() == Some(0) => Ok(false),
        Value::Number(n) if n.as_i64() == Some(1) => Ok(true),
        _ => Err(QueueError::Validation(format!("{field} must be a boolean"))),
    }
}

fn coerce_integer(value: &Value, field: &str) -> Result<i64, QueueError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| QueueError::Validation(format!("{field} must be an integer"))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| QueueError::Validation(format!("{field} must be an integer"))),
        _ => Err(QueueError::Validation(format!("{field} must be an integer"))),
    }
}

fn coerce_number(value: &Value, field: &str) -> Result<f64, QueueError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| QueueError::Validation(format!("{field} must be a number"))),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| QueueError::Validation(format!("{field} must be a number"))),
        _ => Err(QueueError::Validation(format!("{field} must be a number"))),
    }
}

fn coerce_string(value: &Value, field: &str) -> Result<String, QueueError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(QueueError::Validation(format!("{field} must be a string"))),
    }
}

fn check_range(field: &str, value: f64, spec: &ParamSpec) -> Result<(), QueueError> {
    if let Some(min) = spec.minimum {
        if value < min {
            return Err(QueueError::Validation(format!("{field} must be >= {min}")));
        }
    }
    if let Some(max) = spec.maximum {
        if value > max {
            return Err(QueueError::Validation(format!("{field} must be <= {max}")));
        }
    }
    Ok(())
}

fn convert_value(spec: &ParamSpec, raw: &Value) -> Result<Value, QueueError> {
    let field = spec.name.as_str();
    match &spec.param_type {
        ParamType::Boolean => Ok(Value::Bool(coerce_bool(raw, field)?)),
        ParamType::Integer => {
            let v = coerce_integer(raw, field)?;
            check_range(field, v as f64, spec)?;
            Ok(Value::Number(Number::from(v)))
        }
        ParamType::Number => {
            let v = coerce_number(raw, field)?;
            check_range(field, v, spec)?;
            let num = Number::from_f64(v)
                .ok_or_else(|| QueueError::Validation(format!("{field} is not a finite number")))?;
            Ok(Value::Number(num))
        }
        ParamType::String => Ok(Value::String(coerce_string(raw, field)?)),
        ParamType::Enum(choices) => {
            let s = coerce_string(raw, field)?;
            if !choices.iter().any(|c| c == &s) {
                return Err(QueueError::Validation(format!(
                    "{field} must be one of: {}",
                    choices.join(", ")
                )));
            }
            Ok(Value::String(s))
        }
    }
}

/// Normalizes `payload` against `schema`, producing a canonical object or a
/// [`QueueError::Validation`].
///
/// Determinism (P9): for fixed `schema`, `normalize` is a pure function of
/// `payload`'s key/value content — the output always iterates
/// `schema.properties` in declaration order, so the same logical input
/// yields byte-identical serialized output regardless of input key order.
pub fn normalize(schema: &PayloadSchema, payload: &Map<String, Value>) -> Result<Map<String, Value>, QueueError> {
    if !schema.additional_properties {
        let known: Vec<&str> = schema.properties.iter().map(|p| p.name.as_str()).collect();
        let unknown: Vec<&str> = payload
            .keys()
            .map(|k| k.as_str())
            .filter(|k| !known.contains(k))
            .collect();
        if !unknown.is_empty() {
            return Err(QueueError::Validation(format!(
                "unsupported arguments: {}",
                unknown.join(", ")
            )));
        }
    }

    let mut normalized = Map::new();
    for spec in &schema.properties {
        match payload.get(&spec.name) {
            Some(Value::Null) | None => {
                if let Some(default) = &spec.default {
                    normalized.insert(spec.name.clone(), default.clone());
                } else if spec.required {
                    return Err(QueueError::Validation(format!(
                        "missing required argument: {}",
                        spec.name
                    )));
                }
                // Omitted, optional, no default: leave absent from the canonical object.
            }
            Some(raw) => {
                normalized.insert(spec.name.clone(), convert_value(spec, raw)?);
            }
        }
    }

    Ok(normalized)
}

/// `normalize(k, p) = normalize(k, normalize(k, p))` — applying normalize to
/// an already-canonical object is a no-op, since every value it produces is
/// already of the target type and within range.
pub fn is_fixed_point(schema: &PayloadSchema, canonical: &Map<String, Value>) -> bool {
    matches!(normalize(schema, canonical), Ok(again) if &again == canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_schema() -> PayloadSchema {
        PayloadSchema::new(vec![
            ParamSpec::new("limit", ParamType::Integer).with_default(json!(10)),
            ParamSpec::new("replace", ParamType::Boolean).with_default(json!(false)),
            ParamSpec::new("tenant_slug", ParamType::String).required(),
            ParamSpec::new(
                "mode",
                ParamType::Enum(vec!["fast".into(), "thorough".into()]),
            )
            .with_default(json!("fast")),
        ])
    }

    fn obj(pairs: Vec<(&str, Value)>) -> Map<String, Value> {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn rejects_unknown_keys() {
        let schema = sample_schema();
        let payload = obj(vec![("tenant_slug", json!("acme")), ("bogus", json!(1))]);
        let err = normalize(&schema, &payload).unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[test]
    fn coerces_string_bool_and_int() {
        let schema = sample_schema();
        let payload = obj(vec![
            ("tenant_slug", json!("acme")),
            ("limit", json!("12")),
            ("replace", json!("true")),
        ]);
        let normalized = normalize(&schema, &payload).unwrap();
        assert_eq!(normalized.get("limit"), Some(&json!(12)));
        assert_eq!(normalized.get("replace"), Some(&json!(true)));
    }

    #[test]
    fn fills_defaults_for_omitted_optional_keys() {
        let schema = sample_schema();
        let payload = obj(vec![("tenant_slug", json!("acme"))]);
        let normalized = normalize(&schema, &payload).unwrap();
        assert_eq!(normalized.get("limit"), Some(&json!(10)));
        assert_eq!(normalized.get("mode"), Some(&json!("fast")));
    }

    #[test]
    fn fails_on_missing_required_key() {
        let schema = sample_schema();
        let payload = obj(vec![]);
        assert!(normalize(&schema, &payload).is_err());
    }

    #[test]
    fn fails_on_out_of_range_and_unknown_enum() {
        let schema = PayloadSchema::new(vec![
            ParamSpec::new("count", ParamType::Integer).with_range(Some(0.0), Some(5.0)),
        ]);
        let payload = obj(vec![("count", json!(10))]);
        assert!(normalize(&schema, &payload).is_err());

        let schema2 = sample_schema();
        let payload2 = obj(vec![("tenant_slug", json!("acme")), ("mode", json!("bogus"))]);
        assert!(normalize(&schema2, &payload2).is_err());
    }

    #[test]
    fn parses_arg_schema_from_json() {
        let raw = json!({
            "properties": {
                "limit": {"type": "integer", "default": 10, "minimum": 0, "maximum": 100},
                "mode": {"enum": ["fast", "thorough"], "default": "fast"},
            },
            "required": ["mode"],
        });
        let schema = PayloadSchema::from_arg_schema(raw.as_object().unwrap()).unwrap();
        let normalized = normalize(&schema, &obj(vec![("mode", json!("thorough"))])).unwrap();
        assert_eq!(normalized.get("limit"), Some(&json!(10)));
        assert_eq!(normalized.get("mode"), Some(&json!("thorough")));
    }

    #[test]
    fn is_a_fixed_point_and_deterministic() {
        let schema = sample_schema();
        let payload = obj(vec![("tenant_slug", json!("acme")), ("limit", json!("7"))]);
        let normalized = normalize(&schema, &payload).unwrap();
        assert!(is_fixed_point(&schema, &normalized));

        let reordered = obj(vec![("limit", json!("7")), ("tenant_slug", json!("acme"))]);
        let normalized2 = normalize(&schema, &reordered).unwrap();
        assert_eq!(
            serde_json::to_string(&normalized).unwrap(),
            serde_json::to_string(&normalized2).unwrap()
        );
    }
}
