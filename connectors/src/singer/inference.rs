//! Maps a tap's JSON-schema property tree onto canonical fields.

use intake::{CanonicalType, Fields};
use serde_json::{Map, Value};
use tracing::warn;

/// Walks `properties` and collects one canonical field per leaf property.
///
/// A property's `type` is a single name or a list of candidates. `"null"`
/// candidates are skipped and the first recognized candidate wins. Object
/// properties contribute no field of their own: their children are
/// flattened under `<name>_`. Unrecognized types are logged and skipped.
pub fn infer_fields(properties: &Map<String, Value>) -> Fields {
    let mut fields = Fields::new();
    collect_fields("", properties, &mut fields);
    fields
}

fn collect_fields(prefix: &str, properties: &Map<String, Value>, fields: &mut Fields) {
    for (name, property) in properties {
        let candidates = match property.get("type") {
            Some(Value::String(t)) => vec![t.as_str()],
            Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
            other => {
                warn!(property = %name, declared = ?other, "Unknown singer property type declaration");
                continue;
            }
        };

        for candidate in candidates {
            let field_type = match candidate {
                "null" => continue,
                "string" => {
                    if property.get("format").and_then(Value::as_str) == Some("date-time") {
                        CanonicalType::Timestamp
                    } else {
                        CanonicalType::String
                    }
                }
                "number" => CanonicalType::Float64,
                "integer" => CanonicalType::Int64,
                "boolean" => CanonicalType::Bool,
                // arrays are stored serialized
                "array" => CanonicalType::String,
                "object" => {
                    if let Some(nested) = property.get("properties").and_then(Value::as_object) {
                        collect_fields(&format!("{}{}_", prefix, name), nested, fields);
                    }
                    break;
                }
                unknown => {
                    warn!(property = %name, declared = unknown, "Unknown type in singer schema");
                    continue;
                }
            };

            fields.insert(format!("{}{}", prefix, name), field_type);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_nested_object_flattened_without_own_field() {
        let fields = infer_fields(&props(json!({
            "a": {"type": "string"},
            "b": {"type": ["null", "integer"]},
            "c": {"type": "object", "properties": {"d": {"type": "number"}}}
        })));

        let expected: Fields = [
            ("a".to_string(), CanonicalType::String),
            ("b".to_string(), CanonicalType::Int64),
            ("c_d".to_string(), CanonicalType::Float64),
        ]
        .into_iter()
        .collect();
        assert_eq!(fields, expected);
        assert!(!fields.contains_key("c"));
    }

    #[test]
    fn test_first_recognized_candidate_wins() {
        let fields = infer_fields(&props(json!({
            "x": {"type": ["null", "boolean", "string"]},
            "y": {"type": ["decimal", "number"]},
            "z": {"type": ["null"]}
        })));
        assert_eq!(fields.get("x"), Some(&CanonicalType::Bool));
        // unknown candidate skipped, next one taken
        assert_eq!(fields.get("y"), Some(&CanonicalType::Float64));
        assert!(!fields.contains_key("z"));
    }

    #[test]
    fn test_date_time_and_array() {
        let fields = infer_fields(&props(json!({
            "created_at": {"type": ["null", "string"], "format": "date-time"},
            "email": {"type": "string", "format": "email"},
            "tags": {"type": "array", "items": {"type": "string"}}
        })));
        assert_eq!(fields.get("created_at"), Some(&CanonicalType::Timestamp));
        assert_eq!(fields.get("email"), Some(&CanonicalType::String));
        assert_eq!(fields.get("tags"), Some(&CanonicalType::String));
    }

    #[test]
    fn test_deep_prefix_chaining() {
        let fields = infer_fields(&props(json!({
            "user": {
                "type": ["null", "object"],
                "properties": {
                    "address": {
                        "type": "object",
                        "properties": {"zip": {"type": "integer"}}
                    },
                    "name": {"type": "string"}
                }
            }
        })));
        assert_eq!(fields.len(), 2);
        assert_eq!(fields.get("user_address_zip"), Some(&CanonicalType::Int64));
        assert_eq!(fields.get("user_name"), Some(&CanonicalType::String));
    }

    #[test]
    fn test_unrecognized_type_is_skipped() {
        let fields = infer_fields(&props(json!({
            "weird": {"type": "decimal"},
            "untyped": {"anyOf": [{"type": "string"}]},
            "ok": {"type": "integer"}
        })));
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("ok"), Some(&CanonicalType::Int64));
    }
}
