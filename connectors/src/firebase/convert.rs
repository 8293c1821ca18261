//! Document value → record conversion.

use super::store::{FieldValue, Principal};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use intake::Record;
use serde_json::{json, Number, Value};
use std::collections::BTreeMap;

pub const USER_ID_FIELD: &str = "uid";

/// Converts document fields to a record.
///
/// Geo points inside maps, at any depth, are replaced by two sibling fields
/// `<name>.latitude` and `<name>.longitude`.
pub fn document_to_record(fields: BTreeMap<String, FieldValue>) -> Record {
    let mut record = Record::new();
    for (name, value) in fields {
        match value {
            FieldValue::GeoPoint {
                latitude,
                longitude,
            } => {
                record.insert(format!("{}.latitude", name), float(latitude));
                record.insert(format!("{}.longitude", name), float(longitude));
            }
            other => {
                record.insert(name, to_json(other));
            }
        }
    }
    record
}

/// JSON form of a single value. Geo points without a field name (array
/// elements) become `{"latitude": .., "longitude": ..}` objects.
pub fn to_json(value: FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Boolean(b) => Value::Bool(b),
        FieldValue::Integer(i) => Value::from(i),
        FieldValue::Double(d) => float(d),
        FieldValue::Timestamp(t) => Value::String(to_iso(&t)),
        FieldValue::String(s) | FieldValue::Bytes(s) | FieldValue::Reference(s) => Value::String(s),
        FieldValue::GeoPoint {
            latitude,
            longitude,
        } => json!({"latitude": float(latitude), "longitude": float(longitude)}),
        FieldValue::Array(values) => Value::Array(values.into_iter().map(to_json).collect()),
        FieldValue::Map(fields) => Value::Object(document_to_record(fields)),
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// ISO-8601 with microseconds and a `Z` suffix.
pub fn to_iso(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Epoch milliseconds → ISO-8601, truncated to whole seconds.
pub fn millis_to_iso(millis: i64) -> String {
    let t = Utc
        .timestamp_opt(millis / 1000, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    to_iso(&t)
}

pub fn principal_to_record(principal: Principal) -> Record {
    let mut user = Record::new();
    user.insert("email".to_string(), json!(principal.email));
    user.insert(USER_ID_FIELD.to_string(), Value::String(principal.uid));
    user.insert("phone".to_string(), json!(principal.phone_number));
    user.insert("sign_in_methods".to_string(), json!(principal.provider_ids));
    user.insert("disabled".to_string(), Value::Bool(principal.disabled));
    user.insert(
        "created_at".to_string(),
        Value::String(millis_to_iso(principal.created_at_ms)),
    );
    user.insert(
        "last_login".to_string(),
        Value::String(millis_to_iso(principal.last_login_ms)),
    );
    user.insert(
        "last_refresh".to_string(),
        Value::String(millis_to_iso(principal.last_refresh_ms)),
    );
    user
}
