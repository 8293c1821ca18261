//! Canonical column types shared by every source.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The fixed set of column types heterogeneous source schemas collapse into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanonicalType {
    String,
    Int64,
    Float64,
    Bool,
    Timestamp,
}

impl CanonicalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalType::String => "STRING",
            CanonicalType::Int64 => "INT64",
            CanonicalType::Float64 => "FLOAT64",
            CanonicalType::Bool => "BOOL",
            CanonicalType::Timestamp => "TIMESTAMP",
        }
    }
}

impl fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical field set keyed by flattened column name.
pub type Fields = BTreeMap<String, CanonicalType>;

/// Table name plus the canonical fields of one batch of records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub table_name: String,
    pub fields: Fields,
}

impl BatchHeader {
    pub fn new(table_name: impl Into<String>, fields: Fields) -> Self {
        Self {
            table_name: table_name.into(),
            fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_type_names() {
        assert_eq!(CanonicalType::Int64.to_string(), "INT64");
        assert_eq!(
            serde_json::to_string(&CanonicalType::Float64).unwrap(),
            "\"FLOAT64\""
        );
        let parsed: CanonicalType = serde_json::from_str("\"TIMESTAMP\"").unwrap();
        assert_eq!(parsed, CanonicalType::Timestamp);
    }
}
