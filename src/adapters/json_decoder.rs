//! JSON Row Decoder
//!
//! Turns bulk rows and streamed records into keys and JSON-object values
//! holding the namespace's value columns:
//!
//! ```text
//! row { code: "FR", name: "France", region: "EU", pop: 68 }
//!   key_column = code, value_columns = [name, region]
//!   ──► key "FR", value {"name":"France","region":"EU"}
//! ```
//!
//! Streamed payloads are JSON objects carrying the same columns. A missing
//! payload or a JSON `null` payload is a tombstone.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::config::NamespaceConfig;
use crate::domain::ports::{DecodedEntry, RawRecord, RowDecoder, SourceRow, UpdateRecord};
use crate::error::DecodeError;

/// Decoder projecting configured columns into a JSON object value.
#[derive(Debug, Clone)]
pub struct JsonRowDecoder {
    key_column: String,
    value_columns: Vec<String>,
}

impl JsonRowDecoder {
    pub fn new(key_column: impl Into<String>, value_columns: Vec<String>) -> Self {
        Self {
            key_column: key_column.into(),
            value_columns,
        }
    }

    pub fn from_config(config: &NamespaceConfig) -> Self {
        Self::new(config.key_column.clone(), config.value_columns.clone())
    }

    fn key_from(&self, value: Option<&Value>) -> Result<String, DecodeError> {
        match value {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(Value::Bool(b)) => Ok(b.to_string()),
            Some(Value::String(_)) => Err(DecodeError::new(format!(
                "key column {} is empty",
                self.key_column
            ))),
            Some(Value::Null) | None => Err(DecodeError::new(format!(
                "key column {} is missing",
                self.key_column
            ))),
            Some(other) => Err(DecodeError::new(format!(
                "key column {} has unsupported type: {}",
                self.key_column, other
            ))),
        }
    }

    /// Missing value columns are stored as null.
    fn project<'a>(&self, lookup: impl Fn(&str) -> Option<&'a Value>) -> Result<Bytes, DecodeError> {
        let mut object = Map::with_capacity(self.value_columns.len());
        for column in &self.value_columns {
            object.insert(column.clone(), lookup(column).cloned().unwrap_or(Value::Null));
        }
        serde_json::to_vec(&Value::Object(object))
            .map(Bytes::from)
            .map_err(|e| DecodeError::new(format!("failed to encode value: {}", e)))
    }
}

impl RowDecoder for JsonRowDecoder {
    fn decode_row(&self, row: &SourceRow) -> Result<DecodedEntry, DecodeError> {
        let key = self.key_from(row.get(&self.key_column))?;
        let value = self.project(|column| row.get(column))?;
        Ok(DecodedEntry { key, value })
    }

    fn decode_record(&self, record: &RawRecord) -> Result<UpdateRecord, DecodeError> {
        let payload = match &record.payload {
            None => None,
            Some(bytes) => {
                let parsed: Value = serde_json::from_slice(bytes)
                    .map_err(|e| DecodeError::new(format!("payload is not JSON: {}", e)))?;
                match parsed {
                    Value::Null => None,
                    Value::Object(object) => Some(object),
                    other => {
                        return Err(DecodeError::new(format!(
                            "payload must be a JSON object, got {}",
                            type_name(&other)
                        )))
                    }
                }
            }
        };

        let key = match (&record.key, &payload) {
            (Some(key), _) if !key.is_empty() => key.clone(),
            (_, Some(object)) => self.key_from(object.get(&self.key_column))?,
            _ => return Err(DecodeError::new("tombstone without a key")),
        };

        match payload {
            Some(object) => {
                let value = self.project(|column| object.get(column))?;
                Ok(UpdateRecord::upsert(key, value, record.partition, record.offset))
            }
            None => Ok(UpdateRecord::tombstone(key, record.partition, record.offset)),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Read one column out of a stored value. Strings come back unquoted,
/// null and missing columns as `None`, anything else as its JSON text.
pub fn column_text(value: &[u8], column: &str) -> Result<Option<String>, DecodeError> {
    let parsed: Value = serde_json::from_slice(value)
        .map_err(|e| DecodeError::new(format!("stored value is not JSON: {}", e)))?;
    let Value::Object(mut object) = parsed else {
        return Err(DecodeError::new("stored value is not a JSON object"));
    };
    Ok(match object.remove(column) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decoder() -> JsonRowDecoder {
        JsonRowDecoder::new("code", vec!["name".to_string(), "region".to_string()])
    }

    fn record(key: Option<&str>, payload: Option<&str>) -> RawRecord {
        RawRecord {
            partition: 0,
            offset: 9,
            key: key.map(str::to_string),
            payload: payload.map(|p| Bytes::from(p.to_string())),
        }
    }

    #[test]
    fn test_decode_row_projects_value_columns() {
        let row = SourceRow::new()
            .with("code", "FR")
            .with("name", "France")
            .with("region", "EU")
            .with("population", 68);

        let entry = decoder().decode_row(&row).unwrap();
        assert_eq!(entry.key, "FR");

        let value: Value = serde_json::from_slice(&entry.value).unwrap();
        assert_eq!(value, json!({"name": "France", "region": "EU"}));
    }

    #[test]
    fn test_decode_row_numeric_key_and_missing_column() {
        let row = SourceRow::new().with("code", 250).with("name", "France");
        let entry = decoder().decode_row(&row).unwrap();
        assert_eq!(entry.key, "250");
        assert_eq!(column_text(&entry.value, "region").unwrap(), None);
    }

    #[test]
    fn test_decode_row_without_key_fails() {
        let row = SourceRow::new().with("name", "Nowhere");
        assert!(decoder().decode_row(&row).is_err());

        let row = SourceRow::new().with("code", "").with("name", "Nowhere");
        assert!(decoder().decode_row(&row).is_err());
    }

    #[test]
    fn test_decode_record_upsert_uses_payload_key() {
        let update = decoder()
            .decode_record(&record(None, Some(r#"{"code":"DE","name":"Germany"}"#)))
            .unwrap();
        assert_eq!(update.key, "DE");
        assert_eq!(update.offset, 9);
        assert_eq!(
            column_text(update.value.as_ref().unwrap(), "name").unwrap(),
            Some("Germany".to_string())
        );
    }

    #[test]
    fn test_decode_record_tombstones() {
        let update = decoder().decode_record(&record(Some("FR"), None)).unwrap();
        assert!(update.is_tombstone());

        let update = decoder()
            .decode_record(&record(Some("FR"), Some("null")))
            .unwrap();
        assert!(update.is_tombstone());
        assert_eq!(update.key, "FR");

        assert!(decoder().decode_record(&record(None, None)).is_err());
    }

    #[test]
    fn test_decode_record_rejects_garbage() {
        assert!(decoder()
            .decode_record(&record(Some("FR"), Some("not json")))
            .is_err());
        assert!(decoder()
            .decode_record(&record(Some("FR"), Some("[1,2]")))
            .is_err());
    }

    #[test]
    fn test_column_text_renders_non_strings() {
        let value = br#"{"name":"France","population":68,"eu":true}"#;
        assert_eq!(column_text(value, "population").unwrap(), Some("68".to_string()));
        assert_eq!(column_text(value, "eu").unwrap(), Some("true".to_string()));
        assert_eq!(column_text(value, "missing").unwrap(), None);
        assert!(column_text(b"plain", "name").is_err());
    }
}
