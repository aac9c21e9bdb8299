//! SQL values and query results

use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single SQLite value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Convert a JSON request parameter. Objects of the form
    /// `{"blob": "<base64>"}` become blobs.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        use base64::Engine as _;

        Ok(match value {
            serde_json::Value::Null => SqlValue::Null,
            serde_json::Value::Bool(b) => SqlValue::Integer(*b as i64),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => SqlValue::Text(s.clone()),
            serde_json::Value::Object(map) if map.len() == 1 && map.contains_key("blob") => {
                let encoded = map
                    .get("blob")
                    .and_then(|b| b.as_str())
                    .ok_or_else(|| Error::validation("parameters", "blob must be a base64 string"))?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|_| Error::validation("parameters", "blob must be a base64 string"))?;
                SqlValue::Blob(bytes)
            }
            _ => {
                return Err(Error::validation(
                    "parameters",
                    "must be null, a boolean, a number, a string or {\"blob\": ...}",
                ))
            }
        })
    }

    /// JSON form used in API responses
    pub fn to_json(&self) -> serde_json::Value {
        use base64::Engine as _;

        match self {
            SqlValue::Null => serde_json::Value::Null,
            SqlValue::Integer(i) => serde_json::Value::from(*i),
            SqlValue::Real(r) => serde_json::Number::from_f64(*r)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            SqlValue::Text(s) => serde_json::Value::String(s.clone()),
            SqlValue::Blob(b) => serde_json::json!({
                "blob": base64::engine::general_purpose::STANDARD.encode(b)
            }),
        }
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(r) => SqlValue::Real(r),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(r) => ToSqlOutput::Owned(Value::Real(*r)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

/// Result of one statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    /// Rows changed by a write statement
    pub changes: u64,
    pub last_insert_rowid: i64,
}

impl QueryResult {
    /// JSON form used in API responses
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "columns": self.columns,
            "rows": self
                .rows
                .iter()
                .map(|row| row.iter().map(SqlValue::to_json).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
            "changes": self.changes,
            "last_insert_rowid": self.last_insert_rowid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json() {
        assert_eq!(SqlValue::from_json(&json!(null)).unwrap(), SqlValue::Null);
        assert_eq!(SqlValue::from_json(&json!(3)).unwrap(), SqlValue::Integer(3));
        assert_eq!(SqlValue::from_json(&json!(1.5)).unwrap(), SqlValue::Real(1.5));
        assert_eq!(SqlValue::from_json(&json!(true)).unwrap(), SqlValue::Integer(1));
        assert_eq!(
            SqlValue::from_json(&json!("hi")).unwrap(),
            SqlValue::Text("hi".into())
        );
        assert_eq!(
            SqlValue::from_json(&json!({"blob": "AQI="})).unwrap(),
            SqlValue::Blob(vec![1, 2])
        );
        assert!(SqlValue::from_json(&json!([1, 2])).is_err());
        assert!(SqlValue::from_json(&json!({"blob": 5})).is_err());
    }

    #[test]
    fn test_to_json() {
        assert_eq!(SqlValue::Blob(vec![1, 2]).to_json(), json!({"blob": "AQI="}));
        assert_eq!(SqlValue::Integer(7).to_json(), json!(7));
    }
}
