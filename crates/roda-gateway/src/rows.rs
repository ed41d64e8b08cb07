//! Conversions between typed domain models and generic gateway rows.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::resource::Row;

/// Serialize a typed value into a gateway row.
pub fn to_row<T: Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(GatewayError::NotAnObject),
    }
}

/// Deserialize a gateway row into a typed value.
pub fn from_row<T: DeserializeOwned>(row: &Row) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(row.clone()))?)
}

/// Extract the `id` column of a row, when present and well-formed.
pub fn row_id(row: &Row) -> Option<Uuid> {
    row.get("id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use roda_shared::{Profile, UserId};

    fn profile() -> Profile {
        Profile {
            id: UserId::new(),
            email: "a@b.com".to_string(),
            name: "Ana".to_string(),
            username: "ana1".to_string(),
            avatar_url: None,
            bio: None,
            is_beta_tester: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn typed_round_trip() {
        let original = profile();
        let row = to_row(&original).unwrap();
        let back: Profile = from_row(&row).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn row_id_reads_the_id_column() {
        let original = profile();
        let row = to_row(&original).unwrap();
        assert_eq!(row_id(&row), Some(original.id.0));
    }

    #[test]
    fn scalars_are_not_rows() {
        assert!(matches!(
            to_row(&"just a string"),
            Err(GatewayError::NotAnObject)
        ));
    }
}
