use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::KeyFormat;
use crate::row::{RowEvent, RowKind};

/// Builds Kafka message keys in the configured format.
///
/// `hash`: `{"database":"shop","table":"orders","pk.id":1}`
///
/// `array`: `["shop","orders",[{"id":1}]]`
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyStrategy {
    format: KeyFormat,
}

impl KeyStrategy {
    pub fn new(format: KeyFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> KeyFormat {
        self.format
    }

    pub fn key_for(&self, row: &RowEvent) -> String {
        let key = match (self.format, row.kind) {
            (KeyFormat::Hash, RowKind::Ddl) => json!({
                "database": row.database,
                "table": row.table,
            }),
            (KeyFormat::Array, RowKind::Ddl) => json!([row.database, row.table]),
            (KeyFormat::Hash, _) => hash_key(row),
            (KeyFormat::Array, _) => array_key(row),
        };
        key.to_string()
    }
}

fn hash_key(row: &RowEvent) -> Value {
    let mut key = Map::new();
    key.insert("database".to_string(), Value::from(row.database.clone()));
    key.insert(
        "table".to_string(),
        row.table.clone().map_or(Value::Null, Value::from),
    );

    if row.primary_key_columns.is_empty() {
        // no key to group on; unique per row instead
        debug!(database = %row.database, table = row.table_name(), "Table has no primary key");
        key.insert(
            "_position".to_string(),
            Value::from(row.position.binlog().to_string()),
        );
        key.insert("_xoffset".to_string(), Value::from(row.transaction_offset));
        return Value::Object(key);
    }

    for column in &row.primary_key_columns {
        key.insert(
            format!("pk.{}", column.to_lowercase()),
            row.data.get(column).cloned().unwrap_or(Value::Null),
        );
    }
    Value::Object(key)
}

fn array_key(row: &RowEvent) -> Value {
    let columns: Vec<Value> = row
        .primary_key_columns
        .iter()
        .map(|column| {
            let mut entry = Map::new();
            entry.insert(
                column.to_lowercase(),
                row.data.get(column).cloned().unwrap_or(Value::Null),
            );
            Value::Object(entry)
        })
        .collect();
    json!([row.database, row.table, columns])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::tests::{insert_row, position};

    fn order_row() -> RowEvent {
        let mut row = insert_row("shop", "orders", 1).with_primary_key(vec!["ID".to_string()]);
        row.data.insert("ID".to_string(), json!(42));
        row.data.insert("total".to_string(), json!(10));
        row
    }

    #[test]
    fn test_hash_key() {
        let key = KeyStrategy::new(KeyFormat::Hash).key_for(&order_row());
        assert_eq!(key, r#"{"database":"shop","table":"orders","pk.id":42}"#);
    }

    #[test]
    fn test_array_key() {
        let key = KeyStrategy::new(KeyFormat::Array).key_for(&order_row());
        assert_eq!(key, r#"["shop","orders",[{"id":42}]]"#);
    }

    #[test]
    fn test_ddl_key_has_no_primary_key() {
        let row = RowEvent::ddl(
            "shop",
            Some("orders".to_string()),
            "DROP TABLE orders",
            1,
            position(1),
            position(2),
        );
        assert_eq!(
            KeyStrategy::new(KeyFormat::Hash).key_for(&row),
            r#"{"database":"shop","table":"orders"}"#
        );
        assert_eq!(
            KeyStrategy::new(KeyFormat::Array).key_for(&row),
            r#"["shop","orders"]"#
        );
    }

    #[test]
    fn test_keyless_table_uses_row_coordinates() {
        let mut row = insert_row("shop", "log", 1);
        row.transaction_offset = 3;
        let key: Value = serde_json::from_str(&KeyStrategy::default().key_for(&row)).unwrap();
        assert_eq!(key["_xoffset"], json!(3));
        assert!(key.get("_position").is_some());
    }
}
