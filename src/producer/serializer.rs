use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::{NamingStrategy, OutputConfig};
use crate::row::{RowEvent, RowKind};
use crate::Result;

/// Memoised column-name translation for one serializer.
#[derive(Debug)]
pub struct NameCache {
    strategy: NamingStrategy,
    names: Mutex<HashMap<String, String>>,
}

impl NameCache {
    pub fn new(strategy: NamingStrategy) -> Self {
        Self {
            strategy,
            names: Mutex::new(HashMap::new()),
        }
    }

    pub fn translate(&self, name: &str) -> String {
        if self.strategy == NamingStrategy::Default {
            return name.to_string();
        }

        let mut names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        names
            .entry(name.to_string())
            .or_insert_with(|| underscore_to_camel_case(name))
            .clone()
    }
}

fn underscore_to_camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, part) in name.split('_').filter(|p| !p.is_empty()).enumerate() {
        let lower = part.to_lowercase();
        if i == 0 {
            out.push_str(&lower);
            continue;
        }
        let mut chars = lower.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

/// Renders rows as the JSON documents sinks publish.
///
/// ```json
/// {"database":"shop","table":"orders","type":"insert","ts":1700000000,
///  "xid":1234,"xoffset":0,"data":{"id":1,"total":10.5}}
/// ```
#[derive(Debug)]
pub struct RowSerializer {
    output: OutputConfig,
    names: NameCache,
}

impl RowSerializer {
    pub fn new(output: OutputConfig) -> Self {
        let names = NameCache::new(output.naming_strategy);
        Self { output, names }
    }

    pub fn to_value(&self, row: &RowEvent) -> Value {
        let mut doc = Map::new();
        doc.insert("database".to_string(), Value::from(row.database.clone()));
        doc.insert(
            "table".to_string(),
            row.table.clone().map_or(Value::Null, Value::from),
        );
        doc.insert("type".to_string(), Value::from(row.kind.as_str()));
        doc.insert(
            "ts".to_string(),
            Value::from(row.timestamp_millis.div_euclid(1000)),
        );

        if self.output.include_commit_info {
            if let Some(xid) = row.transaction_id {
                doc.insert("xid".to_string(), Value::from(xid));
            }
            if row.tx_commit && row.kind.is_data() {
                doc.insert("commit".to_string(), Value::Bool(true));
            }
        }
        if self.output.include_xoffset && row.kind.is_data() && !row.tx_commit {
            doc.insert("xoffset".to_string(), Value::from(row.transaction_offset));
        }
        if self.output.include_binlog_position {
            doc.insert(
                "position".to_string(),
                Value::from(row.position.binlog().to_string()),
            );
        }
        if self.output.include_server_id {
            if let Some(server_id) = row.server_id {
                doc.insert("server_id".to_string(), Value::from(server_id));
            }
        }

        match row.kind {
            RowKind::Ddl => {
                doc.insert(
                    "sql".to_string(),
                    row.sql.clone().map_or(Value::Null, Value::from),
                );
                doc.insert("schema_version".to_string(), Value::from(row.schema_version));
                for (key, value) in &row.data {
                    doc.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            _ => {
                doc.insert("data".to_string(), Value::Object(self.columns(&row.data)));
                if row.kind == RowKind::Update {
                    doc.insert("old".to_string(), Value::Object(self.columns(&row.old_data)));
                }
            }
        }

        Value::Object(doc)
    }

    pub fn to_json(&self, row: &RowEvent) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value(row))?)
    }

    fn columns(&self, data: &Map<String, Value>) -> Map<String, Value> {
        data.iter()
            .filter(|(_, v)| self.output.include_nulls || !v.is_null())
            .map(|(k, v)| (self.names.translate(k), v.clone()))
            .collect()
    }
}
