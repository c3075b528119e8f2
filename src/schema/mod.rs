//! Schema snapshot model and the store that keeps it in step with the log.
//!
//! A [`Schema`] owns [`Database`]s, which own [`Table`]s, which own ordered
//! [`Column`]s. Column positions are the index of the column in its table
//! and are renumbered whenever a DDL statement inserts or removes a column,
//! so raw row values (which arrive positionally) always map onto the
//! current column list.

pub mod capture;
pub mod ddl;
pub mod store;

pub use capture::{JsonSchemaCapturer, SchemaCapturer};
pub use ddl::{ColumnPlacement, DdlOperation, DdlStatement};
pub use store::{SchemaChange, SchemaChangeKind, SchemaStore};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(default)]
    pub position: u32,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            position: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub primary_key: Vec<String>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>, primary_key: Vec<String>) -> Self {
        let mut table = Self {
            name: name.into(),
            columns,
            primary_key,
        };
        table.renumber();
        table
    }

    /// Column names are case-insensitive.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.column_index(name).map(|i| &self.columns[i])
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub(crate) fn renumber(&mut self) {
        for (i, column) in self.columns.iter_mut().enumerate() {
            column.position = i as u32;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    #[serde(default)]
    pub tables: Vec<Table>,
}

impl Database {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Vec::new(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.iter_mut().find(|t| t.name == name)
    }

    pub(crate) fn remove_table(&mut self, name: &str) -> Option<Table> {
        let index = self.tables.iter().position(|t| t.name == name)?;
        Some(self.tables.remove(index))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub databases: Vec<Database>,
}

impl Schema {
    pub fn database(&self, name: &str) -> Option<&Database> {
        self.databases.iter().find(|d| d.name == name)
    }

    pub(crate) fn database_mut(&mut self, name: &str) -> Option<&mut Database> {
        self.databases.iter_mut().find(|d| d.name == name)
    }

    pub fn table(&self, database: &str, table: &str) -> Option<&Table> {
        self.database(database)?.table(table)
    }

    pub(crate) fn remove_database(&mut self, name: &str) -> Option<Database> {
        let index = self.databases.iter().position(|d| d.name == name)?;
        Some(self.databases.remove(index))
    }
}
