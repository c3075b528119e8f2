//! Versioned schema snapshot.
//!
//! DDL is applied to a copy of the current snapshot and swapped in only
//! when every statement in it succeeded, so no row is ever resolved against
//! a half-applied change. Each successful change bumps the version.

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, instrument};

use super::ddl::{self, ColumnPlacement, DdlOperation, DdlStatement, TableRef};
use super::{Column, Database, Schema, SchemaCapturer, Table};
use crate::{Error, Result};

/// Databases never captured or tracked.
pub const SYSTEM_DATABASES: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeKind {
    DatabaseCreate,
    DatabaseDrop,
    TableCreate,
    TableDrop,
    TableAlter,
}

impl SchemaChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaChangeKind::DatabaseCreate => "database-create",
            SchemaChangeKind::DatabaseDrop => "database-drop",
            SchemaChangeKind::TableCreate => "table-create",
            SchemaChangeKind::TableDrop => "table-drop",
            SchemaChangeKind::TableAlter => "table-alter",
        }
    }
}

impl fmt::Display for SchemaChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied change, reported back so it can be emitted as a DDL row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub kind: SchemaChangeKind,
    pub database: String,
    pub table: Option<String>,
    /// `(database, table)` before a rename.
    pub renamed_from: Option<(String, String)>,
}

impl SchemaChange {
    fn database(kind: SchemaChangeKind, database: &str) -> Self {
        Self {
            kind,
            database: database.to_string(),
            table: None,
            renamed_from: None,
        }
    }

    fn table(kind: SchemaChangeKind, database: &str, table: &str) -> Self {
        Self {
            kind,
            database: database.to_string(),
            table: Some(table.to_string()),
            renamed_from: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchemaStore {
    schema: Schema,
    version: u64,
    excluded: HashSet<String>,
}

impl SchemaStore {
    /// Wraps an already captured snapshot, dropping excluded databases.
    pub fn new(mut schema: Schema, exclude: &[String]) -> Self {
        let excluded: HashSet<String> = SYSTEM_DATABASES
            .iter()
            .map(|d| d.to_string())
            .chain(exclude.iter().cloned())
            .collect();

        schema.databases.retain(|d| !excluded.contains(&d.name));
        for table in schema.databases.iter_mut().flat_map(|d| d.tables.iter_mut()) {
            table.renumber();
        }

        Self {
            schema,
            version: 1,
            excluded,
        }
    }

    /// Builds the initial snapshot from the capture collaborator.
    #[instrument(skip(capturer))]
    pub async fn capture(capturer: &dyn SchemaCapturer, exclude: &[String]) -> Result<Self> {
        let mut schema = Schema::default();
        let store = Self::new(Schema::default(), exclude);

        for name in capturer.list_databases().await? {
            if store.is_excluded(&name) {
                debug!(database = %name, "Skipping excluded database");
                continue;
            }

            let mut database = Database::new(&name);
            for table in capturer.list_tables(&name).await? {
                let columns = capturer.list_columns(&name, &table).await?;
                let primary_key = capturer.primary_key(&name, &table).await?;
                database.tables.push(Table::new(table, columns, primary_key));
            }
            schema.databases.push(database);
        }

        info!(
            databases = schema.databases.len(),
            tables = schema.databases.iter().map(|d| d.tables.len()).sum::<usize>(),
            "Captured schema"
        );
        Ok(Self { schema, ..store })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn is_excluded(&self, database: &str) -> bool {
        self.excluded.contains(database)
    }

    pub fn table(&self, database: &str, table: &str) -> Option<&Table> {
        self.schema.table(database, table)
    }

    /// Parses and applies one DDL statement issued with `default_database`
    /// as the current database.
    ///
    /// Statements that do not change the schema return no changes and leave
    /// the version alone.
    pub fn apply_ddl(&mut self, default_database: &str, sql: &str) -> Result<Vec<SchemaChange>> {
        let statements = ddl::parse(sql)?;
        if statements.is_empty() {
            return Ok(Vec::new());
        }

        let mut next = self.schema.clone();
        let mut changes = Vec::new();
        for statement in statements {
            self.apply_statement(&mut next, default_database, statement, &mut changes)?;
        }

        if !changes.is_empty() {
            self.schema = next;
            self.version += 1;
            debug!(version = self.version, changes = changes.len(), "Applied DDL");
        }
        Ok(changes)
    }

    /// Maps positional raw values onto the table's column names.
    pub fn resolve(&self, database: &str, table: &str, values: &[Value]) -> Result<Map<String, Value>> {
        let t = self.table(database, table).ok_or_else(|| Error::UnknownTable {
            database: database.to_string(),
            table: table.to_string(),
        })?;

        if values.len() != t.columns.len() {
            return Err(Error::consistency(format!(
                "{}.{} has {} columns but the row carries {} values",
                database,
                table,
                t.columns.len(),
                values.len()
            )));
        }

        Ok(t.columns
            .iter()
            .zip(values)
            .map(|(c, v)| (c.name.clone(), v.clone()))
            .collect())
    }

    fn apply_statement(
        &self,
        schema: &mut Schema,
        default_database: &str,
        statement: DdlStatement,
        changes: &mut Vec<SchemaChange>,
    ) -> Result<()> {
        match statement {
            DdlStatement::CreateDatabase {
                database,
                if_not_exists,
            } => {
                if self.is_excluded(&database) {
                    return Ok(());
                }
                if schema.database(&database).is_some() {
                    if if_not_exists {
                        return Ok(());
                    }
                    return Err(Error::consistency(format!(
                        "database {} already exists",
                        database
                    )));
                }
                schema.databases.push(Database::new(&database));
                changes.push(SchemaChange::database(
                    SchemaChangeKind::DatabaseCreate,
                    &database,
                ));
            }

            DdlStatement::DropDatabase {
                database,
                if_exists,
            } => {
                if self.is_excluded(&database) {
                    return Ok(());
                }
                if schema.remove_database(&database).is_none() {
                    if if_exists {
                        return Ok(());
                    }
                    return Err(Error::consistency(format!(
                        "cannot drop unknown database {}",
                        database
                    )));
                }
                changes.push(SchemaChange::database(
                    SchemaChangeKind::DatabaseDrop,
                    &database,
                ));
            }

            DdlStatement::CreateTable {
                table,
                if_not_exists,
                columns,
                primary_key,
                like,
            } => {
                let database = qualify(&table, default_database);
                if self.is_excluded(&database) {
                    return Ok(());
                }

                let (columns, primary_key) = match like {
                    Some(source) => {
                        let source_db = qualify(&source, default_database);
                        let source_table = schema
                            .table(&source_db, &source.table)
                            .ok_or_else(|| unknown_table(&source_db, &source.table))?;
                        (source_table.columns.clone(), source_table.primary_key.clone())
                    }
                    None => (columns, primary_key),
                };

                let db = database_mut(schema, &database)?;
                if db.table(&table.table).is_some() {
                    if if_not_exists {
                        return Ok(());
                    }
                    return Err(Error::consistency(format!(
                        "table {}.{} already exists",
                        database, table.table
                    )));
                }
                db.tables
                    .push(Table::new(table.table.clone(), columns, primary_key));
                changes.push(SchemaChange::table(
                    SchemaChangeKind::TableCreate,
                    &database,
                    &table.table,
                ));
            }

            DdlStatement::DropTable { tables, if_exists } => {
                for table in tables {
                    let database = qualify(&table, default_database);
                    if self.is_excluded(&database) {
                        continue;
                    }
                    let removed = schema
                        .database_mut(&database)
                        .and_then(|db| db.remove_table(&table.table));
                    if removed.is_none() {
                        if if_exists {
                            continue;
                        }
                        return Err(unknown_table(&database, &table.table));
                    }
                    changes.push(SchemaChange::table(
                        SchemaChangeKind::TableDrop,
                        &database,
                        &table.table,
                    ));
                }
            }

            DdlStatement::AlterTable { table, operations } => {
                let database = qualify(&table, default_database);
                if self.is_excluded(&database) {
                    for operation in &operations {
                        if let DdlOperation::RenameTable { to } = operation {
                            self.check_rename_source(&database, &table.table, &qualify(to, &database), &to.table)?;
                        }
                    }
                    return Ok(());
                }

                let mut current = TableRef {
                    database: Some(database.clone()),
                    table: table.table.clone(),
                };
                for operation in operations {
                    if let DdlOperation::RenameTable { to } = operation {
                        let target = TableRef {
                            database: Some(qualify(&to, &database)),
                            table: to.table,
                        };
                        rename_table(schema, &current, &target, default_database)?;
                        current = target;
                        continue;
                    }
                    let db_name = qualify(&current, default_database);
                    let t = table_mut(schema, &db_name, &current.table)?;
                    apply_operation(t, operation)?;
                }

                let final_db = qualify(&current, default_database);
                let mut change =
                    SchemaChange::table(SchemaChangeKind::TableAlter, &final_db, &current.table);
                if final_db != database || current.table != table.table {
                    change.renamed_from = Some((database, table.table));
                }
                changes.push(change);
            }

            DdlStatement::RenameTable { renames } => {
                for (from, to) in renames {
                    let from_db = qualify(&from, default_database);
                    let to_db = qualify(&to, default_database);
                    if self.is_excluded(&from_db) {
                        self.check_rename_source(&from_db, &from.table, &to_db, &to.table)?;
                        continue;
                    }
                    if self.is_excluded(&to_db) {
                        // moved out of sight, same as a drop
                        schema
                            .database_mut(&from_db)
                            .and_then(|db| db.remove_table(&from.table))
                            .ok_or_else(|| unknown_table(&from_db, &from.table))?;
                        changes.push(SchemaChange::table(
                            SchemaChangeKind::TableDrop,
                            &from_db,
                            &from.table,
                        ));
                        continue;
                    }
                    rename_table(schema, &from, &to, default_database)?;

                    let mut change =
                        SchemaChange::table(SchemaChangeKind::TableAlter, &to_db, &to.table);
                    change.renamed_from = Some((from_db, from.table));
                    changes.push(change);
                }
            }
        }
        Ok(())
    }
}

impl SchemaStore {
    /// A table moved out of an excluded database has no known definition.
    fn check_rename_source(&self, from_db: &str, from: &str, to_db: &str, to: &str) -> Result<()> {
        if self.is_excluded(to_db) {
            return Ok(());
        }
        Err(Error::consistency(format!(
            "cannot rename {}.{} to {}.{}: database {} is excluded and its tables are not tracked",
            from_db, from, to_db, to, from_db
        )))
    }
}

fn unknown_table(database: &str, table: &str) -> Error {
    Error::consistency(format!("unknown table {}.{}", database, table))
}

fn qualify(table: &TableRef, default_database: &str) -> String {
    table
        .database
        .clone()
        .unwrap_or_else(|| default_database.to_string())
}

fn database_mut<'a>(schema: &'a mut Schema, database: &str) -> Result<&'a mut Database> {
    schema
        .database_mut(database)
        .ok_or_else(|| Error::consistency(format!("unknown database {}", database)))
}

fn table_mut<'a>(schema: &'a mut Schema, database: &str, table: &str) -> Result<&'a mut Table> {
    schema
        .database_mut(database)
        .and_then(|db| db.table_mut(table))
        .ok_or_else(|| unknown_table(database, table))
}

fn rename_table(
    schema: &mut Schema,
    from: &TableRef,
    to: &TableRef,
    default_database: &str,
) -> Result<()> {
    let from_db = qualify(from, default_database);
    let to_db = qualify(to, default_database);

    if schema.table(&to_db, &to.table).is_some() {
        return Err(Error::consistency(format!(
            "cannot rename {}.{} to existing table {}.{}",
            from_db, from.table, to_db, to.table
        )));
    }
    // fail before removing anything
    database_mut(schema, &to_db)?;

    let mut table = schema
        .database_mut(&from_db)
        .and_then(|db| db.remove_table(&from.table))
        .ok_or_else(|| unknown_table(&from_db, &from.table))?;
    table.name = to.table.clone();
    database_mut(schema, &to_db)?.tables.push(table);
    Ok(())
}

fn apply_operation(table: &mut Table, operation: DdlOperation) -> Result<()> {
    match operation {
        DdlOperation::AddColumn { column, placement } => {
            if table.column_index(&column.name).is_some() {
                return Err(Error::consistency(format!(
                    "column {} already exists in {}",
                    column.name, table.name
                )));
            }
            insert_column(table, column, &placement)?;
        }

        DdlOperation::DropColumn { name, if_exists } => match table.column_index(&name) {
            Some(index) => {
                table.columns.remove(index);
                table.primary_key.retain(|pk| !pk.eq_ignore_ascii_case(&name));
            }
            None if if_exists => {}
            None => {
                return Err(Error::consistency(format!(
                    "cannot drop unknown column {} from {}",
                    name, table.name
                )))
            }
        },

        DdlOperation::ChangeColumn {
            old_name,
            column,
            placement,
        } => {
            let index = existing_column(table, &old_name)?;
            if !old_name.eq_ignore_ascii_case(&column.name)
                && table.column_index(&column.name).is_some()
            {
                return Err(Error::consistency(format!(
                    "column {} already exists in {}",
                    column.name, table.name
                )));
            }
            rename_in_primary_key(table, &old_name, &column.name);

            match placement {
                Some(placement) => {
                    table.columns.remove(index);
                    insert_column(table, column, &placement)?;
                }
                None => table.columns[index] = column,
            }
        }

        DdlOperation::RenameColumn { old_name, new_name } => {
            let index = existing_column(table, &old_name)?;
            if table.column_index(&new_name).is_some() {
                return Err(Error::consistency(format!(
                    "column {} already exists in {}",
                    new_name, table.name
                )));
            }
            rename_in_primary_key(table, &old_name, &new_name);
            table.columns[index].name = new_name;
        }

        DdlOperation::AddPrimaryKey { columns } => {
            for column in &columns {
                existing_column(table, column)?;
            }
            table.primary_key = columns;
        }

        DdlOperation::DropPrimaryKey => table.primary_key.clear(),

        // handled by the caller, which owns the database map
        DdlOperation::RenameTable { .. } => {}
    }

    table.renumber();
    Ok(())
}

fn existing_column(table: &Table, name: &str) -> Result<usize> {
    table.column_index(name).ok_or_else(|| {
        Error::consistency(format!("unknown column {} in {}", name, table.name))
    })
}

fn insert_column(table: &mut Table, column: Column, placement: &ColumnPlacement) -> Result<()> {
    let index = match placement {
        ColumnPlacement::Last => table.columns.len(),
        ColumnPlacement::First => 0,
        ColumnPlacement::After(after) => existing_column(table, after)? + 1,
    };
    table.columns.insert(index, column);
    Ok(())
}

fn rename_in_primary_key(table: &mut Table, old_name: &str, new_name: &str) {
    for pk in table.primary_key.iter_mut() {
        if pk.eq_ignore_ascii_case(old_name) {
            *pk = new_name.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::JsonSchemaCapturer;
    use serde_json::json;

    fn snapshot() -> Schema {
        Schema {
            databases: vec![
                Database {
                    name: "shop".to_string(),
                    tables: vec![Table::new(
                        "orders",
                        vec![Column::new("id", "bigint"), Column::new("total", "int")],
                        vec!["id".to_string()],
                    )],
                },
                Database::new("mysql"),
                Database::new("scratch"),
            ],
        }
    }

    fn store() -> SchemaStore {
        SchemaStore::new(snapshot(), &[])
    }

    #[tokio::test]
    async fn test_capture_excludes_system_and_configured_databases() {
        let capturer = JsonSchemaCapturer::new(snapshot());
        let store = SchemaStore::capture(&capturer, &["scratch".to_string()])
            .await
            .unwrap();

        let names: Vec<&str> = store
            .schema()
            .databases
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, vec!["shop"]);
        assert!(store.is_excluded("mysql"));
        assert_eq!(store.table("shop", "orders").unwrap().primary_key, vec!["id"]);
    }

    #[test]
    fn test_alter_updates_columns_and_version() {
        let mut store = store();
        let before = store.version();

        let changes = store
            .apply_ddl(
                "shop",
                "ALTER TABLE orders ADD COLUMN note varchar(20) FIRST, DROP COLUMN total",
            )
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, SchemaChangeKind::TableAlter);
        assert_eq!(store.version(), before + 1);

        let table = store.table("shop", "orders").unwrap();
        let names: Vec<&str> = table.column_names().collect();
        assert_eq!(names, vec!["note", "id"]);
        assert_eq!(table.columns[1].position, 1);
    }

    #[test]
    fn test_failed_statement_leaves_snapshot_untouched() {
        let mut store = store();
        let before = store.schema().clone();

        // first operation is valid, second references a missing column
        let err = store
            .apply_ddl(
                "shop",
                "ALTER TABLE orders ADD COLUMN note text, DROP COLUMN missing",
            )
            .unwrap_err();
        assert!(matches!(err, Error::SchemaConsistency { .. }));
        assert_eq!(store.schema(), &before);
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_create_rename_drop_table() {
        let mut store = store();
        store
            .apply_ddl("shop", "CREATE TABLE users (id int PRIMARY KEY, email text)")
            .unwrap();
        assert_eq!(store.table("shop", "users").unwrap().primary_key, vec!["id"]);

        let changes = store.apply_ddl("shop", "RENAME TABLE users TO customers").unwrap();
        assert_eq!(
            changes[0].renamed_from,
            Some(("shop".to_string(), "users".to_string()))
        );
        assert!(store.table("shop", "users").is_none());
        assert!(store.table("shop", "customers").is_some());

        store.apply_ddl("shop", "DROP TABLE customers").unwrap();
        assert!(store.table("shop", "customers").is_none());
        assert_eq!(store.version(), 4);
    }

    #[test]
    fn test_ddl_against_unknown_table() {
        let mut store = store();
        let err = store
            .apply_ddl("shop", "ALTER TABLE nope ADD COLUMN x int")
            .unwrap_err();
        assert!(matches!(err, Error::SchemaConsistency { ref message } if message.contains("shop.nope")));

        let err = store.apply_ddl("shop", "DROP TABLE nope").unwrap_err();
        assert!(matches!(err, Error::SchemaConsistency { .. }));

        // IF EXISTS turns it into a no-op
        let changes = store.apply_ddl("shop", "DROP TABLE IF EXISTS nope").unwrap();
        assert!(changes.is_empty());
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_rename_across_excluded_database() {
        let mut store = SchemaStore::new(snapshot(), &["scratch".to_string()]);

        // nothing is known about scratch.staging, so nothing can move in
        let err = store
            .apply_ddl("shop", "RENAME TABLE scratch.staging TO shop.staging")
            .unwrap_err();
        assert!(matches!(err, Error::SchemaConsistency { ref message } if message.contains("excluded")));
        let err = store
            .apply_ddl("scratch", "ALTER TABLE staging RENAME TO shop.staging")
            .unwrap_err();
        assert!(matches!(err, Error::SchemaConsistency { .. }));
        assert_eq!(store.version(), 1);

        let changes = store
            .apply_ddl("shop", "RENAME TABLE orders TO scratch.orders_archive")
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, SchemaChangeKind::TableDrop);
        assert_eq!(changes[0].table.as_deref(), Some("orders"));
        assert!(store.table("shop", "orders").is_none());
        assert!(store.table("scratch", "orders_archive").is_none());
    }

    #[test]
    fn test_ddl_on_excluded_database_is_ignored() {
        let mut store = store();
        let changes = store
            .apply_ddl("mysql", "CREATE TABLE user_audit (id int)")
            .unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_resolve_maps_positional_values() {
        let store = store();
        let row = store.resolve("shop", "orders", &[json!(1), json!(250)]).unwrap();
        assert_eq!(row.get("id"), Some(&json!(1)));
        assert_eq!(row.get("total"), Some(&json!(250)));

        let err = store.resolve("shop", "orders", &[json!(1)]).unwrap_err();
        assert!(matches!(err, Error::SchemaConsistency { .. }));

        let err = store.resolve("shop", "missing", &[]).unwrap_err();
        assert!(matches!(err, Error::UnknownTable { .. }));
    }
}
