//! DDL interpretation.
//!
//! Statements that can change the shape of the schema (`CREATE`/`DROP`
//! `DATABASE`/`SCHEMA`/`TABLE`, `ALTER TABLE`, `RENAME TABLE`) are parsed
//! with `sqlparser`'s MySQL dialect and lowered into [`DdlStatement`]s.
//! Everything else (DML, grants, views, triggers, temporary tables, index
//! maintenance) is recognised by its leading keywords and ignored. A
//! schema-changing statement that does not parse is an error: skipping it
//! would leave the snapshot out of step with the log.

use sqlparser::ast::{
    AlterTableOperation, ColumnDef, ColumnOption, MySQLColumnPosition, ObjectName, ObjectType,
    SchemaName, Statement, TableConstraint,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use super::Column;
use crate::{Error, Result};

/// A table name, optionally qualified by its database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub database: Option<String>,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnPlacement {
    Last,
    First,
    After(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlOperation {
    AddColumn {
        column: Column,
        placement: ColumnPlacement,
    },
    DropColumn {
        name: String,
        if_exists: bool,
    },
    /// `CHANGE` and `MODIFY`; `column.name` is the new name.
    ChangeColumn {
        old_name: String,
        column: Column,
        placement: Option<ColumnPlacement>,
    },
    RenameColumn {
        old_name: String,
        new_name: String,
    },
    RenameTable {
        to: TableRef,
    },
    AddPrimaryKey {
        columns: Vec<String>,
    },
    DropPrimaryKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlStatement {
    CreateDatabase {
        database: String,
        if_not_exists: bool,
    },
    DropDatabase {
        database: String,
        if_exists: bool,
    },
    CreateTable {
        table: TableRef,
        if_not_exists: bool,
        columns: Vec<Column>,
        primary_key: Vec<String>,
        like: Option<TableRef>,
    },
    DropTable {
        tables: Vec<TableRef>,
        if_exists: bool,
    },
    AlterTable {
        table: TableRef,
        operations: Vec<DdlOperation>,
    },
    RenameTable {
        renames: Vec<(TableRef, TableRef)>,
    },
}

/// Parses `sql`, returning the schema changes it describes.
///
/// Returns an empty list for statements that cannot change the schema.
pub fn parse(sql: &str) -> Result<Vec<DdlStatement>> {
    if !is_schema_statement(sql) {
        return Ok(Vec::new());
    }
    if let Some(drop) = parse_drop_database(sql)? {
        return Ok(vec![drop]);
    }
    if let Some(rename) = parse_rename_table(sql)? {
        return Ok(vec![rename]);
    }

    let statements = Parser::parse_sql(&MySqlDialect {}, sql).map_err(|e| Error::SchemaParse {
        sql: sql.to_string(),
        message: e.to_string(),
    })?;

    let mut lowered = Vec::new();
    for statement in statements {
        if let Some(ddl) = lower(sql, statement)? {
            lowered.push(ddl);
        }
    }
    Ok(lowered)
}

/// Whether the leading keywords name a schema-changing statement.
pub fn is_schema_statement(sql: &str) -> bool {
    let words: Vec<String> = strip_leading_comments(sql)
        .split_whitespace()
        .take(3)
        .map(|w| w.to_ascii_uppercase())
        .collect();
    let word = |i: usize| words.get(i).map(String::as_str).unwrap_or("");

    match word(0) {
        "CREATE" => matches!(word(1), "DATABASE" | "SCHEMA" | "TABLE"),
        "ALTER" => word(1) == "TABLE",
        "DROP" => matches!(word(1), "DATABASE" | "SCHEMA" | "TABLE"),
        "RENAME" => word(1) == "TABLE",
        _ => false,
    }
}

pub(crate) fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("/*") {
            match after.find("*/") {
                Some(end) => rest = after[end + 2..].trim_start(),
                None => return "",
            }
        } else if rest.starts_with("--") || rest.starts_with('#') {
            match rest.find('\n') {
                Some(end) => rest = rest[end + 1..].trim_start(),
                None => return "",
            }
        } else {
            return rest;
        }
    }
}

/// `DROP {DATABASE | SCHEMA} [IF EXISTS] name`, read from its keywords.
fn parse_drop_database(sql: &str) -> Result<Option<DdlStatement>> {
    let stripped = strip_leading_comments(sql).trim_end().trim_end_matches(';');
    let mut words = stripped.split_whitespace();

    let is_drop = words.next().is_some_and(|w| w.eq_ignore_ascii_case("DROP"));
    let is_database = words
        .next()
        .is_some_and(|w| w.eq_ignore_ascii_case("DATABASE") || w.eq_ignore_ascii_case("SCHEMA"));
    if !is_drop || !is_database {
        return Ok(None);
    }

    let rest: Vec<&str> = words.collect();
    let (if_exists, name) = match rest.as_slice() {
        [name] => (false, *name),
        [kw_if, kw_exists, name]
            if kw_if.eq_ignore_ascii_case("IF") && kw_exists.eq_ignore_ascii_case("EXISTS") =>
        {
            (true, *name)
        }
        _ => return Err(unsupported(sql, "DROP DATABASE syntax")),
    };

    let database = name.trim_matches('`');
    if database.is_empty() || database.contains('`') {
        return Err(unsupported(sql, "DROP DATABASE name"));
    }
    Ok(Some(DdlStatement::DropDatabase {
        database: database.to_string(),
        if_exists,
    }))
}

/// `RENAME TABLE old TO new [, old TO new]...`, read from its keywords.
fn parse_rename_table(sql: &str) -> Result<Option<DdlStatement>> {
    let stripped = strip_leading_comments(sql).trim_end().trim_end_matches(';');
    let mut words = stripped.split_whitespace();

    let is_rename = words.next().is_some_and(|w| w.eq_ignore_ascii_case("RENAME"));
    let is_table = words.next().is_some_and(|w| w.eq_ignore_ascii_case("TABLE"));
    if !is_rename || !is_table {
        return Ok(None);
    }

    let rest = words.collect::<Vec<_>>().join(" ");
    let renames = rest
        .split(',')
        .map(|pair| match pair.split_whitespace().collect::<Vec<_>>().as_slice() {
            [old, kw_to, new] if kw_to.eq_ignore_ascii_case("TO") => {
                Ok((quoted_table_ref(sql, old)?, quoted_table_ref(sql, new)?))
            }
            _ => Err(unsupported(sql, "RENAME TABLE syntax")),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(DdlStatement::RenameTable { renames }))
}

/// `table`, `db.table`, either part optionally backquoted.
fn quoted_table_ref(sql: &str, name: &str) -> Result<TableRef> {
    let parts: Vec<&str> = name.split('.').map(|p| p.trim_matches('`')).collect();
    if parts.iter().any(|p| p.is_empty() || p.contains('`')) {
        return Err(unsupported(sql, &format!("table name {}", name)));
    }
    match parts.as_slice() {
        [table] => Ok(TableRef {
            database: None,
            table: table.to_string(),
        }),
        [database, table] => Ok(TableRef {
            database: Some(database.to_string()),
            table: table.to_string(),
        }),
        _ => Err(unsupported(sql, &format!("table name {}", name))),
    }
}

fn lower(sql: &str, statement: Statement) -> Result<Option<DdlStatement>> {
    let ddl = match statement {
        Statement::CreateDatabase {
            db_name,
            if_not_exists,
            ..
        } => DdlStatement::CreateDatabase {
            database: single_name(sql, &db_name)?,
            if_not_exists,
        },

        Statement::CreateSchema {
            schema_name,
            if_not_exists,
            ..
        } => {
            let database = match schema_name {
                SchemaName::Simple(name) => single_name(sql, &name)?,
                other => return Err(unsupported(sql, &format!("schema name {}", other))),
            };
            DdlStatement::CreateDatabase {
                database,
                if_not_exists,
            }
        }

        Statement::CreateTable(create) => {
            if create.temporary {
                return Ok(None);
            }
            if create.columns.is_empty() && create.like.is_none() {
                return Err(unsupported(sql, "CREATE TABLE without a column list"));
            }

            let mut primary_key = Vec::new();
            let columns = create
                .columns
                .iter()
                .map(|def| {
                    if is_inline_primary_key(def) {
                        primary_key.push(def.name.value.clone());
                    }
                    column_from_def(def)
                })
                .collect();

            for constraint in &create.constraints {
                if let TableConstraint::PrimaryKey { columns, .. } = constraint {
                    primary_key = columns.iter().map(|c| c.value.clone()).collect();
                }
            }

            DdlStatement::CreateTable {
                table: table_ref(sql, &create.name)?,
                if_not_exists: create.if_not_exists,
                columns,
                primary_key,
                like: create.like.as_ref().map(|n| table_ref(sql, n)).transpose()?,
            }
        }

        Statement::AlterTable {
            name, operations, ..
        } => {
            let mut lowered = Vec::new();
            for operation in operations {
                if let Some(op) = lower_alter(sql, operation)? {
                    lowered.push(op);
                }
            }
            DdlStatement::AlterTable {
                table: table_ref(sql, &name)?,
                operations: lowered,
            }
        }

        Statement::Drop {
            object_type,
            if_exists,
            names,
            ..
        } => match object_type {
            ObjectType::Table => DdlStatement::DropTable {
                tables: names
                    .iter()
                    .map(|n| table_ref(sql, n))
                    .collect::<Result<_>>()?,
                if_exists,
            },
            _ => return Ok(None),
        },

        _ => return Ok(None),
    };
    Ok(Some(ddl))
}

fn lower_alter(sql: &str, operation: AlterTableOperation) -> Result<Option<DdlOperation>> {
    let op = match operation {
        AlterTableOperation::AddColumn {
            column_def,
            column_position,
            ..
        } => DdlOperation::AddColumn {
            column: column_from_def(&column_def),
            placement: placement(column_position).unwrap_or(ColumnPlacement::Last),
        },

        AlterTableOperation::DropColumn {
            column_name,
            if_exists,
            ..
        } => DdlOperation::DropColumn {
            name: column_name.value,
            if_exists,
        },

        AlterTableOperation::ChangeColumn {
            old_name,
            new_name,
            data_type,
            column_position,
            ..
        } => DdlOperation::ChangeColumn {
            old_name: old_name.value,
            column: Column::new(new_name.value, type_name(&data_type)),
            placement: placement(column_position),
        },

        AlterTableOperation::ModifyColumn {
            col_name,
            data_type,
            column_position,
            ..
        } => DdlOperation::ChangeColumn {
            old_name: col_name.value.clone(),
            column: Column::new(col_name.value, type_name(&data_type)),
            placement: placement(column_position),
        },

        AlterTableOperation::RenameColumn {
            old_column_name,
            new_column_name,
        } => DdlOperation::RenameColumn {
            old_name: old_column_name.value,
            new_name: new_column_name.value,
        },

        AlterTableOperation::RenameTable { table_name } => DdlOperation::RenameTable {
            to: table_ref(sql, &table_name)?,
        },

        AlterTableOperation::AddConstraint(TableConstraint::PrimaryKey { columns, .. }) => {
            DdlOperation::AddPrimaryKey {
                columns: columns.into_iter().map(|c| c.value).collect(),
            }
        }

        AlterTableOperation::DropPrimaryKey => DdlOperation::DropPrimaryKey,

        // indexes, constraints, table options
        _ => return Ok(None),
    };
    Ok(Some(op))
}

fn column_from_def(def: &ColumnDef) -> Column {
    Column::new(def.name.value.clone(), type_name(&def.data_type))
}

fn is_inline_primary_key(def: &ColumnDef) -> bool {
    def.options
        .iter()
        .any(|o| matches!(o.option, ColumnOption::Unique { is_primary: true, .. }))
}

fn type_name(data_type: &sqlparser::ast::DataType) -> String {
    data_type.to_string().to_ascii_lowercase()
}

fn placement(position: Option<MySQLColumnPosition>) -> Option<ColumnPlacement> {
    position.map(|p| match p {
        MySQLColumnPosition::First => ColumnPlacement::First,
        MySQLColumnPosition::After(ident) => ColumnPlacement::After(ident.value),
    })
}

fn table_ref(sql: &str, name: &ObjectName) -> Result<TableRef> {
    match name.0.as_slice() {
        [table] => Ok(TableRef {
            database: None,
            table: table.value.clone(),
        }),
        [database, table] => Ok(TableRef {
            database: Some(database.value.clone()),
            table: table.value.clone(),
        }),
        _ => Err(unsupported(sql, &format!("table name {}", name))),
    }
}

fn single_name(sql: &str, name: &ObjectName) -> Result<String> {
    match name.0.as_slice() {
        [ident] => Ok(ident.value.clone()),
        _ => Err(unsupported(sql, &format!("database name {}", name))),
    }
}

fn unsupported(sql: &str, what: &str) -> Error {
    Error::SchemaParse {
        sql: sql.to_string(),
        message: format!("unsupported {}", what),
    }
}
