//! Table and column filtering.
//!
//! Table rules are evaluated in order and the last matching rule wins;
//! tables no rule matches are included. Patterns are `database.table` with
//! glob wildcards (`*`, `?`) or `/regex/` on either side:
//!
//! ```text
//! exclude: *.*
//! include: shop.orders
//! exclude: /^tmp_.*/.*
//! ```
//!
//! The column filter removes named columns from rows of named tables
//! before they reach a sink.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, error, info};

use crate::row::RowEvent;
use crate::{Error, Result};

/// Tables written by managed-database tooling that are never replicated.
pub const SYSTEM_DENY_LIST: &[(&str, &str)] = &[
    ("mysql", "ha_health_check"),
    ("mysql", "rds_heartbeat2"),
    ("mysql", "rds_sysinfo"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleAction {
    Include,
    Exclude,
}

#[derive(Debug, Clone)]
struct Pattern {
    regex: Regex,
    is_wildcard: bool,
}

impl Pattern {
    fn parse(source: &str, rule: &str) -> Result<Self> {
        let invalid = |why: String| Error::Config(format!("invalid filter rule '{}': {}", rule, why));

        if source.is_empty() {
            return Err(invalid("empty pattern".to_string()));
        }

        let (expr, is_wildcard) = if source.len() >= 2 && source.starts_with('/') && source.ends_with('/') {
            (source[1..source.len() - 1].to_string(), false)
        } else {
            (glob_to_regex(source), source == "*")
        };

        let regex = RegexBuilder::new(&expr)
            .case_insensitive(true)
            .build()
            .map_err(|e| invalid(e.to_string()))?;
        Ok(Self { regex, is_wildcard })
    }

    fn matches(&self, text: &str) -> bool {
        self.is_wildcard || self.regex.is_match(text)
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::with_capacity(glob.len() + 2);
    regex.push('^');
    for c in glob.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    regex
}

#[derive(Debug, Clone)]
struct TableRule {
    action: RuleAction,
    database: Pattern,
    table: Pattern,
}

#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    rules: Vec<TableRule>,
}

impl TableFilter {
    pub fn new<S: AsRef<str>>(rules: &[S]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|r| parse_rule(r.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn is_system_denied(database: &str, table: &str) -> bool {
        SYSTEM_DENY_LIST
            .iter()
            .any(|(d, t)| *d == database && *t == table)
    }

    /// Whether rows of `database.table` are replicated.
    pub fn includes(&self, database: &str, table: &str) -> bool {
        if Self::is_system_denied(database, table) {
            return false;
        }

        let mut included = true;
        for rule in &self.rules {
            if rule.database.matches(database) && rule.table.matches(table) {
                included = rule.action == RuleAction::Include;
            }
        }
        included
    }

    /// Whether database-level statements for `database` are replicated.
    ///
    /// Only rules that cover every table of a database apply.
    pub fn includes_database(&self, database: &str) -> bool {
        let mut included = true;
        for rule in &self.rules {
            if rule.table.is_wildcard && rule.database.matches(database) {
                included = rule.action == RuleAction::Include;
            }
        }
        included
    }
}

fn parse_rule(rule: &str) -> Result<TableRule> {
    let invalid = |why: &str| Error::Config(format!("invalid filter rule '{}': {}", rule, why));

    let (action, pattern) = rule
        .split_once(':')
        .ok_or_else(|| invalid("expected '<include|exclude>: db.table'"))?;
    let action = match action.trim().to_ascii_lowercase().as_str() {
        "include" => RuleAction::Include,
        "exclude" => RuleAction::Exclude,
        other => return Err(invalid(&format!("unknown action '{}'", other))),
    };

    let pattern = pattern.trim();
    let split = if pattern.starts_with('/') {
        // skip over the regex so dots inside it are not taken as the separator
        pattern[1..]
            .find('/')
            .and_then(|end| pattern[end + 2..].find('.').map(|dot| end + 2 + dot))
    } else {
        pattern.find('.')
    };
    let split = split.ok_or_else(|| invalid("expected 'database.table'"))?;

    Ok(TableRule {
        action,
        database: Pattern::parse(&pattern[..split], rule)?,
        table: Pattern::parse(&pattern[split + 1..], rule)?,
    })
}

/// One column-filter entry: `table` is `database.table` or a bare table name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFilterEntry {
    pub table: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ColumnFilter {
    by_table: HashMap<String, Vec<String>>,
}

impl ColumnFilter {
    pub fn new(entries: Vec<ColumnFilterEntry>) -> Self {
        let mut by_table: HashMap<String, Vec<String>> = HashMap::new();
        for entry in entries {
            by_table
                .entry(entry.table.to_ascii_lowercase())
                .or_default()
                .extend(entry.columns);
        }
        Self { by_table }
    }

    /// Loads entries from a JSON file.
    ///
    /// A missing or malformed file disables column filtering; it is logged,
    /// never fatal.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                error!(path = ?path, error = %e, "Cannot read column filter, filtering disabled");
                return Self::default();
            }
        };

        match serde_json::from_str::<Vec<ColumnFilterEntry>>(&content) {
            Ok(entries) => {
                info!(path = ?path, entries = entries.len(), "Loaded column filter");
                Self::new(entries)
            }
            Err(e) => {
                error!(path = ?path, error = %e, "Malformed column filter, filtering disabled");
                Self::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_table.is_empty()
    }

    /// Removes filtered columns from `row`.
    pub fn apply(&self, row: &mut RowEvent) {
        if self.by_table.is_empty() || !row.kind.is_data() {
            return;
        }
        let Some(table) = row.table.as_deref() else {
            return;
        };

        let qualified = format!("{}.{}", row.database, table).to_ascii_lowercase();
        let bare = table.to_ascii_lowercase();
        for key in [qualified, bare] {
            if let Some(columns) = self.by_table.get(&key) {
                debug!(table = %key, columns = ?columns, "Redacting columns");
                row.redact_columns(columns);
            }
        }
    }
}
