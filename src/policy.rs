// Snapshot inclusion policies.

use crate::error::{ExportError, Result};
use crate::table::TableDescriptor;
use std::str::FromStr;

/// Decides whether a table takes part in the initial snapshot. Must be a
/// pure function of the descriptor.
pub trait SnapshotPolicy {
    fn include(&self, table: &TableDescriptor) -> bool;
}

impl<F> SnapshotPolicy for F
where
    F: Fn(&TableDescriptor) -> bool,
{
    fn include(&self, table: &TableDescriptor) -> bool {
        self(table)
    }
}

pub fn export_all(_table: &TableDescriptor) -> bool {
    true
}

/// `schema.table` pattern where either part may use `*` wildcards.
/// A bare pattern matches the table name in any schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePattern {
    namespace: Option<String>,
    name: String,
}

impl TablePattern {
    pub fn matches(&self, table: &TableDescriptor) -> bool {
        self.namespace
            .as_deref()
            .is_none_or(|ns| glob_match(ns, &table.namespace))
            && glob_match(&self.name, &table.name)
    }
}

impl FromStr for TablePattern {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        let (namespace, name) = match s.split_once('.') {
            Some((ns, name)) => (Some(ns.to_string()), name.to_string()),
            None => (None, s.to_string()),
        };
        if name.is_empty() || namespace.as_deref() == Some("") {
            return Err(ExportError::Config(format!("invalid table pattern {s:?}")));
        }
        Ok(TablePattern { namespace, name })
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let (p, t): (Vec<char>, Vec<char>) = (pattern.chars().collect(), text.chars().collect());
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Include/exclude filter. An empty include list admits every table;
/// exclusions always win.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    pub include: Vec<TablePattern>,
    pub exclude: Vec<TablePattern>,
}

impl SnapshotPolicy for TableFilter {
    fn include(&self, table: &TableDescriptor) -> bool {
        (self.include.is_empty() || self.include.iter().any(|p| p.matches(table)))
            && !self.exclude.iter().any(|p| p.matches(table))
    }
}
