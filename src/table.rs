// Table descriptors and SQL quoting helpers.

use itertools::Itertools;
use std::fmt;
use std::str::FromStr;

/// One exportable top-level table as listed by the catalog reader.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableDescriptor {
    pub namespace: String,
    pub name: String,
    /// On-disk size in bytes, summed over inheritance children when merged.
    pub approximate_size: u64,
    /// Replica identity / primary key columns; empty for unkeyed tables.
    pub key: Vec<String>,
    /// Export rows of inheritance children together with this table.
    pub with_descendants: bool,
}

impl TableDescriptor {
    pub fn new(namespace: &str, name: &str) -> Self {
        TableDescriptor {
            namespace: namespace.to_string(),
            name: name.to_string(),
            approximate_size: 0,
            key: Vec::new(),
            with_descendants: false,
        }
    }

    pub fn with_key<I, S>(mut self, key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key = key.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_size(mut self, bytes: u64) -> Self {
        self.approximate_size = bytes;
        self
    }

    /// Fully qualified and quoted, safe to splice into SQL.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.namespace), quote_ident(&self.name))
    }
}

impl FromStr for TableDescriptor {
    type Err = std::convert::Infallible;

    /// `schema.table`, or a bare name in `public`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.split_once('.') {
            Some((namespace, name)) => TableDescriptor::new(namespace, name),
            None => TableDescriptor::new("public", s),
        })
    }
}

impl fmt::Display for TableDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Standard-conforming string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render `key = 'value'` pairs as a parenthesised option list, as used by
/// `START_REPLICATION ... LOGICAL`.
pub fn option_list(options: &[(String, String)]) -> String {
    if options.is_empty() {
        return String::new();
    }
    let inner = options
        .iter()
        .map(|(k, v)| format!("{} {}", quote_ident(k), quote_literal(v)))
        .join(", ");
    format!(" ({inner})")
}
