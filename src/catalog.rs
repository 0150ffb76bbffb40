//! Table catalog reader.
//!
//! Lists permanent ordinary tables outside the system schemas, largest first.
//! With partition merging, inheritance children (including declarative
//! partitions) are folded into their topmost parent.

use crate::connection::{QueryConnection, Row, run_query};
use crate::error::{ExportError, Result};
use crate::table::TableDescriptor;

const KEY_COLUMNS: &str = "
       (SELECT pg_catalog.array_to_json(pg_catalog.array_agg(a.attname ORDER BY k.ord))::text
          FROM (SELECT x.indrelid, x.indkey
                  FROM pg_catalog.pg_index x
                 WHERE x.indrelid = c.oid AND (x.indisreplident OR x.indisprimary)
                 ORDER BY x.indisreplident DESC
                 LIMIT 1) x
         CROSS JOIN LATERAL unnest(x.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
          JOIN pg_catalog.pg_attribute a ON a.attrelid = x.indrelid AND a.attnum = k.attnum)";

const USER_SCHEMAS: &str = "n.nspname NOT LIKE 'pg\\_%' AND n.nspname <> 'information_schema'";

pub fn table_list_query(merge_partitions: bool) -> String {
    if merge_partitions {
        format!(
            "WITH RECURSIVE tree AS (
    SELECT c.oid AS root, c.oid AS relid
      FROM pg_catalog.pg_class c
      JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
     WHERE c.relkind IN ('r', 'p')
       AND c.relpersistence = 'p'
       AND {USER_SCHEMAS}
       AND NOT EXISTS (SELECT 1 FROM pg_catalog.pg_inherits i WHERE i.inhrelid = c.oid)
    UNION ALL
    SELECT tree.root, i.inhrelid
      FROM tree
      JOIN pg_catalog.pg_inherits i ON i.inhparent = tree.relid
), sized AS (
    SELECT root, sum(pg_catalog.pg_relation_size(relid))::bigint AS bytes, count(*) > 1 AS nested
      FROM tree
     GROUP BY root
)
SELECT n.nspname, c.relname, sized.bytes, sized.nested,{KEY_COLUMNS}
  FROM sized
  JOIN pg_catalog.pg_class c ON c.oid = sized.root
  JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
 ORDER BY sized.bytes DESC, n.nspname, c.relname"
        )
    } else {
        format!(
            "SELECT n.nspname, c.relname, pg_catalog.pg_relation_size(c.oid), false,{KEY_COLUMNS}
  FROM pg_catalog.pg_class c
  JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
 WHERE c.relkind = 'r'
   AND c.relpersistence = 'p'
   AND {USER_SCHEMAS}
 ORDER BY 3 DESC, n.nspname, c.relname"
        )
    }
}

fn parse_row(row: &Row) -> Result<TableDescriptor> {
    let column = |i: usize, what: &str| {
        row.get(i)
            .ok_or_else(|| ExportError::Protocol(format!("catalog row without {what}")))
    };
    let namespace = column(0, "namespace")?;
    let name = column(1, "name")?;
    let size = row
        .get(2)
        .map(str::parse::<u64>)
        .transpose()
        .map_err(|e| ExportError::Protocol(format!("bad relation size: {e}")))?
        .unwrap_or(0);
    let key: Vec<String> = match row.get(4) {
        Some(json) => serde_json::from_str(json)
            .map_err(|e| ExportError::Protocol(format!("bad key column list: {e}")))?,
        None => Vec::new(),
    };
    let mut table = TableDescriptor::new(namespace, name)
        .with_size(size)
        .with_key(key);
    table.with_descendants = row.get(3) == Some("t");
    Ok(table)
}

/// Enumerate exportable tables on `conn`.
pub fn list_tables<C: QueryConnection>(
    conn: &mut C,
    merge_partitions: bool,
) -> Result<Vec<TableDescriptor>> {
    run_query(conn, &table_list_query(merge_partitions))?
        .iter()
        .map(parse_row)
        .collect()
}
