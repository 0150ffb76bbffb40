use crate::options::ExportOptions;
use crate::policy::{TableFilter, TablePattern};
use crate::snapshot::ExportQuery;
use clap::{Parser, Subcommand};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream changes from a logical replication slot to stdout as JSON lines
    Stream(StreamArgs),
    /// Drop a logical replication slot
    DropSlot {
        /// PostgreSQL connection URI
        #[arg(short, long, env = "DATABASE_URL")]
        uri: String,

        /// Replication slot name
        #[arg(short, long)]
        slot: String,
    },
}

#[derive(clap::Args, Debug)]
pub struct StreamArgs {
    /// PostgreSQL connection URI
    #[arg(short, long, env = "DATABASE_URL")]
    pub uri: String,

    /// Replication slot name
    #[arg(short, long)]
    pub slot: String,

    /// Create the slot if it does not exist
    #[arg(long)]
    pub create_slot: bool,

    /// Export existing table contents before streaming (implies --create-slot)
    #[arg(long)]
    pub initial_snapshot: bool,

    /// Tables exported concurrently during the initial snapshot
    #[arg(short, long, default_value_t = 1)]
    pub jobs: usize,

    /// Seconds to wait before reconnecting a lost stream
    #[arg(long, default_value_t = 10)]
    pub reconnect_delay: u64,

    /// Logical decoding output plugin
    #[arg(short, long, default_value = "wal2json")]
    pub plugin: String,

    /// Output plugin option, may be repeated
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub options: Vec<(String, String)>,

    /// Only snapshot tables matching this pattern, may be repeated
    #[arg(long, value_name = "SCHEMA.TABLE")]
    pub include: Vec<TablePattern>,

    /// Skip tables matching this pattern during the snapshot, may be repeated
    #[arg(long, value_name = "SCHEMA.TABLE")]
    pub exclude: Vec<TablePattern>,

    /// Export partitions and inheritance children as separate tables
    #[arg(long)]
    pub no_merge_partitions: bool,

    /// Server-side function called as f(relname, relnamespace, only) to export a table
    #[arg(long)]
    pub export_function: Option<String>,
}

impl StreamArgs {
    pub fn export_options(&self) -> ExportOptions {
        ExportOptions {
            slot: self.slot.clone(),
            create_slot: self.create_slot || self.initial_snapshot,
            initial_snapshot: self.initial_snapshot,
            max_snapshot_jobs: self.jobs,
            reconnect_delay: Duration::from_secs(self.reconnect_delay),
            plugin: self.plugin.clone(),
            plugin_options: self.options.clone(),
            export_query: match &self.export_function {
                Some(function) => ExportQuery::Function(function.clone()),
                None => ExportQuery::RowToJson,
            },
            merge_partitions: !self.no_merge_partitions,
            ..ExportOptions::default()
        }
    }

    pub fn table_filter(&self) -> TableFilter {
        TableFilter {
            include: self.include.clone(),
            exclude: self.exclude.clone(),
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    if key.is_empty() {
        return Err(format!("empty option name in {s:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

pub fn get_args() -> Result<Args, clap::Error> {
    Args::try_parse()
}
