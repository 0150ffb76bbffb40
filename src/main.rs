//! Main binary entry point for postgres-cdc.

use anyhow::{Context, Result};
use postgres_cdc::args::{Command, get_args};
use postgres_cdc::{Exporter, JsonLinesWriter, PgConnector, PgReplication, ReplicationClient};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = get_args()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Stream(stream) => {
            let options = stream.export_options();
            let filter = stream.table_filter();
            let connector = PgConnector::new(&stream.uri);
            let shutdown = Arc::new(AtomicBool::new(false));
            let shutdown_clone = shutdown.clone();
            ctrlc::set_handler(move || {
                shutdown_clone.store(true, Ordering::Relaxed);
            })?;
            let mut writer = JsonLinesWriter::new(std::io::stdout().lock());
            let last = Exporter::new(&connector, &options)
                .run(&filter, &mut writer, &shutdown)
                .with_context(|| format!("export from slot {:?} failed", options.slot))?;
            info!(slot = %options.slot, acknowledged = %last, messages = writer.written(), "done");
        }
        Command::DropSlot { uri, slot } => {
            let mut repl = PgReplication::connect(&uri)?;
            repl.drop_slot(&slot)?;
            info!(%slot, "dropped replication slot");
        }
    }
    Ok(())
}
