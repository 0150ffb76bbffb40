pub mod message;
pub mod slot;
pub mod stream;

pub use message::{Lsn, PrimaryKeepAlive, ReplicationMessage, XLogData};
pub use slot::{ReplicationSlot, Slot, SlotStatus};
pub use stream::{ChangeStream, LogicalReplicationStream, PgReplication, ReplicationClient};
