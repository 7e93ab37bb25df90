pub mod catalog;
pub mod engine;
pub mod scanner;
pub mod transfer;
pub mod watchdog;

pub use catalog::{CatalogEntry, CatalogStore};
pub use engine::{RunStatus, SyncEngine, SyncRunResult};
pub use scanner::{filter_listing, NamePattern};
pub use transfer::{verify_transfer, TransferFailure, TransferStatus};
pub use watchdog::{ConnectionStatus, ConnectionWatchdog};
