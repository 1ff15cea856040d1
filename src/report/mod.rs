//! Privacy-preserving reports of split-retry outcomes.
//!
//! - [`reporter`]: the [`FailureReporter`], which batches outcomes and sends them over DNS
//! - [`batch`]: per-SNI outcome counters
//! - [`store`]: persistent per-install salt

pub mod batch;
pub mod reporter;
pub mod store;

pub use batch::{Counters, Outcome, ReportBatch};
pub use reporter::{FailureReporter, ReporterConfig};
pub use store::{load_or_create_salt, FileStore, MemoryStore, PersistentStore};
