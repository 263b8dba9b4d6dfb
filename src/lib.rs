#[macro_use]
pub mod macros;

pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod frontend;
pub mod fs;
pub mod hooks;
pub mod instance;
pub mod ledger;
pub mod logging;
pub mod naming;
pub mod paths;
pub mod probe;
pub mod process;
pub mod progress;
pub mod shutdown;
pub mod transform;

pub use config::Config;
pub use engine::{EngineSettings, IngestEngine, ItemOutcome};
pub use error::{DropmarkError, Result};
pub use ledger::{Admission, LedgerEntry, LedgerStatus, Owner, ProcessedLedger};
pub use naming::{NamePattern, ParsedName};
pub use transform::{Transform, TransformClient, TransformError, TransformOutcome};
