pub mod args;
pub mod artifacts;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod parser;
pub mod pretty;
pub mod process;
pub mod scan;
pub mod scanner;
pub mod types;

// Re-export key types and functions at the crate root
pub use config::{ScanConfig, load_config};
pub use error::{Result, ScanError};
pub use logging::{MemoryLog, ScanLogger, get_log_file_path, init_logging};
pub use parser::{LineOutcome, ParseSummary, PortInfoLookup, parse_result_file};
pub use process::{ProcessOutput, ProcessRunner, Runner};
pub use scan::{MongoDbModule, SmtpModule, create_default_modules, module_for};
pub use scanner::{Extracted, Module, Zgrab2Scanner};
pub use types::{MongoDb, PortInfo, PortTarget, ProtocolRecord, ScanTask, Smtp};
