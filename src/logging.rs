use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use log::{Level, LevelFilter, Log, Metadata, Record};

/// Initialize logging to a system-specific log file
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let log_path = get_log_file_path()?;

    // Ensure the log directory exists
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Get log level from environment variable, default to INFO
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);

    env_logger::Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?
        )))
        .init();

    log::info!("Logging initialized to: {}", log_path.display());
    log::info!("Log level: {}", log_level);

    Ok(())
}

/// Get the system-specific log file path
pub fn get_log_file_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let log_dir = if cfg!(target_os = "macos") {
        // macOS: ~/Library/Logs/grabscan/
        dirs::home_dir()
            .ok_or("Could not find home directory")?
            .join("Library")
            .join("Logs")
            .join("grabscan")
    } else if cfg!(target_os = "linux") && nix::unistd::getuid().is_root() {
        PathBuf::from("/var/log/grabscan")
    } else {
        dirs::data_local_dir()
            .ok_or("Could not find local data directory")?
            .join("grabscan")
            .join("logs")
    };

    Ok(log_dir.join("grabscan.log"))
}

#[derive(Clone)]
enum Sink {
    Global,
    Custom(Arc<dyn Log>),
}

/// Logging handle passed to each pipeline component.
///
/// Wraps either the process-wide `log` backend or a caller-supplied
/// [`Log`] implementation, so a batch runner can route one task's records
/// wherever it wants without touching global state.
#[derive(Clone)]
pub struct ScanLogger {
    sink: Sink,
    target: &'static str,
}

impl fmt::Debug for ScanLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sink = match self.sink {
            Sink::Global => "global",
            Sink::Custom(_) => "custom",
        };
        f.debug_struct("ScanLogger")
            .field("sink", &sink)
            .field("target", &self.target)
            .finish()
    }
}

impl Default for ScanLogger {
    fn default() -> Self {
        Self::global("grabscan")
    }
}

impl ScanLogger {
    /// Forward to whatever logger `init_logging` (or the host application) installed.
    pub fn global(target: &'static str) -> Self {
        Self { sink: Sink::Global, target }
    }

    pub fn with_sink(sink: Arc<dyn Log>, target: &'static str) -> Self {
        Self {
            sink: Sink::Custom(sink),
            target,
        }
    }

    /// Same sink, different record target.
    pub fn scoped(&self, target: &'static str) -> Self {
        Self {
            sink: self.sink.clone(),
            target,
        }
    }

    pub fn target(&self) -> &'static str {
        self.target
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        let record = Record::builder()
            .level(level)
            .target(self.target)
            .args(args)
            .build();
        match &self.sink {
            Sink::Global => {
                if level > log::max_level() {
                    return;
                }
                let logger = log::logger();
                if logger.enabled(record.metadata()) {
                    logger.log(&record);
                }
            }
            Sink::Custom(logger) => {
                if logger.enabled(record.metadata()) {
                    logger.log(&record);
                }
            }
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    pub fn trace(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Trace, args);
    }
}

/// A [`Log`] that keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: Mutex<Vec<(Level, String, String)>>,
}

impl MemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(level, target, message)` triples in arrival order.
    pub fn records(&self) -> Vec<(Level, String, String)> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, level: Level) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(l, _, _)| *l == level)
            .count()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(_, _, msg)| msg.contains(needle))
    }
}

impl Log for MemoryLog {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((record.level(), record.target().to_string(), record.args().to_string()));
    }

    fn flush(&self) {}
}
