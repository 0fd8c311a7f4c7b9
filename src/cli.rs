use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "grabscan")]
#[command(about = "Grab and normalize service banners with zgrab2")]
pub struct Cli {
    /// zgrab2 module to run (mongodb, smtp)
    pub module: String,

    /// Primary host address to scan
    pub host: String,

    /// Port(s) to scan; each port is scanned independently
    #[arg(short, long = "port", required = true, num_args = 1..)]
    pub ports: Vec<i64>,

    /// Additional hostname for the host (repeatable)
    #[arg(long = "hostname")]
    pub hostnames: Vec<String>,

    /// Additional domain for the host (repeatable)
    #[arg(long = "domain")]
    pub domains: Vec<String>,

    /// Task identifier used in file names and logs
    #[arg(long)]
    pub task_id: Option<String>,

    /// Batch identifier used in file names and logs
    #[arg(long)]
    pub batch_id: Option<String>,

    /// Scan depth passed through to the parser
    #[arg(long, default_value = "1")]
    pub level: u8,

    /// zgrab2 timeout in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Path to the zgrab2 executable
    #[arg(long)]
    pub zgrab2: Option<PathBuf>,

    /// Directory for host lists and result files
    #[arg(long)]
    pub tmp_dir: Option<PathBuf>,

    /// Run zgrab2 through sudo
    #[arg(long)]
    pub sudo: bool,

    /// YAML config file (defaults to ./grabscan.yaml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print results as JSON instead of the pretty form
    #[arg(long)]
    pub json: bool,

    /// Extra flags passed to zgrab2 verbatim (after `--`)
    #[arg(last = true, allow_hyphen_values = true)]
    pub extra: Vec<String>,
}

pub fn parse() -> Cli {
    Cli::parse()
}
