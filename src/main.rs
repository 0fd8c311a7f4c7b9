use eyre::{Result, WrapErr};
use futures::future::join_all;
use std::time::Instant;

use grabscan::{PortInfo, PortTarget, ScanLogger, ScanTask, Zgrab2Scanner};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging first
    if let Err(e) = grabscan::init_logging() {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let args = grabscan::cli::parse();

    let mut config = grabscan::config::load_config(args.config.as_deref())
        .wrap_err("Failed to load config")?;
    if let Some(path) = args.zgrab2.clone() {
        config.zgrab2_path = path;
    }
    if let Some(dir) = args.tmp_dir.clone() {
        config.tmp_dir = dir;
    }
    if let Some(timeout) = args.timeout {
        config.timeout_secs = timeout;
    }
    if args.sudo {
        config.sudo = true;
    }

    let module = grabscan::scan::module_for(&args.module)
        .ok_or_else(|| eyre::eyre!("Unsupported module: {}", args.module))?;

    let task = ScanTask::new(
        args.task_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        args.batch_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    );
    log::info!(
        "[main] session_starting: task_id={} batch_id={} module={} host={} ports={:?}",
        task.task_id, task.batch_id, module.name(), args.host, args.ports
    );

    let mut infos: Vec<PortInfo> = args
        .ports
        .iter()
        .map(|port| {
            let mut target = PortTarget::new(args.host.clone(), *port);
            for hostname in &args.hostnames {
                target.add_hostname(hostname.clone());
            }
            for domain in &args.domains {
                target.add_domain(domain.clone());
            }
            PortInfo::from_target(target)
        })
        .collect();

    // Reject bad ports up front, before anything is spawned.
    for info in &infos {
        info.target.validate().wrap_err("Invalid scan target")?;
    }

    let scanner = Zgrab2Scanner::new(config, ScanLogger::default());
    if !args.json {
        grabscan::pretty::print_header(module.name(), &args.host);
    }

    let started = Instant::now();
    let outcomes = join_all(infos.iter_mut().map(|info| {
        scanner.get_banner(module.as_ref(), &task, args.level, info, &args.extra)
    }))
    .await;
    let elapsed = started.elapsed();

    for outcome in outcomes {
        outcome.wrap_err("Scan rejected")?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
    } else {
        for info in &infos {
            grabscan::pretty::print_port_info(info, elapsed);
        }
        grabscan::pretty::print_separator();
    }

    Ok(())
}
