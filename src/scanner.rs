use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::Instant;

use crate::args::{self, ArgBuilder, TransportPolicy};
use crate::artifacts::{self, TempArtifacts};
use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::logging::ScanLogger;
use crate::parser::{self, ParseSummary, PortInfoLookup};
use crate::process::{ProcessRunner, Runner};
use crate::types::{PortInfo, ProtocolRecord, ScanTask};

/// What a protocol parser pulls out of one `result` object.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub record: ProtocolRecord,
    pub version: Option<String>,
}

/// One zgrab2 protocol module: how to invoke it and how to read its output.
pub trait Module: Send + Sync {
    /// zgrab2 sub-command, e.g. `smtp`.
    fn name(&self) -> &'static str;

    /// Keys accepted under `data` in a result line.
    fn record_keys(&self) -> &'static [&'static str];

    /// Protocol defaults added when the caller has not set them.
    fn apply_defaults(&self, _args: &mut ArgBuilder, _port: u16) {}

    fn transport_policy(&self) -> Option<TransportPolicy> {
        None
    }

    /// Builds the protocol record from a validated success `result`.
    fn extract(&self, result: &Value) -> Result<Extracted>;
}

/// Drives zgrab2 for one target: host list, invocation, parse, cleanup.
pub struct Zgrab2Scanner<R: Runner = ProcessRunner> {
    config: ScanConfig,
    artifacts: TempArtifacts,
    runner: R,
    logger: ScanLogger,
}

impl Zgrab2Scanner<ProcessRunner> {
    pub fn new(config: ScanConfig, logger: ScanLogger) -> Self {
        let runner = ProcessRunner::new(logger.clone());
        Self::with_runner(config, runner, logger)
    }
}

impl<R: Runner> Zgrab2Scanner<R> {
    pub fn with_runner(config: ScanConfig, runner: R, logger: ScanLogger) -> Self {
        let logger = logger.scoped("grabscan::scanner");
        logger.debug(format_args!(
            "[scanner] new: zgrab2={} tmp_dir={} timeout={}s sudo={}",
            config.zgrab2_path.display(),
            config.tmp_dir.display(),
            config.timeout_secs,
            config.sudo
        ));
        Self {
            artifacts: TempArtifacts::new(config.tmp_dir.clone(), logger.clone()),
            config,
            runner,
            logger,
        }
    }

    /// Scans `portinfo`'s host, hostnames and domains on its port and fills
    /// it in from the first usable record.
    ///
    /// Only [`ScanError::InvalidTarget`] is returned as an error; everything
    /// else is logged and reported as `Ok(false)`.
    pub async fn get_banner(
        &self,
        module: &dyn Module,
        task: &ScanTask,
        level: u8,
        portinfo: &mut PortInfo,
        extra_args: &[String],
    ) -> Result<bool> {
        let port = portinfo.target.validate()?;
        let hosts = portinfo.target.host_list();
        let summary = self
            .scan_and_parse(module, task, level, port, &hosts, portinfo, extra_args)
            .await;
        Ok(summary.attached())
    }

    /// Like [`get_banner`](Self::get_banner) for several hosts sharing one
    /// port, keyed by IP. Only the first usable record is attached.
    pub async fn get_banners(
        &self,
        module: &dyn Module,
        task: &ScanTask,
        level: u8,
        port: i64,
        lookup: &mut std::collections::HashMap<String, PortInfo>,
        extra_args: &[String],
    ) -> Result<bool> {
        let port = u16::try_from(port)
            .map_err(|_| ScanError::invalid_target(format!("port {} out of range 0-65535", port)))?;
        let mut hosts: Vec<String> = Vec::new();
        for info in lookup.values() {
            info.target.validate()?;
            for host in info.target.host_list() {
                if !hosts.contains(&host) {
                    hosts.push(host);
                }
            }
        }
        if hosts.is_empty() {
            return Err(ScanError::invalid_target("no hosts to scan"));
        }
        hosts.sort();
        let summary = self
            .scan_and_parse(module, task, level, port, &hosts, lookup, extra_args)
            .await;
        Ok(summary.attached())
    }

    #[allow(clippy::too_many_arguments)]
    async fn scan_and_parse<L>(
        &self,
        module: &dyn Module,
        task: &ScanTask,
        level: u8,
        port: u16,
        hosts: &[String],
        lookup: &mut L,
        extra_args: &[String],
    ) -> ParseSummary
    where
        L: PortInfoLookup + ?Sized,
    {
        let started = Instant::now();
        match self.execute(module, task, level, port, hosts, lookup, extra_args).await {
            Ok(summary) => {
                self.logger.info(format_args!(
                    "[scanner] scan_completed: module={} task_id={} batch_id={} port={} attached={} duration={}ms",
                    module.name(),
                    task.task_id,
                    task.batch_id,
                    port,
                    summary.attached(),
                    started.elapsed().as_millis()
                ));
                summary
            }
            Err(e) => {
                self.logger.error(format_args!(
                    "[scanner] scan_failed: module={} task_id={} batch_id={} port={} duration={}ms error={}",
                    module.name(),
                    task.task_id,
                    task.batch_id,
                    port,
                    started.elapsed().as_millis(),
                    e
                ));
                ParseSummary::default()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute<L>(
        &self,
        module: &dyn Module,
        task: &ScanTask,
        level: u8,
        port: u16,
        hosts: &[String],
        lookup: &mut L,
        extra_args: &[String],
    ) -> Result<ParseSummary>
    where
        L: PortInfoLookup + ?Sized,
    {
        // Everything allocated or named below is removed when `guard` drops,
        // whichever way this function exits.
        let mut guard = self.artifacts.guard();

        let host_file = guard.allocate(task, port, "hosts")?;
        artifacts::write_host_list(&host_file, hosts)?;
        let out_file = guard.allocate(task, port, module.name())?;

        let timeout = self.config.timeout();
        let built = args::build(module, port, timeout, extra_args, &host_file, &out_file);
        // A caller-supplied host list is left alone; the result file is ours either way.
        guard.track(&built.output_file);

        let work_dir = built
            .output_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        fs::create_dir_all(&work_dir)?;

        self.logger.debug(format_args!(
            "[scanner] invoking: module={} task_id={} hosts={} artifacts={} args={:?}",
            module.name(),
            task.task_id,
            hosts.len(),
            guard.paths().len(),
            built.args
        ));

        let output = self
            .runner
            .run(&self.config.zgrab2_path, &built.args, &work_dir, timeout, self.config.sudo)
            .await?;
        self.logger.info(format_args!(
            "[scanner] zgrab2_exited: module={} exit_code={} task_id={} batch_id={} port={}",
            module.name(),
            output.exit_code,
            task.task_id,
            task.batch_id,
            port
        ));

        if !built.output_file.is_file() {
            return Err(ScanError::MissingResultFile(built.output_file.clone()));
        }

        Ok(parser::parse_result_file(
            module,
            task,
            level,
            lookup,
            &built.output_file,
            &self.logger.scoped("grabscan::parser"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLog;
    use crate::process::ProcessOutput;
    use crate::scan::mongodb::MongoDbModule;
    use crate::scan::smtp::SmtpModule;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Writes canned JSON lines to the `-o` path instead of running zgrab2.
    #[derive(Default)]
    struct FakeRunner {
        lines: Vec<String>,
        fail: Option<ScanError>,
        calls: Mutex<Vec<(Vec<String>, PathBuf, bool)>>,
        hosts_seen: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        fn with_lines(lines: &[&str]) -> Self {
            Self {
                lines: lines.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        fn failing(err: ScanError) -> Self {
            Self {
                lines: vec![r#"{"ip":"10.0.0.1"}"#.to_string()],
                fail: Some(err),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    fn flag_value(args: &[String], flag: &str) -> Option<PathBuf> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(PathBuf::from)
    }

    #[async_trait]
    impl Runner for FakeRunner {
        async fn run(
            &self,
            _executable: &Path,
            args: &[String],
            working_dir: &Path,
            _timeout: Duration,
            elevated: bool,
        ) -> Result<ProcessOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((args.to_vec(), working_dir.to_path_buf(), elevated));
            if let Some(input) = flag_value(args, "-f") {
                let hosts = fs::read_to_string(input).unwrap();
                *self.hosts_seen.lock().unwrap() = hosts.lines().map(str::to_string).collect();
            }
            if let Some(out) = flag_value(args, "-o") {
                fs::write(out, self.lines.join("\n") + "\n").unwrap();
            }
            match &self.fail {
                Some(ScanError::Timeout(d)) => Err(ScanError::Timeout(*d)),
                Some(ScanError::ProcessFailed { exit_code, stderr }) => Err(ScanError::ProcessFailed {
                    exit_code: *exit_code,
                    stderr: stderr.clone(),
                }),
                _ => Ok(ProcessOutput {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                }),
            }
        }
    }

    fn config(root: &Path) -> ScanConfig {
        ScanConfig {
            tmp_dir: root.to_path_buf(),
            timeout_secs: 30,
            ..ScanConfig::default()
        }
    }

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!("grabscan-scanner-{}", uuid::Uuid::new_v4()))
    }

    fn leftover_files(root: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() { stack.push(path) } else { found.push(path) }
            }
        }
        found
    }

    const MONGO_OK: &str = r#"{"ip":"10.0.0.1","data":{"mongodb":{"status":"success","protocol":"mongodb","result":{"is_master":true,"build_info":{"version":"4.2.0"}}}}}"#;

    #[tokio::test]
    async fn test_get_banner_end_to_end() {
        let root = scratch();
        let memory = MemoryLog::new();
        let scanner = Zgrab2Scanner::with_runner(
            config(&root),
            FakeRunner::with_lines(&[MONGO_OK]),
            ScanLogger::with_sink(memory.clone(), "test"),
        );
        let task = ScanTask::new("t1", "b1");
        let mut info = PortInfo::new("10.0.0.1", 27017);
        info.target.add_hostname("db.internal");

        let attached = scanner
            .get_banner(&MongoDbModule, &task, 1, &mut info, &[])
            .await
            .unwrap();

        assert!(attached);
        assert_eq!(info.service, "mongodb");
        assert_eq!(info.version.as_deref(), Some("4.2.0"));
        assert_eq!(*scanner.runner.hosts_seen.lock().unwrap(), vec!["10.0.0.1", "db.internal"]);

        let calls = scanner.runner.calls.lock().unwrap().clone();
        let (args, work_dir, elevated) = &calls[0];
        assert_eq!(args[0], "mongodb");
        assert_eq!(work_dir, &root.join("b1"));
        assert!(!elevated);
        assert!(leftover_files(&root).is_empty());
        assert!(memory.contains("zgrab2_exited"));

        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn test_invalid_port_rejected_before_spawn() {
        let root = scratch();
        let scanner = Zgrab2Scanner::with_runner(config(&root), FakeRunner::with_lines(&[MONGO_OK]), ScanLogger::default());
        let task = ScanTask::new("t1", "b1");

        for port in [-1, 65536, 100_000] {
            let mut info = PortInfo::new("10.0.0.1", port);
            let err = scanner
                .get_banner(&SmtpModule, &task, 1, &mut info, &[])
                .await
                .unwrap_err();
            assert!(matches!(err, ScanError::InvalidTarget { .. }));
        }

        assert_eq!(scanner.runner.calls(), 0);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_process_failure_discards_output() {
        for failure in [
            ScanError::ProcessFailed {
                exit_code: Some(1),
                stderr: "boom".to_string(),
            },
            ScanError::Timeout(Duration::from_secs(30)),
        ] {
            let root = scratch();
            let memory = MemoryLog::new();
            let mut runner = FakeRunner::failing(failure);
            runner.lines = vec![MONGO_OK.to_string()];
            let scanner = Zgrab2Scanner::with_runner(config(&root), runner, ScanLogger::with_sink(memory.clone(), "test"));
            let mut info = PortInfo::new("10.0.0.1", 27017);
            let before = info.clone();

            let attached = scanner
                .get_banner(&MongoDbModule, &ScanTask::new("t", "b"), 1, &mut info, &[])
                .await
                .unwrap();

            assert!(!attached);
            assert_eq!(info, before);
            assert!(memory.contains("scan_failed"));
            assert!(leftover_files(&root).is_empty());
            let _ = fs::remove_dir_all(&root);
        }
    }

    #[tokio::test]
    async fn test_caller_output_override_is_read_and_removed() {
        let root = scratch();
        fs::create_dir_all(&root).unwrap();
        let custom = root.join("custom").join("out.json");
        let scanner = Zgrab2Scanner::with_runner(config(&root), FakeRunner::with_lines(&[MONGO_OK]), ScanLogger::default());
        let mut info = PortInfo::new("10.0.0.1", 27017);

        let attached = scanner
            .get_banner(
                &MongoDbModule,
                &ScanTask::new("t", "b"),
                1,
                &mut info,
                &["-o".to_string(), custom.display().to_string()],
            )
            .await
            .unwrap();

        assert!(attached);
        assert!(root.join("custom").is_dir());
        assert!(leftover_files(&root).is_empty());
        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn test_get_banners_attaches_first_match_only() {
        let root = scratch();
        let second = MONGO_OK.replace("10.0.0.1", "10.0.0.2");
        let scanner = Zgrab2Scanner::with_runner(
            config(&root),
            FakeRunner::with_lines(&[&second, MONGO_OK]),
            ScanLogger::default(),
        );
        let mut lookup: HashMap<String, PortInfo> = ["10.0.0.1", "10.0.0.2"]
            .iter()
            .map(|ip| (ip.to_string(), PortInfo::new(*ip, 27017)))
            .collect();

        let attached = scanner
            .get_banners(&MongoDbModule, &ScanTask::new("t", "b"), 1, 27017, &mut lookup, &[])
            .await
            .unwrap();

        assert!(attached);
        assert!(lookup["10.0.0.2"].record.is_some());
        assert!(lookup["10.0.0.1"].record.is_none());
        assert_eq!(*scanner.runner.hosts_seen.lock().unwrap(), vec!["10.0.0.1", "10.0.0.2"]);
        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn test_sudo_is_forwarded() {
        let root = scratch();
        let cfg = ScanConfig {
            sudo: true,
            ..config(&root)
        };
        let scanner = Zgrab2Scanner::with_runner(cfg, FakeRunner::with_lines(&[]), ScanLogger::default());
        let mut info = PortInfo::new("10.0.0.1", 465);

        let attached = scanner
            .get_banner(&SmtpModule, &ScanTask::new("t", "b"), 1, &mut info, &[])
            .await
            .unwrap();

        assert!(!attached);
        let calls = scanner.runner.calls.lock().unwrap().clone();
        assert!(calls[0].2);
        assert!(calls[0].0.contains(&"--smtps".to_string()));
        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn test_caller_host_list_survives_scan() {
        let root = scratch();
        let own = scratch();
        fs::create_dir_all(&own).unwrap();
        let mine = own.join("mine.txt");
        fs::write(&mine, "10.0.0.1\n10.0.0.9\n").unwrap();
        let scanner = Zgrab2Scanner::with_runner(config(&root), FakeRunner::with_lines(&[MONGO_OK]), ScanLogger::default());
        let mut info = PortInfo::new("10.0.0.1", 27017);

        let attached = scanner
            .get_banner(
                &MongoDbModule,
                &ScanTask::new("t", "b"),
                1,
                &mut info,
                &["-f".to_string(), mine.display().to_string()],
            )
            .await
            .unwrap();

        assert!(attached);
        assert_eq!(*scanner.runner.hosts_seen.lock().unwrap(), vec!["10.0.0.1", "10.0.0.9"]);
        let calls = scanner.runner.calls.lock().unwrap().clone();
        assert_eq!(calls[0].0.iter().filter(|a| *a == "-f").count(), 1);
        assert_eq!(fs::read_to_string(&mine).unwrap(), "10.0.0.1\n10.0.0.9\n");
        assert!(leftover_files(&root).is_empty());

        let _ = fs::remove_dir_all(&root);
        let _ = fs::remove_dir_all(&own);
    }
}
