use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::ops::ControlFlow;
use std::path::Path;

use crate::error::ScanError;
use crate::logging::ScanLogger;
use crate::scanner::{Extracted, Module};
use crate::types::{PortInfo, ScanTask};

/// Maps a record's `ip` (or `domain`) to the `PortInfo` it belongs to.
pub trait PortInfoLookup {
    fn resolve(&mut self, key: &str) -> Option<&mut PortInfo>;
}

impl PortInfoLookup for HashMap<String, PortInfo> {
    fn resolve(&mut self, key: &str) -> Option<&mut PortInfo> {
        self.get_mut(key)
    }
}

/// A lone target answers for its host, hostnames and domains.
impl PortInfoLookup for PortInfo {
    fn resolve(&mut self, key: &str) -> Option<&mut PortInfo> {
        if self.target.answers_to(key) { Some(self) } else { None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Blank,
    MissingIp,
    UnknownHost(String),
    MissingProtocolData,
    NotSuccess(String),
    ProtocolMismatch { expected: String, found: String },
    NoResult,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Blank => write!(f, "blank line"),
            SkipReason::MissingIp => write!(f, "record has no ip"),
            SkipReason::UnknownHost(key) => write!(f, "no port info for {}", key),
            SkipReason::MissingProtocolData => write!(f, "no protocol data"),
            SkipReason::NotSuccess(status) => write!(f, "status {}", status),
            SkipReason::ProtocolMismatch { expected, found } => {
                write!(f, "protocol {} (expected {})", found, expected)
            }
            SkipReason::NoResult => write!(f, "no result object"),
        }
    }
}

/// A validated success record, ready to attach.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The `ip` or `domain` value the lookup recognised.
    pub key: String,
    pub ip: Option<String>,
    pub domain: Option<String>,
    pub protocol: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub extracted: Extracted,
}

/// Verdict on one line. Neither `Skip` nor `Failed` stops the parse; the
/// latter is counted and logged as an error.
#[derive(Debug)]
pub enum LineOutcome {
    Matched(Candidate),
    Skip(SkipReason),
    Failed(ScanError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseSummary {
    pub lines_read: usize,
    pub skipped: usize,
    pub failed: usize,
    pub attached_line: Option<usize>,
}

impl ParseSummary {
    pub fn attached(&self) -> bool {
        self.attached_line.is_some()
    }
}

/// Classifies one raw line without touching any `PortInfo`.
///
/// `known` reports whether an `ip` or `domain` belongs to the scan; it is
/// consulted before the protocol data is looked at.
pub fn classify_line<F>(module: &dyn Module, line_no: usize, raw: &[u8], mut known: F) -> LineOutcome
where
    F: FnMut(&str) -> bool,
{
    if raw.iter().all(u8::is_ascii_whitespace) {
        return LineOutcome::Skip(SkipReason::Blank);
    }
    let record: Value = match serde_json::from_slice(raw) {
        Ok(v) => v,
        Err(source) => {
            return LineOutcome::Failed(ScanError::MalformedRecord {
                line: line_no,
                source,
            });
        }
    };

    let ip = record.get("ip").and_then(Value::as_str).map(str::to_string);
    let domain = record.get("domain").and_then(Value::as_str).map(str::to_string);
    if ip.is_none() && domain.is_none() {
        return LineOutcome::Skip(SkipReason::MissingIp);
    }
    let recognised = [ip.as_deref(), domain.as_deref()]
        .into_iter()
        .flatten()
        .find(|candidate| known(candidate))
        .map(str::to_string);
    let Some(key) = recognised else {
        return LineOutcome::Skip(SkipReason::UnknownHost(ip.or(domain).unwrap_or_default()));
    };

    let Some((record_key, data)) = module
        .record_keys()
        .iter()
        .find_map(|key| record.get("data")?.get(*key).map(|d| (*key, d)))
    else {
        return LineOutcome::Skip(SkipReason::MissingProtocolData);
    };

    let status = data.get("status").and_then(Value::as_str).unwrap_or_default();
    if status != "success" {
        return LineOutcome::Skip(SkipReason::NotSuccess(status.to_string()));
    }
    let protocol = data.get("protocol").and_then(Value::as_str).unwrap_or_default();
    if protocol != record_key {
        return LineOutcome::Skip(SkipReason::ProtocolMismatch {
            expected: record_key.to_string(),
            found: protocol.to_string(),
        });
    }
    let Some(result) = data.get("result").filter(|r| !r.is_null()) else {
        return LineOutcome::Skip(SkipReason::NoResult);
    };

    let timestamp = data
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc));

    match module.extract(result) {
        Ok(extracted) => LineOutcome::Matched(Candidate {
            key,
            ip,
            domain,
            protocol: protocol.to_string(),
            timestamp,
            extracted,
        }),
        Err(e) => LineOutcome::Failed(e),
    }
}

/// Writes a candidate into `portinfo`. This is the only place a parser
/// mutates caller state.
pub fn attach(candidate: Candidate, portinfo: &mut PortInfo) {
    if portinfo.service != candidate.protocol {
        portinfo.service = candidate.protocol;
    }
    if candidate.timestamp.is_some() {
        portinfo.timestamp = candidate.timestamp;
    }
    let Extracted { record, version } = candidate.extracted;
    portinfo.version = version;
    portinfo.banner = Some(record.banner().to_string());
    portinfo.record = Some(record);
}

/// Reads `result_file` and attaches the first usable record to the matching
/// entry of `lookup`. Never fails: every problem is logged and skipped.
pub fn parse_result_file<L>(
    module: &dyn Module,
    task: &ScanTask,
    level: u8,
    lookup: &mut L,
    result_file: &Path,
    logger: &ScanLogger,
) -> ParseSummary
where
    L: PortInfoLookup + ?Sized,
{
    let mut summary = ParseSummary::default();

    let file = match File::open(result_file) {
        Ok(f) => f,
        Err(e) => {
            let err = if e.kind() == io::ErrorKind::NotFound {
                ScanError::MissingResultFile(result_file.to_path_buf())
            } else {
                ScanError::Io(e)
            };
            logger.error(format_args!(
                "[parser] open_failed: module={} task_id={} batch_id={} file={} error={}",
                module.name(),
                task.task_id,
                task.batch_id,
                result_file.display(),
                err
            ));
            return summary;
        }
    };

    let flow = BufReader::new(file)
        .split(b'\n')
        .enumerate()
        .try_for_each(|(idx, line)| {
            let line_no = idx + 1;
            summary.lines_read = line_no;
            let raw = match line {
                Ok(raw) => raw,
                Err(e) => {
                    logger.error(format_args!(
                        "[parser] read_failed: task_id={} file={} line={} error={}",
                        task.task_id,
                        result_file.display(),
                        line_no,
                        e
                    ));
                    summary.failed += 1;
                    return ControlFlow::Break(None);
                }
            };

            match classify_line(module, line_no, &raw, |key| lookup.resolve(key).is_some()) {
                LineOutcome::Matched(candidate) => match lookup.resolve(&candidate.key) {
                    Some(portinfo) => {
                        attach(candidate, portinfo);
                        logger.info(format_args!(
                            "[parser] attached: module={} task_id={} level={} host={} port={} service={} version={} line={}",
                            module.name(),
                            task.task_id,
                            level,
                            portinfo.host(),
                            portinfo.port(),
                            portinfo.service,
                            portinfo.version.as_deref().unwrap_or("-"),
                            line_no
                        ));
                        ControlFlow::Break(Some(line_no))
                    }
                    None => {
                        logger.error(format_args!(
                            "[parser] skipped: task_id={} file={} line={} reason={}",
                            task.task_id,
                            result_file.display(),
                            line_no,
                            SkipReason::UnknownHost(candidate.key)
                        ));
                        summary.skipped += 1;
                        ControlFlow::Continue(())
                    }
                },
                LineOutcome::Skip(reason) => {
                    if matches!(reason, SkipReason::MissingIp | SkipReason::UnknownHost(_)) {
                        logger.error(format_args!(
                            "[parser] skipped: task_id={} file={} line={} reason={}",
                            task.task_id,
                            result_file.display(),
                            line_no,
                            reason
                        ));
                    } else {
                        logger.debug(format_args!(
                            "[parser] skipped: task_id={} line={} reason={}",
                            task.task_id, line_no, reason
                        ));
                    }
                    summary.skipped += 1;
                    ControlFlow::Continue(())
                }
                LineOutcome::Failed(err) => {
                    logger.error(format_args!(
                        "[parser] line_failed: module={} task_id={} batch_id={} file={} line={} error={}",
                        module.name(),
                        task.task_id,
                        task.batch_id,
                        result_file.display(),
                        line_no,
                        err
                    ));
                    summary.failed += 1;
                    ControlFlow::Continue(())
                }
            }
        });

    if let ControlFlow::Break(Some(line_no)) = flow {
        summary.attached_line = Some(line_no);
    } else {
        logger.debug(format_args!(
            "[parser] no_match: module={} task_id={} file={} lines={} skipped={} failed={}",
            module.name(),
            task.task_id,
            result_file.display(),
            summary.lines_read,
            summary.skipped,
            summary.failed
        ));
    }
    summary
}
