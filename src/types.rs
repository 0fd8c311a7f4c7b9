use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Write;

use crate::error::{Result, ScanError};

/// Identifiers correlating one scan request across files and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTask {
    pub task_id: String,
    pub batch_id: String,
}

impl ScanTask {
    pub fn new(task_id: impl Into<String>, batch_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            batch_id: batch_id.into(),
        }
    }
}

/// Host plus the names it is known by, and the port to probe.
///
/// `port` is kept wide on purpose: it comes from upstream unchecked and is
/// only narrowed to `u16` by [`PortTarget::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortTarget {
    pub host: String,
    pub hostnames: Vec<String>,
    pub domains: Vec<String>,
    pub port: i64,
}

impl PortTarget {
    pub fn new(host: impl Into<String>, port: i64) -> Self {
        Self {
            host: host.into(),
            hostnames: Vec::new(),
            domains: Vec::new(),
            port,
        }
    }

    pub fn add_hostname(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.hostnames.contains(&name) {
            self.hostnames.push(name);
        }
    }

    pub fn add_domain(&mut self, domain: impl Into<String>) {
        let domain = domain.into();
        if !self.domains.contains(&domain) {
            self.domains.push(domain);
        }
    }

    pub fn validate(&self) -> Result<u16> {
        if self.host.trim().is_empty() {
            return Err(ScanError::invalid_target("empty host"));
        }
        u16::try_from(self.port)
            .map_err(|_| ScanError::invalid_target(format!("port {} out of range 0-65535", self.port)))
    }

    /// Primary host first, then hostnames, then domains; no duplicates.
    pub fn host_list(&self) -> Vec<String> {
        let mut hosts = vec![self.host.clone()];
        for name in self.hostnames.iter().chain(self.domains.iter()) {
            if !hosts.contains(name) {
                hosts.push(name.clone());
            }
        }
        hosts
    }

    /// Whether a record key (ip or domain) refers to this target.
    pub fn answers_to(&self, key: &str) -> bool {
        self.host == key
            || self.hostnames.iter().any(|h| h == key)
            || self.domains.iter().any(|d| d == key)
    }
}

/// Per-port result record, owned by the caller and filled in by a parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortInfo {
    pub target: PortTarget,
    pub service: String,
    pub version: Option<String>,
    pub banner: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub record: Option<ProtocolRecord>,
}

impl PortInfo {
    pub fn new(host: impl Into<String>, port: i64) -> Self {
        Self::from_target(PortTarget::new(host, port))
    }

    pub fn from_target(target: PortTarget) -> Self {
        Self {
            target,
            service: String::new(),
            version: None,
            banner: None,
            timestamp: None,
            record: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.target.host
    }

    pub fn port(&self) -> i64 {
        self.target.port
    }

    pub fn mongodb(&self) -> Option<&MongoDb> {
        match &self.record {
            Some(ProtocolRecord::MongoDb(m)) => Some(m),
            _ => None,
        }
    }

    pub fn smtp(&self) -> Option<&Smtp> {
        match &self.record {
            Some(ProtocolRecord::Smtp(s)) => Some(s),
            _ => None,
        }
    }
}

/// The protocol-specific sub-record attached to a [`PortInfo`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProtocolRecord {
    MongoDb(MongoDb),
    Smtp(Smtp),
}

impl ProtocolRecord {
    pub fn banner(&self) -> &str {
        match self {
            ProtocolRecord::MongoDb(m) => &m.banner,
            ProtocolRecord::Smtp(s) => &s.banner,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MongoDb {
    pub is_master: Option<bool>,
    pub build_info: Map<String, Value>,
    pub banner: String,
}

impl MongoDb {
    pub fn new(is_master: Option<bool>, build_info: Map<String, Value>) -> Self {
        let mut record = Self {
            is_master,
            build_info,
            banner: String::new(),
        };
        record.banner = record.build_banner();
        record
    }

    pub fn version(&self) -> Option<&str> {
        self.build_info.get("version").and_then(Value::as_str)
    }

    /// `isMaster: <bool>` then `buildInfo:` and the key-sorted build info JSON.
    pub fn build_banner(&self) -> String {
        let mut out = String::new();
        if let Some(is_master) = self.is_master {
            let _ = writeln!(out, "isMaster: {}", is_master);
        }
        let build_info = serde_json::to_string_pretty(&self.build_info).unwrap_or_default();
        let _ = write!(out, "buildInfo: {}", build_info);
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Smtp {
    pub greeting: Option<String>,
    pub ehlo: Option<String>,
    pub starttls: Option<String>,
    pub quit: Option<String>,
    /// A TLS handshake log was present (STARTTLS upgrade or implicit TLS).
    pub tls: bool,
    pub software: Option<String>,
    pub banner: String,
}

impl Smtp {
    /// Greeting, EHLO reply and STARTTLS reply, `\n`-separated throughout.
    pub fn build_banner(&self) -> String {
        [&self.greeting, &self.ehlo, &self.starttls]
            .into_iter()
            .flatten()
            .flat_map(|s| s.lines())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
