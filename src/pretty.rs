use crate::types::{PortInfo, ProtocolRecord};
use std::fmt::Write;
use std::time::Duration;

const SECONDS_PER_MINUTE: u64 = 60;
const SECONDS_PER_HOUR: u64 = 3600;
const SEPARATOR_WIDTH: usize = 80;
const BANNER_INDENT: &str = "  │ ";

pub fn print_port_info(info: &PortInfo, elapsed: Duration) {
    print!("{}", render_port_info(info, elapsed));
}

pub fn render_port_info(info: &PortInfo, elapsed: Duration) -> String {
    let mut out = String::new();
    let status_icon = if info.record.is_some() { "✅" } else { "❌" };
    let service = if info.service.is_empty() { "unknown" } else { info.service.as_str() };

    let _ = write!(out, "{} {}:{} ", status_icon, info.host(), info.port());
    match &info.record {
        Some(record) => {
            let _ = write!(out, "{}", service.to_uppercase());
            if let Some(version) = &info.version {
                let _ = write!(out, " {}", version);
            }
            let _ = writeln!(out, " ({})", describe(record));
        }
        None => {
            let _ = writeln!(out, "no banner");
        }
    }

    if let Some(banner) = &info.banner {
        for line in banner.lines() {
            let _ = writeln!(out, "{}{}", BANNER_INDENT, line.trim_end());
        }
    }
    let _ = writeln!(out, "  └─ Scanned in {}", format_duration(elapsed));
    out
}

fn describe(record: &ProtocolRecord) -> String {
    match record {
        ProtocolRecord::MongoDb(m) => match m.is_master {
            Some(true) => "primary".to_string(),
            Some(false) => "secondary".to_string(),
            None => "role unknown".to_string(),
        },
        ProtocolRecord::Smtp(s) => {
            let mut parts = Vec::new();
            if let Some(software) = &s.software {
                parts.push(software.clone());
            }
            if s.starttls.is_some() {
                parts.push("STARTTLS".to_string());
            } else if s.tls {
                parts.push("TLS".to_string());
            }
            if parts.is_empty() { "plaintext".to_string() } else { parts.join(", ") }
        }
    }
}

fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();

    if total_secs < SECONDS_PER_MINUTE {
        format!("{}s", total_secs)
    } else if total_secs < SECONDS_PER_HOUR {
        format!("{}m{}s", total_secs / SECONDS_PER_MINUTE, total_secs % SECONDS_PER_MINUTE)
    } else {
        let hours = total_secs / SECONDS_PER_HOUR;
        let minutes = (total_secs % SECONDS_PER_HOUR) / SECONDS_PER_MINUTE;
        format!("{}h{}m", hours, minutes)
    }
}

pub fn print_separator() {
    println!("{}", "─".repeat(SEPARATOR_WIDTH));
}

pub fn print_header(module: &str, target: &str) {
    println!("🎯 Grabbing {} banners: {}", module, target);
    print_separator();
}
