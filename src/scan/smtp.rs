use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::args::{ArgBuilder, Flag, TransportPolicy};
use crate::error::{Result, ScanError};
use crate::scanner::{Extracted, Module};
use crate::types::{ProtocolRecord, Smtp};

const EHLO_DOMAIN: &str = "mail.example.com";

/// Port 25 upgrades in place, 465 speaks TLS from the first byte.
const SMTP_TRANSPORT: TransportPolicy = TransportPolicy {
    upgrade_flag: "--starttls",
    implicit_flag: "--smtps",
    upgrade_ports: &[25],
    implicit_ports: &[465],
};

static MTA_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(Exim|Sendmail|OpenSMTPD|hMailServer|Haraka|MDaemon|Kerio Connect|Microsoft ESMTP MAIL Service)[\s/,]*(?:Version:?\s*)?v?(\d+(?:\.\d+)+)",
    )
    .expect("valid regex")
});

#[derive(Debug, Clone, Copy, Default)]
pub struct SmtpModule;

impl SmtpModule {
    /// Software name and version announced in a greeting, when recognisable.
    pub fn software_version(greeting: &str) -> Option<(String, String)> {
        let caps = MTA_VERSION.captures(greeting)?;
        Some((caps[1].to_string(), caps[2].to_string()))
    }
}

fn text_field(result: &Value, key: &str) -> Result<Option<String>> {
    match result.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ScanError::attach_failure(
            "smtp",
            format!("{} is not a string: {}", key, other),
        )),
    }
}

impl Module for SmtpModule {
    fn name(&self) -> &'static str {
        "smtp"
    }

    fn record_keys(&self) -> &'static [&'static str] {
        &["smtp"]
    }

    fn apply_defaults(&self, args: &mut ArgBuilder, _port: u16) {
        args.default_flag(Flag::switch("--send-ehlo"))
            .default_flag(Flag::inline("--ehlo-domain", EHLO_DOMAIN))
            .default_flag(Flag::switch("--keep-client-logs"));
    }

    fn transport_policy(&self) -> Option<TransportPolicy> {
        Some(SMTP_TRANSPORT)
    }

    fn extract(&self, result: &Value) -> Result<Extracted> {
        if !result.is_object() {
            return Err(ScanError::attach_failure(self.name(), "result is not an object"));
        }
        let greeting = text_field(result, "banner")?;
        let ehlo = text_field(result, "ehlo")?.or(text_field(result, "helo")?);
        let starttls = text_field(result, "starttls")?;
        let quit = text_field(result, "quit")?;
        let tls = result.get("tls").is_some_and(|t| !t.is_null());

        if greeting.is_none() && ehlo.is_none() {
            return Err(ScanError::attach_failure(self.name(), "no greeting or ehlo reply"));
        }

        let announced = greeting.as_deref().and_then(Self::software_version);
        let mut record = Smtp {
            greeting,
            ehlo,
            starttls,
            quit,
            tls,
            software: announced.as_ref().map(|(name, _)| name.clone()),
            banner: String::new(),
        };
        record.banner = record.build_banner();

        Ok(Extracted {
            record: ProtocolRecord::Smtp(record),
            version: announced.map(|(_, version)| version),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_software_version() {
        let cases = [
            ("220 mx.example.com ESMTP Exim 4.96 Mon, 01 Jan 2024", Some(("Exim", "4.96"))),
            ("220 host ESMTP Sendmail 8.15.2/8.15.2; Tue", Some(("Sendmail", "8.15.2"))),
            (
                "220 EX01 Microsoft ESMTP MAIL Service, Version: 10.0.17763.1 ready",
                Some(("Microsoft ESMTP MAIL Service", "10.0.17763.1")),
            ),
            ("220 mx.example.com ESMTP Postfix (Ubuntu)", None),
        ];
        for (greeting, expected) in cases {
            let got = SmtpModule::software_version(greeting);
            assert_eq!(
                got.as_ref().map(|(n, v)| (n.as_str(), v.as_str())),
                expected,
                "{greeting}"
            );
        }
    }

    #[test]
    fn test_extract_starttls_session() {
        let result = json!({
            "banner": "220 mx.example.com ESMTP Postfix\r\n",
            "ehlo": "250-mx.example.com\r\n250-PIPELINING\r\n250 STARTTLS\r\n",
            "starttls": "220 2.0.0 Ready to start TLS\r\n",
            "tls": {"handshake_log": {}}
        });
        let extracted = SmtpModule.extract(&result).unwrap();

        assert!(extracted.version.is_none());
        let ProtocolRecord::Smtp(record) = extracted.record else {
            panic!("expected smtp record");
        };
        assert!(record.tls);
        assert!(record.software.is_none());
        assert_eq!(
            record.banner,
            "220 mx.example.com ESMTP Postfix\n250-mx.example.com\n250-PIPELINING\n250 STARTTLS\n220 2.0.0 Ready to start TLS"
        );
    }

    #[test]
    fn test_extract_falls_back_to_helo() {
        let result = json!({"helo": "250 mx.example.com\r\n"});
        let extracted = SmtpModule.extract(&result).unwrap();
        assert_eq!(extracted.record.banner(), "250 mx.example.com");
    }

    #[test]
    fn test_extract_rejects_empty_session() {
        assert!(SmtpModule.extract(&json!({})).is_err());
        assert!(SmtpModule.extract(&json!({"banner": 220})).is_err());
        assert!(SmtpModule.extract(&json!("220 hi")).is_err());
    }
}
