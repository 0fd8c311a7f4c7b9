use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scanner::Module;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlagKey {
    Port,
    Timeout,
    InputFile,
    OutputFile,
    SendEhlo,
    EhloDomain,
    KeepClientLogs,
    StartTls,
    Smtps,
    Other(String),
}

impl FlagKey {
    pub fn from_name(name: &str) -> Self {
        match name {
            "-p" | "--port" => FlagKey::Port,
            "-t" | "--timeout" => FlagKey::Timeout,
            "-f" | "--input-file" => FlagKey::InputFile,
            "-o" | "--output-file" => FlagKey::OutputFile,
            "--send-ehlo" => FlagKey::SendEhlo,
            "--ehlo-domain" => FlagKey::EhloDomain,
            "--keep-client-logs" => FlagKey::KeepClientLogs,
            "--starttls" => FlagKey::StartTls,
            "--smtps" => FlagKey::Smtps,
            other => FlagKey::Other(other.to_string()),
        }
    }

    /// `Some(true)` when the flag needs a value, `None` when unknown.
    fn takes_value(&self) -> Option<bool> {
        match self {
            FlagKey::Port
            | FlagKey::Timeout
            | FlagKey::InputFile
            | FlagKey::OutputFile
            | FlagKey::EhloDomain => Some(true),
            FlagKey::SendEhlo | FlagKey::KeepClientLogs | FlagKey::StartTls | FlagKey::Smtps => Some(false),
            FlagKey::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flag {
    pub key: FlagKey,
    pub name: String,
    pub value: Option<String>,
    /// Rendered as `name=value` instead of two arguments.
    pub inline: bool,
}

impl Flag {
    pub fn switch(name: &str) -> Self {
        Self {
            key: FlagKey::from_name(name),
            name: name.to_string(),
            value: None,
            inline: false,
        }
    }

    pub fn valued(name: &str, value: impl Into<String>) -> Self {
        Self {
            key: FlagKey::from_name(name),
            name: name.to_string(),
            value: Some(value.into()),
            inline: false,
        }
    }

    pub fn inline(name: &str, value: impl Into<String>) -> Self {
        Self {
            inline: true,
            ..Self::valued(name, value)
        }
    }

    pub fn render_into(&self, out: &mut Vec<String>) {
        match (&self.value, self.inline) {
            (Some(value), true) => out.push(format!("{}={}", self.name, value)),
            (Some(value), false) => {
                out.push(self.name.clone());
                out.push(value.clone());
            }
            (None, _) => out.push(self.name.clone()),
        }
    }
}

/// Splits raw caller arguments into typed flags.
///
/// Handles `--name=value`, `--name value` for flags known to take a value,
/// and for unknown flags treats a following non-flag token as the value.
/// Surrounding quotes on values are dropped since no shell is involved.
pub fn parse_flags(args: &[String]) -> Vec<Flag> {
    let mut flags = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(token) = iter.next() {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        // "-p 25" passed as a single argument
        if let Some((name, value)) = token.split_once(' ') {
            if name.starts_with('-') && !name.contains('=') {
                flags.push(Flag::valued(name, unquote(value.trim())));
                continue;
            }
        }
        if !token.starts_with('-') {
            flags.push(Flag::switch(token));
            continue;
        }
        if let Some((name, value)) = token.split_once('=') {
            flags.push(Flag::inline(name, unquote(value)));
            continue;
        }
        let key = FlagKey::from_name(token);
        let wants_value = match key.takes_value() {
            Some(v) => v,
            None => iter.peek().is_some_and(|next| !next.starts_with('-')),
        };
        match (wants_value, iter.peek()) {
            (true, Some(_)) => {
                let value = iter.next().map(|v| unquote(v.trim())).unwrap_or_default();
                flags.push(Flag::valued(token, value));
            }
            _ => flags.push(Flag::switch(token)),
        }
    }
    flags
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

/// Two mutually exclusive TLS modes chosen by well-known port.
#[derive(Debug, Clone, Copy)]
pub struct TransportPolicy {
    pub upgrade_flag: &'static str,
    pub implicit_flag: &'static str,
    pub upgrade_ports: &'static [u16],
    pub implicit_ports: &'static [u16],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArgs {
    pub args: Vec<String>,
    /// Host list the prober will read (caller override or the allocated one).
    pub input_file: PathBuf,
    /// Result file the prober will write (caller override or the allocated one).
    pub output_file: PathBuf,
}

impl BuiltArgs {
    pub fn contains(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

#[derive(Debug, Clone)]
pub struct ArgBuilder {
    caller: Vec<Flag>,
    defaults: Vec<Flag>,
    transport: Option<Flag>,
}

impl ArgBuilder {
    pub fn new(caller_args: &[String]) -> Self {
        Self {
            caller: parse_flags(caller_args),
            defaults: Vec::new(),
            transport: None,
        }
    }

    pub fn caller_has(&self, key: &FlagKey) -> bool {
        self.caller.iter().any(|f| &f.key == key)
    }

    fn has(&self, key: &FlagKey) -> bool {
        self.caller_has(key)
            || self.defaults.iter().any(|f| &f.key == key)
            || self.transport.as_ref().is_some_and(|f| &f.key == key)
    }

    /// Adds `flag` unless a flag with the same key is already present.
    pub fn default_flag(&mut self, flag: Flag) -> &mut Self {
        if !self.has(&flag.key) {
            self.defaults.push(flag);
        }
        self
    }

    /// Enforces one TLS mode. Well-known ports decide and strip the opposing
    /// flag wherever it came from; elsewhere the caller's last choice stands.
    pub fn resolve_transport(&mut self, policy: &TransportPolicy, port: u16) {
        let upgrade = FlagKey::from_name(policy.upgrade_flag);
        let implicit = FlagKey::from_name(policy.implicit_flag);

        let forced = if policy.upgrade_ports.contains(&port) {
            Some((policy.upgrade_flag, upgrade.clone(), implicit.clone()))
        } else if policy.implicit_ports.contains(&port) {
            Some((policy.implicit_flag, implicit.clone(), upgrade.clone()))
        } else {
            None
        };

        match forced {
            Some((name, wanted, opposing)) => {
                self.remove(&opposing);
                if !self.has(&wanted) {
                    self.transport = Some(Flag::switch(name));
                }
            }
            None => {
                let last = self
                    .caller
                    .iter()
                    .rev()
                    .find(|f| f.key == upgrade || f.key == implicit)
                    .map(|f| f.key.clone());
                if let Some(last) = last {
                    let other = if last == upgrade { implicit } else { upgrade };
                    self.remove(&other);
                }
            }
        }
    }

    fn remove(&mut self, key: &FlagKey) {
        self.caller.retain(|f| &f.key != key);
        self.defaults.retain(|f| &f.key != key);
        if self.transport.as_ref().is_some_and(|f| &f.key == key) {
            self.transport = None;
        }
    }

    fn caller_value(&self, key: &FlagKey) -> Option<&str> {
        self.caller
            .iter()
            .rev()
            .find(|f| &f.key == key)
            .and_then(|f| f.value.as_deref())
    }

    /// `module [defaults] [caller] [transport] -f <input> -o <output>`.
    pub fn finish(self, module: &str, input: &Path, output: &Path) -> BuiltArgs {
        let input_file = self
            .caller_value(&FlagKey::InputFile)
            .map(PathBuf::from)
            .unwrap_or_else(|| input.to_path_buf());
        let output_file = self
            .caller_value(&FlagKey::OutputFile)
            .map(PathBuf::from)
            .unwrap_or_else(|| output.to_path_buf());
        let has_input = self.caller_has(&FlagKey::InputFile);
        let has_output = self.caller_has(&FlagKey::OutputFile);

        let mut args = vec![module.to_string()];
        for flag in self.defaults.iter().chain(self.caller.iter()).chain(self.transport.iter()) {
            flag.render_into(&mut args);
        }
        if !has_input {
            Flag::valued("-f", input.display().to_string()).render_into(&mut args);
        }
        if !has_output {
            Flag::valued("-o", output.display().to_string()).render_into(&mut args);
        }

        BuiltArgs {
            args,
            input_file,
            output_file,
        }
    }
}

/// Builds the full argument list for `module` against `port`.
pub fn build(
    module: &dyn Module,
    port: u16,
    timeout: Duration,
    caller_args: &[String],
    input: &Path,
    output: &Path,
) -> BuiltArgs {
    let mut builder = ArgBuilder::new(caller_args);
    builder.default_flag(Flag::valued("-p", port.to_string()));
    builder.default_flag(Flag::valued("-t", format!("{}s", timeout.as_secs())));
    module.apply_defaults(&mut builder, port);
    if let Some(policy) = module.transport_policy() {
        builder.resolve_transport(&policy, port);
    }
    builder.finish(module.name(), input, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::mongodb::MongoDbModule;
    use crate::scan::smtp::SmtpModule;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn smtp(port: u16, caller: &[&str]) -> BuiltArgs {
        build(
            &SmtpModule,
            port,
            Duration::from_secs(600),
            &strings(caller),
            Path::new("/tmp/in.hosts"),
            Path::new("/tmp/out.smtp"),
        )
    }

    #[test]
    fn test_parse_flags_forms() {
        let flags = parse_flags(&strings(&[
            "-p 26",
            "--ehlo-domain=\"mx.test\"",
            "--timeout",
            "5s",
            "--starttls",
            "--verbose-thing",
            "value",
            "--flag-only",
        ]));
        assert_eq!(flags[0], Flag::valued("-p", "26"));
        assert_eq!(flags[1], Flag::inline("--ehlo-domain", "mx.test"));
        assert_eq!(flags[2], Flag::valued("--timeout", "5s"));
        assert_eq!(flags[3].key, FlagKey::StartTls);
        assert_eq!(flags[4], Flag::valued("--verbose-thing", "value"));
        assert_eq!(flags[5], Flag::switch("--flag-only"));
        assert_eq!(flags.len(), 6);
    }

    #[test]
    fn test_smtp_defaults_and_layout() {
        let built = smtp(2525, &[]);
        assert_eq!(
            built.args,
            strings(&[
                "smtp",
                "-p",
                "2525",
                "-t",
                "600s",
                "--send-ehlo",
                "--ehlo-domain=mail.example.com",
                "--keep-client-logs",
                "-f",
                "/tmp/in.hosts",
                "-o",
                "/tmp/out.smtp",
            ])
        );
        assert!(!built.contains("--starttls"));
        assert!(!built.contains("--smtps"));
    }

    #[test]
    fn test_port_25_forces_starttls() {
        let built = smtp(25, &[]);
        assert!(built.contains("--starttls"));
        assert!(!built.contains("--smtps"));

        let built = smtp(25, &["--smtps"]);
        assert!(built.contains("--starttls"));
        assert!(!built.contains("--smtps"));
    }

    #[test]
    fn test_port_465_forces_smtps() {
        let built = smtp(465, &[]);
        assert!(built.contains("--smtps"));
        assert!(!built.contains("--starttls"));

        let built = smtp(465, &["--starttls", "--smtps"]);
        assert!(built.contains("--smtps"));
        assert!(!built.contains("--starttls"));
        assert_eq!(built.args.iter().filter(|a| *a == "--smtps").count(), 1);
    }

    #[test]
    fn test_transport_flags_never_both() {
        let callers: [&[&str]; 5] = [
            &[],
            &["--starttls"],
            &["--smtps"],
            &["--starttls", "--smtps"],
            &["--smtps", "--starttls"],
        ];
        for port in [0u16, 25, 465, 587, 2525, 65535] {
            for caller in callers {
                let built = smtp(port, caller);
                assert!(
                    !(built.contains("--starttls") && built.contains("--smtps")),
                    "port={port} caller={caller:?} args={:?}",
                    built.args
                );
            }
        }
    }

    #[test]
    fn test_caller_last_transport_wins_off_convention() {
        let built = smtp(587, &["--smtps", "--starttls"]);
        assert!(built.contains("--starttls"));
        assert!(!built.contains("--smtps"));
    }

    #[test]
    fn test_caller_flag_suppresses_default() {
        let built = smtp(25, &["--port", "2525", "--ehlo-domain=relay.test", "-t", "10s"]);
        assert!(!built.contains("-p"));
        assert!(!built.contains("600s"));
        assert!(built.contains("--ehlo-domain=relay.test"));
        assert!(!built.contains("--ehlo-domain=mail.example.com"));
        assert_eq!(built.args.iter().filter(|a| a.starts_with("--ehlo-domain")).count(), 1);
    }

    #[test]
    fn test_caller_io_override() {
        let built = smtp(25, &["-o", "/data/custom.json", "--input-file=/data/hosts.txt"]);
        assert_eq!(built.output_file, PathBuf::from("/data/custom.json"));
        assert_eq!(built.input_file, PathBuf::from("/data/hosts.txt"));
        assert!(!built.contains("/tmp/out.smtp"));
        assert!(!built.contains("/tmp/in.hosts"));
    }

    #[test]
    fn test_mongodb_has_no_protocol_defaults() {
        let built = build(
            &MongoDbModule,
            27017,
            Duration::from_secs(30),
            &[],
            Path::new("in"),
            Path::new("out"),
        );
        assert_eq!(
            built.args,
            strings(&["mongodb", "-p", "27017", "-t", "30s", "-f", "in", "-o", "out"])
        );
    }
}
