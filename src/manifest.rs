//! Manifest loading and parsing.
//!
//! The manifest ("Rackfile") declares one directive per line in `key: value`
//! form. A handful of keys configure the engine (`workdir`, `observe`,
//! `ignore`, `formation`, `baseport`); every other key declares a process
//! type whose value is a shell command, optionally prefixed with
//! `waitfor=`/`restart=`/`signal=`/`timeout=` tokens.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// How a process reacts to exits and rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartMode {
    /// Restarted on every new generation; restarted on exit within one.
    OnBuild,
    /// Restarted only when it exits non-zero.
    OnFailure,
    /// Restarted whenever it terminates; started once across generations.
    Loop,
    /// Started once, never restarted.
    Temporary,
    /// Run once per generation.
    #[default]
    Never,
}

impl RestartMode {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "onbuild" | "always" | "yes" | "true" | "1" | "build" => Self::OnBuild,
            "fail" | "failure" | "onfail" | "onfailure" | "on-failure" | "on_failure" => {
                Self::OnFailure
            }
            "temporary" | "temp" | "tmp" | "start-once" => Self::Temporary,
            "loop" => Self::Loop,
            _ => Self::Never,
        }
    }

    fn token(&self) -> Option<&'static str> {
        match self {
            Self::OnBuild => Some("onbuild"),
            Self::OnFailure => Some("fail"),
            Self::Temporary => Some("temporary"),
            Self::Loop => Some("loop"),
            Self::Never => None,
        }
    }
}

/// Signal sent to a process group on cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopSignal {
    Term,
    #[default]
    Kill,
}

impl StopSignal {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "sigterm" | "term" | "15" => Self::Term,
            _ => Self::Kill,
        }
    }

    fn token(&self) -> Option<&'static str> {
        match self {
            Self::Term => Some("term"),
            Self::Kill => None,
        }
    }
}

/// One declared process type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessType {
    /// Process type name. A `build` prefix marks a build step.
    pub name: String,
    /// Shell command, run as `sh -c <cmd>`.
    pub cmd: String,
    /// `host:port` target or process-type name probed before start.
    pub wait_for: Option<String>,
    pub restart: RestartMode,
    pub signal: StopSignal,
    /// Grace period between the stop signal and the forced kill.
    pub timeout: Duration,
}

impl ProcessType {
    pub fn is_build(&self) -> bool {
        self.name.starts_with("build")
    }
}

/// Parsed manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifest {
    pub workdir: String,
    pub observables: Vec<String>,
    pub skip_dirs: Vec<String>,
    pub formation: BTreeMap<String, usize>,
    pub base_port: u16,
    pub processes: Vec<ProcessType>,
}

impl Manifest {
    /// Parses the textual manifest form.
    pub fn parse(input: &str) -> Result<Manifest> {
        let mut manifest = Manifest::default();
        for raw in input.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key.to_lowercase().as_str() {
                "workdir" => manifest.workdir = expand_env(value),
                "observe" | "watch" => {
                    manifest.observables =
                        value.split_whitespace().map(str::to_string).collect();
                }
                "ignore" => {
                    manifest.skip_dirs =
                        value.split_whitespace().map(str::to_string).collect();
                }
                "formation" => {
                    for entry in value.split_whitespace() {
                        let (name, count) = entry
                            .split_once(':')
                            .or_else(|| entry.split_once('='))
                            .unwrap_or((entry, ""));
                        let name = name.trim();
                        if name.is_empty() {
                            continue;
                        }
                        let count = count.trim().parse::<usize>().unwrap_or(1);
                        manifest.formation.insert(name.to_string(), count);
                    }
                }
                "baseport" => {
                    let port: u32 = value
                        .parse()
                        .with_context(|| format!("invalid base port {value:?}"))?;
                    if !(1..=65535).contains(&port) {
                        bail!("base port {port} out of range");
                    }
                    manifest.base_port = port as u16;
                }
                _ => {
                    let mut proc = ProcessType {
                        name: key.to_string(),
                        cmd: String::new(),
                        wait_for: None,
                        restart: RestartMode::default(),
                        signal: StopSignal::default(),
                        timeout: Duration::ZERO,
                    };
                    let mut command = Vec::new();
                    for part in value.split_whitespace() {
                        if let Some(target) = part.strip_prefix("waitfor=") {
                            proc.wait_for = Some(target.to_string());
                        } else if let Some(mode) = part.strip_prefix("restart=") {
                            proc.restart = RestartMode::parse(mode);
                        } else if let Some(signal) = part.strip_prefix("signal=") {
                            proc.signal = StopSignal::parse(signal);
                        } else if let Some(timeout) = part.strip_prefix("timeout=") {
                            proc.timeout = parse_duration(timeout).with_context(|| {
                                format!("invalid timeout for process {:?}", proc.name)
                            })?;
                        } else {
                            command.push(part);
                        }
                    }
                    proc.cmd = command.join(" ");
                    manifest.processes.push(proc);
                }
            }
        }
        Ok(manifest)
    }

    /// Serializes the manifest back to its directive form. Parsing the output
    /// yields a semantically identical manifest.
    pub fn to_procfile(&self) -> String {
        let mut out = String::new();
        if !self.workdir.is_empty() {
            out.push_str(&format!("workdir: {}\n", self.workdir));
        }
        if !self.observables.is_empty() {
            out.push_str(&format!("observe: {}\n", self.observables.join(" ")));
        }
        if !self.skip_dirs.is_empty() {
            out.push_str(&format!("ignore: {}\n", self.skip_dirs.join(" ")));
        }
        if !self.formation.is_empty() {
            let entries: Vec<String> = self
                .formation
                .iter()
                .map(|(name, count)| format!("{name}:{count}"))
                .collect();
            out.push_str(&format!("formation: {}\n", entries.join(" ")));
        }
        if self.base_port > 0 {
            out.push_str(&format!("baseport: {}\n", self.base_port));
        }
        for proc in &self.processes {
            let mut tokens = Vec::new();
            if let Some(target) = &proc.wait_for {
                tokens.push(format!("waitfor={target}"));
            }
            if let Some(mode) = proc.restart.token() {
                tokens.push(format!("restart={mode}"));
            }
            if let Some(signal) = proc.signal.token() {
                tokens.push(format!("signal={signal}"));
            }
            if !proc.timeout.is_zero() {
                tokens.push(format!("timeout={}", format_duration(proc.timeout)));
            }
            tokens.push(proc.cmd.clone());
            out.push_str(&format!("{}: {}\n", proc.name, tokens.join(" ")));
        }
        out
    }
}

/// Parses a duration of the form `<integer><ns|us|ms|s|m|h>`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .with_context(|| format!("missing unit in duration {s:?}"))?;
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration {s:?}"))?;
    let duration = match unit {
        "ns" => Duration::from_nanos(value),
        "us" => Duration::from_micros(value),
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        _ => bail!("unknown duration unit {unit:?}"),
    };
    Ok(duration)
}

fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    for (unit, factor) in [
        ("h", 3_600_000_000_000),
        ("m", 60_000_000_000),
        ("s", 1_000_000_000),
        ("ms", 1_000_000),
        ("us", 1_000),
    ] {
        if nanos > 0 && nanos % factor == 0 {
            return format!("{}{}", nanos / factor, unit);
        }
    }
    format!("{nanos}ns")
}

// Expands `$NAME` and `${NAME}` references from the ambient environment.
// Unset variables expand to the empty string.
fn expand_env(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            while let Some(&c) = chars.peek() {
                chars.next();
                if c == '}' {
                    break;
                }
                name.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
        }
        if name.is_empty() {
            out.push('$');
            continue;
        }
        if let Ok(value) = std::env::var(&name) {
            out.push_str(&value);
        }
    }
    out
}
