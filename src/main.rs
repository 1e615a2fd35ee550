//! devrack: a manifest-driven development process orchestrator.
//!
//! Reads a Rackfile, watches the working directory, re-runs build steps on
//! change, and supervises the declared long-running processes. A discovery
//! HTTP endpoint exposes state and a merged log stream.

mod ansi;
mod builds;
mod engine;
mod envfile;
mod launch;
mod logmux;
mod manifest;
mod pattern;
mod probe;
mod state;
mod supervise;
mod watch;
mod web;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, EngineOptions};
use crate::logmux::LogMessage;
use crate::manifest::{Manifest, ProcessType};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(name = "devrack", version, about = "Manifest-driven development process orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Manifest file to run.
    #[arg(default_value = "Rackfile")]
    file: PathBuf,
    /// Base IP port used to compute each instance's $PORT (0 disables).
    #[arg(long, default_value_t = 5000)]
    port: u16,
    /// Service discovery bind address (empty disables).
    #[arg(long = "service-discovery", default_value = "localhost:64000")]
    service_discovery: String,
    /// Formation overrides, format: "name:count name2:count".
    #[arg(long)]
    formation: Option<String>,
    /// Environment file loaded for all processes.
    #[arg(long = "env-file", default_value = ".env")]
    env_file: PathBuf,
    /// Space-separated process types that should not run.
    #[arg(long)]
    skip: Option<String>,
    /// Space-separated process types that alone should run.
    #[arg(long)]
    only: Option<String>,
    /// Space-separated process types exempt from --skip.
    #[arg(long)]
    optional: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Follow the merged log stream of a running devrack.
    Logs {
        /// Substring filter applied to process names and lines.
        #[arg(long)]
        filter: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("DEVRACK_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Some(Commands::Logs { filter }) = cli.command {
        return tail_logs(&cli.service_discovery, filter).await;
    }

    let raw = std::fs::read_to_string(&cli.file)
        .with_context(|| format!("cannot read manifest {}", cli.file.display()))?;
    let mut manifest = Manifest::parse(&raw)
        .with_context(|| format!("cannot parse manifest {}", cli.file.display()))?;

    if let Some(overrides) = &cli.formation {
        apply_formation(&mut manifest, overrides);
    }
    if let Some(skip) = &cli.skip {
        manifest.processes = filter_skipped(
            manifest.processes,
            skip,
            cli.optional.as_deref().unwrap_or(""),
        );
    } else if let Some(only) = &cli.only {
        manifest.processes = filter_only(manifest.processes, only);
    }

    let base_env = match std::fs::read_to_string(&cli.env_file) {
        Ok(contents) => envfile::parse_env_file(&contents),
        Err(_) => Vec::new(),
    };

    let options = EngineOptions {
        base_port: cli.port,
        base_env,
        discovery_addr: (!cli.service_discovery.is_empty())
            .then(|| cli.service_discovery.clone()),
        console: None,
    };
    let engine = Engine::new(manifest, options)?;

    let root = CancellationToken::new();
    tokio::spawn({
        let root = root.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
                root.cancel();
            }
        }
    });

    engine.start(root).await
}

// Formation overrides accept the same entry form as the manifest directive.
fn apply_formation(manifest: &mut Manifest, overrides: &str) {
    for entry in overrides.split_whitespace() {
        let (name, count) = entry
            .split_once(':')
            .or_else(|| entry.split_once('='))
            .unwrap_or((entry, ""));
        if name.is_empty() {
            continue;
        }
        let count = count.trim().parse::<usize>().unwrap_or(1);
        manifest.formation.insert(name.to_string(), count);
    }
}

fn filter_skipped(processes: Vec<ProcessType>, skip: &str, optional: &str) -> Vec<ProcessType> {
    let skipped: Vec<&str> = skip.split_whitespace().collect();
    let exempt: Vec<&str> = optional.split_whitespace().collect();
    processes
        .into_iter()
        .filter(|proc| {
            let name = proc.name.as_str();
            if exempt.contains(&name) {
                return true;
            }
            if skipped.contains(&name) {
                println!("skipping {name}");
                return false;
            }
            true
        })
        .collect()
}

fn filter_only(processes: Vec<ProcessType>, only: &str) -> Vec<ProcessType> {
    let kept: Vec<&str> = only.split_whitespace().collect();
    processes
        .into_iter()
        .filter(|proc| kept.contains(&proc.name.as_str()))
        .collect()
}

/// Connects to a running engine's `/logs` stream and prints every message in
/// the padded console form. Reconnects until interrupted.
async fn tail_logs(addr: &str, filter: Option<String>) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/logs");
    info!("connecting to {url}");
    loop {
        let mut request = client.get(&url);
        if let Some(filter) = &filter {
            request = request.query(&[("filter", filter)]);
        }
        match request.send().await {
            Ok(response) => {
                if let Err(err) = follow(response).await {
                    warn!("log stream interrupted: {err}");
                }
            }
            Err(err) => warn!("cannot dial log endpoint: {err}"),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn follow(response: reqwest::Response) -> Result<()> {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim_end().strip_prefix("data: ") else {
                continue;
            };
            match serde_json::from_str::<LogMessage>(data) {
                Ok(msg) => println!("{}: {}", msg.padded_name, msg.line),
                Err(err) => warn!("decode: {err}"),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{RestartMode, StopSignal};

    fn proc(name: &str) -> ProcessType {
        ProcessType {
            name: name.to_string(),
            cmd: "./run".to_string(),
            wait_for: None,
            restart: RestartMode::Never,
            signal: StopSignal::Kill,
            timeout: Duration::ZERO,
        }
    }

    #[test]
    fn formation_overrides_merge_into_manifest() {
        let mut manifest = Manifest::parse("web: ./server\nformation: web:1\n").unwrap();
        apply_formation(&mut manifest, "web:3 worker=2 lone");
        assert_eq!(manifest.formation.get("web"), Some(&3));
        assert_eq!(manifest.formation.get("worker"), Some(&2));
        assert_eq!(manifest.formation.get("lone"), Some(&1));
    }

    #[test]
    fn skip_removes_named_processes() {
        let processes = vec![proc("web"), proc("worker"), proc("db")];
        let kept = filter_skipped(processes, "worker db", "");
        let names: Vec<&str> = kept.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["web"]);
    }

    #[test]
    fn optional_exempts_from_skip() {
        let processes = vec![proc("web"), proc("worker")];
        let kept = filter_skipped(processes, "web worker", "worker");
        let names: Vec<&str> = kept.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["worker"]);
    }

    #[test]
    fn only_keeps_named_processes() {
        let processes = vec![proc("web"), proc("worker"), proc("db")];
        let kept = filter_only(processes, "web db");
        let names: Vec<&str> = kept.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["web", "db"]);
    }
}
