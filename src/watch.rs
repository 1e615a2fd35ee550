//! Working-directory change detection.
//!
//! Produces a lazy stream of changed file paths. One initial empty emission
//! triggers the first build/run. Two strategies: when the workdir is a git
//! checkout, `git status --porcelain=v1` is polled; otherwise the tree is
//! scanned recursively. Both track modification times and only emit on mtime
//! transitions. Polls back off while the tree is quiet and reset to the base
//! interval after an emission.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::pattern;

const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_STEP: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Watcher inputs, cloned out of the engine configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub workdir: PathBuf,
    /// Sorted so that negative (`!`-prefixed) patterns come first.
    pub observables: Vec<String>,
    pub skip_dirs: Vec<String>,
}

/// Starts the watcher and returns the change stream. The stream is
/// single-consumer, may repeat paths, and ends when `root` is cancelled.
/// Producers drop events when the buffer is full; the mtime map catches the
/// change again on the next poll.
pub async fn watch(root: CancellationToken, cfg: WatcherConfig) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(String::new());

    let git = git_available(&cfg.workdir).await;
    tokio::spawn(async move {
        let mut poller = Poller {
            cfg,
            mtimes: HashMap::new(),
        };
        let mut delay = BACKOFF_BASE;
        loop {
            tokio::select! {
                _ = root.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let changed = if git {
                poller.poll_git().await
            } else {
                poller.poll_scan()
            };
            if changed.is_empty() {
                delay = (delay + BACKOFF_STEP).min(BACKOFF_MAX);
            } else {
                for path in changed {
                    let _ = tx.try_send(path);
                }
                delay = BACKOFF_BASE;
            }
        }
    });
    rx
}

async fn git_available(workdir: &Path) -> bool {
    Command::new("git")
        .arg("-C")
        .arg(workdir)
        .arg("status")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

struct Poller {
    cfg: WatcherConfig,
    mtimes: HashMap<PathBuf, SystemTime>,
}

impl Poller {
    // Records the file's mtime; returns the path when a stored mtime changed.
    // A file seen for the first time is tracked silently.
    fn observe(&mut self, path: PathBuf) -> Option<String> {
        let mtime = std::fs::metadata(&path).ok()?.modified().ok()?;
        match self.mtimes.insert(path.clone(), mtime) {
            Some(previous) if previous != mtime => Some(path.to_string_lossy().into_owned()),
            _ => None,
        }
    }

    fn skipped(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        self.cfg.skip_dirs.iter().any(|skip| {
            if skip.is_empty() {
                return false;
            }
            let prefix = self
                .cfg
                .workdir
                .join(skip.trim_start_matches('/'))
                .to_string_lossy()
                .into_owned();
            path.starts_with(&prefix)
        })
    }

    fn observed(&self, path: &str) -> bool {
        is_observed(&self.cfg.observables, path)
    }

    fn poll_scan(&mut self) -> Vec<String> {
        let mut candidates = Vec::new();
        {
            let walker = WalkDir::new(&self.cfg.workdir)
                .into_iter()
                .filter_entry(|entry| !(entry.file_type().is_dir() && self.skipped(entry.path())));
            for entry in walker.flatten() {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.into_path();
                if self.observed(&path.to_string_lossy()) {
                    candidates.push(path);
                }
            }
        }
        let mut changed = Vec::new();
        for path in candidates {
            if let Some(hit) = self.observe(path) {
                changed.push(hit);
            }
        }
        changed
    }

    async fn poll_git(&mut self) -> Vec<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.cfg.workdir)
            .args(["status", "--porcelain=v1"])
            .output()
            .await;
        let Ok(output) = output else {
            return Vec::new();
        };
        if !output.status.success() {
            return Vec::new();
        }
        let mut changed = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if line.len() < 4 {
                continue;
            }
            let mut listed = &line[3..];
            if let Some((_, renamed)) = listed.split_once(" -> ") {
                listed = renamed;
            }
            let listed = listed.trim_matches('"');
            let path = self.cfg.workdir.join(listed);
            if self.skipped(&path) || !self.observed(&path.to_string_lossy()) {
                continue;
            }
            if let Some(hit) = self.observe(path) {
                changed.push(hit);
            }
        }
        changed
    }
}

/// A path is observed when it matches at least one positive pattern and no
/// negative one. Negative patterns are sorted first, so the first negative
/// hit wins over any later positive.
pub fn is_observed(observables: &[String], path: &str) -> bool {
    let mut matched = false;
    for observable in observables {
        if let Some(negated) = observable.strip_prefix('!') {
            if pattern::matches(negated, path) {
                return false;
            }
        } else if !matched && pattern::matches(observable, path) {
            matched = true;
        }
    }
    matched
}
