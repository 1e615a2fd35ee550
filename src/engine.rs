//! Engine configuration, validation, and the orchestration loop.
//!
//! The engine owns the declared process types and the shared runtime state.
//! Its loop turns watcher emissions into build cycles and generation swaps:
//! a change whose content hash is new runs every build step; when all builds
//! succeed and no further change is queued, the previous generation is
//! cancelled and a fresh permanent tree is started. The ephemeral tree is
//! started once, on the first successful cycle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::builds;
use crate::logmux::{ConsoleSink, LogMux};
use crate::manifest::{Manifest, ProcessType};
use crate::state::{discovery_env_var, normalize_env_var, ServiceState};
use crate::supervise::{self, Instance};
use crate::watch::{self, WatcherConfig};
use crate::web;

/// Engine knobs supplied by the front-end on top of the manifest.
pub struct EngineOptions {
    /// Base port for `$PORT` assignment; a manifest `baseport` directive
    /// takes precedence. 0 disables port assignment.
    pub base_port: u16,
    /// `KEY=VALUE` entries merged on top of the ambient environment.
    pub base_env: Vec<String>,
    /// Discovery/log server bind address; `None` disables it.
    pub discovery_addr: Option<String>,
    /// Console writer for merged child output; defaults to stdout. The
    /// output-filter collaborator swaps this before the engine starts.
    pub console: Option<ConsoleSink>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            base_port: 0,
            base_env: Vec::new(),
            discovery_addr: None,
            console: None,
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workdir", &self.workdir)
            .field("observables", &self.observables)
            .field("skip_dirs", &self.skip_dirs)
            .field("processes", &self.processes)
            .field("formation", &self.formation)
            .field("base_port", &self.base_port)
            .field("base_env", &self.base_env)
            .field("discovery_addr", &self.discovery_addr)
            .field("static_discovery", &self.static_discovery)
            .finish()
    }
}

pub struct Engine {
    workdir: PathBuf,
    observables: Vec<String>,
    skip_dirs: Vec<String>,
    processes: Vec<ProcessType>,
    formation: BTreeMap<String, usize>,
    base_port: u16,
    base_env: Vec<String>,
    discovery_addr: Option<String>,
    static_discovery: Vec<String>,
    pub(crate) state: ServiceState,
    pub(crate) mux: LogMux,
}

impl Engine {
    /// Validates the configuration and builds a ready-to-start engine.
    /// Rejects duplicate normalized instance names, sorts negative observe
    /// patterns ahead of positive ones, resolves the workdir, and computes
    /// the log padding width and the static discovery environment.
    pub fn new(manifest: Manifest, opts: EngineOptions) -> Result<Engine> {
        let workdir = if manifest.workdir.is_empty() {
            std::env::current_dir().context("cannot resolve current directory")?
        } else {
            let dir = PathBuf::from(&manifest.workdir);
            if dir.is_absolute() {
                dir
            } else {
                std::env::current_dir()
                    .context("cannot resolve current directory")?
                    .join(dir)
            }
        };
        std::fs::metadata(&workdir)
            .with_context(|| format!("cannot stat workdir {}", workdir.display()))?;

        let mut observables = manifest.observables;
        observables.sort_by_key(|pattern| !pattern.starts_with('!'));

        let base_port = if manifest.base_port > 0 {
            manifest.base_port
        } else {
            opts.base_port
        };

        let formation = manifest.formation;
        let formation_count =
            |name: &str| formation.get(name).copied().unwrap_or(1);

        let mut seen = HashSet::new();
        let mut longest = 0;
        for proc in &manifest.processes {
            let count = formation_count(&proc.name).max(1);
            for i in 0..count {
                let instance = format!("{}.{}", proc.name, i);
                if !seen.insert(normalize_env_var(&instance)) {
                    bail!("non unique process type name: {}", proc.name);
                }
                if !proc.is_build() {
                    longest = longest.max(instance.len());
                }
            }
            if proc.is_build() {
                longest = longest.max(proc.name.len());
            }
        }
        let pad_width = longest + 1;

        let mut static_discovery = Vec::new();
        if base_port > 0 {
            for (j, proc) in manifest.processes.iter().enumerate() {
                if proc.is_build() {
                    continue;
                }
                for i in 0..formation_count(&proc.name) {
                    if let Some(port) = assigned_port(base_port, j, i) {
                        static_discovery.push(format!(
                            "{}=localhost:{}",
                            discovery_env_var(&proc.name, i),
                            port
                        ));
                    }
                }
            }
        }

        let sink = opts
            .console
            .unwrap_or_else(|| Box::new(std::io::stdout()));

        Ok(Engine {
            workdir,
            observables,
            skip_dirs: manifest.skip_dirs,
            processes: manifest.processes,
            formation,
            base_port,
            base_env: opts.base_env,
            discovery_addr: opts.discovery_addr.filter(|addr| !addr.is_empty()),
            static_discovery,
            state: ServiceState::new(),
            mux: LogMux::new(pad_width, sink),
        })
    }

    pub(crate) fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub(crate) fn processes(&self) -> &[ProcessType] {
        &self.processes
    }

    pub(crate) fn discovery_addr(&self) -> Option<&str> {
        self.discovery_addr.as_deref()
    }

    pub(crate) fn formation_count(&self, name: &str) -> usize {
        self.formation.get(name).copied().unwrap_or(1)
    }

    /// Enumerates all non-build instances with their assigned ports.
    pub(crate) fn instances(&self) -> Vec<Instance> {
        let mut out = Vec::new();
        for (j, proc) in self.processes.iter().enumerate() {
            if proc.is_build() {
                continue;
            }
            for i in 0..self.formation_count(&proc.name) {
                out.push(Instance {
                    proc: proc.clone(),
                    name: format!("{}.{}", proc.name, i),
                    index: i,
                    port: assigned_port(self.base_port, j, i),
                });
            }
        }
        out
    }

    /// Environment injected into a child on top of the ambient one.
    pub(crate) fn child_env(
        &self,
        instance_name: &str,
        port: Option<u16>,
        changed: &str,
    ) -> Vec<(String, String)> {
        let mut env = Vec::new();
        for entry in &self.base_env {
            if let Some((key, value)) = entry.split_once('=') {
                env.push((key.to_string(), value.to_string()));
            }
        }
        env.push(("PS".to_string(), instance_name.to_string()));
        if let Some(port) = port {
            env.push(("PORT".to_string(), port.to_string()));
        }
        if let Some(addr) = &self.discovery_addr {
            env.push(("DISCOVERY".to_string(), addr.clone()));
        }
        env.push(("CHANGED_FILENAME".to_string(), changed.to_string()));
        for entry in &self.static_discovery {
            if let Some((key, value)) = entry.split_once('=') {
                env.push((key.to_string(), value.to_string()));
            }
        }
        env
    }

    /// Runs the engine until the root token is cancelled. Only configuration
    /// problems surface as errors; build and child failures are handled
    /// internally.
    pub async fn start(self, root: CancellationToken) -> Result<()> {
        let engine = Arc::new(self);

        let broadcaster = tokio::spawn({
            let engine = engine.clone();
            let root = root.clone();
            async move { engine.mux.run_broadcast(root).await }
        });

        let web_server = engine.discovery_addr.as_ref().map(|_| {
            tokio::spawn({
                let engine = engine.clone();
                let root = root.clone();
                async move {
                    if let Err(err) = web::serve(engine, root).await {
                        error!("service discovery server failed: {err:#}");
                    }
                }
            })
        });

        let mut updates = watch::watch(
            root.clone(),
            WatcherConfig {
                workdir: engine.workdir.clone(),
                observables: engine.observables.clone(),
                skip_dirs: engine.skip_dirs.clone(),
            },
        )
        .await;

        let mut file_hashes: HashMap<String, String> = HashMap::new();
        let mut generation: u64 = 0;
        let mut gen_token = root.child_token();
        let mut gen_tasks: JoinSet<()> = JoinSet::new();
        let mut ephemeral_tasks: JoinSet<()> = JoinSet::new();

        loop {
            let changed = tokio::select! {
                _ = root.cancelled() => break,
                changed = updates.recv() => changed,
            };
            let Some(path) = changed else {
                // The watcher only closes the stream on root cancellation.
                break;
            };

            let new_hash = hash_file(&path);
            if let Some(old_hash) = file_hashes.get(&path) {
                if *old_hash == new_hash && !updates.is_empty() {
                    info!("{path} didn't change, skipping");
                    continue;
                }
            }
            file_hashes.insert(path.clone(), new_hash);

            if !builds::run_builds(&engine, &root, &path).await {
                error!("error during build, halted");
                continue;
            }

            let pending = updates.len();
            if pending > 0 {
                info!("builds pending before application start: {pending}");
                continue;
            }

            gen_token.cancel();
            gen_token = root.child_token();
            if generation == 0 {
                supervise::start_ephemeral(&engine, &root, &path, &mut ephemeral_tasks);
            }
            while gen_tasks.try_join_next().is_some() {}
            gen_tasks.spawn({
                let engine = engine.clone();
                let token = gen_token.clone();
                let changed = path.clone();
                async move { supervise::run_generation(engine, token, changed).await }
            });
            generation += 1;
        }

        gen_token.cancel();
        while gen_tasks.join_next().await.is_some() {}
        while ephemeral_tasks.join_next().await.is_some() {}
        let _ = broadcaster.await;
        if let Some(server) = web_server {
            let _ = server.await;
        }
        Ok(())
    }
}

fn assigned_port(base_port: u16, descriptor_index: usize, instance_index: usize) -> Option<u16> {
    if base_port == 0 {
        return None;
    }
    u16::try_from(base_port as usize + descriptor_index * 100 + instance_index).ok()
}

// Content hash used to suppress rebuilds for watcher events on unchanged
// files. Unreadable paths (including the initial empty trigger) hash empty.
fn hash_file(path: &str) -> String {
    match std::fs::read(path) {
        Ok(contents) => blake3::hash(&contents).to_hex().to_string(),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::RestartMode;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn options() -> EngineOptions {
        EngineOptions {
            console: Some(Box::new(std::io::sink())),
            ..EngineOptions::default()
        }
    }

    fn parse_in(dir: &TempDir, manifest: &str) -> Manifest {
        Manifest::parse(&format!("workdir: {}\n{manifest}", dir.path().display())).unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // Rewrites a watched file with new content and a visibly newer mtime so
    // a single poll observes the transition.
    fn trigger_change(path: &Path, contents: &str) {
        std::fs::write(path, contents).unwrap();
        let old = std::fs::metadata(path).unwrap().modified().unwrap();
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(old + Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let manifest = parse_in(&dir, "web: ./a\nweb: ./b\n");
        let err = Engine::new(manifest, options()).unwrap_err();
        assert!(err.to_string().contains("non unique process type name"));
    }

    #[test]
    fn normalization_collisions_are_rejected() {
        let dir = TempDir::new().unwrap();
        let manifest = parse_in(&dir, "web-a: ./a\nweb_a: ./b\n");
        assert!(Engine::new(manifest, options()).is_err());
    }

    #[test]
    fn missing_workdir_is_rejected() {
        let manifest = Manifest::parse("workdir: /nonexistent-devrack\nweb: ./a\n").unwrap();
        assert!(Engine::new(manifest, options()).is_err());
    }

    #[test]
    fn observables_sort_negatives_first_stably() {
        let dir = TempDir::new().unwrap();
        let manifest = parse_in(&dir, "observe: *.go !*_test.go *.js !*.min.js\nweb: ./a\n");
        let engine = Engine::new(manifest, options()).unwrap();
        assert_eq!(
            engine.observables,
            vec!["!*_test.go", "!*.min.js", "*.go", "*.js"]
        );
    }

    #[test]
    fn ports_follow_descriptor_and_instance_indexes() {
        let dir = TempDir::new().unwrap();
        let manifest = parse_in(
            &dir,
            "baseport: 5000\nbuild-a: true\nweb: restart=onbuild ./server\napi: ./api\nformation: web:2\n",
        );
        let engine = Engine::new(manifest, options()).unwrap();
        let instances = engine.instances();
        let port_of = |name: &str| {
            instances
                .iter()
                .find(|inst| inst.name == name)
                .and_then(|inst| inst.port)
        };
        // build-a holds descriptor index 0; web is 1, api is 2.
        assert_eq!(port_of("web.0"), Some(5100));
        assert_eq!(port_of("web.1"), Some(5101));
        assert_eq!(port_of("api.0"), Some(5200));
    }

    #[test]
    fn formation_zero_yields_no_instances() {
        let dir = TempDir::new().unwrap();
        let manifest = parse_in(&dir, "web: ./server\nformation: web:0\n");
        let engine = Engine::new(manifest, options()).unwrap();
        assert!(engine.instances().is_empty());
    }

    #[test]
    fn static_discovery_covers_all_instances() {
        let dir = TempDir::new().unwrap();
        let manifest = parse_in(
            &dir,
            "baseport: 5000\nweb: ./server\nformation: web:2\n",
        );
        let engine = Engine::new(manifest, options()).unwrap();
        assert_eq!(
            engine.static_discovery,
            vec!["WEB_0_PORT=localhost:5000", "WEB_1_PORT=localhost:5001"]
        );
    }

    #[test]
    fn child_env_injects_contract_variables() {
        let dir = TempDir::new().unwrap();
        let manifest = parse_in(&dir, "baseport: 5000\nweb: ./server\n");
        let engine = Engine::new(
            manifest,
            EngineOptions {
                base_env: vec!["FOO=bar".to_string()],
                discovery_addr: Some("localhost:64000".to_string()),
                ..options()
            },
        )
        .unwrap();
        let env = engine.child_env("web.0", Some(5000), "main.go");
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("FOO"), Some("bar"));
        assert_eq!(get("PS"), Some("web.0"));
        assert_eq!(get("PORT"), Some("5000"));
        assert_eq!(get("DISCOVERY"), Some("localhost:64000"));
        assert_eq!(get("CHANGED_FILENAME"), Some("main.go"));
        assert_eq!(get("WEB_0_PORT"), Some("localhost:5000"));
    }

    #[test]
    fn restart_default_is_never() {
        let dir = TempDir::new().unwrap();
        let manifest = parse_in(&dir, "web: ./server\n");
        let engine = Engine::new(manifest, options()).unwrap();
        assert_eq!(engine.processes()[0].restart, RestartMode::Never);
    }

    #[tokio::test]
    async fn initial_cycle_builds_and_starts_processes() {
        let dir = TempDir::new().unwrap();
        let manifest = parse_in(
            &dir,
            "observe: *.trigger\nbaseport: 5000\nbuild-a: echo building\nweb: restart=onbuild env > env-$PS; sleep 30\nformation: web:2\n",
        );
        let engine = Engine::new(manifest, options()).unwrap();
        let state = engine.state.clone();
        let root = CancellationToken::new();
        let run = tokio::spawn(engine.start(root.clone()));

        let web0 = dir.path().join("env-web.0");
        let web1 = dir.path().join("env-web.1");
        wait_until("build and both web instances", || {
            state.get("BUILD_BUILD_A").as_deref() == Some("done")
                && web0.exists()
                && web1.exists()
        })
        .await;

        let env0 = std::fs::read_to_string(&web0).unwrap();
        assert!(env0.contains("PS=web.0"));
        assert!(env0.contains("PORT=5100"));
        assert!(env0.contains("CHANGED_FILENAME=\n"));
        assert!(env0.contains("WEB_1_PORT=localhost:5101"));
        let env1 = std::fs::read_to_string(&web1).unwrap();
        assert!(env1.contains("PORT=5101"));
        assert_eq!(state.get("WEB_0_PORT").as_deref(), Some("localhost:5100"));

        root.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rebuild_cancels_previous_generation() {
        let dir = TempDir::new().unwrap();
        let watched = dir.path().join("main.trigger");
        std::fs::write(&watched, "v1").unwrap();
        let manifest = parse_in(
            &dir,
            "observe: *.trigger\nweb: restart=onbuild echo $$ >> pids; sleep 30\n",
        );
        let engine = Engine::new(manifest, options()).unwrap();
        let root = CancellationToken::new();
        let run = tokio::spawn(engine.start(root.clone()));

        let pids = dir.path().join("pids");
        wait_until("first generation", || {
            std::fs::read_to_string(&pids)
                .map(|s| s.lines().count() >= 1)
                .unwrap_or(false)
        })
        .await;

        trigger_change(&watched, "v2");
        wait_until("second generation", || {
            std::fs::read_to_string(&pids)
                .map(|s| s.lines().count() >= 2)
                .unwrap_or(false)
        })
        .await;

        let recorded = std::fs::read_to_string(&pids).unwrap();
        let mut pids_seen = recorded.lines();
        let first: i32 = pids_seen.next().unwrap().trim().parse().unwrap();
        let second: i32 = pids_seen.next().unwrap().trim().parse().unwrap();
        assert_ne!(first, second);
        // The first shell must be gone: signal 0 probes for existence.
        let alive = unsafe { libc::kill(first, 0) } == 0;
        assert!(!alive, "previous generation pid {first} still alive");

        root.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failing_build_leaves_previous_generation_running() {
        let dir = TempDir::new().unwrap();
        let watched = dir.path().join("main.trigger");
        std::fs::write(&watched, "v1").unwrap();
        let manifest = parse_in(
            &dir,
            "observe: *.trigger\nbuild-x: if [ -f flag ]; then echo broken >&2; exit 1; else touch flag; fi\nweb: restart=onbuild echo $$ >> pids; sleep 30\n",
        );
        let engine = Engine::new(manifest, options()).unwrap();
        let state = engine.state.clone();
        let root = CancellationToken::new();
        let run = tokio::spawn(engine.start(root.clone()));

        let pids = dir.path().join("pids");
        wait_until("first generation", || {
            state.get("BUILD_BUILD_X").as_deref() == Some("done") && pids.exists()
        })
        .await;

        trigger_change(&watched, "v2");
        wait_until("failed rebuild", || {
            state.get("BUILD_BUILD_X").as_deref() == Some("errored")
        })
        .await;

        assert!(state.get("ERROR_BUILD_X").unwrap().contains("broken"));
        // The generation was not swapped: still exactly one pid, and alive.
        let recorded = std::fs::read_to_string(&pids).unwrap();
        assert_eq!(recorded.lines().count(), 1);
        let pid: i32 = recorded.lines().next().unwrap().trim().parse().unwrap();
        assert_eq!(unsafe { libc::kill(pid, 0) }, 0, "web.0 must still run");

        root.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn loop_process_survives_rebuild() {
        let dir = TempDir::new().unwrap();
        let watched = dir.path().join("main.trigger");
        std::fs::write(&watched, "v1").unwrap();
        let manifest = parse_in(
            &dir,
            "observe: *.trigger\nw: restart=loop echo $$ >> loop-pids; sleep 30\nweb: restart=onbuild echo $$ >> web-pids; sleep 30\n",
        );
        let engine = Engine::new(manifest, options()).unwrap();
        let root = CancellationToken::new();
        let run = tokio::spawn(engine.start(root.clone()));

        let loop_pids = dir.path().join("loop-pids");
        let web_pids = dir.path().join("web-pids");
        wait_until("first generation", || loop_pids.exists() && web_pids.exists()).await;

        trigger_change(&watched, "v2");
        wait_until("second web generation", || {
            std::fs::read_to_string(&web_pids)
                .map(|s| s.lines().count() >= 2)
                .unwrap_or(false)
        })
        .await;

        let loops = std::fs::read_to_string(&loop_pids).unwrap();
        assert_eq!(loops.lines().count(), 1, "loop process must not restart");

        root.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn root_cancel_returns_within_bounded_time() {
        let dir = TempDir::new().unwrap();
        let manifest = parse_in(
            &dir,
            "web: restart=onbuild touch started; sleep 30\n",
        );
        let engine = Engine::new(manifest, options()).unwrap();
        let root = CancellationToken::new();
        let run = tokio::spawn(engine.start(root.clone()));
        let started = dir.path().join("started");
        wait_until("web start", || started.exists()).await;
        let begun = Instant::now();
        root.cancel();
        run.await.unwrap().unwrap();
        assert!(begun.elapsed() < Duration::from_secs(5));
    }
}
