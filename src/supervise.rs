//! Process supervision.
//!
//! Two disjoint trees host the non-build processes. The permanent tree is
//! rebuilt every generation and holds ON_BUILD and NEVER processes; when an
//! ON_BUILD member exits, all siblings are halted and the tree restarts them
//! together. The ephemeral tree is started once per engine lifetime, bound to
//! the root token, and hosts LOOP, TEMPORARY, and ON_FAILURE processes so
//! they survive rebuild cycles.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::launch::{run_command, Launch};
use crate::manifest::{ProcessType, RestartMode};
use crate::probe;
use crate::state::discovery_env_var;

// Pause between one-for-all rounds so a crash-looping member cannot spin the
// supervisor.
const RESTART_PAUSE: Duration = Duration::from_millis(250);

/// One running incarnation of a process type.
#[derive(Debug, Clone)]
pub struct Instance {
    pub proc: ProcessType,
    /// `name.index`, the log prefix and `PS` value.
    pub name: String,
    pub index: usize,
    pub port: Option<u16>,
}

/// Runs one generation of the permanent tree until the generation token is
/// cancelled. ON_BUILD members trigger a one-for-all restart on exit; NEVER
/// members run once and are left alone.
pub async fn run_generation(engine: Arc<Engine>, gen: CancellationToken, changed: String) {
    let members: Vec<Instance> = engine
        .instances()
        .into_iter()
        .filter(|inst| {
            matches!(
                inst.proc.restart,
                RestartMode::OnBuild | RestartMode::Never
            )
        })
        .collect();
    if members.is_empty() {
        return;
    }

    let mut round = 0u32;
    loop {
        let tree = gen.child_token();
        let mut children: JoinSet<RestartMode> = JoinSet::new();
        for inst in &members {
            if inst.proc.restart == RestartMode::Never && round > 0 {
                continue;
            }
            let engine = engine.clone();
            let tree = tree.clone();
            let inst = inst.clone();
            let changed = changed.clone();
            children.spawn(async move {
                run_instance(&engine, &tree, &inst, &changed).await;
                inst.proc.restart
            });
        }
        if children.is_empty() {
            gen.cancelled().await;
            return;
        }

        let mut restart = false;
        while let Some(exited) = children.join_next().await {
            if gen.is_cancelled() {
                continue;
            }
            if matches!(exited, Ok(RestartMode::OnBuild)) && !restart {
                restart = true;
                tree.cancel();
            }
        }
        if gen.is_cancelled() {
            return;
        }
        if !restart {
            // Only NEVER members were left and all of them finished.
            gen.cancelled().await;
            return;
        }
        tokio::select! {
            _ = gen.cancelled() => return,
            _ = tokio::time::sleep(RESTART_PAUSE) => {}
        }
        round += 1;
    }
}

/// Starts the ephemeral tree: LOOP members restart on every exit, TEMPORARY
/// members run once, ON_FAILURE members restart until they exit zero. All of
/// them are bound to the root token and survive generation swaps.
pub fn start_ephemeral(
    engine: &Arc<Engine>,
    root: &CancellationToken,
    changed: &str,
    tasks: &mut JoinSet<()>,
) {
    for inst in engine.instances() {
        let mode = inst.proc.restart;
        if !matches!(
            mode,
            RestartMode::Loop | RestartMode::Temporary | RestartMode::OnFailure
        ) {
            continue;
        }
        let engine = engine.clone();
        let root = root.clone();
        let changed = changed.to_string();
        tasks.spawn(async move {
            loop {
                let ok = run_instance(&engine, &root, &inst, &changed).await;
                let done = match mode {
                    RestartMode::Temporary => true,
                    RestartMode::OnFailure => ok,
                    _ => false,
                };
                if done || root.is_cancelled() {
                    return;
                }
                tokio::select! {
                    _ = root.cancelled() => return,
                    _ = tokio::time::sleep(RESTART_PAUSE) => {}
                }
            }
        });
    }
}

/// Starts a single instance: advertises its address, waits on its readiness
/// target, and runs the command to completion.
pub(crate) async fn run_instance(
    engine: &Engine,
    cancel: &CancellationToken,
    inst: &Instance,
    changed: &str,
) -> bool {
    if let Some(port) = inst.port {
        engine.state.set(
            discovery_env_var(&inst.proc.name, inst.index),
            format!("localhost:{port}"),
        );
    }
    if let Some(target) = &inst.proc.wait_for {
        probe::wait_for(cancel, &engine.state, &engine.mux, &inst.name, target).await;
        if cancel.is_cancelled() {
            return false;
        }
    }
    let launch = Launch {
        name: &inst.name,
        cmd: &inst.proc.cmd,
        workdir: engine.workdir(),
        signal: inst.proc.signal,
        timeout: inst.proc.timeout,
        port: inst.port,
        env: engine.child_env(&inst.name, inst.port, changed),
        capture: None,
    };
    run_command(cancel, launch, &engine.mux).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::manifest::Manifest;
    use std::time::Instant;
    use tempfile::TempDir;

    fn engine_for(dir: &TempDir, manifest: &str) -> Arc<Engine> {
        let manifest =
            Manifest::parse(&format!("workdir: {}\n{manifest}", dir.path().display())).unwrap();
        let opts = EngineOptions {
            console: Some(Box::new(std::io::sink())),
            ..EngineOptions::default()
        };
        Arc::new(Engine::new(manifest, opts).unwrap())
    }

    async fn wait_for_lines(path: &std::path::Path, want: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let lines = std::fs::read_to_string(path)
                .map(|s| s.lines().count())
                .unwrap_or(0);
            if lines >= want || Instant::now() > deadline {
                return lines;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn on_build_member_restarts_after_exit() {
        let dir = TempDir::new().unwrap();
        let engine = engine_for(&dir, "web: restart=onbuild echo run >> runs\n");
        let gen = CancellationToken::new();
        let handle = tokio::spawn(run_generation(engine, gen.clone(), String::new()));
        let runs = wait_for_lines(&dir.path().join("runs"), 2).await;
        assert!(runs >= 2, "expected a one-for-all restart, saw {runs} run(s)");
        gen.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn never_member_runs_once_per_generation() {
        let dir = TempDir::new().unwrap();
        let engine = engine_for(&dir, "task: echo run >> runs\n");
        let gen = CancellationToken::new();
        let handle = tokio::spawn(run_generation(engine, gen.clone(), String::new()));
        wait_for_lines(&dir.path().join("runs"), 1).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        let runs = std::fs::read_to_string(dir.path().join("runs")).unwrap();
        assert_eq!(runs.lines().count(), 1);
        gen.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancelling_generation_stops_members() {
        let dir = TempDir::new().unwrap();
        let engine = engine_for(&dir, "web: restart=onbuild sleep 30\n");
        let gen = CancellationToken::new();
        let handle = tokio::spawn(run_generation(engine, gen.clone(), String::new()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        gen.cancel();
        handle.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn on_failure_member_retries_until_success() {
        let dir = TempDir::new().unwrap();
        let engine = engine_for(
            &dir,
            "job: restart=onfailure echo run >> runs; test -f flag || { touch flag; exit 1; }\n",
        );
        let root = CancellationToken::new();
        let mut tasks = JoinSet::new();
        start_ephemeral(&engine, &root, "", &mut tasks);
        let runs = wait_for_lines(&dir.path().join("runs"), 2).await;
        assert_eq!(runs, 2);
        tokio::time::sleep(Duration::from_millis(300)).await;
        let contents = std::fs::read_to_string(dir.path().join("runs")).unwrap();
        assert_eq!(contents.lines().count(), 2, "must stop once it exits zero");
        root.cancel();
        while tasks.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn temporary_member_runs_exactly_once() {
        let dir = TempDir::new().unwrap();
        let engine = engine_for(&dir, "once: restart=temporary echo run >> runs\n");
        let root = CancellationToken::new();
        let mut tasks = JoinSet::new();
        start_ephemeral(&engine, &root, "", &mut tasks);
        while tasks.join_next().await.is_some() {}
        let contents = std::fs::read_to_string(dir.path().join("runs")).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[tokio::test]
    async fn instances_advertise_their_address() {
        let dir = TempDir::new().unwrap();
        let engine = engine_for(&dir, "baseport: 5000\nweb: restart=onbuild true\n");
        let inst = engine
            .instances()
            .into_iter()
            .find(|inst| inst.name == "web.0")
            .unwrap();
        let cancel = CancellationToken::new();
        run_instance(&engine, &cancel, &inst, "").await;
        assert_eq!(
            engine.state.get("WEB_0_PORT").as_deref(),
            Some("localhost:5000")
        );
    }
}
