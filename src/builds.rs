//! Build stage.
//!
//! Process types whose name starts with `build` run before everything else.
//! All builds of a cycle run concurrently; the stage returns once every one
//! of them finished and reports whether all succeeded. Status and captured
//! output land in the discovery state.

use std::sync::{Arc, PoisonError};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::launch::{capture_buffer, run_command, Launch};
use crate::state::normalize_env_var;

/// Runs every build process type, `formation` copies each, concurrently.
/// `BUILD_<NAME>` tracks `building`/`done`/`errored`; on failure the captured
/// output is stored under `ERROR_<NAME>`.
pub async fn run_builds(engine: &Arc<Engine>, cancel: &CancellationToken, changed: &str) -> bool {
    let mut tasks: JoinSet<bool> = JoinSet::new();
    for proc in engine.processes().iter().filter(|p| p.is_build()) {
        let count = engine.formation_count(&proc.name);
        for _ in 0..count {
            engine
                .state
                .set(status_key(&proc.name), "building".to_string());
            let engine = engine.clone();
            let cancel = cancel.clone();
            let proc = proc.clone();
            let changed = changed.to_string();
            tasks.spawn(async move {
                let capture = capture_buffer();
                let launch = Launch {
                    name: &proc.name,
                    cmd: &proc.cmd,
                    workdir: engine.workdir(),
                    signal: proc.signal,
                    timeout: proc.timeout,
                    port: None,
                    env: engine.child_env(&proc.name, None, &changed),
                    capture: Some(capture.clone()),
                };
                let ok = run_command(&cancel, launch, &engine.mux).await;
                if ok {
                    engine.state.set(status_key(&proc.name), "done");
                    engine.state.remove(&error_key(&proc.name));
                } else {
                    engine.state.set(status_key(&proc.name), "errored");
                    let output = capture
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    engine.state.set(error_key(&proc.name), output);
                }
                ok
            });
        }
    }

    let mut all_ok = true;
    while let Some(result) = tasks.join_next().await {
        if !result.unwrap_or(false) {
            all_ok = false;
        }
    }
    all_ok
}

fn status_key(name: &str) -> String {
    format!("BUILD_{}", normalize_env_var(name))
}

fn error_key(name: &str) -> String {
    format!("ERROR_{}", normalize_env_var(name))
}
