//! Process launching.
//!
//! Each command runs as `sh -c <cmd>` in the engine workdir, leading its own
//! process group so that shell-hosted children and their descendants all
//! receive signals. Output streams are line-split into the log multiplexer
//! and, for builds, an in-memory capture buffer.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::logmux::LogMux;
use crate::manifest::StopSignal;

const LINE_BUFFER_INITIAL: usize = 64 * 1024;
const LINE_BUFFER_MAX: usize = 2 * 1024 * 1024;

/// Scratch buffer the build stage reads back on failure.
pub type CaptureBuffer = Arc<Mutex<String>>;

pub fn capture_buffer() -> CaptureBuffer {
    Arc::new(Mutex::new(String::new()))
}

/// One command launch.
pub struct Launch<'a> {
    /// Instance name used as the log prefix, e.g. `web.0`.
    pub name: &'a str,
    pub cmd: &'a str,
    pub workdir: &'a Path,
    pub signal: StopSignal,
    /// Grace period between the stop signal and SIGKILL.
    pub timeout: Duration,
    pub port: Option<u16>,
    /// Extra environment merged over the ambient one.
    pub env: Vec<(String, String)>,
    pub capture: Option<CaptureBuffer>,
}

enum WaitOutcome {
    Exited(ExitStatus),
    Cancelled,
    Error(std::io::Error),
}

/// Runs the command to completion. On cancellation the configured signal is
/// sent to the child's process group, the grace timeout elapses, and the
/// group is SIGKILLed and reaped. Returns whether the command exited zero.
pub async fn run_command(cancel: &CancellationToken, launch: Launch<'_>, mux: &LogMux) -> bool {
    mux.publish(launch.name, &format!("running \"{}\"", launch.cmd))
        .await;
    if let Some(port) = launch.port {
        mux.publish(launch.name, &format!("listening on {port}"))
            .await;
    }

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(launch.cmd)
        .current_dir(launch.workdir)
        .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // The child leads its own process group so the whole subtree is signaled.
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            mux.publish(
                launch.name,
                &format!("exec error {}: ({}) {}", launch.name, launch.cmd, err),
            )
            .await;
            return false;
        }
    };

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        mux.publish(
            launch.name,
            &format!("cannot open stdio pipes {}: ({})", launch.name, launch.cmd),
        )
        .await;
        let _ = child.start_kill();
        let _ = child.wait().await;
        return false;
    };

    let outcome = {
        let stdout_reader = read_lines(stdout, launch.name, launch.capture.clone(), mux);
        let stderr_reader = read_lines(stderr, launch.name, launch.capture.clone(), mux);
        let waiter = supervise_wait(cancel, &mut child, launch.signal, launch.timeout);
        let (outcome, (), ()) = tokio::join!(waiter, stdout_reader, stderr_reader);
        outcome
    };

    mux.publish(launch.name, &format!("finished \"{}\"", launch.cmd))
        .await;

    match outcome {
        WaitOutcome::Exited(status) if status.success() => true,
        WaitOutcome::Exited(status) => {
            mux.publish(
                launch.name,
                &format!("exec error {}: ({}) {}", launch.name, launch.cmd, status),
            )
            .await;
            false
        }
        WaitOutcome::Cancelled => false,
        WaitOutcome::Error(err) => {
            mux.publish(
                launch.name,
                &format!("exec error {}: ({}) {}", launch.name, launch.cmd, err),
            )
            .await;
            false
        }
    }
}

async fn supervise_wait(
    cancel: &CancellationToken,
    child: &mut Child,
    signal: StopSignal,
    grace: Duration,
) -> WaitOutcome {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => WaitOutcome::Exited(status),
            Err(err) => WaitOutcome::Error(err),
        },
        _ = cancel.cancelled() => {
            if let Some(pid) = child.id() {
                signal_group(pid, os_signal(signal));
            }
            let reaped = tokio::time::timeout(grace, child.wait()).await;
            if !matches!(reaped, Ok(Ok(_))) {
                if let Some(pid) = child.id() {
                    signal_group(pid, libc::SIGKILL);
                }
                let _ = child.wait().await;
            }
            WaitOutcome::Cancelled
        }
    }
}

async fn read_lines<R>(reader: R, name: &str, capture: Option<CaptureBuffer>, mux: &LogMux)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let codec = LinesCodec::new_with_max_length(LINE_BUFFER_MAX);
    let mut lines = FramedRead::with_capacity(reader, codec, LINE_BUFFER_INITIAL);
    while let Some(next) = lines.next().await {
        match next {
            Ok(line) => {
                if let Some(buffer) = &capture {
                    let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                    buffer.push_str(&line);
                    buffer.push('\n');
                }
                mux.publish(name, &line).await;
            }
            // Oversized line dropped; the codec resumes at the next newline.
            Err(_) => continue,
        }
    }
}

fn os_signal(signal: StopSignal) -> libc::c_int {
    match signal {
        StopSignal::Term => libc::SIGTERM,
        StopSignal::Kill => libc::SIGKILL,
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    unsafe {
        let pid = pid as libc::pid_t;
        let _ = libc::kill(pid, signal);
        let _ = libc::kill(-pid, signal);
    }
}
