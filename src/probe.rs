//! Network readiness probing.
//!
//! Before a process with a `waitfor=` target starts, the engine dials the
//! target until it accepts a TCP connection. Targets without a port are
//! treated as process-type names and resolved through the discovery state on
//! every attempt, so a dependency that registers late is still found.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::logmux::LogMux;
use crate::state::ServiceState;

const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Blocks until `target` accepts a TCP connection or `cancel` fires. The
/// probe connection is closed immediately on success. Progress is logged
/// through the instance's log stream.
pub async fn wait_for(
    cancel: &CancellationToken,
    state: &ServiceState,
    mux: &LogMux,
    name: &str,
    target: &str,
) {
    mux.publish(name, &format!("waiting for {target}")).await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(PROBE_INTERVAL) => {
                let addr = resolve(state, target);
                if TcpStream::connect(&addr).await.is_ok() {
                    break;
                }
            }
        }
    }
    mux.publish(name, "starting").await;
}

fn resolve(state: &ServiceState, target: &str) -> String {
    if target.contains(':') {
        return target.to_string();
    }
    state
        .resolve_instance_address(target)
        .unwrap_or_else(|| target.to_string())
}
