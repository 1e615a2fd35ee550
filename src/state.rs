//! Shared discovery state.
//!
//! The engine keeps one flat map of string keys to string values: build
//! statuses under `BUILD_*`, captured build output under `ERROR_*`, and
//! advertised instance addresses under `NAME_I_PORT` keys. The map is read by
//! the HTTP discovery endpoint and by the readiness prober.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Mutex-guarded key/value store shared between the build stage, the
/// supervisors, and the HTTP server.
#[derive(Debug, Clone, Default)]
pub struct ServiceState {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl ServiceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut map = self.lock();
        map.insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) {
        let mut map = self.lock();
        map.remove(key);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    /// Copies the whole map, for serving `/state`.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock().clone()
    }

    /// Resolves a process-type name to the advertised address of one of its
    /// instances. The target is normalized to env-var form and matched as a
    /// key prefix; only `*_PORT` keys qualify. First match in key order wins.
    pub fn resolve_instance_address(&self, target: &str) -> Option<String> {
        let prefix = format!("{}_", normalize_env_var(target));
        let map = self.lock();
        map.iter()
            .find(|(key, _)| key.starts_with(&prefix) && key.ends_with("_PORT"))
            .map(|(_, value)| value.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rewrites a name to comply with POSIX shell environment variable naming
/// (`[a-zA-Z_]+[a-zA-Z0-9_]*`): a leading digit and every character outside
/// `[A-Za-z0-9]` become `_`, and the result is uppercased.
pub fn normalize_env_var(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, ch) in name.chars().enumerate() {
        if (i == 0 && ch.is_ascii_digit()) || !ch.is_ascii_alphanumeric() {
            out.push('_');
        } else {
            out.push(ch.to_ascii_uppercase());
        }
    }
    out
}

/// The env-var key under which instance `index` of process type `name`
/// advertises its address, e.g. `web`/0 becomes `WEB_0_PORT`.
pub fn discovery_env_var(name: &str, index: usize) -> String {
    normalize_env_var(&format!("{name}_{index}_PORT"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rewrites_to_env_var_rules() {
        assert_eq!(normalize_env_var("web"), "WEB");
        assert_eq!(normalize_env_var("build-server"), "BUILD_SERVER");
        assert_eq!(normalize_env_var("web.0"), "WEB_0");
        assert_eq!(normalize_env_var("9lives"), "_LIVES");
        assert_eq!(normalize_env_var("a9lives"), "A9LIVES");
    }

    #[test]
    fn discovery_env_var_appends_index_and_port() {
        assert_eq!(discovery_env_var("web", 0), "WEB_0_PORT");
        assert_eq!(discovery_env_var("api-gw", 2), "API_GW_2_PORT");
    }

    #[test]
    fn resolve_matches_instance_keys_by_prefix() {
        let state = ServiceState::new();
        state.set("WEB_0_PORT", "localhost:5100");
        state.set("BUILD_WEB", "done");
        assert_eq!(
            state.resolve_instance_address("web"),
            Some("localhost:5100".to_string())
        );
        assert_eq!(state.resolve_instance_address("db"), None);
    }

    #[test]
    fn resolve_ignores_non_port_keys() {
        let state = ServiceState::new();
        state.set("WEB_STATUS", "done");
        assert_eq!(state.resolve_instance_address("web"), None);
    }

    #[test]
    fn set_and_remove_round_trip() {
        let state = ServiceState::new();
        state.set("BUILD_X", "building");
        assert_eq!(state.get("BUILD_X").as_deref(), Some("building"));
        state.remove("BUILD_X");
        assert_eq!(state.get("BUILD_X"), None);
        assert!(state.snapshot().is_empty());
    }
}
