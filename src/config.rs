//! Centralized environment variable access for the `portbridge` binary.
//!
//! One function per input, `PORTBRIDGE_` prefix throughout, resolved once at
//! startup into a [`RuntimeConfig`].

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;

const ENV_HOST: &str = "PORTBRIDGE_HOST";
const ENV_LOG: &str = "PORTBRIDGE_LOG";
const ENV_IDENTITY_FILE: &str = "PORTBRIDGE_IDENTITY_FILE";
const ENV_LABEL_PORTS: &str = "PORTBRIDGE_LABEL_PORTS";

const DEFAULT_LOG_LEVEL: &str = "info";
const HEALTH_MONITOR_INTERVAL: Duration = Duration::from_secs(15);
const RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// The required host reference text. No default: a missing host reference
/// is an `Input` error surfaced before any task is spawned.
pub fn host_ref_text() -> Result<String, Error> {
    std::env::var(ENV_HOST)
        .map_err(|_| Error::Input(format!("{ENV_HOST} is required")))
}

/// The log-level selector. Defaults to `info`. Rejects anything outside
/// `trace|debug|info|warn|error`.
pub fn log_level() -> Result<String, Error> {
    let level = std::env::var(ENV_LOG).unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(level),
        other => Err(Error::Input(format!(
            "{ENV_LOG} must be one of trace|debug|info|warn|error, got `{other}`"
        ))),
    }
}

/// An optional identity-file path forwarded verbatim as `-i <path>`.
pub fn identity_file() -> Option<PathBuf> {
    std::env::var_os(ENV_IDENTITY_FILE).map(PathBuf::from)
}

/// Whether to additionally source desired ports from container labels
/// (`<appprefix>.forward.*`), gated by this flag. Test-only affordance in
/// the source system; never changes Reconciler/State semantics here.
pub fn label_based_port_discovery() -> bool {
    matches!(
        std::env::var(ENV_LABEL_PORTS).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

/// Fully resolved runtime configuration. Intervals are fixed in the minimum
/// environment surface but exposed as constructor parameters so tests can
/// override them.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub host_ref_text: String,
    pub log_level: String,
    pub identity_file: Option<PathBuf>,
    pub label_based_port_discovery: bool,
    pub health_monitor_interval: Duration,
    pub resync_interval: Duration,
}

impl RuntimeConfig {
    /// Resolve every environment input into a single config value.
    pub fn from_env() -> Result<Self, Error> {
        Ok(Self {
            host_ref_text: host_ref_text()?,
            log_level: log_level()?,
            identity_file: identity_file(),
            label_based_port_discovery: label_based_port_discovery(),
            health_monitor_interval: HEALTH_MONITOR_INTERVAL,
            resync_interval: RESYNC_INTERVAL,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch
    // them so they don't race under the test harness's thread pool.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn host_ref_text_requires_env_var() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(ENV_HOST);
        assert!(host_ref_text().is_err());
        std::env::set_var(ENV_HOST, "ssh://me@example.com");
        assert_eq!(host_ref_text().unwrap(), "ssh://me@example.com");
        std::env::remove_var(ENV_HOST);
    }

    #[test]
    fn log_level_defaults_and_validates() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(ENV_LOG);
        assert_eq!(log_level().unwrap(), "info");
        std::env::set_var(ENV_LOG, "debug");
        assert_eq!(log_level().unwrap(), "debug");
        std::env::set_var(ENV_LOG, "bogus");
        assert!(log_level().is_err());
        std::env::remove_var(ENV_LOG);
    }

    #[test]
    fn label_based_port_discovery_accepts_documented_truthy_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(ENV_LABEL_PORTS);
        assert!(!label_based_port_discovery());
        std::env::set_var(ENV_LABEL_PORTS, "true");
        assert!(label_based_port_discovery());
        std::env::set_var(ENV_LABEL_PORTS, "0");
        assert!(!label_based_port_discovery());
        std::env::remove_var(ENV_LABEL_PORTS);
    }
}
