// ABOUTME: Supervisor configuration with defaults and environment overrides
// ABOUTME: Variable names come from metrodeck-config so every package agrees on them

use crate::env::{parse_env_bool, parse_env_or_default_with_validation, parse_env_path};
use crate::logs::RetentionPolicy;
use metrodeck_config as names;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_DISCOVERY_PORT_START: u16 = 8080;
pub const DEFAULT_DISCOVERY_PORT_END: u16 = 8100;
pub const DEFAULT_LOG_SOFT_CAP: usize = 1000;
pub const DEFAULT_LOG_CLEANUP_THRESHOLD: usize = 1200;
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;
pub const DEFAULT_TERMINATION_GRACE_MS: u64 = 1000;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 3;
pub const DEFAULT_HANDOFF_DELAY_MS: u64 = 1000;

/// Tunables for the supervisor and its background reconciliation loop
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Whether `init` starts the reconciliation loop
    pub discovery_enabled: bool,
    pub discovery_interval: Duration,
    /// Listener scan window for external dev servers
    pub discovery_ports: RangeInclusive<u16>,
    pub retention: RetentionPolicy,
    /// Automatic restarts after a conflict is seen in output
    pub max_conflict_retries: u32,
    /// Wait between graceful and forced termination
    pub termination_grace: Duration,
    pub http_timeout: Duration,
    /// Delay before a stopped project's port is handed to a queued project
    pub handoff_delay: Duration,
    /// Persisted registry file; `None` disables persistence
    pub state_path: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            discovery_enabled: true,
            discovery_interval: Duration::from_secs(DEFAULT_DISCOVERY_INTERVAL_SECS),
            discovery_ports: DEFAULT_DISCOVERY_PORT_START..=DEFAULT_DISCOVERY_PORT_END,
            retention: RetentionPolicy {
                soft_cap: DEFAULT_LOG_SOFT_CAP,
                cleanup_threshold: DEFAULT_LOG_CLEANUP_THRESHOLD,
            },
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            termination_grace: Duration::from_millis(DEFAULT_TERMINATION_GRACE_MS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            handoff_delay: Duration::from_millis(DEFAULT_HANDOFF_DELAY_MS),
            state_path: default_state_path(),
        }
    }
}

impl SupervisorConfig {
    /// Build a configuration from the process environment, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let interval_secs = std::env::var(names::METRODECK_DISCOVERY_INTERVAL_SECS)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|v| v.clamp(10, 300)) // Min 10s, max 5 minutes
            .unwrap_or(DEFAULT_DISCOVERY_INTERVAL_SECS);

        let port_start = parse_env_or_default_with_validation(
            names::METRODECK_DISCOVERY_PORT_START,
            DEFAULT_DISCOVERY_PORT_START,
            |v| v > 0,
        );
        let port_end = parse_env_or_default_with_validation(
            names::METRODECK_DISCOVERY_PORT_END,
            DEFAULT_DISCOVERY_PORT_END,
            |v| v > 0,
        );
        let discovery_ports = if port_start <= port_end {
            port_start..=port_end
        } else {
            warn!(
                "Discovery port window {}-{} is inverted, using default {}-{}",
                port_start, port_end, DEFAULT_DISCOVERY_PORT_START, DEFAULT_DISCOVERY_PORT_END
            );
            defaults.discovery_ports.clone()
        };

        let soft_cap = parse_env_or_default_with_validation(
            names::METRODECK_LOG_SOFT_CAP,
            DEFAULT_LOG_SOFT_CAP,
            |v| v > 0,
        );
        // The trimmed store plus its cleanup note must stay under the threshold
        let cleanup_threshold = parse_env_or_default_with_validation(
            names::METRODECK_LOG_CLEANUP_THRESHOLD,
            DEFAULT_LOG_CLEANUP_THRESHOLD.max(soft_cap + 1),
            |v| v > soft_cap,
        );

        Self {
            discovery_enabled: parse_env_bool(names::METRODECK_DISCOVERY_ENABLED, true),
            discovery_interval: Duration::from_secs(interval_secs),
            discovery_ports,
            retention: RetentionPolicy {
                soft_cap,
                cleanup_threshold,
            },
            max_conflict_retries: parse_env_or_default_with_validation(
                names::METRODECK_MAX_CONFLICT_RETRIES,
                DEFAULT_MAX_CONFLICT_RETRIES,
                |v| v <= 10,
            ),
            termination_grace: Duration::from_millis(parse_env_or_default_with_validation(
                names::METRODECK_TERMINATION_GRACE_MS,
                DEFAULT_TERMINATION_GRACE_MS,
                |v| (100..=10_000).contains(&v),
            )),
            http_timeout: Duration::from_secs(parse_env_or_default_with_validation(
                names::METRODECK_HTTP_TIMEOUT_SECS,
                DEFAULT_HTTP_TIMEOUT_SECS,
                |v| (1..=30).contains(&v),
            )),
            handoff_delay: Duration::from_millis(parse_env_or_default_with_validation(
                names::METRODECK_HANDOFF_DELAY_MS,
                DEFAULT_HANDOFF_DELAY_MS,
                |v| v <= 10_000,
            )),
            state_path: parse_env_path(names::METRODECK_STATE_PATH).or(defaults.state_path),
        }
    }

    /// Configuration for tests and embedders that manage state themselves:
    /// no persistence and no background loop.
    pub fn ephemeral() -> Self {
        Self {
            discovery_enabled: false,
            state_path: None,
            ..Self::default()
        }
    }
}

/// `~/.metrodeck/projects.json`, or `None` when no home directory is known
pub fn default_state_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".metrodeck").join("projects.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            names::METRODECK_DISCOVERY_ENABLED,
            names::METRODECK_DISCOVERY_INTERVAL_SECS,
            names::METRODECK_DISCOVERY_PORT_START,
            names::METRODECK_DISCOVERY_PORT_END,
            names::METRODECK_LOG_SOFT_CAP,
            names::METRODECK_LOG_CLEANUP_THRESHOLD,
            names::METRODECK_MAX_CONFLICT_RETRIES,
            names::METRODECK_TERMINATION_GRACE_MS,
            names::METRODECK_HTTP_TIMEOUT_SECS,
            names::METRODECK_HANDOFF_DELAY_MS,
            names::METRODECK_STATE_PATH,
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = SupervisorConfig::from_env();

        assert!(config.discovery_enabled);
        assert_eq!(config.discovery_interval, Duration::from_secs(30));
        assert_eq!(config.discovery_ports, 8080..=8100);
        assert_eq!(config.retention.soft_cap, 1000);
        assert_eq!(config.retention.cleanup_threshold, 1200);
        assert_eq!(config.max_conflict_retries, 3);
        assert_eq!(config.termination_grace, Duration::from_secs(1));
    }

    #[test]
    #[serial]
    fn test_interval_is_clamped() {
        clear_env();
        std::env::set_var(names::METRODECK_DISCOVERY_INTERVAL_SECS, "2");
        assert_eq!(
            SupervisorConfig::from_env().discovery_interval,
            Duration::from_secs(10)
        );
        std::env::set_var(names::METRODECK_DISCOVERY_INTERVAL_SECS, "9000");
        assert_eq!(
            SupervisorConfig::from_env().discovery_interval,
            Duration::from_secs(300)
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_inverted_port_window_falls_back() {
        clear_env();
        std::env::set_var(names::METRODECK_DISCOVERY_PORT_START, "9000");
        std::env::set_var(names::METRODECK_DISCOVERY_PORT_END, "8000");
        assert_eq!(SupervisorConfig::from_env().discovery_ports, 8080..=8100);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_threshold_must_exceed_soft_cap() {
        clear_env();
        std::env::set_var(names::METRODECK_LOG_SOFT_CAP, "500");
        std::env::set_var(names::METRODECK_LOG_CLEANUP_THRESHOLD, "400");
        let config = SupervisorConfig::from_env();
        assert_eq!(config.retention.soft_cap, 500);
        assert_eq!(config.retention.cleanup_threshold, 1200);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_state_path_override_and_disable_flag() {
        clear_env();
        std::env::set_var(names::METRODECK_STATE_PATH, "/tmp/metrodeck-state.json");
        std::env::set_var(names::METRODECK_DISCOVERY_ENABLED, "false");
        let config = SupervisorConfig::from_env();
        assert_eq!(
            config.state_path,
            Some(PathBuf::from("/tmp/metrodeck-state.json"))
        );
        assert!(!config.discovery_enabled);
        clear_env();
    }
}
