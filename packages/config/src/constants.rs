// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Metrodeck

// Background Reconciliation / Discovery
pub const METRODECK_DISCOVERY_ENABLED: &str = "METRODECK_DISCOVERY_ENABLED";
pub const METRODECK_DISCOVERY_INTERVAL_SECS: &str = "METRODECK_DISCOVERY_INTERVAL_SECS";
pub const METRODECK_DISCOVERY_PORT_START: &str = "METRODECK_DISCOVERY_PORT_START";
pub const METRODECK_DISCOVERY_PORT_END: &str = "METRODECK_DISCOVERY_PORT_END";

// Log Retention
pub const METRODECK_LOG_SOFT_CAP: &str = "METRODECK_LOG_SOFT_CAP";
pub const METRODECK_LOG_CLEANUP_THRESHOLD: &str = "METRODECK_LOG_CLEANUP_THRESHOLD";

// Process Lifecycle
pub const METRODECK_MAX_CONFLICT_RETRIES: &str = "METRODECK_MAX_CONFLICT_RETRIES";
pub const METRODECK_TERMINATION_GRACE_MS: &str = "METRODECK_TERMINATION_GRACE_MS";
pub const METRODECK_HANDOFF_DELAY_MS: &str = "METRODECK_HANDOFF_DELAY_MS";

// Dev Server HTTP Endpoints
pub const METRODECK_HTTP_TIMEOUT_SECS: &str = "METRODECK_HTTP_TIMEOUT_SECS";

// Persistence
pub const METRODECK_STATE_PATH: &str = "METRODECK_STATE_PATH";

// Child Process Environment
pub const PATH: &str = "PATH";
pub const CI: &str = "CI";
pub const NODE_ENV: &str = "NODE_ENV";
