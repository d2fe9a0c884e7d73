// ABOUTME: Environment variable parsing utilities
// ABOUTME: Typed lookups with validation and defaults for supervisor configuration

use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

/// Parse an environment variable with validation
/// Returns the parsed value if it passes validation, otherwise returns the default
/// Logs warnings when environment variables are set but fail validation or parsing
pub fn parse_env_or_default_with_validation<T, F>(var_name: &str, default: T, validator: F) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    F: Fn(T) -> bool,
{
    match std::env::var(var_name) {
        Ok(raw_value) => match raw_value.trim().parse::<T>() {
            Ok(parsed_value) if validator(parsed_value) => parsed_value,
            Ok(_) => {
                warn!(
                    "Environment variable {} has invalid value '{}', using default: {}",
                    var_name, raw_value, default
                );
                default
            }
            Err(_) => {
                warn!(
                    "Environment variable {} has unparseable value '{}', using default: {}",
                    var_name, raw_value, default
                );
                default
            }
        },
        // Not set is the normal case
        Err(_) => default,
    }
}

/// Parse a boolean flag. Accepts `true`/`1`/`yes` and `false`/`0`/`no` in any case.
pub fn parse_env_bool(var_name: &str, default: bool) -> bool {
    match std::env::var(var_name) {
        Ok(raw_value) => match raw_value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => {
                warn!(
                    "Environment variable {} has unparseable value '{}', using default: {}",
                    var_name, raw_value, default
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// Read a path from the environment, ignoring empty values
pub fn parse_env_path(var_name: &str) -> Option<PathBuf> {
    std::env::var(var_name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_validation_passes() {
        std::env::set_var("METRODECK_TEST_INTERVAL", "45");
        let result =
            parse_env_or_default_with_validation("METRODECK_TEST_INTERVAL", 30u64, |v| {
                (10..=300).contains(&v)
            });
        assert_eq!(result, 45);
        std::env::remove_var("METRODECK_TEST_INTERVAL");
    }

    #[test]
    #[serial]
    fn test_validation_fails_uses_default() {
        std::env::set_var("METRODECK_TEST_RETRIES", "42");
        let result =
            parse_env_or_default_with_validation("METRODECK_TEST_RETRIES", 3u32, |v| v <= 10);
        assert_eq!(result, 3);
        std::env::remove_var("METRODECK_TEST_RETRIES");
    }

    #[test]
    #[serial]
    fn test_unparseable_uses_default() {
        std::env::set_var("METRODECK_TEST_PORT", "eighty");
        let result = parse_env_or_default_with_validation("METRODECK_TEST_PORT", 8080u16, |_| true);
        assert_eq!(result, 8080);
        std::env::remove_var("METRODECK_TEST_PORT");
    }

    #[test]
    #[serial]
    fn test_parse_env_bool() {
        std::env::set_var("METRODECK_TEST_FLAG", "FALSE");
        assert!(!parse_env_bool("METRODECK_TEST_FLAG", true));
        std::env::set_var("METRODECK_TEST_FLAG", "1");
        assert!(parse_env_bool("METRODECK_TEST_FLAG", false));
        std::env::set_var("METRODECK_TEST_FLAG", "maybe");
        assert!(parse_env_bool("METRODECK_TEST_FLAG", true));
        std::env::remove_var("METRODECK_TEST_FLAG");
        assert!(!parse_env_bool("METRODECK_TEST_FLAG", false));
    }

    #[test]
    #[serial]
    fn test_parse_env_path_ignores_blank() {
        std::env::set_var("METRODECK_TEST_PATH", "   ");
        assert_eq!(parse_env_path("METRODECK_TEST_PATH"), None);
        std::env::set_var("METRODECK_TEST_PATH", "/tmp/state.json");
        assert_eq!(
            parse_env_path("METRODECK_TEST_PATH"),
            Some(PathBuf::from("/tmp/state.json"))
        );
        std::env::remove_var("METRODECK_TEST_PATH");
    }
}
