//! Configuration module for webherd
//!
//! Handles loading, parsing, and validating TOML configuration files. Every
//! option has a default; a missing file section falls back to it. Invalid
//! values, malformed duration strings included, surface here as
//! [`ConfigError`]s so the rest of the crate never has to re-validate.
//!
//! # Example
//!
//! ```no_run
//! use webherd::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("webherd.toml")).unwrap();
//! println!("segment cap: {}", config.dispatcher.max_links_per_segment);
//! ```

mod types;
mod validation;

pub use types::{Config, DispatcherConfig, FetcherConfig, LinkConfig, StoreConfig};
pub use validation::validate;

use crate::ConfigError;
use std::path::Path;

/// Loads and parses a configuration file from the given path
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parses and validates configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_valid_config() {
        let config_content = r#"
[store]
hosts = ["10.0.0.1:9042", "10.0.0.2:9042"]
keyspace = "crawlspace"
num-query-retries = 5

[links]
add-new-domains = false
added-domains-cache-size = 128
default-domain-priority = 2
purge-sid-list = ["jsessionid", "phpsessid", "sid"]

[fetcher]
active-fetchers-ttl = "20m"

[dispatcher]
num-concurrent-domains = 4
dispatch-interval = "5m"
min-link-refresh-time = "49h"
max-links-per-segment = 9
refresh-percentage = 33
correct-link-normalization = true
empty-dispatch-retry-interval = "1h"
active-fetchers-cacheratio = 0.5
"#;

        let file = create_temp_config(config_content);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.store.hosts.len(), 2);
        assert_eq!(config.store.keyspace, "crawlspace");
        assert!(!config.links.add_new_domains);
        assert_eq!(config.links.purge_sid_list.len(), 3);
        assert_eq!(
            config.fetcher.active_fetchers_ttl,
            std::time::Duration::from_secs(20 * 60)
        );
        assert_eq!(
            config.dispatcher.min_link_refresh_time,
            std::time::Duration::from_secs(49 * 60 * 60)
        );
        assert_eq!(config.dispatcher.max_links_per_segment, 9);
        assert_eq!(config.dispatcher.refresh_percentage, 33);
        assert!(config.dispatcher.correct_link_normalization);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.store.keyspace, "webherd");
        assert!(config.links.add_new_domains);
        assert_eq!(config.dispatcher.max_links_per_segment, 500);
        assert_eq!(config.links.purge_sid_list, vec!["jsessionid", "phpsessid"]);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = parse_config("[dispatcher]\nmax-links-per-segment = 7\n").unwrap();
        assert_eq!(config.dispatcher.max_links_per_segment, 7);
        assert_eq!(config.dispatcher.refresh_percentage, 25);
    }

    #[test]
    fn test_invalid_duration_string_is_an_error() {
        let result = parse_config("[dispatcher]\ndispatch-interval = \"not a duration\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_failure_surfaces() {
        let result = parse_config("[dispatcher]\nrefresh-percentage = 250\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_load_config_with_invalid_path() {
        let result = load_config(Path::new("/nonexistent/webherd.toml"));
        assert!(result.is_err());
    }
}
