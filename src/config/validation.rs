use crate::config::types::{Config, DispatcherConfig, LinkConfig, StoreConfig};
use crate::ConfigError;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_store_config(&config.store)?;
    validate_link_config(&config.links)?;
    validate_dispatcher_config(&config.dispatcher)?;

    if config.fetcher.active_fetchers_ttl.is_zero() {
        return Err(ConfigError::Validation(
            "active-fetchers-ttl must be positive".to_string(),
        ));
    }

    Ok(())
}

fn validate_store_config(config: &StoreConfig) -> Result<(), ConfigError> {
    if config.hosts.is_empty() {
        return Err(ConfigError::Validation(
            "store.hosts must list at least one contact point".to_string(),
        ));
    }

    if config.keyspace.is_empty() {
        return Err(ConfigError::Validation(
            "store.keyspace cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_link_config(config: &LinkConfig) -> Result<(), ConfigError> {
    if config.added_domains_cache_size < 1 {
        return Err(ConfigError::Validation(format!(
            "added-domains-cache-size must be >= 1, got {}",
            config.added_domains_cache_size
        )));
    }

    if !config.default_domain_priority.is_valid() {
        return Err(ConfigError::Validation(format!(
            "default-domain-priority {} is not an allowed priority class",
            config.default_domain_priority
        )));
    }

    for sid in &config.purge_sid_list {
        if sid.is_empty() {
            return Err(ConfigError::Validation(
                "purge-sid-list entries cannot be empty".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_dispatcher_config(config: &DispatcherConfig) -> Result<(), ConfigError> {
    if config.num_concurrent_domains < 1 {
        return Err(ConfigError::Validation(format!(
            "num-concurrent-domains must be >= 1, got {}",
            config.num_concurrent_domains
        )));
    }

    if config.max_links_per_segment < 1 {
        return Err(ConfigError::Validation(format!(
            "max-links-per-segment must be >= 1, got {}",
            config.max_links_per_segment
        )));
    }

    if config.refresh_percentage > 100 {
        return Err(ConfigError::Validation(format!(
            "refresh-percentage must be between 0 and 100, got {}",
            config.refresh_percentage
        )));
    }

    if config.active_fetchers_cacheratio <= 0.0 || config.active_fetchers_cacheratio > 1.0 {
        return Err(ConfigError::Validation(format!(
            "active-fetchers-cacheratio must be in (0, 1], got {}",
            config.active_fetchers_cacheratio
        )));
    }

    Ok(())
}
