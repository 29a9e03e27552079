//! Environment-borne configuration loading

use crate::{BrokerConfig, BusConfig, StoreConfig};
use std::env;
use tracing::debug;

/// Build a [`BusConfig`] from environment variables, starting from
/// defaults. Unset variables leave the default in place; values that do
/// not parse are ignored.
pub fn from_env() -> BusConfig {
    BusConfig {
        broker: broker_from_env(),
        store: store_from_env(),
    }
}

fn broker_from_env() -> BrokerConfig {
    let mut config = BrokerConfig::default();

    if let Ok(val) = env::var("AMQP_HOST") {
        config.host = val;
    }
    if let Ok(val) = env::var("AMQP_PORT") {
        if let Ok(port) = val.parse() {
            config.port = port;
        }
    }
    if let Ok(val) = env::var("AMQP_USER") {
        config.user = val;
    }
    if let Ok(val) = env::var("AMQP_PASS") {
        config.pass = val;
    }
    if let Ok(val) = env::var("AMQP_VHOST") {
        config.vhost = val;
    }
    if let Ok(val) = env::var("AMQP_PROJECT") {
        config.project = val;
    }
    if let Ok(val) = env::var("AMQP_MICROSERVICE_NAME") {
        config.consumer_id = val;
    }
    if let Ok(val) = env::var("AMQP_EXCHANGE") {
        config.exchange = val;
    }
    if let Ok(val) = env::var("AMQP_DELAY_EXCHANGE") {
        config.delay_exchange = val;
    }
    if let Ok(val) = env::var("AMQP_PUBLISHER_ENABLED") {
        config.publisher_enabled = parse_bool(&val).unwrap_or(true);
    }

    debug!(
        host = %config.host,
        project = %config.project,
        consumer_id = %config.consumer_id,
        publisher_enabled = config.publisher_enabled,
        "Loaded broker configuration from environment"
    );

    config
}

fn store_from_env() -> StoreConfig {
    let mut config = StoreConfig::default();

    if let Ok(val) = env::var("DB_BOX_HOST") {
        config.host = val;
    }
    if let Ok(val) = env::var("DB_BOX_PORT") {
        if let Ok(port) = val.parse() {
            config.port = port;
        }
    }
    if let Ok(val) = env::var("DB_BOX_NAME") {
        config.name = val;
    }
    if let Ok(val) = env::var("DB_BOX_USER") {
        config.user = val;
    }
    if let Ok(val) = env::var("DB_BOX_PASS") {
        config.pass = val;
    }
    if let Ok(val) = env::var("DB_BOX_SCHEMA") {
        config.schema = val;
    }

    config
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("FALSE"), Some(false));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
