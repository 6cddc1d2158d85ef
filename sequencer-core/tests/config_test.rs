use sequencer_core::config::SequencerConfig;
use sequencer_core::{parse_inventory, ConfigError};
use std::time::Duration;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_path() -> String {
        format!("{}/config/sequencer.toml", env!("CARGO_MANIFEST_DIR"))
    }

    #[test]
    fn test_sample_config_loads() {
        let config = SequencerConfig::from_path(&sample_path()).unwrap();

        assert_eq!(config.pool.acquire_wait(), Duration::from_secs(2));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.retry.fee_bump_bps, 1_250);
        assert_eq!(config.chain.required_depth, 1);
        assert_eq!(config.worker.max_concurrent_wallets, 32);
        assert_eq!(config.maintenance.retention(), Duration::from_secs(86_400));
        assert!(config.pool.inventory_path.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = SequencerConfig::from_path("/nonexistent/sequencer.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn test_invalid_toml_is_a_parse_error() {
        let err = SequencerConfig::from_toml_str("[retry\nmax_attempts = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_wrong_type_is_a_parse_error() {
        let err = SequencerConfig::from_toml_str("[retry]\nmax_attempts = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let mut config = SequencerConfig::default();
        config.retry.base_delay_ms = 5_000;
        config.retry.max_delay_ms = 100;
        match config.validate() {
            Err(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "retry.max_delay_ms")
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = SequencerConfig::default();
        config.chain.confirmation_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inventory_formats() {
        let csv = parse_inventory("# wallets\n0xaaa, key-a\n\n0xbbb,key-b\n").unwrap();
        assert_eq!(csv.len(), 2);
        assert_eq!(csv[1].address, "0xbbb");
        assert_eq!(csv[0].signing_key_ref().expose(), "key-a");

        let json =
            parse_inventory(r#"[{"address": "0xccc", "signing_key_ref": "key-c"}]"#).unwrap();
        assert_eq!(json[0].key_ref, "key-c");

        assert!(parse_inventory("0xaaa,key-a\n0xaaa,key-b").is_err());
        assert!(parse_inventory("0xaaa").is_err());
    }
}
