//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// the listed fields by parsing from the given TOML string if it is `Some`.
/// Evaluates to `Ok(config)` on success, or `Err(RoomkeeperError)` if the
/// string does not parse or names a key outside the listed fields.
///
/// Example:
/// ```no_compile
/// let config = parsed_config!(config_str => ReplicaConfig;
///                             heartbeat_interval_ms, multicast_port)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::RoomkeeperError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;
            $({
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // anything left over was not an expected field
            if let Some(key) = table.keys().next() {
                return Err($crate::RoomkeeperError::msg(format!(
                    "invalid field name '{}' in config",
                    key
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::RoomkeeperError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        interval_ms: u64,
        pool_base: String,
        port: u16,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                interval_ms: 500,
                pool_base: "239.0.0.1".into(),
                port: 4446,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), RoomkeeperError> {
        let config =
            parsed_config!(None => TestConfig; interval_ms, pool_base, port)?;
        assert_eq!(config, TestConfig::default());
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), RoomkeeperError> {
        let config_str = Some("pool_base = '127.0.1.1'\nport = 5000");
        let config =
            parsed_config!(config_str => TestConfig; pool_base, port)?;
        let ref_config = TestConfig {
            interval_ms: 500,
            pool_base: "127.0.1.1".into(),
            port: 5000,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("mystery = 999");
        assert!(parsed_config!(config_str => TestConfig; port).is_err());
    }

    #[test]
    fn parse_wrong_type() {
        let config_str = Some("port = 'not a number'");
        assert!(parsed_config!(config_str => TestConfig; port).is_err());
    }
}
