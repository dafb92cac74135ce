//! Configuration loading for the maintenance runner
//!
//! Sources are layered lowest to highest priority:
//!
//! 1. Built-in defaults of [`WardenConfig`]
//! 2. The file passed with `--config`
//! 3. `config/default.{toml,yaml,json}` and `config/local.{toml,yaml,json}`
//! 4. `WARDEN__*` environment variables, e.g. `WARDEN__MAINTENANCE__INTERVAL_SECS=30`

use anyhow::Context;
use config::{Config, ConfigBuilder, Environment, File};

use warden_engine::WardenConfig;

/// Load and validate the configuration
pub fn load(config_path: Option<&str>) -> anyhow::Result<WardenConfig> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let mut builder = Config::builder();

    if let Some(path) = config_path {
        builder = builder.add_source(File::with_name(path).required(true));
    }

    builder = builder
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name("config/local").required(false))
        .add_source(
            Environment::with_prefix("WARDEN")
                .separator("__")
                .try_parsing(true),
        );

    from_builder(builder)
}

/// Deserialize and validate whatever the builder layered together
fn from_builder(
    builder: ConfigBuilder<config::builder::DefaultState>,
) -> anyhow::Result<WardenConfig> {
    let config: WardenConfig = builder
        .build()
        .context("failed to read configuration sources")?
        .try_deserialize()
        .context("failed to parse configuration")?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use warden_engine::LogFormat;

    fn parse(toml: &str) -> anyhow::Result<WardenConfig> {
        from_builder(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    #[test]
    fn test_empty_sources_give_defaults() {
        let config = from_builder(Config::builder()).unwrap();
        assert_eq!(config, WardenConfig::default());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let config = parse(
            r#"
            [maintenance]
            interval_secs = 15
            anchor_enabled = false

            [ledger]
            anchor_max_leaves = 256

            [logging]
            level = "warn"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.maintenance.interval_secs, 15);
        assert!(!config.maintenance.anchor_enabled);
        assert_eq!(config.maintenance.velocity_retention_secs, 3_600);
        assert_eq!(config.ledger.anchor_max_leaves, 256);
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_later_sources_win() {
        let config = from_builder(
            Config::builder()
                .add_source(File::from_str("[maintenance]\ninterval_secs = 15", FileFormat::Toml))
                .add_source(File::from_str(
                    r#"{ "maintenance": { "interval_secs": 90 } }"#,
                    FileFormat::Json,
                )),
        )
        .unwrap();
        assert_eq!(config.maintenance.interval_secs, 90);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = parse("[maintenance]\ninterval_secs = 0").unwrap_err();
        assert!(err.to_string().contains("interval_secs"));

        assert!(parse("[logging]\nformat = \"xml\"").is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(load(Some("/nonexistent/warden-maintenance")).is_err());
    }
}
