use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    pub data_dir: String,
    pub settings_dir: String,
    pub sweep_interval_secs: u64,
    /// Stale-reservation cutoff for the sweep; 0 disables expiry
    pub reservation_ttl_secs: u64,
}

pub fn load_config() -> Result<AppConfig, ConfigError> {
    let s = Config::builder()
        // Set defaults
        .set_default("log_level", "info")?
        .set_default("log_to_file", false)?
        .set_default("log_file", "log/reward_ledger.log")?
        .set_default("data_dir", "data/ledger")?
        .set_default("settings_dir", "data/settings")?
        .set_default("sweep_interval_secs", 300_i64)?
        .set_default("reservation_ttl_secs", 7 * 24 * 3600_i64)?
        // Add configuration from a file
        .add_source(File::with_name("config/config.yaml").required(false))
        // Add configuration from environment variables
        .add_source(config::Environment::with_prefix("APP"))
        .build()?;

    s.try_deserialize()
}
