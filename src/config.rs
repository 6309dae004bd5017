//! Collector configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/collector.toml` by default)
//! 2. Environment variables (prefixed with `DAQ_COLLECTOR_`)
//!
//! # Example
//! ```no_run
//! use daq_collector::config::CollectorConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CollectorConfig::load_from("config/collector.toml")?;
//! config.validate()?;
//! println!("Stage: {}", config.app);
//! # Ok(())
//! # }
//! ```

use crate::app::AppKind;
use crate::error::{CollectorError, CollectorResult};
use crate::logging::OutputFormat;
use crate::network::{Endpoint, SocketOptions};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `DAQ_COLLECTOR_LAX=true`.
pub const ENV_PREFIX: &str = "DAQ_COLLECTOR_";

/// Configuration of one collector stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Which collector variant to run
    pub app: AppKind,
    /// Address the confirmed input binds to
    pub input_address: String,
    /// Output address (the bulk data channel for the ROI variant)
    pub output_address: String,
    /// ROI side-channel address, required for `final_collector_with_roi`
    #[serde(default)]
    pub roi_address: Option<String>,
    /// Address the monitoring channel binds to
    #[serde(default)]
    pub monitoring_address: Option<String>,
    /// Drop events instead of stalling when no worker is ready
    #[serde(default)]
    pub lax: bool,
    /// Seconds without data before a drain is forced to complete
    #[serde(default = "default_stop_waiting_time")]
    pub stop_waiting_time_secs: u64,
    /// Prefix raw output payloads with their length
    #[serde(default)]
    pub add_event_size: bool,
    /// Identity announced when connecting downstream
    #[serde(default)]
    pub identity: Option<String>,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

fn default_stop_waiting_time() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

impl CollectorConfig {
    /// Minimal configuration for `app`; everything else takes its default.
    pub fn new(app: AppKind, input_address: impl Into<String>, output_address: impl Into<String>) -> Self {
        Self {
            app,
            input_address: input_address.into(),
            output_address: output_address.into(),
            roi_address: None,
            monitoring_address: None,
            lax: false,
            stop_waiting_time_secs: default_stop_waiting_time(),
            add_event_size: false,
            identity: None,
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }

    /// Load configuration from `config/collector.toml` and environment variables
    pub fn load() -> CollectorResult<Self> {
        Self::load_from("config/collector.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables override the file; nested keys are separated by `__`.
    /// Example: `DAQ_COLLECTOR_STOP_WAITING_TIME_SECS=5`
    pub fn load_from<P: AsRef<Path>>(path: P) -> CollectorResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(CollectorError::from)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> CollectorResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(CollectorError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.stop_waiting_time_secs == 0 {
            return Err(CollectorError::Configuration(
                "stop_waiting_time_secs must be at least 1".into(),
            ));
        }

        if self.app == AppKind::FinalCollectorWithRoi && self.roi_address.is_none() {
            return Err(CollectorError::Configuration(format!(
                "roi_address is required for {}",
                self.app
            )));
        }

        for address in [&self.input_address, &self.output_address]
            .into_iter()
            .chain(self.roi_address.as_ref())
            .chain(self.monitoring_address.as_ref())
        {
            Endpoint::parse(address)?;
        }

        Ok(())
    }

    /// Drain timeout as a duration.
    pub fn stop_waiting_time(&self) -> Duration {
        Duration::from_secs(self.stop_waiting_time_secs)
    }

    /// Socket options carrying the configured identity, or a generated one.
    pub fn socket_options(&self) -> SocketOptions {
        match &self.identity {
            Some(identity) => SocketOptions::new(identity.clone()),
            None => SocketOptions::new(format!("{}-{}", self.app, uuid::Uuid::new_v4())),
        }
    }
}
