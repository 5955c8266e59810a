use anyhow::Result;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::behavior::BehaviorConfig;
use crate::persistence::PersistenceConfig;

/// Main configuration structure for flexflow
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FlexflowConfig {
    /// Where workflow records and behavior profiles live
    pub persistence: PersistenceConfig,
    /// Behavior tracking and suggestion thresholds
    pub behavior: BehaviorConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Emit JSON lines instead of compact text
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl FlexflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (flexflow.toml, .flexflow-rc)
    /// 3. Environment variables (FLEXFLOW_SECTION__KEY)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        if Path::new("flexflow.toml").exists() {
            builder = builder.add_source(File::with_name("flexflow"));
        }

        if Path::new(".flexflow-rc").exists() {
            builder = builder.add_source(File::new(".flexflow-rc", FileFormat::Toml));
        }

        builder = builder.add_source(Self::environment());

        let config: FlexflowConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Load an explicit TOML file, still honouring environment overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()).format(FileFormat::Toml))
            .add_source(Self::environment())
            .build()?;

        Ok(config.try_deserialize()?)
    }

    fn environment() -> Environment {
        Environment::with_prefix("FLEXFLOW")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
