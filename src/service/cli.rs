// ABOUTME: Shared CLI arguments for the link daemon
// ABOUTME: Builds a ServiceConfig from flags and owns tracing setup and startup logging

use crate::error::Error;
use crate::peer::Role;
use crate::service::config::ServiceConfig;
use crate::Result;
use clap::Args;
use std::path::PathBuf;

/// Service arguments
///
/// Use with `#[command(flatten)]` in a binary's Args struct.
#[derive(Args, Debug, Clone)]
pub struct ServiceArgs {
    /// JSON configuration file; flags below override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Control channel socket path
    #[arg(long)]
    pub control_path: Option<PathBuf>,

    /// Audio data channel socket path
    #[arg(long)]
    pub data_path: Option<PathBuf>,

    /// Enabled local roles; the first speaks on the control channel
    #[arg(short, long, value_enum, value_delimiter = ',')]
    pub roles: Vec<Role>,

    /// Codec frame interval in milliseconds
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Peers allowed to be connected at once per role
    #[arg(long)]
    pub max_connected: Option<usize>,

    /// Demo tone frequency in Hz (0 for silence)
    #[arg(short, long)]
    pub frequency: Option<f64>,

    /// Pretend a hardware offload path exists
    #[arg(long)]
    pub offload: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl ServiceArgs {
    /// Initialize tracing based on verbosity flag
    pub fn init_tracing(&self) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let filter = if self.verbose {
            "a2dp_link=debug,a2dp_linkd=debug"
        } else {
            "a2dp_link=info,a2dp_linkd=info"
        };

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| filter.into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    /// Log startup information
    pub fn log_startup_info(&self, config: &ServiceConfig) {
        tracing::info!("a2dp-linkd v{}", env!("CARGO_PKG_VERSION"));
        tracing::info!("Control: {}", config.control_path.display());
        tracing::info!("Data: {}", config.data_path.display());
        tracing::info!(
            "Roles: {:?}, codec interval {} ms, max connected {}",
            config.roles,
            config.codec_interval_ms,
            config.max_connected
        );
    }

    /// Build the configuration: file first, then flag overrides
    pub fn build_config(&self) -> Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::from_json_file(path)?,
            None => ServiceConfig::default(),
        };

        if let Some(path) = &self.control_path {
            config = config.control_path(path);
        }
        if let Some(path) = &self.data_path {
            config = config.data_path(path);
        }
        if !self.roles.is_empty() {
            config = config.roles(self.roles.clone());
        }
        if let Some(ms) = self.interval_ms {
            config = config.codec_interval_ms(ms);
        }
        if let Some(max) = self.max_connected {
            config = config.max_connected(max);
        }
        if let Some(hz) = self.frequency {
            if hz < 0.0 {
                return Err(Error::Config(format!("negative tone frequency {}", hz)));
            }
            config = config.tone_frequency(hz);
        }
        if self.offload {
            config = config.offload(true);
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> ServiceArgs {
        ServiceArgs {
            config: None,
            control_path: None,
            data_path: None,
            roles: Vec::new(),
            interval_ms: None,
            max_connected: None,
            frequency: None,
            offload: false,
            verbose: false,
        }
    }

    #[test]
    fn test_defaults_pass_through() {
        let config = args().build_config().unwrap();
        assert_eq!(config.roles, vec![Role::Source]);
        assert_eq!(config.codec_interval_ms, 20);
        assert!(!config.offload);
    }

    #[test]
    fn test_flags_override() {
        let args = ServiceArgs {
            control_path: Some("/tmp/ctl".into()),
            data_path: Some("/tmp/data".into()),
            roles: vec![Role::Sink],
            interval_ms: Some(10),
            offload: true,
            ..args()
        };

        let config = args.build_config().unwrap();
        assert_eq!(config.control_path, PathBuf::from("/tmp/ctl"));
        assert_eq!(config.roles, vec![Role::Sink]);
        assert_eq!(config.codec_interval_ms, 10);
        assert!(config.offload);
    }

    #[test]
    fn test_invalid_flags_rejected() {
        let zero = ServiceArgs {
            interval_ms: Some(0),
            ..args()
        };
        assert!(zero.build_config().is_err());

        let negative = ServiceArgs {
            frequency: Some(-1.0),
            ..args()
        };
        assert!(negative.build_config().is_err());
    }
}
