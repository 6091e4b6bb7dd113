use clap::Parser;
use std::path::PathBuf;

use castlink_core::config::{Config, ConfigError};
use castlink_core::SourceKind;

#[derive(Parser, Debug)]
#[command(name = "castlink")]
#[command(author = "Castlink Team")]
#[command(version)]
#[command(about = "WebRTC publisher: offers local camera, microphone and screen to viewers", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/castlink.toml")]
    pub config: PathBuf,

    /// Signaling server URL (ws:// or wss://)
    #[arg(short, long)]
    pub signaling_url: Option<String>,

    /// Sources that must be ready before offering (repeatable)
    #[arg(long = "require", value_name = "KIND")]
    pub require: Vec<SourceKind>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    /// Load the config file and apply command line overrides
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        let mut config = Config::load(&self.config)?;
        if let Some(url) = &self.signaling_url {
            config.signaling.url = url.clone();
        }
        if !self.require.is_empty() {
            config.capture.required = self.require.clone();
            config.capture.optional.retain(|kind| !self.require.contains(kind));
        }
        config.validate()?;
        Ok(config)
    }
}
