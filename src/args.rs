use callcore::config::{self, CaptureSource};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "callcore")]
#[command(version = "0.1.0")]
#[command(about = "Loopback call between two local parties", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "callcore.toml")]
    pub config: PathBuf,

    /// Calling party
    #[arg(long, default_value = "alice")]
    pub caller: String,

    /// Called party
    #[arg(long, default_value = "bob")]
    pub callee: String,

    /// Place an audio+video call
    #[arg(long, action)]
    pub video: bool,

    /// Seconds to stay connected before hanging up (0 = until Ctrl-C)
    #[arg(long, default_value = "10")]
    pub duration: u64,

    /// Seconds to wait for the call to connect
    #[arg(long, default_value = "15")]
    pub connect_timeout: u64,

    /// Let the callee decline instead of answering
    #[arg(long, action)]
    pub decline: bool,

    /// Capture source (silence or device)
    #[arg(long)]
    pub source: Option<String>,

    /// Disconnect grace window in milliseconds
    #[arg(long)]
    pub grace_ms: Option<u64>,

    /// STUN host override
    #[arg(long)]
    pub stun_host: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Apply command line overrides on top of the file configuration
    pub fn apply_overrides(&self, config: &mut config::Config) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(source) = &self.source {
            config.media.source = match source.as_str() {
                "silence" => CaptureSource::Silence,
                "device" => CaptureSource::Device,
                other => return Err(format!("Unknown capture source: {}", other).into()),
            };
        }
        if let Some(grace_ms) = self.grace_ms {
            config.call.disconnect_grace_ms = grace_ms;
        }
        if let Some(host) = &self.stun_host {
            config.webrtc.stun_host = host.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_file_values() {
        let args = Args::parse_from(["callcore", "--source", "device", "--grace-ms", "2500"]);
        let mut config = config::Config::default();
        args.apply_overrides(&mut config).unwrap();
        assert_eq!(config.media.source, CaptureSource::Device);
        assert_eq!(config.call.disconnect_grace_ms, 2500);
    }

    #[test]
    fn unknown_source_is_rejected() {
        let args = Args::parse_from(["callcore", "--source", "webcam"]);
        assert!(args.apply_overrides(&mut config::Config::default()).is_err());
    }
}
