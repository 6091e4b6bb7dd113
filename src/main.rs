//! castlink - Main entry point
//!
//! Runs the publisher service until interrupted or until it can no longer
//! make progress.

mod args;

use args::Args;
use castlink_core::{HostNotification, ServiceDeps, ServiceLifecycle};
use clap::Parser;
use log::{error, info, warn};
use std::process::ExitCode;
use tokio::signal;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let loaded = args.load_config();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = match (&loaded, args.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(config), false) => config.logging.level.clone(),
        (Err(_), false) => "info".to_string(),
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("CASTLINK_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("castlink v{}", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Ok(config) => {
            info!("Loaded configuration from {:?}", args.config);
            config
        }
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let deps = ServiceDeps::production(&config);
    let (service, mut notifications) = match ServiceLifecycle::start(config, deps) {
        Ok(started) => started,
        Err(e) => {
            error!("Failed to start service: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut exit = ExitCode::SUCCESS;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            notification = notifications.recv() => match notification {
                Some(HostNotification::PermissionOrCaptureError { sources, fatal: true }) => {
                    error!("Capture sources {:?} unavailable; nothing to publish", sources);
                    exit = ExitCode::FAILURE;
                    break;
                }
                Some(HostNotification::PermissionOrCaptureError { sources, fatal: false }) => {
                    warn!("Capture sources {:?} unavailable; viewers will wait", sources);
                }
                Some(HostNotification::SignalingUnavailable { attempts }) => {
                    error!("Signaling server unreachable after {} attempts", attempts);
                    exit = ExitCode::FAILURE;
                    break;
                }
                None => break,
            },
        }
    }

    info!("Initiating graceful shutdown...");
    let report = service.stop().await;
    for e in &report.errors {
        warn!("Shutdown: {}", e);
    }
    exit
}
