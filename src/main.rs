//! # SCO Bridge - Main Application Entry Point
//!
//! Bridges the audio of a Bluetooth hands-free call between the kernel's SCO
//! socket and the host's playback/capture devices.
//!
//! ## Application Architecture:
//! - **config**: layered settings (defaults, `sco-bridge.toml`, environment)
//! - **agent**: oFono audio agent registration and notification dispatch
//! - **session**: the single active call and its teardown rules
//! - **link**: SCO socket access and the connection handshake
//! - **stream**: the receive and transmit workers
//! - **audio**: mSBC framing, jitter buffer, codec transform, host devices
//! - **state**: process-wide counters
//! - **error**: error types shared by the above
//!
//! ## Startup:
//! 1. Load and validate configuration, set up logging
//! 2. Switch the adapter to transparent voice (wideband is disabled if this fails)
//! 3. Look for the SBC transform
//! 4. Register with the call-control service and dispatch until a signal arrives

mod agent;
mod audio;
mod config;
mod error;
mod link;
mod session;
mod state;
mod stream;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use config::BridgeConfig;
use state::BridgeMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent::ofono::OfonoClient;
use agent::RegisterPolicy;
use audio::device::CommandDevices;
use session::{SessionController, SessionSettings};

/// Set by the signal handlers, polled by the dispatcher thread.
///
/// ## Rust Concepts:
/// - A `static` atomic needs no `Arc`: the blocking dispatcher borrows it as
///   `&'static AtomicBool` while the async side only ever stores `true`
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = BridgeConfig::load()?;
    config.validate()?;

    info!("Starting sco-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        service = %config.agent.service,
        agent_path = %config.agent.agent_path,
        "Configuration loaded"
    );

    let transparent_voice = link::apply_voice_setting(&config.link).await;
    let transforms = if !config.agent.wideband {
        info!("Wideband disabled by configuration");
        None
    } else if !transparent_voice {
        warn!("Adapter voice setting not applied, offering narrowband only");
        None
    } else {
        let detected = audio::transform::detect();
        if detected.is_none() {
            warn!("No SBC transform available, offering narrowband only");
        }
        detected
    };

    let metrics = BridgeMetrics::new();
    let mut controller = SessionController::new(
        Arc::new(CommandDevices::from_config(&config.audio)),
        transforms,
        SessionSettings::from_config(&config),
        metrics.clone(),
    );

    setup_signal_handlers();

    let policy = RegisterPolicy::from(&config.agent);
    let mut bus = OfonoClient::new(&config.agent);
    let mut dispatcher = tokio::task::spawn_blocking(move || {
        agent::run(
            &mut bus,
            &mut controller,
            &policy,
            &SHUTDOWN_SIGNAL,
            agent::BUS_POLL_INTERVAL,
        )
    });

    let result = tokio::select! {
        result = &mut dispatcher => result,
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping dispatcher...");
            dispatcher.await
        }
    };

    let snapshot = metrics.snapshot();
    info!(
        uptime_seconds = metrics.uptime_seconds(),
        sessions_started = snapshot.sessions_started,
        sessions_preempted = snapshot.sessions_preempted,
        sessions_reaped = snapshot.sessions_reaped,
        connections_refused = snapshot.connections_refused,
        rx_frames = snapshot.rx_frames,
        tx_frames = snapshot.tx_frames,
        silence_chunks = snapshot.silence_chunks,
        "Bridge totals"
    );

    match result.context("Dispatcher task failed")? {
        Ok(()) => {
            info!("Bridge stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Bridge stopped with a fatal error");
            Err(e.into())
        }
    }
}

/// Initialize tracing; `RUST_LOG` overrides the default `sco_bridge=debug`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sco_bridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Set the shutdown flag on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Resolve once the shutdown flag is set.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
