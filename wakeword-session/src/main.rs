/// Wake-word session service binary
///
/// Opens the default microphone, listens for the configured patterns and
/// logs every wake flag change until interrupted.

use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info};
use wakeword_session::audio::cpal_backend::{CpalGraph, CpalMicrophone};
use wakeword_session::{
    DetectionLog, LevelEngineFactory, SessionBackends, SessionConfig, SessionController,
    WakeFlagStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakeword_session=debug".parse()?),
        )
        .init();

    info!("Starting AetherOS wake-word session service v{}", wakeword_session::VERSION);

    let config = SessionConfig::load().context("Failed to load configuration")?;

    let wake_flag = Arc::new(WakeFlagStore::with_reset_delay(config.wake_flag_reset()));
    let log = Arc::new(match config.log_capacity {
        Some(capacity) => DetectionLog::with_capacity(capacity),
        None => DetectionLog::new(),
    });

    let controller = SessionController::new(
        SessionBackends {
            microphone: Arc::new(CpalMicrophone),
            graph: Arc::new(CpalGraph::new(config.capture.device_name.clone())),
            engines: Arc::new(LevelEngineFactory),
        },
        Arc::clone(&log),
        Arc::clone(&wake_flag),
    );

    if let Err(e) = controller.start(config.start_options()).await {
        error!("Failed to start listening: {}", e);
        return Err(e.into());
    }

    let names: Vec<&str> = config.patterns.iter().map(|p| p.name.as_str()).collect();
    info!("Listening for {:?}. Press Ctrl-C to stop.", names);

    let mut flag = wake_flag.subscribe();
    loop {
        tokio::select! {
            changed = flag.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = flag.borrow_and_update().clone();
                info!(
                    "Wake flag: detected={} last={}",
                    state.detected,
                    state.last_detection_text.as_deref().unwrap_or("-")
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
        }
    }

    controller.stop().await;
    wake_flag.shutdown();

    info!("{} detection(s) this run", log.len());
    info!("Wake-word session service stopped");

    Ok(())
}
