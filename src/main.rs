use std::{process, sync::OnceLock, time::Duration};

use device_agent::{
    config::Config,
    logger::LoggerManager,
    print_error,
    telemetry::{log_commands, log_state_changes, log_will_changes, TelemetryAgent},
};
use device_mqtt::{SessionBuilder, TcpConnector};
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting device-agent version {}...", env!("CARGO_PKG_VERSION"));
    debug!("{:#?}", cfg.transport);
    info!("Log level: {}", cfg.logger.level);

    let connector = TcpConnector::from_config(&cfg.transport);
    let session = SessionBuilder::new(cfg.transport.clone())
        .spawn(connector)
        .unwrap_or_else(|e| {
            error!("Failed to start MQTT session: {}", e);
            process::exit(1);
        });
    info!(
        "MQTT session for {} targeting {}:{}",
        session.client_id(),
        cfg.transport.host,
        cfg.transport.port
    );

    tokio::spawn(log_state_changes(session.subscribe_state()));
    tokio::spawn(log_will_changes(session.subscribe_will()));
    tokio::spawn(log_commands(session.messages()));

    let agent = TelemetryAgent::new(
        session.clone(),
        cfg.telemetry.clone(),
        &cfg.transport.reconnect,
    )
    .unwrap_or_else(|e| {
        error!("Invalid telemetry settings: {}", e);
        process::exit(1);
    });

    info!(
        "Publishing telemetry to '{}' every {}s",
        cfg.telemetry.topic, cfg.telemetry.interval_secs
    );

    tokio::select! {
        result = agent.run() => {
            if let Err(e) = result {
                error!("Telemetry loop stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
            if let Err(e) = session.disconnect().await {
                warn!("Graceful disconnect skipped: {}", e);
            }
        }
    }

    session.shutdown();
    tokio::time::sleep(Duration::from_millis(300)).await;
    info!("Shutdown complete");
    Ok(())
}
