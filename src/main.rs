mod cleanup;
mod config;
mod error;
mod facade;
mod manager;
mod messages;
mod registry;
mod room;
mod session;
mod signaling;

use config::Config;
use manager::Manager;
use room::RoomEventSink;
use signaling::SignalingServer;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    let local_ip = config::get_local_ip();
    let listen_host = config.listen_host.clone();
    let listen_port = config.listen_port;

    tracing::info!(%local_ip, %listen_host, listen_port, "starting sfu room core");

    let manager = match Manager::new(config).await {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!(error = %e, "failed to start media worker pool");
            return ExitCode::from(1);
        }
    };

    let signaling = Arc::new(SignalingServer::new(manager.clone()));
    manager.set_sink(signaling.clone() as Arc<dyn RoomEventSink>);

    tracing::info!("signaling server ready for connections");

    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
        tracing::info!("shutdown signal received");
    };

    tokio::select! {
        result = signaling.run(&listen_host, listen_port) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "signaling server exited with an error");
                return ExitCode::from(1);
            }
        }
        _ = shutdown => {}
    }

    ExitCode::from(0)
}
