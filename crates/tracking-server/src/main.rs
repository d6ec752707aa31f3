//! Tracking server binary entry point.
//!
//! Usage: tracking-server [serve]
//!        tracking-server redrive [--from email.dlq] [--to email.queue] [--limit 100]

use clap::Parser;
use tracing::{error, info};
use tracking_server::cli::{Args, Command};
use tracking_server::{runtime, ServerConfig, ServerResult};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> ServerResult<()> {
    let args = Args::parse();

    let mut config = ServerConfig::from_env()?;
    args.apply(&mut config);

    observability::init_with_config(observability::LogConfig {
        service_name: "tracking-server".into(),
        default_level: config.log_level.clone(),
        log_path: args.log_file.clone(),
        also_stderr: true,
        ..Default::default()
    });

    config.validate()?;

    info!(
        bind = %config.bind_addr,
        redis = config.redis_url.is_some(),
        buffer_capacity = config.buffer_capacity,
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        consumer = %config.consumer_name,
        "Configuration loaded"
    );

    match args.command() {
        Command::Serve => {
            if let Err(e) = runtime::serve(config, shutdown_signal()).await {
                error!(error = %e, "server exited with error");
                return Err(e);
            }
        }
        Command::Redrive { from, to, limit } => {
            let moved = runtime::redrive(&config, &from, &to, limit).await?;
            info!(from = %from, to = %to, moved, "redrive complete");
        }
    }

    Ok(())
}
