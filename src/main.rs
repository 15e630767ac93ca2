//! DevProxy daemon entry point.

use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use devproxy::caddy::{CaddyClient, ConfigBuilder};
use devproxy::config::Config;
use devproxy::discovery::Discovery;
use devproxy::manager::{Manager, ManagerSettings};
use devproxy::runtime::DockerRuntime;

#[tokio::main]
async fn main() -> ExitCode {
    // Container health check.
    if std::env::args().nth(1).as_deref() == Some("--health") {
        println!("healthy");
        return ExitCode::SUCCESS;
    }

    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cfg.log_level))
        .init();
    info!("Starting DevProxy with config: {:?}", cfg);

    match run(cfg).await {
        Ok(()) => {
            info!("DevProxy stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Manager failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let runtime = DockerRuntime::connect(cfg.docker_host.as_deref(), cfg.event_buffer)?;
    let caddy = CaddyClient::new(
        cfg.caddy_admin_url.clone(),
        cfg.request_timeout(),
        cfg.probe_interval(),
    )?;

    let manager = Manager::new(
        Arc::new(runtime),
        Arc::new(caddy),
        Discovery::new(cfg.domain_suffix.clone()),
        ConfigBuilder::new(cfg.domain_suffix.clone()),
        ManagerSettings {
            ready_retries: cfg.ready_retries,
        },
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    manager.run(cancel).await?;
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                error!("Unable to listen for shutdown signal: {}", err);
                return;
            }
        }
        _ = terminate => {}
    }

    info!("Received shutdown signal, shutting down...");
    cancel.cancel();
}
