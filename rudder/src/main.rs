use std::process::ExitCode;
use std::sync::Arc;

use clap::error::ErrorKind;
use prometheus_client::registry::Registry;
use rudder::{
    Result,
    config::{self, Config, ConfigError},
    controller, http,
};
use rudder_reconciler::ReconciliationMetrics;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match config::load() {
        Ok(config) => config,
        Err(ConfigError::Flags(e))
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) =>
        {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            setup_subscriber(false);
            error!("failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    setup_subscriber(config.debug);
    info!(
        env = %config.env,
        debug = config.debug,
        metrics_addr = ?config.metrics_addr,
        probe_addr = ?config.probe_addr,
        leader_election = config.leader_election,
        port = config.port,
        enable_webhooks = config.enable_webhooks,
        "loaded config"
    );

    run(config).await
}

async fn run(config: Config) -> ExitCode {
    let mut registry = Registry::with_prefix("rudder");
    let metrics = ReconciliationMetrics::default().register(&mut registry);
    let registry = Arc::new(registry);

    let config = Arc::new(config);
    let ready = CancellationToken::new();
    let cancel = CancellationToken::new();

    let mut metrics_handle = tokio::spawn(http::serve_metrics(
        config.metrics_addr.clone(),
        registry,
        cancel.child_token(),
    ));
    let mut probes_handle = tokio::spawn(http::serve_probes(
        config.probe_addr.clone(),
        ready.clone(),
        cancel.child_token(),
    ));
    let mut controller_handle = {
        let config = config.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move { controller::start(&config, metrics, ready, cancel).await })
    };
    let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });

    // watch for shutdown and errors
    let ok = tokio::select! {
        h = &mut metrics_handle => exit("metrics", h),
        h = &mut probes_handle => exit("probes", h),
        h = &mut controller_handle => exit("controller", h),
        _ = &mut shutdown_handle => {
            cancel.cancel();
            let (metrics, probes, controller) =
                tokio::join!(metrics_handle, probes_handle, controller_handle);
            [exit("metrics", metrics), exit("probes", probes), exit("controller", controller)]
                .into_iter()
                .all(|ok| ok)
        },
    };
    cancel.cancel();
    info!("Exiting...");
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn setup_subscriber(debug: bool) {
    let default = if debug {
        "rudder=debug,rudder_reconciler=debug,rudder_pod_controller=debug"
    } else {
        "rudder=info,rudder_reconciler=info,rudder_pod_controller=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {
            info!("captured ctrl_c signal");
        },
        _ = terminate => {
            info!("captured terminate signal");
        },
    }
}

fn exit(task: &str, out: std::result::Result<Result<()>, JoinError>) -> bool {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited");
            true
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}");
            false
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}");
            false
        }
    }
}
