//! Process entry point: resolves configuration, initializes logging, wires
//! the system together, and runs the Manager to completion.

use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

use portbridge::config::RuntimeConfig;
use portbridge::control_channel::ControlChannel;
use portbridge::manager::Manager;
use portbridge::state::State;
use portbridge::status::StatusInterface;
use portbridge::{Error, HostReference};

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn install_signal_bridge(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    cancel.cancel();
}

async fn run() -> Result<(), Error> {
    let config = RuntimeConfig::from_env()?;
    init_logging(&config.log_level);

    let host = HostReference::parse(&config.host_ref_text)?;
    let (channel, recovery_rx) = ControlChannel::new(host.clone(), config.identity_file.clone());
    let channel = Arc::new(channel);

    let state = Arc::new(State::new());
    let status = Arc::new(StatusInterface::new(host, SystemTime::now())?);

    let cancel = CancellationToken::new();

    let socket_task = {
        let status = status.clone();
        let state = state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = status.run_socket(&state, cancel).await {
                error!(error = %e, "status socket task exited with an error");
            }
        })
    };
    let state_file_task = {
        let status = status.clone();
        let state = state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = status.run_state_file_ticker(&state, cancel).await {
                error!(error = %e, "state file ticker exited with an error");
            }
        })
    };

    let signal_task = tokio::spawn(install_signal_bridge(cancel.clone()));

    let health_task = channel
        .clone()
        .spawn_health_monitor(config.health_monitor_interval, cancel.clone());

    let mut manager = Manager::new(
        channel,
        state,
        status,
        recovery_rx,
        config.resync_interval,
        config.label_based_port_discovery,
    );
    let result = manager.run(cancel.clone()).await;

    cancel.cancel();
    let _ = socket_task.await;
    let _ = state_file_task.await;
    health_task.abort();
    signal_task.abort();

    result
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "fatal error");
        eprintln!("portbridge: {e}");
        std::process::exit(1);
    }
}
