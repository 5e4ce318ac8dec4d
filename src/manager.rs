//! Orchestrates startup reconciliation, event ingestion, periodic resync,
//! health supervision, and graceful teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::control_channel::ControlChannel;
use crate::error::Error;
use crate::event_source::{self, EventKind};
use crate::reconciler;
use crate::state::{safe_log_id, State};
use crate::status::StatusInterface;

const REMOTE_RUNTIME: &str = "docker";
const EVENT_SOURCE_BACKOFF_CAP: Duration = Duration::from_secs(30);
const EVENT_SOURCE_BACKOFF_BASE: Duration = Duration::from_secs(1);
const TEARDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Everything the Manager needs wired up before `run` is called.
pub struct Manager {
    channel: Arc<ControlChannel>,
    state: Arc<State>,
    status: Arc<StatusInterface>,
    recovery_rx: mpsc::Receiver<()>,
    resync_interval: Duration,
    label_based_port_discovery: bool,
}

impl Manager {
    pub fn new(
        channel: Arc<ControlChannel>,
        state: Arc<State>,
        status: Arc<StatusInterface>,
        recovery_rx: mpsc::Receiver<()>,
        resync_interval: Duration,
        label_based_port_discovery: bool,
    ) -> Self {
        Self {
            channel,
            state,
            status,
            recovery_rx,
            resync_interval,
            label_based_port_discovery,
        }
    }

    /// Startup reconciliation: query remote for the currently running
    /// containers and their published ports, seed desired state, reconcile
    /// once.
    async fn resync(&self) {
        match remote_inspect(&self.channel, self.label_based_port_discovery).await {
            Ok(containers) => {
                for (container, ports) in containers {
                    self.state.set_desired(container, ports);
                }
                self.reconcile_once().await;
            }
            Err(e) => {
                error!(error = %e, "remote inspect failed during resync");
            }
        }
    }

    async fn reconcile_once(&self) {
        let plan = reconciler::diff(&self.state);
        if let Err(e) = reconciler::apply(&self.state, self.channel.as_ref(), &plan).await {
            warn!(error = %e, "reconcile apply returned an error; other actions still applied");
        }
        if let Err(e) = self.status.refresh_state_file(&self.state) {
            warn!(error = %e, "status refresh after reconcile failed");
        }
    }

    async fn handle_start(&self, container: &str) {
        match remote_inspect_one(&self.channel, container, self.label_based_port_discovery).await {
            Ok(ports) => {
                self.state.set_desired(container.to_string(), ports);
                self.reconcile_once().await;
            }
            Err(e) => {
                warn!(
                    container = safe_log_id(container),
                    error = %e,
                    "remote-inspect for start event failed"
                );
            }
        }
    }

    async fn handle_stop_or_die(&self, container: &str) {
        self.state.set_desired(container.to_string(), Vec::new());
        self.reconcile_once().await;
    }

    /// Drive the whole process until `cancel` fires, then tear down.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), Error> {
        self.channel.open().await?;
        self.resync().await;

        let mut resync_ticker = tokio::time::interval(self.resync_interval);
        resync_ticker.tick().await; // consume the immediate first tick

        let mut backoff = EVENT_SOURCE_BACKOFF_BASE;
        let (mut events_rx, mut errors_rx) = event_source::spawn(self.channel.clone(), REMOTE_RUNTIME)?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = resync_ticker.tick() => {
                    info!("periodic resync");
                    self.resync().await;
                }

                Some(()) = self.recovery_rx.recv() => {
                    info!("control channel recovered; invalidating actual state and forcing full resync");
                    self.state.invalidate_all_actual();
                    self.resync().await;
                }

                event = events_rx.recv() => {
                    match event {
                        Some(event) => {
                            backoff = EVENT_SOURCE_BACKOFF_BASE;
                            match event.kind {
                                EventKind::Start => self.handle_start(&event.container).await,
                                EventKind::Die | EventKind::Stop => {
                                    self.handle_stop_or_die(&event.container).await
                                }
                            }
                        }
                        None => {
                            warn!(?backoff, "event source channel closed; restarting after backoff");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(EVENT_SOURCE_BACKOFF_CAP);
                            match event_source::spawn(self.channel.clone(), REMOTE_RUNTIME) {
                                Ok((new_events, new_errors)) => {
                                    events_rx = new_events;
                                    errors_rx = new_errors;
                                }
                                Err(e) => error!(error = %e, "failed to restart event source"),
                            }
                        }
                    }
                }

                Some(err) = errors_rx.recv() => {
                    warn!(error = %err, "event source reported an error");
                }
            }
        }

        self.teardown().await;
        Ok(())
    }

    /// Clear desired state for every known container, reconcile with a
    /// deadline, close the control channel, remove both status transports.
    /// Idempotent and tolerant of partial failure.
    async fn teardown(&self) {
        info!("tearing down");
        for container in self.state.all_containers() {
            self.state.set_desired(container, Vec::new());
        }

        let plan = reconciler::diff(&self.state);
        let apply = reconciler::apply(&self.state, self.channel.as_ref(), &plan);
        match tokio::time::timeout(TEARDOWN_DEADLINE, apply).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "teardown reconcile reported an error"),
            Err(_) => warn!("teardown reconcile exceeded its deadline"),
        }

        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "control channel close reported an error");
        }

        self.status.remove();
    }
}

#[derive(Debug, Deserialize)]
struct InspectMapping {
    #[serde(rename = "ContainerID")]
    container_id: Option<String>,
    #[serde(rename = "Ports")]
    ports: Option<Vec<u16>>,
}

/// Parse the remote inspect command's output. Accepts both a JSON
/// list-of-mappings form and a flat `containerID port` line-pair form;
/// surfaces only ports with a valid numeric value.
fn parse_inspect_output(raw: &[u8]) -> HashMap<String, Vec<u16>> {
    let text = String::from_utf8_lossy(raw);
    let mut result: HashMap<String, Vec<u16>> = HashMap::new();

    if let Ok(mappings) = serde_json::from_str::<Vec<InspectMapping>>(text.trim()) {
        for mapping in mappings {
            if let Some(id) = mapping.container_id {
                result.entry(id).or_default().extend(mapping.ports.unwrap_or_default());
            }
        }
        return result;
    }

    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let (Some(id), Some(port_str)) = (parts.next(), parts.next()) else {
            continue;
        };
        if let Ok(port) = port_str.parse::<u16>() {
            result.entry(id.to_string()).or_default().push(port);
        }
    }

    result
}

async fn remote_inspect(
    channel: &ControlChannel,
    label_based_port_discovery: bool,
) -> Result<Vec<(String, Vec<u16>)>, Error> {
    let command = inspect_command(REMOTE_RUNTIME, label_based_port_discovery);
    let output = channel.run_remote_command(command).await?;
    Ok(parse_inspect_output(&output).into_iter().collect())
}

async fn remote_inspect_one(
    channel: &ControlChannel,
    container: &str,
    label_based_port_discovery: bool,
) -> Result<Vec<u16>, Error> {
    let all = remote_inspect(channel, label_based_port_discovery).await?;
    Ok(all
        .into_iter()
        .find(|(id, _)| id == container)
        .map(|(_, ports)| ports)
        .unwrap_or_default())
}

/// Build the remote-inspect command line. When `label_based_port_discovery`
/// is set, ports are additionally sourced from container labels named
/// `<appprefix>.forward.*` rather than published-port metadata alone; this
/// never changes Reconciler/State semantics, only the desired-port source.
fn inspect_command(runtime: &str, label_based_port_discovery: bool) -> Vec<String> {
    let mut args = vec![
        runtime.to_string(),
        "ps".to_string(),
        "--format".to_string(),
        "{{.ID}} {{.Ports}}".to_string(),
    ];
    if label_based_port_discovery {
        args.push("--filter".to_string());
        args.push("label=portbridge.forward".to_string());
    }
    args
}
