//! Streams container lifecycle events from the remote runtime through the
//! control channel: one JSON object per line, `start`/`die`/`stop` only.

use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::control_channel::ControlChannel;
use crate::error::Error;

const EVENTS_CHANNEL_CAPACITY: usize = 10;
const ERRORS_CHANNEL_CAPACITY: usize = 1;

/// The three lifecycle event kinds the core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Die,
    Stop,
}

impl EventKind {
    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "start" => Some(EventKind::Start),
            "die" => Some(EventKind::Die),
            "stop" => Some(EventKind::Stop),
            _ => None,
        }
    }
}

/// A single parsed lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub container: String,
    pub timestamp: i64,
}

/// One line of the remote events wire format. `action` takes precedence
/// over the legacy `status` field; anything other than `container`-typed
/// `start`/`die`/`stop` is silently dropped.
#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "Type")]
    r#type: Option<String>,
    #[serde(rename = "Action")]
    action: Option<String>,
    status: Option<String>,
    #[serde(rename = "Actor")]
    actor: Option<WireActor>,
    time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireActor {
    #[serde(rename = "ID")]
    id: Option<String>,
}

fn parse_line(line: &str) -> Option<Event> {
    let wire: WireEvent = match serde_json::from_str(line) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "dropping unparseable event line");
            return None;
        }
    };

    if wire.r#type.as_deref() != Some("container") {
        return None;
    }

    let action = wire.action.or(wire.status)?;
    let kind = EventKind::from_wire(&action)?;
    let container = wire.actor?.id?;
    let timestamp = wire.time.unwrap_or(0);

    Some(Event {
        kind,
        container,
        timestamp,
    })
}

/// The command line executed remotely, in token form, ready for
/// [`ControlChannel::spawn_streaming_command`].
fn events_command(runtime: &str) -> Vec<String> {
    vec![
        runtime.to_string(),
        "events".to_string(),
        "--format={{json .}}".to_string(),
        "--filter".to_string(),
        "type=container".to_string(),
        "--filter".to_string(),
        "event=start".to_string(),
        "--filter".to_string(),
        "event=die".to_string(),
        "--filter".to_string(),
        "event=stop".to_string(),
    ]
}

/// Spawn the remote events subprocess and stream its lines into bounded
/// channels. Both channels close when: the subprocess exits cleanly, exits
/// with an error (the error is delivered to the errors channel first), or
/// `cancel` is dropped/cancelled by the caller's task being aborted.
pub fn spawn(
    channel: Arc<ControlChannel>,
    runtime: &str,
) -> Result<(mpsc::Receiver<Event>, mpsc::Receiver<Error>), Error> {
    let mut child = channel.spawn_streaming_command(events_command(runtime))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::EventStream("remote events subprocess had no stdout".into()))?;

    let (events_tx, events_rx) = mpsc::channel(EVENTS_CHANNEL_CAPACITY);
    let (errors_tx, errors_rx) = mpsc::channel(ERRORS_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Some(event) = parse_line(&line) {
                        debug!(container = %event.container, kind = ?event.kind, "event received");
                        if events_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    let status = child.wait().await;
                    if let Ok(status) = status {
                        if !status.success() {
                            let _ = errors_tx
                                .send(Error::EventStream(format!(
                                    "remote events subprocess exited with {status}"
                                )))
                                .await;
                        }
                    }
                    break;
                }
                Err(e) => {
                    let _ = errors_tx
                        .send(Error::EventStream(format!("event line read failed: {e}")))
                        .await;
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    break;
                }
            }
        }
    });

    Ok((events_rx, errors_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_action_field() {
        let line = r#"{"Type":"container","Action":"start","Actor":{"ID":"abc123"},"time":1000}"#;
        let event = parse_line(line).unwrap();
        assert_eq!(event.kind, EventKind::Start);
        assert_eq!(event.container, "abc123");
        assert_eq!(event.timestamp, 1000);
    }

    #[test]
    fn legacy_status_field_used_when_action_absent() {
        let line = r#"{"Type":"container","status":"die","Actor":{"ID":"abc123"},"time":2000}"#;
        let event = parse_line(line).unwrap();
        assert_eq!(event.kind, EventKind::Die);
    }

    #[test]
    fn action_field_takes_precedence_over_status() {
        let line = r#"{"Type":"container","Action":"stop","status":"start","Actor":{"ID":"x"},"time":1}"#;
        let event = parse_line(line).unwrap();
        assert_eq!(event.kind, EventKind::Stop);
    }

    #[test]
    fn non_container_type_is_dropped() {
        let line = r#"{"Type":"network","Action":"connect","Actor":{"ID":"x"},"time":1}"#;
        assert!(parse_line(line).is_none());
    }

    #[test]
    fn unrecognized_action_is_dropped() {
        let line = r#"{"Type":"container","Action":"pause","Actor":{"ID":"x"},"time":1}"#;
        assert!(parse_line(line).is_none());
    }

    #[test]
    fn malformed_json_is_dropped_not_panicked() {
        assert!(parse_line("not json at all").is_none());
    }

    #[test]
    fn events_command_filters_to_three_kinds() {
        let args = events_command("docker");
        assert_eq!(args[0], "docker");
        assert!(args.contains(&"event=start".to_string()));
        assert!(args.contains(&"event=die".to_string()));
        assert!(args.contains(&"event=stop".to_string()));
    }
}
