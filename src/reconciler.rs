//! Computes an ordered action plan (removals then additions) from desired
//! vs actual state, applies it through the control channel, and enforces
//! retry/backoff and conflict policy.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use crate::control_channel::ForwardChannel;
use crate::error::Error;
use crate::probe;
use crate::state::{safe_log_id, HistoryEntry, State, Status};

const MAX_ADD_ATTEMPTS: u32 = 5;
const ADD_BACKOFF_CAP: Duration = Duration::from_secs(10);
const ADD_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// One entry of the action plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Add { container: String, port: u16 },
    Remove { container: String, port: u16 },
}

/// The ordered plan a diff produces: removals first, then additions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub to_remove: Vec<Action>,
    pub to_add: Vec<Action>,
}

/// Diff the desired map against the active subset of actual state.
///
/// For every desired `(container, port)`: unowned -> add; owned by the same
/// container -> no-op; owned by a different container -> remove the old
/// owner then add the new one (last-writer-wins). Every active
/// `(container, port)` absent from desired is removed.
pub fn diff(state: &State) -> Plan {
    let desired = state.get_desired();
    let actual = state.get_actual();

    let mut desired_map: HashMap<&str, &[u16]> = HashMap::new();
    for (container, ports) in &desired {
        desired_map.insert(container.as_str(), ports.as_slice());
    }

    let mut port_owner: HashMap<u16, &str> = HashMap::new();
    for entry in &actual {
        if entry.status == Status::Active {
            port_owner.insert(entry.port, entry.container.as_str());
        }
    }

    let mut to_add = Vec::new();
    let mut to_remove = Vec::new();
    let mut removed: std::collections::HashSet<(String, u16)> = std::collections::HashSet::new();

    for (container, ports) in &desired {
        for &port in ports {
            match port_owner.get(&port) {
                None => to_add.push(Action::Add {
                    container: container.clone(),
                    port,
                }),
                Some(owner) if *owner == container.as_str() => {
                    // idempotent: already owned by this container
                }
                Some(owner) => {
                    let owner = owner.to_string();
                    if removed.insert((owner.clone(), port)) {
                        to_remove.push(Action::Remove {
                            container: owner,
                            port,
                        });
                    }
                    to_add.push(Action::Add {
                        container: container.clone(),
                        port,
                    });
                }
            }
        }
    }

    for entry in &actual {
        if entry.status != Status::Active {
            continue;
        }
        let still_desired = desired_map
            .get(entry.container.as_str())
            .map(|ports| ports.contains(&entry.port))
            .unwrap_or(false);
        if !still_desired && removed.insert((entry.container.clone(), entry.port)) {
            to_remove.push(Action::Remove {
                container: entry.container.clone(),
                port: entry.port,
            });
        }
    }

    Plan { to_remove, to_add }
}

fn add_backoff_delay(attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    let millis = ADD_BACKOFF_BASE.as_millis() as u64;
    let delay = millis.saturating_mul(factor);
    Duration::from_millis(delay).min(ADD_BACKOFF_CAP)
}

/// Retry a single add up to `MAX_ADD_ATTEMPTS` times, backing off between
/// attempts, but only when the failure is a documented port-in-use error.
async fn add_with_retry<C: ForwardChannel>(channel: &C, container: &str, port: u16) -> Result<(), Error> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match channel.forward(port, port).await {
            Ok(()) => return Ok(()),
            Err(Error::Forward { message, retryable }) if retryable && attempt < MAX_ADD_ATTEMPTS => {
                warn!(
                    container = safe_log_id(container),
                    port,
                    attempt,
                    "add retrying after port-in-use"
                );
                let _ = message;
                tokio::time::sleep(add_backoff_delay(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Apply a plan: execute all removes, then all adds, preserving within-list
/// order. Returns the first error encountered but always processes every
/// action (no single failing port blocks another).
pub async fn apply<C: ForwardChannel>(state: &State, channel: &C, plan: &Plan) -> Result<(), Error> {
    let mut first_error = None;

    for action in &plan.to_remove {
        let Action::Remove { container, port } = action else {
            continue;
        };
        let still_active = state
            .get_by_container(container)
            .into_iter()
            .any(|e| e.port == *port && e.status == Status::Active);
        if !still_active {
            continue;
        }

        let cancel_result = channel.cancel(*port, *port).await;
        if let Err(e) = &cancel_result {
            warn!(
                container = safe_log_id(container),
                port,
                error = %e,
                "cancel returned an error; removing locally regardless"
            );
        }

        let reclaimed_by = plan.to_add.iter().find_map(|a| match a {
            Action::Add {
                container: new_owner,
                port: new_port,
            } if new_port == port && new_owner != container => Some(new_owner.clone()),
            _ => None,
        });

        let end_reason = match reclaimed_by {
            Some(new_owner) => format!("port claimed by {}", safe_log_id(&new_owner)),
            None => "container stopped".to_string(),
        };

        if let Some(entry) = state
            .get_by_container(container)
            .into_iter()
            .find(|e| e.port == *port)
        {
            state.push_history(HistoryEntry {
                container: container.clone(),
                port: *port,
                created_at: entry.created_at,
                ended_at: SystemTime::now(),
                end_reason,
                final_status: entry.status,
            });
        }

        state.clear_port(container, *port);
    }

    for action in &plan.to_add {
        let Action::Add { container, port } = action else {
            continue;
        };
        let already_active = state
            .get_by_container(container)
            .into_iter()
            .any(|e| e.port == *port && e.status == Status::Active);
        if already_active {
            continue;
        }

        match add_with_retry(channel, container, *port).await {
            Ok(()) => match probe::probe(*port).await {
                Ok(()) => {
                    state.mark_active(container, *port);
                    info!(container = safe_log_id(container), port, "forward active");
                }
                Err(e) => {
                    warn!(
                        container = safe_log_id(container),
                        port,
                        error = %e,
                        "forward created but probe failed"
                    );
                    state.mark_pending(container, *port, e.to_string());
                }
            },
            Err(e) => {
                warn!(
                    container = safe_log_id(container),
                    port,
                    error = %e,
                    "add exhausted retries"
                );
                state.mark_conflict(container, *port, e.to_string());
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
