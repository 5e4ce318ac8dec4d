//! In-memory `ForwardChannel` used to drive a full reconcile cycle in tests
//! without a real ssh control master.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Error;

use super::ForwardChannel;

#[derive(Default)]
struct FakeState {
    forwarded: Vec<(u16, u16)>,
    cancelled: Vec<(u16, u16)>,
    fail_next: HashMap<u16, u32>,
}

/// Records every `forward`/`cancel` call in memory. `fail_forward_next` lets
/// a test make the next N forward attempts for a port fail with a retryable
/// port-in-use error, exercising the reconciler's retry path.
#[derive(Clone, Default)]
pub struct FakeControlChannel {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeControlChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `attempts` calls to `forward` for `port` fail as a
    /// retryable port-in-use error before succeeding.
    pub fn fail_forward_next(&self, port: u16, attempts: u32) {
        self.inner.lock().fail_next.insert(port, attempts);
    }

    pub fn forwarded_ports(&self) -> Vec<(u16, u16)> {
        self.inner.lock().forwarded.clone()
    }

    pub fn cancelled_ports(&self) -> Vec<(u16, u16)> {
        self.inner.lock().cancelled.clone()
    }
}

#[async_trait]
impl ForwardChannel for FakeControlChannel {
    async fn forward(&self, local_port: u16, remote_port: u16) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if let Some(remaining) = inner.fail_next.get_mut(&local_port) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Forward {
                    message: "fake: address already in use".to_string(),
                    retryable: true,
                });
            }
        }
        inner.forwarded.push((local_port, remote_port));
        Ok(())
    }

    async fn cancel(&self, local_port: u16, remote_port: u16) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        inner.forwarded.retain(|&(l, r)| !(l == local_port && r == remote_port));
        inner.cancelled.push((local_port, remote_port));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forward_is_recorded_and_cancel_removes_it() {
        let channel = FakeControlChannel::new();
        channel.forward(18080, 80).await.unwrap();
        assert_eq!(channel.forwarded_ports(), vec![(18080, 80)]);

        channel.cancel(18080, 80).await.unwrap();
        assert!(channel.forwarded_ports().is_empty());
        assert_eq!(channel.cancelled_ports(), vec![(18080, 80)]);
    }

    #[tokio::test]
    async fn fail_forward_next_fails_the_configured_attempt_count() {
        let channel = FakeControlChannel::new();
        channel.fail_forward_next(80, 2);
        assert!(channel.forward(80, 80).await.is_err());
        assert!(channel.forward(80, 80).await.is_err());
        assert!(channel.forward(80, 80).await.is_ok());
    }
}
