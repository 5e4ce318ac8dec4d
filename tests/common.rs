use std::path::PathBuf;

use portbridge::control_channel::ControlChannel;
use portbridge::HostReference;

/// The destination these integration tests dial. Mirrors the crate's own
/// env-var conventions; override with `TEST_HOST` to point at a different
/// sshd (the default assumes a local test server on port 2222, the same
/// convention used by the crate's own CI fixture).
pub fn addr() -> String {
    std::env::var("TEST_HOST").unwrap_or_else(|_| "ssh://test-user@127.0.0.1:2222".to_string())
}

pub fn host() -> HostReference {
    HostReference::parse(&addr()).expect("TEST_HOST must be a valid ssh:// reference")
}

pub fn identity_file() -> Option<PathBuf> {
    std::env::var_os("TEST_IDENTITY_FILE").map(PathBuf::from)
}

/// Build and open a control channel against the test host. Panics (failing
/// the test) if no sshd is reachable; these tests are integration tests and
/// require one, exactly as the crate's own upstream tests do.
pub async fn open_channel() -> ControlChannel {
    let (channel, _recovery_rx) = ControlChannel::new(host(), identity_file());
    channel.open().await.expect("failed to open control channel against TEST_HOST");
    channel
}
