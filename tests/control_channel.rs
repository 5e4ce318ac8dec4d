mod common;

use portbridge::control_channel::ControlChannel;

/// Opening, checking, and closing a control channel against a real sshd.
#[tokio::test]
async fn open_check_close_round_trip() {
    let (channel, _recovery_rx) = ControlChannel::new(common::host(), common::identity_file());
    channel.open().await.expect("open should succeed against TEST_HOST");
    channel.check().await.expect("freshly opened channel should report alive");
    channel.close().await.expect("close should succeed");
}

/// A forward can be created and torn down, and the local port accepts a
/// loopback connection in between.
#[tokio::test]
async fn forward_then_cancel() {
    let channel = common::open_channel().await;
    let port = 19321;

    channel
        .forward(port, 22)
        .await
        .expect("forward to the test sshd's own port should succeed");

    portbridge::probe::probe(port)
        .await
        .expect("forwarded port should accept a loopback connection");

    channel
        .cancel(port, 22)
        .await
        .expect("cancel of a live forward should succeed");

    // Cancelling an already-gone forward is treated as success, not an error.
    channel
        .cancel(port, 22)
        .await
        .expect("cancel of an already-removed forward should be non-fatal");

    channel.close().await.expect("close should succeed");
}

/// `ensure_alive` recreates the channel after the underlying master is
/// killed externally, mirroring the control-channel-recovery scenario.
#[tokio::test]
async fn ensure_alive_recovers_a_killed_master() {
    let channel = common::open_channel().await;
    assert!(channel.check().await.is_ok());

    // Simulate the master dying by removing its control socket; the next
    // `-O check` will fail and ensure_alive should recreate it.
    let _ = std::fs::remove_file(channel.control_path());

    channel
        .ensure_alive()
        .await
        .expect("ensure_alive should recreate the channel");
    assert!(channel.check().await.is_ok());

    channel.close().await.expect("close should succeed");
}
