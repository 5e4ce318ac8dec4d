use portbridge::control_channel::fake::FakeControlChannel;
use portbridge::reconciler;
use portbridge::state::{State, Status};
use tokio::net::TcpListener;

/// Drives a full reconcile cycle (add, probe, teardown) against an in-memory
/// fake control channel. Needs no live sshd, unlike the channel/reconcile
/// tests that dial `TEST_HOST`.
#[tokio::test]
async fn fake_channel_add_probe_and_teardown() {
    let channel = FakeControlChannel::new();
    let state = State::new();
    let port = 19340;

    // The probe step dials the loopback port directly; the fake only
    // records that `forward` was called, so something has to actually be
    // listening for the probe to see as live.
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();

    state.set_desired("container-a", vec![port]);
    reconciler::apply(&state, &channel, &reconciler::diff(&state))
        .await
        .unwrap();

    assert_eq!(state.get_by_container("container-a")[0].status, Status::Active);
    assert_eq!(channel.forwarded_ports(), vec![(port, port)]);

    state.set_desired("container-a", vec![]);
    reconciler::apply(&state, &channel, &reconciler::diff(&state))
        .await
        .unwrap();
    assert!(state.get_by_container("container-a").is_empty());
    assert_eq!(channel.cancelled_ports(), vec![(port, port)]);

    drop(listener);
}

/// A transient port-in-use failure is retried and the add still succeeds.
#[tokio::test]
async fn fake_channel_retries_transient_forward_failure() {
    let channel = FakeControlChannel::new();
    let state = State::new();
    let port = 19341;
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();

    channel.fail_forward_next(port, 2);
    state.set_desired("container-b", vec![port]);
    reconciler::apply(&state, &channel, &reconciler::diff(&state))
        .await
        .unwrap();

    assert_eq!(state.get_by_container("container-b")[0].status, Status::Active);
    drop(listener);
}
