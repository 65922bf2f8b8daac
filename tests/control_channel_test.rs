use camlink::control::{
    CameraCommand, ChannelState, CommandChannel, ControlEvent, ControlOptions,
};
use camlink::invariant_ppt::contract_test;
use camlink::testing::{DialScript, MockControlTransport};
use camlink::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;

fn fast_opts() -> ControlOptions {
    ControlOptions {
        max_reconnect_attempts: 5,
        retry: RetryPolicy::new(10, 50),
        max_queue_depth: 64,
    }
}

fn make_channel(transport: Arc<MockControlTransport>, opts: ControlOptions) -> CommandChannel {
    CommandChannel::with_transport("ws://controller.local:8765", opts, transport)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn wait_until_state(channel: &CommandChannel, target: ChannelState) {
    for _ in 0..400 {
        if channel.state().await == target {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("channel never reached {:?}", target);
}

#[tokio::test]
async fn test_commands_queued_while_disconnected_flush_fifo() {
    let transport = Arc::new(MockControlTransport::new());
    let channel = make_channel(Arc::clone(&transport), fast_opts());

    // A and B are submitted before any connection exists.
    channel.send(&CameraCommand::step_up("cam1")).await.unwrap();
    channel.send(&CameraCommand::step_down("cam1")).await.unwrap();

    let probe = Arc::clone(&transport);
    wait_until(move || {
        probe
            .last_link()
            .map(|link| link.sent_count() == 2)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(channel.state().await, ChannelState::Open);

    // C is submitted after the channel reports Open.
    channel.send(&CameraCommand::pan_left("cam1")).await.unwrap();

    let link = transport.last_link().unwrap();
    let probe = Arc::clone(&link);
    wait_until(move || probe.sent_count() == 3).await;

    assert_eq!(
        link.sent(),
        vec![
            r#"{"command":"u","camera":"cam1"}"#.to_string(),
            r#"{"command":"d","camera":"cam1"}"#.to_string(),
            r#"{"command":"l","camera":"cam1"}"#.to_string(),
        ]
    );

    contract_test(
        "control drain",
        &["Queued frames drain fully before new sends are accepted"],
    );
}

#[tokio::test]
async fn test_inbound_status_frames_are_fanned_out() {
    let transport = Arc::new(MockControlTransport::new());
    let channel = make_channel(Arc::clone(&transport), fast_opts());
    let mut events = channel.subscribe();

    channel.connect().await.unwrap();
    let link = transport.last_link().unwrap();

    link.push(r#"{"status":"connected","servo_position":1500,"total_steps":0}"#);
    link.push(r#"{"status":"executed","command":"u","camera":"cam1"}"#);
    link.push("pong");

    let mut seen = Vec::new();
    for _ in 0..4 {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        seen.push(event);
    }

    assert!(matches!(seen[0], ControlEvent::Open));
    match &seen[1] {
        ControlEvent::Status { status, .. } => {
            assert_eq!(status.status, "connected");
            assert_eq!(status.servo_position, Some(1500));
        }
        other => panic!("expected connected status, got {:?}", other),
    }
    match &seen[2] {
        ControlEvent::Status { status, .. } => {
            assert_eq!(status.status, "executed");
            assert_eq!(status.command.as_deref(), Some("u"));
        }
        other => panic!("expected executed status, got {:?}", other),
    }
    match &seen[3] {
        ControlEvent::Raw { text, .. } => assert_eq!(text, "pong"),
        other => panic!("expected raw payload, got {:?}", other),
    }

    // An unparsable payload never terminates the channel.
    assert_eq!(channel.state().await, ChannelState::Open);
}

#[tokio::test]
async fn test_reconnects_with_backoff_after_peer_drop() {
    let transport = Arc::new(MockControlTransport::new());
    let channel = make_channel(Arc::clone(&transport), fast_opts());

    channel.connect().await.unwrap();
    let first = transport.last_link().unwrap();
    first.close();

    let probe = Arc::clone(&transport);
    wait_until(move || probe.dial_count() == 2).await;

    wait_until_state(&channel, ChannelState::Open).await;

    // Commands sent while the connection was down arrive on the new link.
    channel.send(&CameraCommand::home("cam1")).await.unwrap();
    let second = transport.last_link().unwrap();
    let probe = Arc::clone(&second);
    wait_until(move || probe.sent_count() == 1).await;
    assert_eq!(second.sent(), vec![r#"{"command":"home","camera":"cam1"}"#]);
}

#[tokio::test]
async fn test_reconnect_budget_exhaustion_then_manual_retry_via_send() {
    let transport = Arc::new(MockControlTransport::scripted(vec![
        DialScript::Refuse,
        DialScript::Refuse,
        DialScript::Refuse,
    ]));
    let opts = ControlOptions {
        max_reconnect_attempts: 2,
        ..fast_opts()
    };
    let channel = make_channel(Arc::clone(&transport), opts);

    // Initial dial plus two budgeted reconnects, all refused.
    channel.send(&CameraCommand::step_up("cam1")).await.unwrap();
    let probe = Arc::clone(&transport);
    wait_until(move || probe.dial_count() == 3).await;

    // Budget exhausted: no further automatic dials.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.dial_count(), 3);
    assert_eq!(channel.state().await, ChannelState::Disconnected);
    assert_eq!(channel.queued().await, 1);

    // The next send acts as a manual retry; the script is exhausted so the
    // dial is accepted and the backlog flushes.
    channel.send(&CameraCommand::step_down("cam1")).await.unwrap();
    let probe = Arc::clone(&transport);
    wait_until(move || {
        probe
            .last_link()
            .map(|link| link.sent_count() == 2)
            .unwrap_or(false)
    })
    .await;

    let link = transport.last_link().unwrap();
    assert_eq!(
        link.sent(),
        vec![
            r#"{"command":"u","camera":"cam1"}"#.to_string(),
            r#"{"command":"d","camera":"cam1"}"#.to_string(),
        ]
    );
}

#[tokio::test]
async fn test_queue_cap_drops_oldest() {
    let transport = Arc::new(MockControlTransport::scripted(vec![DialScript::Refuse]));
    let opts = ControlOptions {
        max_reconnect_attempts: 0,
        max_queue_depth: 2,
        ..fast_opts()
    };
    let channel = make_channel(Arc::clone(&transport), opts);

    channel.send(&CameraCommand::preset(1, "cam1")).await.unwrap();
    channel.send(&CameraCommand::preset(2, "cam1")).await.unwrap();
    channel.send(&CameraCommand::preset(3, "cam1")).await.unwrap();

    assert_eq!(channel.queued().await, 2);

    // Whether a background dial already consumed the refusal or this call
    // does, the first accepted dial flushes only the two newest frames.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = channel.connect().await;

    let probe = Arc::clone(&transport);
    wait_until(move || {
        probe
            .last_link()
            .map(|link| link.sent_count() == 2)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(
        transport.last_link().unwrap().sent(),
        vec![
            r#"{"command":"2","camera":"cam1"}"#.to_string(),
            r#"{"command":"3","camera":"cam1"}"#.to_string(),
        ]
    );
}

#[tokio::test]
async fn test_shutdown_keeps_queue_for_next_send() {
    let transport = Arc::new(MockControlTransport::new());
    let channel = make_channel(Arc::clone(&transport), fast_opts());

    channel.connect().await.unwrap();
    channel.shutdown().await;
    assert_eq!(channel.state().await, ChannelState::Disconnected);

    channel.send(&CameraCommand::pan_right("cam1")).await.unwrap();
    let probe = Arc::clone(&transport);
    wait_until(move || {
        probe
            .last_link()
            .map(|link| link.sent_count() == 1)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(
        transport.last_link().unwrap().sent(),
        vec![r#"{"command":"r","camera":"cam1"}"#]
    );
}
