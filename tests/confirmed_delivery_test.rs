//! Integration tests for confirmed delivery
//!
//! A confirmed input acknowledges every data message with a confirmation carrying the
//! same sequence id, queued before the next message from that peer is accepted.

mod common;

use common::*;
use daq_collector::app::ProxyCollector;
use daq_collector::connection::{
    ConfirmedConnection, ConfirmedOutput, InputConnection, InputEvent, OutputConnection,
    OutputEvent,
};
use daq_collector::network::Context;
use daq_collector::state::CollectorState;
use daq_collector::{AppKind, CollectorApp, Message, MessageKind};
use tokio::time::{Duration, Instant};

const DOWNSTREAM: &str = "inproc://downstream";
const WAIT: Duration = Duration::from_secs(2);

async fn next_data(input: &mut ConfirmedConnection) -> (String, Message) {
    loop {
        if let InputEvent::Data(received) = input.receive().await.unwrap() {
            assert!(received.confirmation.is_ok());
            return (received.peer, received.message);
        }
    }
}

/// Next signal the downstream input sees, with its sender.
async fn next_signal(input: &mut ConfirmedConnection) -> (MessageKind, String) {
    loop {
        if let InputEvent::Signal { kind, peer } = input.receive().await.unwrap() {
            return (kind, peer);
        }
    }
}

/// A proxy stage in front of a bound downstream input.
async fn proxy(ctx: &Context) -> (ProxyCollector, ConfirmedConnection) {
    let downstream = ConfirmedConnection::bind(ctx, DOWNSTREAM, opts("next-stage"))
        .await
        .unwrap();
    let (input, monitor) = bind_common(ctx).await;
    let output = ConfirmedOutput::connect(ctx, DOWNSTREAM, opts("proxy"))
        .await
        .unwrap();
    let app = CollectorApp::new(AppKind::ProxyCollector, input, output, WAIT).with_monitor(monitor);
    (app, downstream)
}

// =============================================================================
// ConfirmedConnection
// =============================================================================

#[tokio::test]
async fn test_every_message_confirmed_before_the_next_is_accepted() {
    let ctx = Context::new();
    let mut input = ConfirmedConnection::bind(&ctx, INPUT, opts("collector"))
        .await
        .unwrap();
    let mut sender = ctx.connect(INPUT, opts("src")).await.unwrap();

    let sequence_ids = [10, 11, 12, 13, 14];
    for seq in sequence_ids {
        sender.send(INPUT, event(b"payload").with_sequence(seq)).unwrap();
    }

    for seq in sequence_ids {
        let (_, message) = next_data(&mut input).await;
        assert_eq!(message.sequence_id(), Some(seq));

        // The confirmation is already waiting for the sender; nothing else is.
        let confirmations = queued_messages(&mut sender);
        assert_eq!(confirmations, vec![Message::confirm(Some(seq))]);
    }

    assert!(queued_messages(&mut sender).is_empty());
    assert_eq!(input.status()["received"], 5);
    assert_eq!(input.status()["confirmed"], 5);
}

#[tokio::test]
async fn test_confirmations_go_back_to_their_sender() {
    let ctx = Context::new();
    let mut input = ConfirmedConnection::bind(&ctx, INPUT, opts("collector"))
        .await
        .unwrap();
    let mut a = ctx.connect(INPUT, opts("a")).await.unwrap();
    let mut b = ctx.connect(INPUT, opts("b")).await.unwrap();

    a.send(INPUT, event(b"a0").with_sequence(0)).unwrap();
    b.send(INPUT, event(b"b0").with_sequence(100)).unwrap();
    a.send(INPUT, event(b"a1").with_sequence(1)).unwrap();

    let mut from_a = Vec::new();
    for _ in 0..3 {
        let (peer, message) = next_data(&mut input).await;
        if peer == "a" {
            from_a.push(message.sequence_id());
        }
    }
    assert_eq!(from_a, vec![Some(0), Some(1)]);

    assert_eq!(
        queued_messages(&mut a),
        vec![Message::confirm(Some(0)), Message::confirm(Some(1))]
    );
    assert_eq!(queued_messages(&mut b), vec![Message::confirm(Some(100))]);

    let mut peers = input.upstream_peers();
    peers.sort();
    assert_eq!(peers, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_data_without_sequence_id_gets_bare_confirmation() {
    let ctx = Context::new();
    let mut input = ConfirmedConnection::bind(&ctx, INPUT, opts("collector"))
        .await
        .unwrap();
    let mut sender = ctx.connect(INPUT, opts("src")).await.unwrap();

    sender.send(INPUT, event(b"unnumbered")).unwrap();
    next_data(&mut input).await;

    assert_eq!(queued_messages(&mut sender), vec![Message::confirm(None)]);
}

#[tokio::test]
async fn test_non_data_messages_are_not_confirmed() {
    let ctx = Context::new();
    let mut input = ConfirmedConnection::bind(&ctx, INPUT, opts("collector"))
        .await
        .unwrap();
    let mut sender = ctx.connect(INPUT, opts("src")).await.unwrap();

    sender.send(INPUT, Message::control(MessageKind::Ready)).unwrap();
    sender.send(INPUT, Message::control(MessageKind::Start)).unwrap();

    assert!(matches!(input.receive().await.unwrap(), InputEvent::PeerJoined(_)));
    assert!(matches!(
        input.receive().await.unwrap(),
        InputEvent::Other { message, .. } if message.kind() == MessageKind::Ready
    ));
    assert!(matches!(
        input.receive().await.unwrap(),
        InputEvent::Signal { kind: MessageKind::Start, .. }
    ));
    assert!(input.try_receive().unwrap().is_none());
    assert!(queued_messages(&mut sender).is_empty());
}

// =============================================================================
// ProxyCollector: confirmed input to confirmed output
// =============================================================================

#[tokio::test]
async fn test_proxy_collector_renumbers_and_confirms_both_ways() {
    let ctx = Context::new();
    let (app, mut downstream) = proxy(&ctx).await;

    let mut src = ctx.connect(INPUT, opts("src")).await.unwrap();
    let controller = controller(&ctx).await;
    let task = spawn_app(app);

    for seq in 500..503u64 {
        let payload = format!("e{}", seq - 500);
        src.send(INPUT, Message::data(payload).unwrap().with_sequence(seq))
            .unwrap();
    }

    // Downstream sees the proxy's own numbering.
    for expected in 0..3u64 {
        let (peer, message) = next_data(&mut downstream).await;
        assert_eq!(peer, "proxy");
        assert_eq!(message.sequence_id(), Some(expected));
        assert_eq!(message.payload().as_ref(), format!("e{expected}").as_bytes());
    }

    // The source's numbering is confirmed by the proxy input.
    for seq in 500..503u64 {
        assert_eq!(next_message(&mut src).await, Message::confirm(Some(seq)));
    }

    let app = terminate(&controller, task).await;
    assert_eq!(app.counters().received, 3);
    assert_eq!(app.counters().forwarded, 3);

    // Terminate is passed on to the next stage.
    assert_eq!(
        next_signal(&mut downstream).await,
        (MessageKind::Terminate, "proxy".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_proxy_collector_forwards_stop_after_wait() {
    let ctx = Context::new();
    let (app, mut downstream) = proxy(&ctx).await;
    let mut controller = controller(&ctx).await;
    let task = spawn_app(app);

    let start = Instant::now();
    signal(&controller, MessageKind::Stop);

    assert_eq!(
        next_signal(&mut downstream).await,
        (MessageKind::Stop, "proxy".to_string())
    );
    assert_elapsed(start, WAIT);

    let status = request_status(&mut controller).await;
    assert_eq!(status["state"], "stopped");
    assert_eq!(status["counters"]["stops_forwarded"], 1);

    let app = terminate(&controller, task).await;
    assert_eq!(app.state(), CollectorState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_proxy_collector_forwards_stop_once_every_source_stopped() {
    let ctx = Context::new();
    let (app, mut downstream) = proxy(&ctx).await;
    let mut src_a = ConfirmedOutput::connect(&ctx, INPUT, opts("src-a")).await.unwrap();
    let mut src_b = ConfirmedOutput::connect(&ctx, INPUT, opts("src-b")).await.unwrap();
    let controller = controller(&ctx).await;
    let task = spawn_app(app);

    let start = Instant::now();
    src_a.dispatch(event(b"last")).unwrap();
    src_a.send_signal(MessageKind::Stop).unwrap();
    assert_eq!(src_a.next_event().await.unwrap(), OutputEvent::Confirmed(0));

    let (_, message) = next_data(&mut downstream).await;
    assert_eq!(message.payload().as_ref(), b"last");

    src_b.send_signal(MessageKind::Stop).unwrap();
    assert_eq!(
        next_signal(&mut downstream).await,
        (MessageKind::Stop, "proxy".to_string())
    );
    assert_elapsed(start, Duration::ZERO);

    let app = terminate(&controller, task).await;
    assert_eq!(app.counters().forwarded, 1);
    assert_eq!(app.counters().stops_forwarded, 1);
    assert_eq!(app.input().stop_counter().count(), 2);
}

#[tokio::test]
async fn test_confirmed_output_tracks_unconfirmed_messages() {
    let ctx = Context::new();
    let mut input = ConfirmedConnection::bind(&ctx, INPUT, opts("collector"))
        .await
        .unwrap();
    let mut output = ConfirmedOutput::connect(&ctx, INPUT, opts("src")).await.unwrap();

    assert!(output.is_ready());
    for _ in 0..3 {
        output.dispatch(event(b"e")).unwrap();
    }
    assert_eq!(output.unconfirmed().collect::<Vec<_>>(), vec![0, 1, 2]);

    next_data(&mut input).await;
    assert_eq!(output.next_event().await.unwrap(), OutputEvent::Confirmed(0));
    assert_eq!(output.unconfirmed().collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(output.status()["unconfirmed"], 2);
}
