//! End-to-end test over TCP
//!
//! A final collector with length-prefixed output, fed by a confirmed source and drained
//! by a plain byte-stream sink, all on loopback sockets.

mod common;

use common::*;
use daq_collector::app::{ExitReason, FinalCollector};
use daq_collector::connection::{
    ConfirmedConnection, ConfirmedOutput, OutputConnection, OutputEvent, RawConnection,
};
use daq_collector::monitor::MonitoringConnection;
use daq_collector::network::{Context, Socket};
use daq_collector::{AppKind, CollectorApp, Message, MessageKind};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};

const ANY_PORT: &str = "tcp://127.0.0.1:0";

async fn status_over(controller: &mut Socket, address: &str) -> serde_json::Value {
    controller
        .send(address, Message::control(MessageKind::StatusRequest))
        .unwrap();
    loop {
        let message = next_message(controller).await;
        if message.kind() == MessageKind::Status {
            return message.status_json().unwrap();
        }
    }
}

async fn read_event(sink: &mut TcpStream) -> Vec<u8> {
    let len = sink.read_u32_le().await.unwrap() as usize;
    let mut payload = vec![0u8; len];
    sink.read_exact(&mut payload).await.unwrap();
    payload
}

#[tokio::test]
async fn test_final_collector_over_tcp() {
    let ctx = Context::new();
    let input = ConfirmedConnection::bind(&ctx, ANY_PORT, opts("final"))
        .await
        .unwrap();
    let output = RawConnection::bind(&ctx, ANY_PORT, opts("final"), true)
        .await
        .unwrap();
    let monitor = MonitoringConnection::bind(&ctx, ANY_PORT, opts("final"))
        .await
        .unwrap();

    let input_address = input.local_address().to_string();
    let output_address = output.local_address().to_string();
    let monitor_address = monitor.local_address().to_string();

    let app: FinalCollector =
        CollectorApp::new(AppKind::FinalCollector, input, output, Duration::from_secs(2))
            .with_monitor(monitor);
    let task = spawn_app(app);

    let mut sink = TcpStream::connect(output_address.trim_start_matches("tcp://"))
        .await
        .unwrap();
    let mut controller = ctx.connect(&monitor_address, opts("ctl")).await.unwrap();

    // The sink is attached once the stage has processed the accepted stream.
    timeout(Duration::from_secs(5), async {
        while status_over(&mut controller, &monitor_address).await["output"]["sinks"] != 1 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let mut src = ConfirmedOutput::connect(&ctx, &input_address, opts("src"))
        .await
        .unwrap();
    src.dispatch(Message::data(&b"hello"[..]).unwrap()).unwrap();
    src.dispatch(Message::data(&b"world!"[..]).unwrap()).unwrap();

    assert_eq!(src.next_event().await.unwrap(), OutputEvent::Confirmed(0));
    assert_eq!(src.next_event().await.unwrap(), OutputEvent::Confirmed(1));
    assert_eq!(src.unconfirmed_count(), 0);

    assert_eq!(read_event(&mut sink).await, b"hello");
    assert_eq!(read_event(&mut sink).await, b"world!");

    controller
        .send(&monitor_address, Message::control(MessageKind::Terminate))
        .unwrap();
    let (app, result) = task.await.unwrap();
    assert_eq!(result.unwrap(), ExitReason::Terminated("ctl".into()));
    assert_eq!(app.counters().received, 2);
    assert_eq!(app.counters().forwarded, 2);
    assert_eq!(app.output().status()["bytes_sent"], 19);
}
