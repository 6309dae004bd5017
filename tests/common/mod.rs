//! Shared fixtures for the collector integration tests.

#![allow(dead_code)]

use daq_collector::app::{CollectorApp, ExitReason};
use daq_collector::connection::{
    ConfirmedConnection, ConfirmedOutput, InputConnection, LoadBalancedConnection,
    OutputConnection,
};
use daq_collector::monitor::MonitoringConnection;
use daq_collector::network::{Context, Incoming, Socket, SocketOptions};
use daq_collector::{AppKind, CollectorResult, Message, MessageKind};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

pub const INPUT: &str = "inproc://input";
pub const OUTPUT: &str = "inproc://output";
pub const ROI: &str = "inproc://roi";
pub const MONITOR: &str = "inproc://monitor";

pub type AppTask<I, O> = JoinHandle<(CollectorApp<I, O>, CollectorResult<ExitReason>)>;

pub fn opts(identity: &str) -> SocketOptions {
    SocketOptions::new(identity)
}

pub fn event(payload: &'static [u8]) -> Message {
    Message::data(payload).unwrap()
}

/// Bind the input and monitoring sockets every app needs.
pub async fn bind_common(ctx: &Context) -> (ConfirmedConnection, MonitoringConnection) {
    let input = ConfirmedConnection::bind(ctx, INPUT, opts("stage")).await.unwrap();
    let monitor = MonitoringConnection::bind(ctx, MONITOR, opts("stage"))
        .await
        .unwrap();
    (input, monitor)
}

/// A `Collector` with a monitoring channel and the given drain timeout.
pub async fn collector(ctx: &Context, lax: bool, stop_waiting_time: Duration) -> daq_collector::app::Collector {
    let (input, monitor) = bind_common(ctx).await;
    let output = LoadBalancedConnection::bind(ctx, OUTPUT, opts("stage"), lax)
        .await
        .unwrap();
    CollectorApp::new(AppKind::Collector, input, output, stop_waiting_time).with_monitor(monitor)
}

pub async fn source(ctx: &Context) -> ConfirmedOutput {
    ConfirmedOutput::connect(ctx, INPUT, opts("src")).await.unwrap()
}

pub async fn controller(ctx: &Context) -> Socket {
    ctx.connect(MONITOR, opts("ctl")).await.unwrap()
}

pub async fn worker(ctx: &Context, name: &str) -> Socket {
    ctx.connect(OUTPUT, opts(name)).await.unwrap()
}

pub fn spawn_app<I, O>(mut app: CollectorApp<I, O>) -> AppTask<I, O>
where
    I: InputConnection + 'static,
    O: OutputConnection + 'static,
{
    tokio::spawn(async move {
        let result = app.run().await;
        (app, result)
    })
}

pub fn signal(controller: &Socket, kind: MessageKind) {
    controller.send(MONITOR, Message::control(kind)).unwrap();
}

pub fn ready(worker: &Socket) {
    worker.send(OUTPUT, Message::control(MessageKind::Ready)).unwrap();
}

/// Next message on `socket`, skipping connection churn.
pub async fn next_message(socket: &mut Socket) -> Message {
    loop {
        if let Incoming::Message(_, message) = socket.recv().await.unwrap() {
            return message;
        }
    }
}

/// Every message already queued on `socket`.
pub fn queued_messages(socket: &mut Socket) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Some(incoming) = socket.try_recv().unwrap() {
        if let Incoming::Message(_, message) = incoming {
            messages.push(message);
        }
    }
    messages
}

/// Ask the stage for its status snapshot.
pub async fn request_status(controller: &mut Socket) -> serde_json::Value {
    controller
        .send(MONITOR, Message::control(MessageKind::StatusRequest))
        .unwrap();
    loop {
        let message = next_message(controller).await;
        if message.kind() == MessageKind::Status {
            return message.status_json().unwrap();
        }
    }
}

/// Send Terminate and wait for the app to hand itself back.
pub async fn terminate<I, O>(controller: &Socket, task: AppTask<I, O>) -> CollectorApp<I, O> {
    signal(controller, MessageKind::Terminate);
    let (app, result) = task.await.unwrap();
    assert_eq!(result.unwrap(), ExitReason::Terminated("ctl".into()));
    app
}

/// Elapsed time since `start`, within one timer tick of `expected`.
pub fn assert_elapsed(start: Instant, expected: Duration) {
    let elapsed = start.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(10),
        "expected {expected:?}, got {elapsed:?}"
    );
}
