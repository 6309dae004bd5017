//! Collector apps: one control loop over interchangeable connections.
//!
//! A [`CollectorApp`] owns one input connection, one output connection and optionally a
//! [`MonitoringConnection`]. Its event loop waits on all of them plus the drain deadline
//! in a single `tokio::select!`; that wait is the only suspension point.
//!
//! | Variant                  | Output                     | Drain completes by         |
//! |--------------------------|----------------------------|----------------------------|
//! | [`Collector`]            | [`LoadBalancedConnection`] | forwarding Stop            |
//! | [`ProxyCollector`]       | [`ConfirmedOutput`]        | forwarding Stop            |
//! | [`FinalCollector`]       | [`RawConnection`]          | resetting stop bookkeeping |
//! | [`FinalCollectorWithRoi`]| [`DataAndRoiOutput`]       | resetting stop bookkeeping |
//! | [`OutputAdapter`]        | [`RawConnection`]          | never; only Terminate ends it |
//!
//! All variants read from a [`ConfirmedConnection`].
//!
//! ## Priorities
//!
//! Every iteration first drains the monitoring queue so a Terminate overtakes anything
//! queued before it. Then the loop prefers monitoring, then output events (worker Ready),
//! then input. Data is only taken while the output can take work and nothing is pending;
//! otherwise the input is read for signals alone and data stays unconfirmed, so
//! backpressure reaches upstream while Stop and Terminate still get through.

use crate::config::CollectorConfig;
use crate::connection::{
    ConfirmedConnection, ConfirmedOutput, DataAndRoiOutput, DispatchOutcome, InputConnection,
    InputEvent, LoadBalancedConnection, OutputConnection, OutputEvent, RawConnection, Received,
};
use crate::error::{CollectorError, CollectorResult};
use crate::message::{Message, MessageKind};
use crate::monitor::{MonitorEvent, MonitoringConnection};
use crate::network::{Context, PeerId};
use crate::state::{CollectorState, DrainAction, DrainMachine, DrainPolicy};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::fmt;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

/// Collector variant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum AppKind {
    /// Confirmed input, load-balanced output.
    Collector,
    /// Confirmed input, confirmed output towards another collector.
    ProxyCollector,
    /// Confirmed input, raw output to storage.
    FinalCollector,
    /// Confirmed input, raw data and ROI outputs.
    FinalCollectorWithRoi,
    /// Confirmed input, raw output; ignores Stop.
    OutputAdapter,
}

impl AppKind {
    /// How a drain completes for this variant.
    pub fn drain_policy(self) -> DrainPolicy {
        match self {
            AppKind::Collector | AppKind::ProxyCollector => DrainPolicy::Forward,
            AppKind::FinalCollector | AppKind::FinalCollectorWithRoi => DrainPolicy::Reset,
            AppKind::OutputAdapter => DrainPolicy::Ignore,
        }
    }

    /// Whether non-data input is silently filtered instead of reported.
    pub fn filters_control_messages(self) -> bool {
        matches!(self, AppKind::FinalCollector | AppKind::FinalCollectorWithRoi)
    }

    /// Configuration name.
    pub fn as_str(self) -> &'static str {
        match self {
            AppKind::Collector => "collector",
            AppKind::ProxyCollector => "proxy_collector",
            AppKind::FinalCollector => "final_collector",
            AppKind::FinalCollectorWithRoi => "final_collector_with_roi",
            AppKind::OutputAdapter => "output_adapter",
        }
    }
}

impl fmt::Display for AppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why [`CollectorApp::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// A Terminate signal arrived from this peer.
    Terminated(PeerId),
}

/// Event counters exposed in the status snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppCounters {
    /// Data messages accepted from the input.
    pub received: u64,
    /// Data messages handed to the output.
    pub forwarded: u64,
    /// Data messages discarded by lax mode.
    pub dropped: u64,
    /// Dispatches refused for lack of a ready worker.
    pub backpressured: u64,
    /// Dispatches that failed on the transport.
    pub dispatch_errors: u64,
    /// Confirmations that could not be sent.
    pub confirmation_failures: u64,
    /// Non-data input dropped by final stages.
    pub filtered: u64,
    /// Unexpected messages logged and ignored.
    pub protocol_violations: u64,
    /// Start signals seen.
    pub start_signals: u64,
    /// Stop signals seen.
    pub stop_signals: u64,
    /// Drains that ended with Stop forwarded downstream.
    pub stops_forwarded: u64,
    /// Drains that ended with a reset.
    pub resets: u64,
}

/// Confirmed input to load-balanced workers.
pub type Collector = CollectorApp<ConfirmedConnection, LoadBalancedConnection>;
/// Confirmed input to the confirmed input of another collector.
pub type ProxyCollector = CollectorApp<ConfirmedConnection, ConfirmedOutput>;
/// Confirmed input to a storage sink.
pub type FinalCollector = CollectorApp<ConfirmedConnection, RawConnection>;
/// Confirmed input to data and ROI sinks.
pub type FinalCollectorWithRoi = CollectorApp<ConfirmedConnection, DataAndRoiOutput>;
/// Confirmed input to a raw sink, ignoring Stop.
pub type OutputAdapter = CollectorApp<ConfirmedConnection, RawConnection>;

/// One pipeline stage: input, output, optional monitoring, and the drain state machine.
#[derive(Debug)]
pub struct CollectorApp<I, O> {
    kind: AppKind,
    input: I,
    output: O,
    monitor: Option<MonitoringConnection>,
    machine: DrainMachine,
    pending: VecDeque<Message>,
    counters: AppCounters,
}

enum Step {
    Monitor(MonitorEvent),
    Output(OutputEvent),
    Input(InputEvent),
    Timeout,
}

impl<I: InputConnection, O: OutputConnection> CollectorApp<I, O> {
    /// Compose an app. It starts in `Running`.
    pub fn new(kind: AppKind, input: I, output: O, stop_waiting_time: Duration) -> Self {
        Self {
            kind,
            input,
            output,
            monitor: None,
            machine: DrainMachine::new(kind.drain_policy(), stop_waiting_time),
            pending: VecDeque::new(),
            counters: AppCounters::default(),
        }
    }

    /// Attach a monitoring channel.
    pub fn with_monitor(mut self, monitor: MonitoringConnection) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Variant.
    pub fn kind(&self) -> AppKind {
        self.kind
    }

    /// Current state.
    pub fn state(&self) -> CollectorState {
        self.machine.state()
    }

    /// Event counters.
    pub fn counters(&self) -> &AppCounters {
        &self.counters
    }

    /// Messages refused by the output and waiting for a worker.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Input connection.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// Output connection.
    pub fn output(&self) -> &O {
        &self.output
    }

    /// When the current drain times out, if one is in progress.
    pub fn drain_deadline(&self) -> Option<Instant> {
        self.machine.deadline(self.input.stop_counter())
    }

    /// JSON status snapshot.
    pub fn status(&self) -> serde_json::Value {
        json!({
            "app": self.kind,
            "state": self.machine.state(),
            "stop_waiting_time_secs": self.machine.stop_waiting_time().as_secs(),
            "pending": self.pending.len(),
            "counters": self.counters,
            "input": self.input.status(),
            "output": self.output.status(),
        })
    }

    /// Whether the loop takes data from the input right now.
    pub fn accepting_input(&self) -> bool {
        self.pending.is_empty() && self.output.is_ready()
    }

    /// React to one input event.
    pub fn handle_input(&mut self, event: InputEvent) -> Option<ExitReason> {
        match event {
            InputEvent::Data(Received {
                peer,
                message,
                confirmation,
            }) => {
                if let Err(e) = confirmation {
                    self.counters.confirmation_failures += 1;
                    warn!(%peer, error = %e, "confirmation failed, forwarding anyway");
                }
                self.counters.received += 1;
                self.forward(message);
                None
            }
            InputEvent::Signal { kind, peer } => self.handle_external_signal(kind, &peer),
            InputEvent::PeerJoined(peer) => {
                info!(%peer, "upstream peer connected");
                None
            }
            InputEvent::PeerLeft(peer) => {
                info!(%peer, "upstream peer disconnected");
                let upstream = self.input.upstream_peers();
                let action = self
                    .machine
                    .on_peer_left(self.input.stop_counter_mut(), &upstream);
                self.apply(action);
                None
            }
            InputEvent::Other { peer, message } => {
                if self.kind.filters_control_messages() {
                    self.counters.filtered += 1;
                    debug!(%peer, kind = %message.kind(), "non-data message filtered");
                } else {
                    self.protocol_violation(&peer, message.kind());
                }
                None
            }
        }
    }

    /// Start, Stop or Terminate from an upstream peer or a controller.
    pub fn handle_external_signal(&mut self, kind: MessageKind, peer: &str) -> Option<ExitReason> {
        match kind {
            MessageKind::Start => {
                self.counters.start_signals += 1;
                let before = self.machine.state();
                self.machine.on_start(self.input.stop_counter_mut());
                if before == self.machine.state() {
                    debug!(%peer, state = %before, "start has no effect");
                } else {
                    info!(%peer, "start received, drain abandoned");
                }
                None
            }
            MessageKind::Stop => {
                self.counters.stop_signals += 1;
                let upstream = self.input.upstream_peers();
                let action = self.machine.on_stop(
                    self.input.stop_counter_mut(),
                    peer,
                    &upstream,
                    Instant::now(),
                );
                info!(
                    %peer,
                    stopped = self.input.stop_counter().count(),
                    upstream = upstream.len(),
                    state = %self.machine.state(),
                    "stop received"
                );
                self.apply(action);
                None
            }
            MessageKind::Terminate => Some(self.terminate(peer)),
            other => {
                self.protocol_violation(peer, other);
                None
            }
        }
    }

    /// Drain timer fired.
    pub fn handle_timeout(&mut self) {
        let stopped = self.input.stop_counter().count();
        let action = self
            .machine
            .on_timeout(self.input.stop_counter_mut(), Instant::now());
        if action != DrainAction::None {
            info!(
                stopped,
                upstream = self.input.upstream_peers().len(),
                waited = ?self.machine.stop_waiting_time(),
                "no data within stop waiting time, completing drain"
            );
        }
        self.apply(action);
    }

    /// React to one output event.
    pub fn handle_output(&mut self, event: OutputEvent) {
        match event {
            OutputEvent::WorkerReady(worker) => {
                trace!(%worker, "worker ready");
                self.flush_pending();
            }
            OutputEvent::PeerJoined(peer) => {
                debug!(%peer, "downstream peer connected");
                self.flush_pending();
            }
            OutputEvent::PeerLeft(peer) => debug!(%peer, "downstream peer left"),
            OutputEvent::Confirmed(seq) => trace!(seq, "downstream confirmed"),
            OutputEvent::Ignored => {}
        }
    }

    /// React to one monitoring event.
    pub fn handle_monitor(&mut self, event: MonitorEvent) -> Option<ExitReason> {
        match event {
            MonitorEvent::Signal { kind, peer } => self.handle_external_signal(kind, &peer),
            MonitorEvent::StatusRequest { peer } => {
                let snapshot = self.status();
                if let Some(monitor) = &self.monitor {
                    if let Err(e) = monitor.reply_status(&peer, &snapshot) {
                        warn!(%peer, error = %e, "status reply failed");
                    }
                }
                None
            }
            MonitorEvent::Ignored => None,
        }
    }

    /// Run until a Terminate arrives.
    ///
    /// Errors seen while running are logged and the loop continues; only a closed
    /// transport ends it with an error.
    #[instrument(skip_all, fields(app = %self.kind))]
    pub async fn run(&mut self) -> CollectorResult<ExitReason> {
        info!(state = %self.machine.state(), "collector running");
        loop {
            if let Some(reason) = self.poll_monitor(None)? {
                return Ok(reason);
            }

            let deadline = self.drain_deadline();
            let accepting = self.accepting_input();
            let step = tokio::select! {
                biased;
                event = next_monitor_event(&mut self.monitor) => event.map(Step::Monitor),
                event = self.output.next_event() => event.map(Step::Output),
                event = next_input_event(&mut self.input, accepting) => event.map(Step::Input),
                () = sleep_until_deadline(deadline) => Ok(Step::Timeout),
            };

            let exit = match step {
                Ok(Step::Monitor(event)) => self.poll_monitor(Some(event))?,
                Ok(Step::Output(event)) => {
                    self.handle_output(event);
                    None
                }
                Ok(Step::Input(event)) => self.handle_input(event),
                Ok(Step::Timeout) => {
                    self.handle_timeout();
                    None
                }
                Err(e @ CollectorError::TransportClosed(_)) => {
                    error!(error = %e, "transport closed, leaving event loop");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "event loop error ignored");
                    None
                }
            };
            if let Some(reason) = exit {
                info!(?reason, "collector terminated");
                return Ok(reason);
            }
        }
    }

    /// Process `first` and every queued monitoring event, Terminate first.
    fn poll_monitor(&mut self, first: Option<MonitorEvent>) -> CollectorResult<Option<ExitReason>> {
        let Some(monitor) = self.monitor.as_mut() else {
            return Ok(None);
        };
        let mut queued: Vec<MonitorEvent> = first.into_iter().collect();
        while let Some(event) = monitor.try_receive()? {
            queued.push(event);
        }

        let terminate = queued.iter().find_map(|event| match event {
            MonitorEvent::Signal {
                kind: MessageKind::Terminate,
                peer,
            } => Some(peer.clone()),
            _ => None,
        });
        if let Some(peer) = terminate {
            return Ok(Some(self.terminate(&peer)));
        }

        for event in queued {
            if let Some(reason) = self.handle_monitor(event) {
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }

    fn terminate(&mut self, peer: &str) -> ExitReason {
        info!(%peer, state = %self.machine.state(), pending = self.pending.len(), "terminate received");
        if let Err(e) = self.output.send_signal(MessageKind::Terminate) {
            debug!(error = %e, "terminate not forwarded");
        }
        ExitReason::Terminated(peer.to_string())
    }

    fn forward(&mut self, message: Message) {
        let now = Instant::now();
        if !self.pending.is_empty() {
            self.pending.push_back(message);
            self.machine.on_data(self.input.stop_counter_mut(), now);
            return;
        }

        match self.output.dispatch(message) {
            Ok(DispatchOutcome::Sent) => {
                self.counters.forwarded += 1;
                self.machine.on_data(self.input.stop_counter_mut(), now);
            }
            Ok(DispatchOutcome::Backpressure(message)) => {
                self.counters.backpressured += 1;
                self.pending.push_back(message);
                debug!(pending = self.pending.len(), "no ready worker, message buffered");
                self.machine.on_data(self.input.stop_counter_mut(), now);
            }
            // A dropped message is not traffic for the drain clock.
            Ok(DispatchOutcome::Dropped) => self.counters.dropped += 1,
            Err(e) => {
                self.counters.dispatch_errors += 1;
                warn!(error = %e, "dispatch failed");
                self.machine.on_data(self.input.stop_counter_mut(), now);
            }
        }
    }

    fn flush_pending(&mut self) {
        while let Some(message) = self.pending.pop_front() {
            match self.output.dispatch(message) {
                Ok(DispatchOutcome::Sent) => self.counters.forwarded += 1,
                Ok(DispatchOutcome::Backpressure(message)) => {
                    self.pending.push_front(message);
                    break;
                }
                Ok(DispatchOutcome::Dropped) => self.counters.dropped += 1,
                Err(e) => {
                    self.counters.dispatch_errors += 1;
                    warn!(error = %e, "dispatch of buffered message failed");
                }
            }
        }
    }

    fn apply(&mut self, action: DrainAction) {
        match action {
            DrainAction::ForwardStop => {
                self.counters.stops_forwarded += 1;
                info!(pending = self.pending.len(), "drain complete, forwarding stop");
                if let Err(e) = self.output.send_signal(MessageKind::Stop) {
                    warn!(error = %e, "stop could not be forwarded");
                }
            }
            DrainAction::Reset => {
                self.counters.resets += 1;
                info!("drain complete, stop bookkeeping reset");
            }
            DrainAction::None => {}
        }
    }

    fn protocol_violation(&mut self, peer: &str, kind: MessageKind) {
        self.counters.protocol_violations += 1;
        let violation = CollectorError::UnexpectedMessage {
            kind,
            peer: peer.to_string(),
        };
        warn!(error = %violation, "protocol violation ignored");
    }
}

async fn next_monitor_event(
    monitor: &mut Option<MonitoringConnection>,
) -> CollectorResult<MonitorEvent> {
    match monitor {
        Some(monitor) => monitor.receive().await,
        None => std::future::pending().await,
    }
}

async fn next_input_event<I: InputConnection>(
    input: &mut I,
    accepting: bool,
) -> CollectorResult<InputEvent> {
    if accepting {
        input.receive().await
    } else {
        input.receive_control().await
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A configured stage, ready to run.
#[derive(Debug)]
pub enum Stage {
    /// See [`Collector`].
    Collector(Collector),
    /// See [`ProxyCollector`].
    ProxyCollector(ProxyCollector),
    /// See [`FinalCollector`].
    FinalCollector(FinalCollector),
    /// See [`FinalCollectorWithRoi`].
    FinalCollectorWithRoi(FinalCollectorWithRoi),
    /// See [`OutputAdapter`].
    OutputAdapter(OutputAdapter),
}

impl Stage {
    /// Validate the configuration and bind or connect every socket.
    ///
    /// Any failure here is fatal for the stage.
    pub async fn initialize(ctx: &Context, config: &CollectorConfig) -> CollectorResult<Self> {
        config.validate()?;
        let options = config.socket_options();
        let wait = config.stop_waiting_time();

        let input = ConfirmedConnection::bind(ctx, &config.input_address, options.clone()).await?;
        let monitor = match &config.monitoring_address {
            Some(address) => Some(MonitoringConnection::bind(ctx, address, options.clone()).await?),
            None => None,
        };

        let stage = match config.app {
            AppKind::Collector => {
                let output =
                    LoadBalancedConnection::bind(ctx, &config.output_address, options, config.lax)
                        .await?;
                Stage::Collector(assemble(config.app, input, output, wait, monitor))
            }
            AppKind::ProxyCollector => {
                let output = ConfirmedOutput::connect(ctx, &config.output_address, options).await?;
                Stage::ProxyCollector(assemble(config.app, input, output, wait, monitor))
            }
            AppKind::FinalCollector | AppKind::OutputAdapter => {
                let output = RawConnection::bind(
                    ctx,
                    &config.output_address,
                    options,
                    config.add_event_size,
                )
                .await?;
                let app = assemble(config.app, input, output, wait, monitor);
                if config.app == AppKind::FinalCollector {
                    Stage::FinalCollector(app)
                } else {
                    Stage::OutputAdapter(app)
                }
            }
            AppKind::FinalCollectorWithRoi => {
                let roi_address = config.roi_address.as_deref().ok_or_else(|| {
                    CollectorError::Configuration("roi_address is required".into())
                })?;
                let data = RawConnection::bind(
                    ctx,
                    &config.output_address,
                    options.clone(),
                    config.add_event_size,
                )
                .await?;
                let roi =
                    RawConnection::bind(ctx, roi_address, options, config.add_event_size).await?;
                let output = DataAndRoiOutput::new(data, roi);
                Stage::FinalCollectorWithRoi(assemble(config.app, input, output, wait, monitor))
            }
        };

        info!(app = %config.app, input = %config.input_address, output = %config.output_address, "stage initialized");
        Ok(stage)
    }

    /// Variant.
    pub fn kind(&self) -> AppKind {
        match self {
            Stage::Collector(app) => app.kind(),
            Stage::ProxyCollector(app) => app.kind(),
            Stage::FinalCollector(app) | Stage::OutputAdapter(app) => app.kind(),
            Stage::FinalCollectorWithRoi(app) => app.kind(),
        }
    }

    /// JSON status snapshot.
    pub fn status(&self) -> serde_json::Value {
        match self {
            Stage::Collector(app) => app.status(),
            Stage::ProxyCollector(app) => app.status(),
            Stage::FinalCollector(app) | Stage::OutputAdapter(app) => app.status(),
            Stage::FinalCollectorWithRoi(app) => app.status(),
        }
    }

    /// Run the stage's event loop until Terminate.
    pub async fn run(&mut self) -> CollectorResult<ExitReason> {
        match self {
            Stage::Collector(app) => app.run().await,
            Stage::ProxyCollector(app) => app.run().await,
            Stage::FinalCollector(app) | Stage::OutputAdapter(app) => app.run().await,
            Stage::FinalCollectorWithRoi(app) => app.run().await,
        }
    }
}

fn assemble<O: OutputConnection>(
    kind: AppKind,
    input: ConfirmedConnection,
    output: O,
    stop_waiting_time: Duration,
    monitor: Option<MonitoringConnection>,
) -> CollectorApp<ConfirmedConnection, O> {
    let app = CollectorApp::new(kind, input, output, stop_waiting_time);
    match monitor {
        Some(monitor) => app.with_monitor(monitor),
        None => app,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::SocketOptions;
    use tracing_test::traced_test;

    #[test]
    fn variants_map_to_drain_policies() {
        assert_eq!(AppKind::Collector.drain_policy(), DrainPolicy::Forward);
        assert_eq!(AppKind::ProxyCollector.drain_policy(), DrainPolicy::Forward);
        assert_eq!(AppKind::FinalCollector.drain_policy(), DrainPolicy::Reset);
        assert_eq!(AppKind::FinalCollectorWithRoi.drain_policy(), DrainPolicy::Reset);
        assert_eq!(AppKind::OutputAdapter.drain_policy(), DrainPolicy::Ignore);

        assert!(AppKind::FinalCollector.filters_control_messages());
        assert!(!AppKind::Collector.filters_control_messages());
    }

    #[test]
    fn app_kind_names_match_configuration() {
        let kind: AppKind = serde_json::from_str("\"final_collector_with_roi\"").unwrap();
        assert_eq!(kind, AppKind::FinalCollectorWithRoi);
        assert_eq!(kind.to_string(), "final_collector_with_roi");
    }

    #[tokio::test]
    async fn start_while_running_is_a_noop() {
        let ctx = Context::new();
        let input = ConfirmedConnection::bind(&ctx, "inproc://unit-in", SocketOptions::new("c"))
            .await
            .unwrap();
        let output =
            LoadBalancedConnection::bind(&ctx, "inproc://unit-out", SocketOptions::new("c"), false)
                .await
                .unwrap();
        let mut app = Collector::new(AppKind::Collector, input, output, Duration::from_secs(2));

        assert!(app.handle_external_signal(MessageKind::Start, "ctl").is_none());
        assert_eq!(app.state(), CollectorState::Running);
        assert_eq!(app.drain_deadline(), None);

        app.handle_external_signal(MessageKind::Stop, "ctl");
        assert_eq!(app.state(), CollectorState::Draining);
        assert!(app.drain_deadline().is_some());

        // The timer firing before the deadline changes nothing.
        app.handle_timeout();
        assert_eq!(app.state(), CollectorState::Draining);
    }

    #[tokio::test]
    async fn terminate_ends_from_any_state() {
        let ctx = Context::new();
        let input = ConfirmedConnection::bind(&ctx, "inproc://unit-t-in", SocketOptions::new("c"))
            .await
            .unwrap();
        let output =
            LoadBalancedConnection::bind(&ctx, "inproc://unit-t-out", SocketOptions::new("c"), false)
                .await
                .unwrap();
        let mut app = Collector::new(AppKind::Collector, input, output, Duration::from_secs(2));

        app.handle_external_signal(MessageKind::Stop, "ctl");
        assert_eq!(
            app.handle_external_signal(MessageKind::Terminate, "ctl"),
            Some(ExitReason::Terminated("ctl".into()))
        );
    }

    #[tokio::test]
    async fn status_reports_state_and_connections() {
        let ctx = Context::new();
        let input = ConfirmedConnection::bind(&ctx, "inproc://unit-s-in", SocketOptions::new("c"))
            .await
            .unwrap();
        let output =
            LoadBalancedConnection::bind(&ctx, "inproc://unit-s-out", SocketOptions::new("c"), true)
                .await
                .unwrap();
        let app = Collector::new(AppKind::Collector, input, output, Duration::from_secs(2));

        let status = app.status();
        assert_eq!(status["app"], "collector");
        assert_eq!(status["state"], "running");
        assert_eq!(status["input"]["type"], "confirmed");
        assert_eq!(status["output"]["lax"], true);
    }

    #[tokio::test]
    #[traced_test]
    async fn unexpected_input_is_logged_and_ignored() {
        let ctx = Context::new();
        let input = ConfirmedConnection::bind(&ctx, "inproc://unit-v-in", SocketOptions::new("c"))
            .await
            .unwrap();
        let output =
            LoadBalancedConnection::bind(&ctx, "inproc://unit-v-out", SocketOptions::new("c"), false)
                .await
                .unwrap();
        let mut app = Collector::new(AppKind::Collector, input, output, Duration::from_secs(2));

        let exit = app.handle_input(InputEvent::Other {
            peer: "src".into(),
            message: Message::control(MessageKind::Ready),
        });

        assert!(exit.is_none());
        assert_eq!(app.state(), CollectorState::Running);
        assert_eq!(app.counters().protocol_violations, 1);
        assert!(logs_contain("protocol violation ignored"));
    }

    #[tokio::test]
    #[traced_test]
    async fn final_stage_filters_control_input_quietly() {
        let ctx = Context::new();
        let input = ConfirmedConnection::bind(&ctx, "inproc://unit-f-in", SocketOptions::new("c"))
            .await
            .unwrap();
        let output = RawConnection::bind(&ctx, "inproc://unit-f-out", SocketOptions::new("c"), false)
            .await
            .unwrap();
        let mut app =
            FinalCollector::new(AppKind::FinalCollector, input, output, Duration::from_secs(2));

        app.handle_input(InputEvent::Other {
            peer: "src".into(),
            message: Message::control(MessageKind::Goodbye),
        });

        assert_eq!(app.counters().filtered, 1);
        assert_eq!(app.counters().protocol_violations, 0);
        assert!(!logs_contain("protocol violation ignored"));
    }
}
