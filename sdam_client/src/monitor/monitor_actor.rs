use std::{sync::Arc, time::Duration};

use serde_json::json;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Span};
use uuid::Uuid;

use crate::{
    connection::{
        command_with_timeout, connect_with_timeout, Connection, ConnectionFactory,
        ConnectionOptions,
    },
    events::{
        EventEmitter, SdamEvent, ServerHeartbeatFailedEvent, ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello_reply::{HelloReply, TopologyVersion},
    round_trip_time::RoundTripTime,
    SdamError, ServerAddress, ServerDescription,
};

use super::{
    InterruptibleInterval, MonitorEvent, MonitorMessage, MonitorOptions, MonitorState, RttPinger,
};

/// Everything a single check needs, shared with the spawned check tasks.
#[derive(Debug)]
struct CheckContext {
    address: ServerAddress,
    factory: Box<dyn ConnectionFactory>,
    options: MonitorOptions,
    events: EventEmitter,
    round_trip_time: Arc<RoundTripTime>,
}

struct CheckSuccess {
    reply: HelloReply,
    round_trip_time_ms: f64,
}

struct CheckOutcome {
    /// The connection to keep for the next check, if it is still usable.
    connection: Option<Box<dyn Connection>>,
    result: Result<CheckSuccess, SdamError>,
}

struct RunningCheck {
    handle: JoinHandle<CheckOutcome>,
    cancel: CancellationToken,
    is_retry: bool,
}

impl RunningCheck {
    fn abort(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

pub(crate) struct MonitorActor {
    context: Arc<CheckContext>,
    receiver: mpsc::Receiver<MonitorMessage>,
    reports: mpsc::UnboundedSender<MonitorEvent>,
    cancel: CancellationToken,
    state: MonitorState,
    interval: InterruptibleInterval,
    connection: Option<Box<dyn Connection>>,
    /// The description this monitor last reported.
    description: ServerDescription,
    check: Option<RunningCheck>,
    rtt_pinger: Option<RttPinger>,
}

impl MonitorActor {
    pub(crate) fn new(
        address: ServerAddress,
        factory: Box<dyn ConnectionFactory>,
        options: MonitorOptions,
        events: EventEmitter,
        receiver: mpsc::Receiver<MonitorMessage>,
        reports: mpsc::UnboundedSender<MonitorEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let interval =
            InterruptibleInterval::new(options.heartbeat_frequency, options.min_heartbeat_frequency);
        Self {
            description: ServerDescription::new(&address),
            context: Arc::new(CheckContext {
                address,
                factory,
                options,
                events,
                round_trip_time: Arc::new(RoundTripTime::default()),
            }),
            receiver,
            reports,
            cancel,
            state: MonitorState::Closed,
            interval,
            connection: None,
            check: None,
            rtt_pinger: None,
        }
    }

    #[instrument(
        level = "debug",
        name = "Monitor Actor - Handle Message",
        skip(self),
        fields(address = %self.context.address, correlation_id)
    )]
    fn handle_message(&mut self, msg: MonitorMessage) {
        Span::current().record("correlation_id", Uuid::new_v4().to_string());
        match msg {
            MonitorMessage::Connect => {
                if self.state != MonitorState::Closed {
                    return;
                }
                self.transition(MonitorState::Monitoring);
                self.start_check(false);
            }
            MonitorMessage::RequestCheck => {
                if !self.state.accepts_check_requests() {
                    tracing::trace!(state = %self.state, "Ignoring check request");
                    return;
                }
                let decision = self.interval.wake(Instant::now());
                tracing::trace!(?decision, "Check requested");
            }
            MonitorMessage::Reset => self.reset(),
            MonitorMessage::Close { respond_to } => {
                self.close();
                let _ = respond_to.send(());
            }
        }
    }

    fn transition(&mut self, next: MonitorState) {
        if self.state.can_transition_to(next) {
            tracing::trace!("Monitor state {} -> {}", self.state, next);
            self.state = next;
        } else {
            tracing::error!(
                "Illegal monitor state transition {} -> {}",
                self.state,
                next
            );
        }
    }

    fn is_awaitable(&self) -> bool {
        self.connection.is_some() && self.description.topology_version().is_some()
    }

    fn start_check(&mut self, is_retry: bool) {
        let now = Instant::now();
        self.interval.mark_called(now);
        self.transition(MonitorState::Monitoring);

        let topology_version = if self.is_awaitable() {
            self.ensure_rtt_pinger();
            self.description.topology_version().cloned()
        } else {
            None
        };

        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(check_server(
            self.context.clone(),
            self.connection.take(),
            topology_version,
            cancel.clone(),
        ));
        self.check = Some(RunningCheck {
            handle,
            cancel,
            is_retry,
        });
    }

    fn ensure_rtt_pinger(&mut self) {
        if self.rtt_pinger.as_ref().map_or(false, RttPinger::is_running) {
            return;
        }
        self.rtt_pinger = Some(RttPinger::start(
            self.context.address.clone(),
            self.context.factory.clone(),
            self.context.options.clone(),
            self.context.round_trip_time.clone(),
            self.cancel.child_token(),
        ));
    }

    fn finish_check(&mut self, joined: Result<CheckOutcome, JoinError>) {
        let is_retry = match self.check.take() {
            Some(check) => check.is_retry,
            None => false,
        };
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => return,
            Err(e) => CheckOutcome {
                connection: None,
                result: Err(SdamError::UnexpectedError(format!(
                    "heartbeat task failed: {}",
                    e
                ))),
            },
        };
        if self.state.is_closing_or_closed() {
            if let Some(mut connection) = outcome.connection {
                connection.destroy();
            }
            return;
        }
        self.connection = outcome.connection;

        match outcome.result {
            Ok(success) => {
                let streaming = success.reply.topology_version.is_some();
                let description = ServerDescription::from_hello_reply(
                    &self.context.address,
                    success.reply,
                    success.round_trip_time_ms,
                );
                self.report(description);
                self.transition(MonitorState::Idle);
                if streaming {
                    self.interval.schedule_now(Instant::now());
                } else {
                    self.interval.schedule_after_interval(Instant::now());
                }
            }
            Err(error) => {
                self.send(MonitorEvent::ResetConnectionPool(self.context.address.clone()));
                if !is_retry && self.description.is_known() && error.is_network_error() {
                    tracing::debug!("Heartbeat to a known server failed, retrying once");
                    self.start_check(true);
                    return;
                }
                self.context.round_trip_time.reset();
                self.report(ServerDescription::new_from_error(&self.context.address, error));
                self.transition(MonitorState::Idle);
                self.interval.schedule_after_interval(Instant::now());
            }
        }
    }

    fn report(&mut self, description: ServerDescription) {
        self.description = description.clone();
        self.send(MonitorEvent::ServerUpdated(Box::new(description)));
    }

    fn send(&self, event: MonitorEvent) {
        if self.reports.send(event).is_err() {
            tracing::trace!("Topology is gone, dropping monitor report");
        }
    }

    fn reset_monitor_state(&mut self) {
        if let Some(check) = self.check.take() {
            check.abort();
        }
        if let Some(mut connection) = self.connection.take() {
            connection.destroy();
        }
        if let Some(pinger) = self.rtt_pinger.take() {
            pinger.close();
        }
        self.interval.stop();
    }

    fn reset(&mut self) {
        if self.state.is_closing_or_closed() {
            return;
        }
        self.transition(MonitorState::Closing);
        self.reset_monitor_state();
        self.description = ServerDescription::new(&self.context.address);
        self.transition(MonitorState::Idle);
        self.interval.restart(Instant::now());
    }

    fn close(&mut self) {
        if self.state.is_closing_or_closed() {
            return;
        }
        self.transition(MonitorState::Closing);
        self.reset_monitor_state();
        self.transition(MonitorState::Closed);
        tracing::debug!("Monitor closed");
    }

    fn next_check_at(&self) -> Option<Instant> {
        if self.check.is_none() && self.state == MonitorState::Idle {
            self.interval.next_due()
        } else {
            None
        }
    }
}

/// Runs one heartbeat: an awaitable handshake on the existing connection when
/// `topology_version` is known, a plain handshake on the existing connection,
/// or a fresh connection followed by a handshake.
#[instrument(level = "debug", name = "Heartbeat", skip_all, fields(address = %context.address))]
async fn check_server(
    context: Arc<CheckContext>,
    connection: Option<Box<dyn Connection>>,
    topology_version: Option<TopologyVersion>,
    cancel: CancellationToken,
) -> CheckOutcome {
    let awaited = topology_version.is_some();
    context
        .events
        .emit(SdamEvent::ServerHeartbeatStarted(ServerHeartbeatStartedEvent {
            address: context.address.clone(),
            awaited,
        }));

    let start = Instant::now();
    let (connection, result) = run_handshake(&context, connection, topology_version, cancel).await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let result = result.and_then(|document| {
        let reply = HelloReply::from_document(&document).map_err(|e| {
            SdamError::UnexpectedError(format!("malformed handshake reply: {}", e))
        })?;
        if reply.ok {
            Ok((document, reply))
        } else {
            Err(SdamError::from_error_reply(&document))
        }
    });

    match result {
        Ok((document, reply)) => {
            let round_trip_time_ms = if awaited {
                context.round_trip_time.average().unwrap_or(elapsed_ms)
            } else {
                context.round_trip_time.add_sample(elapsed_ms)
            };
            context
                .events
                .emit(SdamEvent::ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent {
                    address: context.address.clone(),
                    duration: Duration::from_secs_f64(round_trip_time_ms / 1000.0),
                    reply: document,
                    awaited,
                }));
            CheckOutcome {
                connection,
                result: Ok(CheckSuccess {
                    reply,
                    round_trip_time_ms,
                }),
            }
        }
        Err(error) => {
            context
                .events
                .emit(SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                    address: context.address.clone(),
                    duration: Duration::from_secs_f64(elapsed_ms / 1000.0),
                    failure: error.to_string(),
                    awaited,
                }));
            if let Some(mut connection) = connection {
                connection.destroy();
            }
            CheckOutcome {
                connection: None,
                result: Err(error),
            }
        }
    }
}

async fn run_handshake(
    context: &CheckContext,
    connection: Option<Box<dyn Connection>>,
    topology_version: Option<TopologyVersion>,
    cancel: CancellationToken,
) -> (
    Option<Box<dyn Connection>>,
    Result<serde_json::Value, SdamError>,
) {
    let options = &context.options;
    let mut connection = match connection.filter(|c| !c.is_closed()) {
        Some(connection) => connection,
        None => {
            let connection_options = ConnectionOptions {
                connect_timeout: options.connect_timeout,
                monitoring: true,
            };
            match connect_with_timeout(
                context.factory.as_ref(),
                &context.address,
                &connection_options,
                cancel,
            )
            .await
            {
                Ok(connection) => connection,
                Err(e) => return (None, Err(e)),
            }
        }
    };

    let mut command = json!({ "ismaster": true });
    let timeout = match &topology_version {
        Some(topology_version) => {
            command["maxAwaitTimeMS"] = json!(options.heartbeat_frequency.as_millis() as u64);
            command["topologyVersion"] = topology_version.to_document();
            options
                .connect_timeout
                .saturating_add(options.heartbeat_frequency)
        }
        None => options.connect_timeout,
    };

    let result = command_with_timeout(connection.as_mut(), "admin", command, timeout).await;
    (Some(connection), result)
}

async fn wait_for_check(
    check: &mut Option<RunningCheck>,
) -> Result<CheckOutcome, JoinError> {
    match check {
        Some(check) => (&mut check.handle).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[instrument(
    level = "debug",
    name = "Running Monitor Actor",
    skip(actor),
    fields(address = %actor.context.address)
)]
pub(crate) async fn run_monitor_actor(mut actor: MonitorActor) {
    loop {
        let next_check_at = actor.next_check_at();
        tokio::select! {
            _ = actor.cancel.cancelled() => break,
            opt_msg = actor.receiver.recv() => {
                let msg = match opt_msg {
                    Some(msg) => msg,
                    None => break,
                };
                actor.handle_message(msg);
            },
            joined = wait_for_check(&mut actor.check) => actor.finish_check(joined),
            _ = sleep_until(next_check_at) => actor.start_check(false),
        }
    }
    actor.close();
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::{broadcast, mpsc};
    use tokio_util::sync::CancellationToken;

    use super::{run_monitor_actor, MonitorActor};
    use crate::{
        events::{EventEmitter, SdamEvent},
        monitor::{MonitorEvent, MonitorHandle, MonitorOptions},
        server_description::ServerType,
        test_util::{address, MockCluster, MockResponse},
    };

    fn options() -> MonitorOptions {
        MonitorOptions {
            heartbeat_frequency: Duration::from_millis(10_000),
            min_heartbeat_frequency: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(1_000),
        }
    }

    fn start(
        cluster: &MockCluster,
    ) -> (
        MonitorHandle,
        mpsc::UnboundedReceiver<MonitorEvent>,
        broadcast::Receiver<SdamEvent>,
    ) {
        let events = EventEmitter::new();
        let event_receiver = events.subscribe();
        let (reports, report_receiver) = mpsc::unbounded_channel();
        let monitor = MonitorHandle::new(
            address("a:27017"),
            Box::new(cluster.clone()),
            options(),
            events,
            reports,
            CancellationToken::new(),
        );
        (monitor, report_receiver, event_receiver)
    }

    async fn next_description(
        reports: &mut mpsc::UnboundedReceiver<MonitorEvent>,
    ) -> crate::ServerDescription {
        loop {
            match reports.recv().await.unwrap() {
                MonitorEvent::ServerUpdated(description) => return *description,
                MonitorEvent::ResetConnectionPool(_) => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_checks_immediately_and_reports_description() {
        let cluster = MockCluster::new();
        cluster.set_reply("a:27017", json!({ "ok": 1, "ismaster": true, "maxWireVersion": 9 }));
        let (monitor, mut reports, mut events) = start(&cluster);

        monitor.connect().await;
        let description = next_description(&mut reports).await;

        assert_eq!(description.server_type(), ServerType::Standalone);
        assert!(description.round_trip_time_ms() >= 0.0);
        assert!(matches!(
            events.recv().await.unwrap(),
            SdamEvent::ServerHeartbeatStarted(e) if !e.awaited
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SdamEvent::ServerHeartbeatSucceeded(_)
        ));
        monitor.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_check_reports_unknown_and_resets_pool() {
        let cluster = MockCluster::new();
        let (monitor, mut reports, _events) = start(&cluster);

        monitor.connect().await;

        assert!(matches!(
            reports.recv().await.unwrap(),
            MonitorEvent::ResetConnectionPool(_)
        ));
        let description = next_description(&mut reports).await;
        assert_eq!(description.server_type(), ServerType::Unknown);
        assert!(description.error().unwrap().is_network_error());
        monitor.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn known_server_is_retried_once_before_reporting_unknown() {
        let cluster = MockCluster::new();
        cluster.set_reply("a:27017", json!({ "ok": 1, "ismaster": true }));
        let (monitor, mut reports, _events) = start(&cluster);
        monitor.connect().await;
        assert!(next_description(&mut reports).await.is_known());

        cluster.set_response("a:27017", MockResponse::NetworkError);
        tokio::time::sleep(Duration::from_millis(10_001)).await;
        let description = next_description(&mut reports).await;

        assert_eq!(description.server_type(), ServerType::Unknown);
        // Initial connect, then one retry after the existing connection broke.
        assert_eq!(cluster.connection_count("a:27017"), 1);
        let handshakes = cluster.commands_sent_to("a:27017");
        assert_eq!(handshakes.len(), 2);
        monitor.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn request_check_pulls_next_heartbeat_in_to_min_frequency() {
        let cluster = MockCluster::new();
        cluster.set_reply("a:27017", json!({ "ok": 1, "ismaster": true }));
        let (monitor, mut reports, _events) = start(&cluster);
        monitor.connect().await;
        next_description(&mut reports).await;
        let started = tokio::time::Instant::now();

        monitor.request_check().await;
        next_description(&mut reports).await;

        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(500));
        assert!(waited < Duration::from_millis(10_000));
        monitor.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_reply_switches_to_awaitable_checks() {
        let cluster = MockCluster::new();
        cluster.set_reply(
            "a:27017",
            json!({
                "ok": 1, "ismaster": true,
                "topologyVersion": { "processId": "p1", "counter": 1 }
            }),
        );
        let (monitor, mut reports, _events) = start(&cluster);
        monitor.connect().await;
        next_description(&mut reports).await;
        next_description(&mut reports).await;

        let awaited = cluster
            .commands_sent_to("a:27017")
            .into_iter()
            .find(|c| c.get("maxAwaitTimeMS").is_some())
            .unwrap();
        assert_eq!(awaited["maxAwaitTimeMS"], json!(10_000));
        assert_eq!(awaited["topologyVersion"]["processId"], json!({ "$oid": "p1" }));
        // The heartbeat connection plus the RTT pinger's own.
        assert_eq!(cluster.connection_count("a:27017"), 2);
        monitor.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reset_abandons_in_flight_check_and_waits_a_full_interval() {
        let cluster = MockCluster::new();
        cluster.set_reply("a:27017", json!({ "ok": 1, "ismaster": true }));
        let (monitor, mut reports, _events) = start(&cluster);
        monitor.connect().await;
        next_description(&mut reports).await;

        cluster.set_response("a:27017", MockResponse::Hang);
        tokio::time::sleep(Duration::from_millis(10_001)).await;
        monitor.reset().await;
        cluster.set_reply("a:27017", json!({ "ok": 1, "ismaster": true }));
        let started = tokio::time::Instant::now();

        let description = next_description(&mut reports).await;

        assert_eq!(description.server_type(), ServerType::Standalone);
        assert!(started.elapsed() >= Duration::from_millis(10_000));
        // The hung connection was dropped and a fresh one opened.
        assert_eq!(cluster.connection_count("a:27017"), 2);
        monitor.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn request_check_after_reset_runs_immediately() {
        let cluster = MockCluster::new();
        cluster.set_reply("a:27017", json!({ "ok": 1, "ismaster": true }));
        let (monitor, mut reports, _events) = start(&cluster);
        monitor.connect().await;
        next_description(&mut reports).await;
        monitor.reset().await;
        let started = tokio::time::Instant::now();

        monitor.request_check().await;
        let description = next_description(&mut reports).await;

        assert_eq!(description.server_type(), ServerType::Standalone);
        assert!(started.elapsed() < Duration::from_millis(500));
        monitor.close().await;
    }

    #[tokio::test]
    async fn actor_stops_when_cancelled() {
        let cluster = MockCluster::new();
        let (_sender, receiver) = mpsc::channel(8);
        let (reports, _report_receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let actor = MonitorActor::new(
            address("a:27017"),
            Box::new(cluster),
            options(),
            EventEmitter::new(),
            receiver,
            reports,
            cancel.clone(),
        );
        let task = tokio::spawn(run_monitor_actor(actor));

        cancel.cancel();

        tokio_test::assert_ok!(task.await);
    }
}
