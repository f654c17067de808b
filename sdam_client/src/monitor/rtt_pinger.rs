use std::sync::Arc;

use serde_json::json;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    connection::{
        command_with_timeout, connect_with_timeout, Connection, ConnectionFactory,
        ConnectionOptions,
    },
    round_trip_time::RoundTripTime,
    ServerAddress,
};

use super::MonitorOptions;

/// Samples round trip time on its own connection while the monitor's
/// connection is blocked in awaitable handshakes.
#[derive(Debug)]
pub(crate) struct RttPinger {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl RttPinger {
    pub(crate) fn start(
        address: ServerAddress,
        factory: Box<dyn ConnectionFactory>,
        options: MonitorOptions,
        round_trip_time: Arc<RoundTripTime>,
        cancel: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(run_rtt_pinger(
            address,
            factory,
            options,
            round_trip_time,
            cancel.clone(),
        ));
        Self { handle, cancel }
    }

    /// The pinger stops by itself after its first failure.
    pub(crate) fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub(crate) fn close(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

#[instrument(level = "debug", name = "Running RTT Pinger", skip_all, fields(address = %address))]
async fn run_rtt_pinger(
    address: ServerAddress,
    factory: Box<dyn ConnectionFactory>,
    options: MonitorOptions,
    round_trip_time: Arc<RoundTripTime>,
    cancel: CancellationToken,
) {
    let connection_options = ConnectionOptions {
        connect_timeout: options.connect_timeout,
        monitoring: true,
    };
    let mut connection: Option<Box<dyn Connection>> = None;

    loop {
        let start = Instant::now();
        let sample = match connection.as_mut() {
            Some(existing) => command_with_timeout(
                existing.as_mut(),
                "admin",
                json!({ "ismaster": 1 }),
                options.connect_timeout,
            )
            .await
            .map(|_| ()),
            None => connect_with_timeout(
                factory.as_ref(),
                &address,
                &connection_options,
                cancel.child_token(),
            )
            .await
            .map(|opened| connection = Some(opened)),
        };

        if let Err(e) = sample {
            tracing::debug!("Round trip time sample failed, stopping pinger. Caused by: {}", e);
            if let Some(mut broken) = connection.take() {
                broken.destroy();
            }
            round_trip_time.reset();
            return;
        }
        let average = round_trip_time.add_sample(start.elapsed().as_secs_f64() * 1000.0);
        tracing::trace!(average, "Sampled round trip time");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(options.heartbeat_frequency) => {},
        }
    }

    if let Some(mut open) = connection.take() {
        open.destroy();
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use std::{sync::Arc, time::Duration};

    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::RttPinger;
    use crate::{
        monitor::MonitorOptions,
        round_trip_time::RoundTripTime,
        test_util::{address, MockCluster},
    };

    fn options() -> MonitorOptions {
        MonitorOptions {
            heartbeat_frequency: Duration::from_millis(10_000),
            min_heartbeat_frequency: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(1_000),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pinger_samples_on_its_own_connection_every_heartbeat() {
        let cluster = MockCluster::new();
        cluster.set_reply("a:27017", json!({ "ok": 1, "ismaster": true }));
        let round_trip_time = Arc::new(RoundTripTime::default());

        let pinger = RttPinger::start(
            address("a:27017"),
            Box::new(cluster.clone()),
            options(),
            round_trip_time.clone(),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(cluster.connection_count("a:27017"), 1);
        assert!(round_trip_time.average().is_some());
        assert!(cluster.commands_sent_to("a:27017").is_empty());

        tokio::time::sleep(Duration::from_millis(20_000)).await;

        assert_eq!(cluster.connection_count("a:27017"), 1);
        assert_eq!(
            cluster.commands_sent_to("a:27017"),
            vec![json!({ "ismaster": 1 }), json!({ "ismaster": 1 })]
        );
        assert!(pinger.is_running());
        pinger.close();
    }

    #[tokio::test(start_paused = true)]
    async fn pinger_stops_and_forgets_the_average_after_a_failure() {
        // Nothing scripted for the address, so connecting is refused.
        let cluster = MockCluster::new();
        let round_trip_time = Arc::new(RoundTripTime::default());
        round_trip_time.add_sample(5.0);

        let pinger = RttPinger::start(
            address("a:27017"),
            Box::new(cluster),
            options(),
            round_trip_time.clone(),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(!pinger.is_running());
        assert_eq!(round_trip_time.average(), None);
    }
}
