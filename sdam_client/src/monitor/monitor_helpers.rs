use std::time::Duration;

use tokio::sync::oneshot;

use crate::{ServerAddress, ServerDescription, TopologyOptions};

#[derive(Debug)]
pub(crate) enum MonitorMessage {
    /// Starts monitoring. Ignored unless the monitor is closed.
    Connect,
    /// Asks for an early check, subject to the minimum heartbeat frequency.
    RequestCheck,
    /// Drops the monitoring connection and any check in flight, then waits a
    /// full heartbeat before checking again.
    Reset,
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

/// What a monitor tells the topology that owns it.
#[derive(Debug)]
pub(crate) enum MonitorEvent {
    ServerUpdated(Box<ServerDescription>),
    /// A check failed; application connections to the server are suspect.
    ResetConnectionPool(ServerAddress),
}

#[derive(Clone, Debug)]
pub(crate) struct MonitorOptions {
    pub(crate) heartbeat_frequency: Duration,
    pub(crate) min_heartbeat_frequency: Duration,
    pub(crate) connect_timeout: Duration,
}

impl From<&TopologyOptions> for MonitorOptions {
    fn from(options: &TopologyOptions) -> Self {
        Self {
            heartbeat_frequency: options.heartbeat_frequency,
            min_heartbeat_frequency: options.min_heartbeat_frequency,
            connect_timeout: options.connect_timeout,
        }
    }
}
