//! Monitoring events published by a [`Topology`](crate::Topology) and its monitors.
//!
//! Every event is sent on a broadcast channel (see
//! [`Topology::subscribe`](crate::Topology::subscribe)) and logged at debug level.
use std::{sync::Arc, time::Duration};

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{ServerAddress, ServerDescription, TopologyDescription};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub enum SdamEvent {
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    TopologyOpening(TopologyOpeningEvent),
    TopologyClosed(TopologyClosedEvent),
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

impl SdamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ServerOpening(_) => "serverOpening",
            Self::ServerClosed(_) => "serverClosed",
            Self::ServerDescriptionChanged(_) => "serverDescriptionChanged",
            Self::TopologyOpening(_) => "topologyOpening",
            Self::TopologyClosed(_) => "topologyClosed",
            Self::TopologyDescriptionChanged(_) => "topologyDescriptionChanged",
            Self::ServerHeartbeatStarted(_) => "serverHeartbeatStarted",
            Self::ServerHeartbeatSucceeded(_) => "serverHeartbeatSucceeded",
            Self::ServerHeartbeatFailed(_) => "serverHeartbeatFailed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerOpeningEvent {
    pub topology_id: Uuid,
    pub address: ServerAddress,
}

#[derive(Clone, Debug)]
pub struct ServerClosedEvent {
    pub topology_id: Uuid,
    pub address: ServerAddress,
}

#[derive(Clone, Debug)]
pub struct ServerDescriptionChangedEvent {
    pub topology_id: Uuid,
    pub address: ServerAddress,
    pub previous_description: ServerDescription,
    pub new_description: ServerDescription,
}

#[derive(Clone, Debug)]
pub struct TopologyOpeningEvent {
    pub topology_id: Uuid,
}

#[derive(Clone, Debug)]
pub struct TopologyClosedEvent {
    pub topology_id: Uuid,
}

#[derive(Clone, Debug)]
pub struct TopologyDescriptionChangedEvent {
    pub topology_id: Uuid,
    pub previous_description: Arc<TopologyDescription>,
    pub new_description: Arc<TopologyDescription>,
}

#[derive(Clone, Debug)]
pub struct ServerHeartbeatStartedEvent {
    pub address: ServerAddress,
    pub awaited: bool,
}

#[derive(Clone, Debug)]
pub struct ServerHeartbeatSucceededEvent {
    pub address: ServerAddress,
    pub duration: Duration,
    pub reply: serde_json::Value,
    pub awaited: bool,
}

#[derive(Clone, Debug)]
pub struct ServerHeartbeatFailedEvent {
    pub address: ServerAddress,
    pub duration: Duration,
    pub failure: String,
    pub awaited: bool,
}

/// Cheap to clone; every clone publishes to the same subscribers.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    sender: broadcast::Sender<SdamEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SdamEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: SdamEvent) {
        tracing::debug!(event = event.name(), "{:?}", &event);
        // Nobody listening is fine.
        let _ = self.sender.send(event);
    }
}
