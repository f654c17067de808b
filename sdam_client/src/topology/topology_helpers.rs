use std::{collections::HashMap, fmt, sync::Arc};

use tokio::sync::oneshot;

use crate::{
    SdamError, SelectionCriteria, Server, ServerAddress, TopologyDescription,
};

#[derive(Debug)]
pub(crate) enum TopologyMessage {
    Connect {
        respond_to: oneshot::Sender<()>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
    /// Wakes every monitor after a selection attempt found nothing suitable.
    RequestImmediateCheck,
    /// An operation against `address` failed with `error` on a connection
    /// from pool generation `generation`.
    HandleApplicationError {
        address: ServerAddress,
        error: SdamError,
        generation: Option<u32>,
        respond_to: oneshot::Sender<()>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TopologyLifecycle {
    /// Never connected, or closed since.
    Closed,
    Connected,
    Closing,
}

/// What selection reads: published by the actor after every accepted change.
#[derive(Clone)]
pub(crate) struct TopologySnapshot {
    pub(crate) lifecycle: TopologyLifecycle,
    pub(crate) description: Arc<TopologyDescription>,
    pub(crate) servers: Arc<HashMap<ServerAddress, Arc<Server>>>,
}

impl fmt::Debug for TopologySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologySnapshot")
            .field("lifecycle", &self.lifecycle)
            .field("topology_type", &self.description.topology_type())
            .field("servers", &self.servers.len())
            .finish()
    }
}

/// Options for [`Topology::command`](crate::Topology::command).
#[derive(Clone, Debug, Default)]
pub struct CommandOptions {
    /// Defaults to the primary.
    pub selection_criteria: Option<SelectionCriteria>,
    /// Retry once on a freshly selected server after a retryable error.
    pub retryable: bool,
}

/// True when a reply document carries a truthy `ok`.
pub(crate) fn is_ok_reply(reply: &serde_json::Value) -> bool {
    match reply.get("ok") {
        Some(serde_json::Value::Bool(ok)) => *ok,
        Some(serde_json::Value::Number(ok)) => ok.as_f64().map_or(false, |ok| ok != 0.0),
        _ => false,
    }
}
