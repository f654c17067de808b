use std::collections::HashSet;

use crate::{ServerAddress, TopologyDescription};

/// The server objects to open and close so that the tracked set matches a
/// topology description.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ServerReconciliation {
    pub(crate) to_create: Vec<ServerAddress>,
    pub(crate) to_destroy: Vec<ServerAddress>,
}

#[cfg(test)]
impl ServerReconciliation {
    pub(crate) fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_destroy.is_empty()
    }
}

pub(crate) fn reconcile_servers<'a>(
    tracked: impl IntoIterator<Item = &'a ServerAddress>,
    description: &TopologyDescription,
) -> ServerReconciliation {
    let tracked = tracked.into_iter().collect::<HashSet<_>>();

    let mut to_create = description
        .server_addresses()
        .filter(|address| !tracked.contains(address))
        .cloned()
        .collect::<Vec<_>>();
    let mut to_destroy = tracked
        .into_iter()
        .filter(|address| !description.has_server(address))
        .cloned()
        .collect::<Vec<_>>();
    to_create.sort();
    to_destroy.sort();

    ServerReconciliation {
        to_create,
        to_destroy,
    }
}
