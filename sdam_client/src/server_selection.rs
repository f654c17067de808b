//! Server selection: pure filters that turn a topology snapshot and a
//! selection criteria into the list of suitable servers.
//!
//! For replica sets a read preference is applied as
//! `latency window ∘ tag sets ∘ max staleness ∘ server type`, except that
//! primary reads only look at the server type, and the `*Preferred` modes fall
//! back to the other role when their preferred role yields nothing.
//! Single and sharded topologies accept every known server.
use std::{fmt, sync::Arc, time::Duration};

use rand::seq::SliceRandom;

use crate::{
    read_preference::{ReadPreference, ReadPreferenceMode, TagSet},
    server_description::{ServerDescription, ServerType},
    topology_description::{TopologyDescription, TopologyType},
    SdamError,
};

/// Time between no-op writes a primary performs while idle.
pub const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);
/// The smallest max staleness ever accepted.
pub const SMALLEST_MAX_STALENESS: Duration = Duration::from_secs(90);

pub type ServerPredicate = Arc<dyn Fn(&ServerDescription) -> bool + Send + Sync>;

/// What the caller wants from the server it gets back.
#[derive(Clone)]
pub enum SelectionCriteria {
    ReadPreference(ReadPreference),
    /// Any server that accepts writes.
    Writable,
    /// Any known server the predicate accepts.
    Predicate(ServerPredicate),
}

impl fmt::Debug for SelectionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadPreference(rp) => f.debug_tuple("ReadPreference").field(rp).finish(),
            Self::Writable => f.write_str("Writable"),
            Self::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        Self::ReadPreference(ReadPreference::primary())
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_preference: ReadPreference) -> Self {
        Self::ReadPreference(read_preference)
    }
}

/// Returns every server in `topology` suitable for `criteria`, or an error if
/// the criteria can never be satisfied by this topology.
pub fn select_suitable_servers<'a>(
    criteria: &SelectionCriteria,
    topology: &'a TopologyDescription,
) -> Result<Vec<&'a ServerDescription>, SdamError> {
    let servers = topology.servers.values().collect::<Vec<_>>();
    match criteria {
        SelectionCriteria::ReadPreference(read_preference) => {
            read_preference_server_selector(read_preference, topology, servers)
        }
        SelectionCriteria::Writable => Ok(writable_server_selector(topology, servers)),
        SelectionCriteria::Predicate(predicate) => {
            let matching = servers
                .into_iter()
                .filter(|s| s.is_known() && predicate(s))
                .collect();
            Ok(latency_window_filter(topology.local_threshold, matching))
        }
    }
}

/// Picks uniformly at random among the candidates.
pub fn choose_server<'a>(servers: &[&'a ServerDescription]) -> Option<&'a ServerDescription> {
    servers.choose(&mut rand::thread_rng()).copied()
}

pub fn writable_server_selector<'a>(
    topology: &TopologyDescription,
    servers: Vec<&'a ServerDescription>,
) -> Vec<&'a ServerDescription> {
    let writable = servers.into_iter().filter(|s| s.is_writable()).collect();
    latency_window_filter(topology.local_threshold, writable)
}

pub fn read_preference_server_selector<'a>(
    read_preference: &ReadPreference,
    topology: &TopologyDescription,
    servers: Vec<&'a ServerDescription>,
) -> Result<Vec<&'a ServerDescription>, SdamError> {
    read_preference.validate()?;

    if let (Some(required), Some(common)) =
        (read_preference.min_wire_version, topology.common_wire_version)
    {
        if required > common {
            return Err(SdamError::Compatibility(format!(
                "Minimum wire version '{}' required, but found '{}'",
                required, common
            )));
        }
    }

    match topology.topology_type {
        TopologyType::Unknown => return Ok(Vec::new()),
        TopologyType::Single | TopologyType::Sharded => {
            let known = servers.into_iter().filter(|s| s.is_known()).collect();
            return Ok(latency_window_filter(topology.local_threshold, known));
        }
        TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {}
    }

    if let Some(max_staleness) = read_preference.max_staleness {
        verify_max_staleness(max_staleness, topology.heartbeat_frequency)?;
    }

    let primaries = || {
        servers
            .iter()
            .copied()
            .filter(|s| s.server_type == ServerType::RsPrimary)
            .collect::<Vec<_>>()
    };

    let mode = read_preference.mode;
    match mode {
        ReadPreferenceMode::Primary => return Ok(primaries()),
        ReadPreferenceMode::PrimaryPreferred => {
            let found = primaries();
            if !found.is_empty() {
                return Ok(found);
            }
        }
        _ => {}
    }

    let candidates = servers
        .iter()
        .copied()
        .filter(|s| match mode {
            ReadPreferenceMode::Nearest => {
                matches!(s.server_type, ServerType::RsPrimary | ServerType::RsSecondary)
            }
            _ => s.server_type == ServerType::RsSecondary,
        })
        .collect();

    let selected = latency_window_filter(
        topology.local_threshold,
        tag_set_filter(
            &read_preference.tag_sets,
            max_staleness_filter(read_preference.max_staleness, topology, candidates),
        ),
    );

    if mode == ReadPreferenceMode::SecondaryPreferred && selected.is_empty() {
        return Ok(primaries());
    }
    Ok(selected)
}

/// Max staleness must leave room for one heartbeat plus one idle write.
pub fn verify_max_staleness(
    max_staleness: Duration,
    heartbeat_frequency: Duration,
) -> Result<(), SdamError> {
    let smallest = std::cmp::max(
        SMALLEST_MAX_STALENESS,
        heartbeat_frequency.saturating_add(IDLE_WRITE_PERIOD),
    );
    if max_staleness < smallest {
        return Err(SdamError::InvalidArgument(format!(
            "maxStalenessSeconds must be at least {} seconds, got {}",
            smallest.as_secs(),
            max_staleness.as_secs()
        )));
    }
    Ok(())
}

/// Keeps the servers of the first tag set that matches anything. No match
/// at all yields no servers.
pub fn tag_set_filter<'a>(
    tag_sets: &[TagSet],
    servers: Vec<&'a ServerDescription>,
) -> Vec<&'a ServerDescription> {
    if tag_sets.is_empty() {
        return servers;
    }
    for tag_set in tag_sets {
        let matching = servers
            .iter()
            .copied()
            .filter(|s| tag_set.iter().all(|(k, v)| s.tags.get(k) == Some(v)))
            .collect::<Vec<_>>();
        if !matching.is_empty() {
            return matching;
        }
    }
    Vec::new()
}

pub fn max_staleness_filter<'a>(
    max_staleness: Option<Duration>,
    topology: &TopologyDescription,
    servers: Vec<&'a ServerDescription>,
) -> Vec<&'a ServerDescription> {
    let max_staleness = match max_staleness {
        Some(max_staleness) => max_staleness.as_millis() as i64,
        None => return servers,
    };
    let heartbeat_ms = topology.heartbeat_frequency.as_millis() as i64;

    let staleness_of: Box<dyn Fn(&ServerDescription) -> i64> = match topology.primary() {
        Some(primary) => {
            let primary_lag =
                primary.last_update_time - primary.last_write_date.unwrap_or_default();
            Box::new(move |s| {
                (s.last_update_time - s.last_write_date.unwrap_or_default()) - primary_lag
                    + heartbeat_ms
            })
        }
        None => {
            let max_last_write = servers
                .iter()
                .filter(|s| s.server_type == ServerType::RsSecondary)
                .filter_map(|s| s.last_write_date)
                .max()
                .unwrap_or_default();
            Box::new(move |s| max_last_write - s.last_write_date.unwrap_or_default() + heartbeat_ms)
        }
    };

    servers
        .into_iter()
        .filter(|s| staleness_of(s) <= max_staleness)
        .collect()
}

/// Keeps the servers whose round trip time is within `local_threshold` of the fastest.
pub fn latency_window_filter<'a>(
    local_threshold: Duration,
    servers: Vec<&'a ServerDescription>,
) -> Vec<&'a ServerDescription> {
    let low = match servers
        .iter()
        .map(|s| s.round_trip_time_ms)
        .min_by(|a, b| a.total_cmp(b))
    {
        Some(low) => low,
        None => return servers,
    };
    let high = low + local_threshold.as_millis() as f64;

    servers
        .into_iter()
        .filter(|s| s.round_trip_time_ms >= low && s.round_trip_time_ms <= high)
        .collect()
}
