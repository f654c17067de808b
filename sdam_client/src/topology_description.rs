use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use serde::Serialize;

use crate::{
    hello_reply::ElectionId,
    server_description::{ServerDescription, ServerType},
    SdamError, ServerAddress, TopologyOptions,
};

/// The believed shape of the whole deployment.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Serialize)]
pub enum TopologyType {
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    #[default]
    Unknown,
}

impl TopologyType {
    pub fn is_replica_set(self) -> bool {
        matches!(self, Self::ReplicaSetNoPrimary | Self::ReplicaSetWithPrimary)
    }
}

/// An immutable snapshot of the whole cluster. New snapshots are produced by
/// [`TopologyDescription::update`], never by mutating an existing one.
#[derive(Clone, Debug)]
pub struct TopologyDescription {
    pub(crate) topology_type: TopologyType,
    pub(crate) set_name: Option<String>,
    pub(crate) max_set_version: Option<i32>,
    pub(crate) max_election_id: Option<ElectionId>,
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
    pub(crate) common_wire_version: Option<i32>,
    pub(crate) compatibility_error: Option<String>,
    pub(crate) logical_session_timeout_minutes: Option<i64>,
    pub(crate) heartbeat_frequency: Duration,
    pub(crate) local_threshold: Duration,
}

impl Default for TopologyDescription {
    fn default() -> Self {
        Self::new(&TopologyOptions::default())
    }
}

impl TopologyDescription {
    /// The initial description for a set of seeds: every seed is tracked as
    /// Unknown and the type is inferred from the options alone.
    pub fn new(options: &TopologyOptions) -> Self {
        let servers = options
            .hosts
            .iter()
            .map(|address| (address.clone(), ServerDescription::new(address)))
            .collect();

        Self {
            topology_type: options.initial_topology_type(),
            set_name: options.replica_set.clone(),
            max_set_version: None,
            max_election_id: None,
            servers,
            common_wire_version: None,
            compatibility_error: None,
            logical_session_timeout_minutes: None,
            heartbeat_frequency: options.heartbeat_frequency,
            local_threshold: options.local_threshold,
        }
    }

    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    pub fn max_set_version(&self) -> Option<i32> {
        self.max_set_version
    }

    pub fn max_election_id(&self) -> Option<ElectionId> {
        self.max_election_id
    }

    pub fn servers(&self) -> &HashMap<ServerAddress, ServerDescription> {
        &self.servers
    }

    pub fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub fn has_server(&self, address: &ServerAddress) -> bool {
        self.servers.contains_key(address)
    }

    pub fn get_server_description(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub fn common_wire_version(&self) -> Option<i32> {
        self.common_wire_version
    }

    pub fn compatibility_error(&self) -> Option<&str> {
        self.compatibility_error.as_deref()
    }

    pub fn is_compatible(&self) -> bool {
        self.compatibility_error.is_none()
    }

    pub fn logical_session_timeout_minutes(&self) -> Option<i64> {
        self.logical_session_timeout_minutes
    }

    pub fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_frequency
    }

    pub fn local_threshold(&self) -> Duration {
        self.local_threshold
    }

    pub fn has_primary(&self) -> bool {
        self.servers
            .values()
            .any(|s| s.server_type == ServerType::RsPrimary)
    }

    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers
            .values()
            .find(|s| s.server_type == ServerType::RsPrimary)
    }

    /// The first error recorded against any tracked server, used to give
    /// selection timeouts some context.
    pub fn error(&self) -> Option<&SdamError> {
        self.servers.values().find_map(|s| s.error.as_ref())
    }

    /// True when `server_description` comes from an older topology version of
    /// the same server process than the one currently recorded.
    pub fn is_stale_server_description(&self, server_description: &ServerDescription) -> bool {
        let current = match self.servers.get(&server_description.address) {
            Some(current) => current,
            None => return false,
        };
        match (
            current.topology_version.as_ref(),
            server_description.topology_version.as_ref(),
        ) {
            (Some(current_tv), Some(new_tv)) => new_tv.is_older_than(current_tv),
            _ => false,
        }
    }

    /// Folds one new server description into the topology and returns the
    /// resulting description. Reports for untracked addresses are ignored.
    pub fn update(&self, server_description: ServerDescription) -> TopologyDescription {
        let mut next = self.clone();
        if next.servers.contains_key(&server_description.address) {
            next.apply(server_description);
        }
        next
    }

    /// Compares against `other` (the newer description), returning `None` if
    /// they are equal.
    pub fn diff<'a>(&'a self, other: &'a TopologyDescription) -> Option<TopologyDescriptionDiff<'a>> {
        if self == other {
            return None;
        }

        let addresses: HashSet<&ServerAddress> = self.server_addresses().collect();
        let other_addresses: HashSet<&ServerAddress> = other.server_addresses().collect();

        let changed_servers = self
            .servers
            .iter()
            .filter_map(|(address, description)| match other.servers.get(address) {
                Some(other_description) if description != other_description => {
                    Some((address, (description, other_description)))
                }
                _ => None,
            })
            .collect();

        Some(TopologyDescriptionDiff {
            removed_addresses: addresses.difference(&other_addresses).cloned().collect(),
            added_addresses: other_addresses.difference(&addresses).cloned().collect(),
            changed_servers,
        })
    }

    fn apply(&mut self, mut server_description: ServerDescription) {
        if server_description.max_wire_version != 0 {
            self.common_wire_version = Some(
                self.common_wire_version
                    .map_or(server_description.max_wire_version, |v| {
                        v.min(server_description.max_wire_version)
                    }),
            );
        }

        if self.topology_type == TopologyType::Single {
            if let Some(expected) = self.set_name.as_deref() {
                if server_description.is_known() && server_description.set_name() != Some(expected) {
                    let got = server_description.set_name().unwrap_or("<none>").to_string();
                    server_description = ServerDescription::new_from_error(
                        &server_description.address,
                        SdamError::InvalidArgument(format!(
                            "replicaSet name {:?} does not match actual name {:?}",
                            expected, got
                        )),
                    );
                }
            }
        }

        self.servers.insert(
            server_description.address.clone(),
            server_description.clone(),
        );

        match self.topology_type {
            TopologyType::Single => {}
            TopologyType::Unknown => self.update_unknown_topology(server_description),
            TopologyType::Sharded => self.update_sharded_topology(server_description),
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
                self.update_replica_set_topology(server_description)
            }
        }

        self.update_logical_session_timeout();
        self.check_compatibility();
    }

    fn update_unknown_topology(&mut self, server_description: ServerDescription) {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost | ServerType::PossiblePrimary => {}
            ServerType::Standalone => {
                self.servers.remove(&server_description.address);
            }
            ServerType::Mongos => self.topology_type = TopologyType::Sharded,
            ServerType::RsPrimary => {
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.update_rs_from_primary(server_description);
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_rs_without_primary(server_description);
            }
        }
    }

    fn update_sharded_topology(&mut self, server_description: ServerDescription) {
        match server_description.server_type {
            ServerType::Unknown | ServerType::Mongos => {}
            _ => {
                self.servers.remove(&server_description.address);
            }
        }
    }

    fn update_replica_set_topology(&mut self, server_description: ServerDescription) {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost | ServerType::PossiblePrimary => {}
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&server_description.address);
            }
            ServerType::RsPrimary => self.update_rs_from_primary(server_description),
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                if self.has_primary() {
                    self.update_rs_with_primary_from_member(server_description);
                } else {
                    self.update_rs_without_primary(server_description);
                }
            }
        }
        self.record_primary_state();
    }

    fn update_rs_without_primary(&mut self, server_description: ServerDescription) {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name.clone();
        } else if self.set_name != server_description.set_name {
            self.servers.remove(&server_description.address);
            return;
        }

        self.add_new_servers(server_description.known_hosts().cloned());

        if let Some(primary) = server_description.primary.as_ref() {
            if let Some(current) = self.servers.get(primary) {
                if current.server_type == ServerType::Unknown {
                    let mut possible_primary = ServerDescription::new(primary);
                    possible_primary.server_type = ServerType::PossiblePrimary;
                    self.servers.insert(primary.clone(), possible_primary);
                }
            }
        }

        if server_description.has_mismatched_me() {
            self.servers.remove(&server_description.address);
        }
    }

    fn update_rs_with_primary_from_member(&mut self, server_description: ServerDescription) {
        if self.set_name != server_description.set_name || server_description.has_mismatched_me()
        {
            self.servers.remove(&server_description.address);
        }
    }

    fn update_rs_from_primary(&mut self, server_description: ServerDescription) {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name.clone();
        } else if self.set_name != server_description.set_name {
            self.servers.remove(&server_description.address);
            self.record_primary_state();
            return;
        }

        if let (Some(set_version), Some(election_id)) =
            (server_description.set_version, server_description.election_id)
        {
            if let (Some(max_set_version), Some(max_election_id)) =
                (self.max_set_version, self.max_election_id)
            {
                if (max_set_version, max_election_id) > (set_version, election_id) {
                    tracing::debug!(
                        "Ignoring stale primary report from {}: ({}, {}) is older than ({}, {})",
                        server_description.address,
                        set_version,
                        election_id,
                        max_set_version,
                        max_election_id
                    );
                    self.servers.insert(
                        server_description.address.clone(),
                        ServerDescription::new(&server_description.address),
                    );
                    self.record_primary_state();
                    return;
                }
            }
            self.max_election_id = Some(election_id);
        }

        if let Some(set_version) = server_description.set_version {
            if self.max_set_version.map_or(true, |max| set_version > max) {
                self.max_set_version = Some(set_version);
            }
        }

        let addresses = self.servers.keys().cloned().collect::<Vec<_>>();

        // Only one primary is believed at a time; the others get re-checked.
        for address in addresses.iter() {
            if *address == server_description.address {
                continue;
            }
            let is_primary = self
                .servers
                .get(address)
                .map(|s| s.server_type == ServerType::RsPrimary)
                .unwrap_or(false);
            if is_primary {
                self.servers
                    .insert(address.clone(), ServerDescription::new(address));
            }
        }

        let known_hosts = server_description
            .known_hosts()
            .cloned()
            .collect::<HashSet<_>>();
        self.add_new_servers(known_hosts.iter().cloned());

        for address in addresses {
            if !known_hosts.contains(&address) {
                self.servers.remove(&address);
            }
        }

        self.record_primary_state();
    }

    fn record_primary_state(&mut self) {
        self.topology_type = if self.has_primary() {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    fn add_new_servers(&mut self, addresses: impl IntoIterator<Item = ServerAddress>) {
        for address in addresses {
            self.servers
                .entry(address.clone())
                .or_insert_with(|| ServerDescription::new(&address));
        }
    }

    fn update_logical_session_timeout(&mut self) {
        let mut readable = self.servers.values().filter(|s| s.is_readable()).peekable();
        if readable.peek().is_none() {
            self.logical_session_timeout_minutes = None;
            return;
        }
        // A single readable server without a value disables sessions.
        self.logical_session_timeout_minutes = readable
            .map(|s| s.logical_session_timeout_minutes)
            .try_fold(i64::MAX, |min, value| value.map(|v| min.min(v)));
    }

    fn check_compatibility(&mut self) {
        self.compatibility_error = self
            .servers
            .values()
            .find_map(|s| s.compatibility_error_message());
    }
}

/// Only the fields server selection looks at take part in equality, so an
/// unchanged comparison means selection would see the same cluster.
impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        self.topology_type == other.topology_type
            && self.compatibility_error == other.compatibility_error
            && self.servers == other.servers
    }
}

#[derive(Debug)]
pub struct TopologyDescriptionDiff<'a> {
    pub removed_addresses: HashSet<&'a ServerAddress>,
    pub added_addresses: HashSet<&'a ServerAddress>,
    pub changed_servers: HashMap<&'a ServerAddress, (&'a ServerDescription, &'a ServerDescription)>,
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use serde_json::json;

    use super::{TopologyDescription, TopologyType};
    use crate::{
        server_description::ServerType,
        test_util::{address, description, election_id, topology_options},
    };

    fn replica_set(seeds: &[&str]) -> TopologyDescription {
        let mut options = topology_options(seeds);
        options.replica_set = Some("rs0".to_string());
        TopologyDescription::new(&options)
    }

    fn primary(host: &str, hosts: &[&str], set_version: i32, election: u8) -> crate::ServerDescription {
        description(
            host,
            json!({
                "ok": 1, "ismaster": true, "setName": "rs0", "hosts": hosts,
                "setVersion": set_version, "electionId": election_id(election),
                "minWireVersion": 0, "maxWireVersion": 9
            }),
        )
    }

    fn secondary(host: &str, hosts: &[&str]) -> crate::ServerDescription {
        description(
            host,
            json!({
                "ok": 1, "secondary": true, "setName": "rs0", "hosts": hosts,
                "minWireVersion": 0, "maxWireVersion": 9
            }),
        )
    }

    #[test]
    fn new_infers_initial_type_from_options() {
        assert_eq!(
            TopologyDescription::new(&topology_options(&["a:27017"])).topology_type(),
            TopologyType::Single
        );
        assert_eq!(
            TopologyDescription::new(&topology_options(&["a:27017", "b:27017"])).topology_type(),
            TopologyType::Unknown
        );
        assert_eq!(replica_set(&["a:27017"]).topology_type(), TopologyType::ReplicaSetNoPrimary);
    }

    #[test]
    fn single_seed_standalone_stays_single() {
        let topology = TopologyDescription::new(&topology_options(&["a:27017"]));

        let updated = topology.update(description(
            "a:27017",
            json!({ "ok": 1, "ismaster": true, "minWireVersion": 0, "maxWireVersion": 9 }),
        ));

        assert_eq!(updated.topology_type(), TopologyType::Single);
        assert_eq!(
            updated.servers()[&address("a:27017")].server_type(),
            ServerType::Standalone
        );
    }

    #[test]
    fn single_never_reclassifies() {
        let mut topology = TopologyDescription::new(&topology_options(&["a:27017"]));
        let reports = [
            json!({ "ok": 1, "ismaster": true, "setName": "rs0", "hosts": ["a:27017", "b:27017"] }),
            json!({ "ok": 1, "msg": "isdbgrid" }),
            json!({ "ok": 0 }),
            json!({ "ok": 1, "secondary": true, "setName": "rs0" }),
        ];

        for report in reports {
            topology = topology.update(description("a:27017", report));
            assert_eq!(topology.topology_type(), TopologyType::Single);
            assert_eq!(topology.servers().len(), 1);
        }
    }

    #[test]
    fn single_with_configured_set_name_rejects_mismatched_reply() {
        let mut options = topology_options(&["a:27017"]);
        options.replica_set = Some("rs0".to_string());
        options.direct_connection = Some(true);
        let topology = TopologyDescription::new(&options);

        let updated = topology.update(description(
            "a:27017",
            json!({ "ok": 1, "ismaster": true, "setName": "other" }),
        ));

        let server = &updated.servers()[&address("a:27017")];
        assert_eq!(server.server_type(), ServerType::Unknown);
        assert!(server.error().is_some());
    }

    #[test]
    fn unknown_topology_drops_standalone_from_multiple_seeds() {
        let topology = TopologyDescription::new(&topology_options(&["a:27017", "b:27017"]));

        let updated = topology.update(description("a:27017", json!({ "ok": 1, "ismaster": true })));

        assert_eq!(updated.topology_type(), TopologyType::Unknown);
        assert!(!updated.has_server(&address("a:27017")));
        assert!(updated.has_server(&address("b:27017")));
    }

    #[test]
    fn unknown_topology_becomes_sharded_and_drops_non_mongos() {
        let topology = TopologyDescription::new(&topology_options(&["a:27017", "b:27017"]));

        let sharded = topology.update(description("a:27017", json!({ "ok": 1, "msg": "isdbgrid" })));
        let updated = sharded.update(secondary("b:27017", &["b:27017"]));

        assert_eq!(sharded.topology_type(), TopologyType::Sharded);
        assert_eq!(updated.topology_type(), TopologyType::Sharded);
        assert!(!updated.has_server(&address("b:27017")));
    }

    #[test]
    fn primary_report_discovers_hosts_as_unknown() {
        let topology = replica_set(&["a:27017", "b:27017", "c:27017"]);

        let updated = topology.update(primary("a:27017", &["a:27017", "b:27017", "c:27017"], 1, 1));

        assert_eq!(updated.topology_type(), TopologyType::ReplicaSetWithPrimary);
        assert_eq!(updated.servers().len(), 3);
        assert_eq!(updated.servers()[&address("b:27017")].server_type(), ServerType::Unknown);
        assert_eq!(updated.servers()[&address("c:27017")].server_type(), ServerType::Unknown);
        assert_eq!(updated.max_set_version(), Some(1));
    }

    #[test]
    fn primary_report_removes_hosts_it_does_not_list() {
        let topology = replica_set(&["a:27017", "b:27017", "z:27017"]);

        let updated = topology.update(primary("a:27017", &["a:27017", "b:27017", "c:27017"], 1, 1));

        assert!(!updated.has_server(&address("z:27017")));
        assert!(updated.has_server(&address("c:27017")));
    }

    #[test]
    fn new_primary_demotes_old_primary_to_unknown() {
        let hosts = ["a:27017", "b:27017"];
        let topology = replica_set(&hosts)
            .update(primary("a:27017", &hosts, 1, 1))
            .update(primary("b:27017", &hosts, 1, 2));

        assert_eq!(topology.servers()[&address("a:27017")].server_type(), ServerType::Unknown);
        assert_eq!(topology.servers()[&address("b:27017")].server_type(), ServerType::RsPrimary);
        assert_eq!(topology.max_election_id(), Some(election_id(2).parse().unwrap()));
    }

    #[test]
    fn stale_primary_with_lower_set_version_is_rejected() {
        let hosts = ["a:27017", "b:27017"];
        let topology = replica_set(&hosts)
            .update(primary("a:27017", &hosts, 5, 5))
            .update(primary("b:27017", &hosts, 4, 9));

        assert_eq!(topology.servers()[&address("b:27017")].server_type(), ServerType::Unknown);
        assert_eq!(topology.servers()[&address("a:27017")].server_type(), ServerType::RsPrimary);
        assert_eq!(topology.max_set_version(), Some(5));
    }

    #[test]
    fn stale_primary_with_equal_set_version_and_lower_election_id_is_rejected() {
        let hosts = ["a:27017", "b:27017"];
        let topology = replica_set(&hosts)
            .update(primary("a:27017", &hosts, 5, 5))
            .update(primary("b:27017", &hosts, 5, 4));

        assert_eq!(topology.servers()[&address("b:27017")].server_type(), ServerType::Unknown);
        assert_eq!(topology.max_election_id(), Some(election_id(5).parse().unwrap()));
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    }

    #[test]
    fn primary_with_wrong_set_name_is_dropped() {
        let topology = replica_set(&["a:27017", "b:27017"]);

        let updated = topology.update(description(
            "a:27017",
            json!({ "ok": 1, "ismaster": true, "setName": "other", "hosts": ["a:27017"] }),
        ));

        assert!(!updated.has_server(&address("a:27017")));
        assert_eq!(updated.topology_type(), TopologyType::ReplicaSetNoPrimary);
    }

    #[test]
    fn member_with_mismatched_me_is_dropped() {
        let topology = replica_set(&["a:27017", "b:27017"]);

        let updated = topology.update(description(
            "a:27017",
            json!({ "ok": 1, "secondary": true, "setName": "rs0", "me": "x:27017", "hosts": ["x:27017"] }),
        ));

        assert!(!updated.has_server(&address("a:27017")));
        assert!(updated.has_server(&address("x:27017")));
    }

    #[test]
    fn member_without_primary_merges_hosts_and_marks_possible_primary() {
        let topology = replica_set(&["b:27017"]);

        let updated = topology.update(description(
            "b:27017",
            json!({
                "ok": 1, "secondary": true, "setName": "rs0",
                "hosts": ["a:27017", "b:27017", "c:27017"], "primary": "a:27017"
            }),
        ));

        assert_eq!(updated.servers().len(), 3);
        assert_eq!(
            updated.servers()[&address("a:27017")].server_type(),
            ServerType::PossiblePrimary
        );
        assert_eq!(updated.topology_type(), TopologyType::ReplicaSetNoPrimary);
    }

    #[test]
    fn member_with_primary_known_does_not_merge_hosts() {
        let hosts = ["a:27017", "b:27017"];
        let topology = replica_set(&hosts).update(primary("a:27017", &hosts, 1, 1));

        let updated = topology.update(secondary("b:27017", &["a:27017", "b:27017", "d:27017"]));

        assert!(!updated.has_server(&address("d:27017")));
        assert_eq!(updated.servers()[&address("b:27017")].server_type(), ServerType::RsSecondary);
    }

    #[test]
    fn standalone_in_replica_set_is_dropped_and_primary_state_recomputed() {
        let hosts = ["a:27017", "b:27017"];
        let topology = replica_set(&hosts).update(primary("a:27017", &hosts, 1, 1));

        let updated = topology.update(description("a:27017", json!({ "ok": 1, "ismaster": true })));

        assert!(!updated.has_server(&address("a:27017")));
        assert_eq!(updated.topology_type(), TopologyType::ReplicaSetNoPrimary);
    }

    #[test]
    fn primary_going_unknown_downgrades_topology() {
        let hosts = ["a:27017", "b:27017"];
        let topology = replica_set(&hosts).update(primary("a:27017", &hosts, 1, 1));

        let updated = topology.update(description("a:27017", json!({ "ok": 0 })));

        assert!(updated.has_server(&address("a:27017")));
        assert_eq!(updated.topology_type(), TopologyType::ReplicaSetNoPrimary);
    }

    #[test]
    fn applying_same_description_twice_is_idempotent() {
        let hosts = ["a:27017", "b:27017", "c:27017"];
        let topology = replica_set(&hosts);
        let report = primary("a:27017", &hosts, 1, 1);

        let once = topology.update(report.clone());
        let twice = once.update(report);

        assert_eq!(once, twice);
        assert!(once.diff(&twice).is_none());
    }

    #[test]
    fn at_most_one_primary_after_any_sequence() {
        let hosts = ["a:27017", "b:27017", "c:27017"];
        let mut topology = replica_set(&hosts);
        let reports = [
            primary("a:27017", &hosts, 1, 1),
            primary("b:27017", &hosts, 1, 3),
            primary("c:27017", &hosts, 2, 2),
            primary("a:27017", &hosts, 1, 9),
            secondary("b:27017", &hosts),
        ];

        for report in reports {
            topology = topology.update(report);
            let primaries = topology
                .servers()
                .values()
                .filter(|s| s.server_type() == ServerType::RsPrimary)
                .count();
            assert!(primaries <= 1);
        }
        assert_eq!(topology.servers()[&address("c:27017")].server_type(), ServerType::RsPrimary);
    }

    #[test]
    fn common_wire_version_ignores_zero() {
        let hosts = ["a:27017", "b:27017"];
        let topology = replica_set(&hosts)
            .update(primary("a:27017", &hosts, 1, 1))
            .update(description("b:27017", json!({ "ok": 0 })))
            .update(description(
                "b:27017",
                json!({ "ok": 1, "secondary": true, "setName": "rs0", "maxWireVersion": 6 }),
            ));

        assert_eq!(topology.common_wire_version(), Some(6));
    }

    #[test]
    fn incompatible_server_sets_compatibility_error() {
        let topology = TopologyDescription::new(&topology_options(&["a:27017"]));

        let updated = topology.update(description(
            "a:27017",
            json!({ "ok": 1, "ismaster": true, "minWireVersion": 20, "maxWireVersion": 21 }),
        ));

        assert!(!updated.is_compatible());
        assert!(updated.compatibility_error().unwrap().contains("a:27017"));
    }

    #[test]
    fn logical_session_timeout_is_minimum_over_readable_servers() {
        let hosts = ["a:27017", "b:27017"];
        let topology = replica_set(&hosts)
            .update(description(
                "a:27017",
                json!({ "ok": 1, "ismaster": true, "setName": "rs0", "hosts": hosts,
                        "logicalSessionTimeoutMinutes": 30, "maxWireVersion": 9 }),
            ))
            .update(description(
                "b:27017",
                json!({ "ok": 1, "secondary": true, "setName": "rs0", "hosts": hosts,
                        "logicalSessionTimeoutMinutes": 20, "maxWireVersion": 9 }),
            ));

        assert_eq!(topology.logical_session_timeout_minutes(), Some(20));

        let without = topology.update(secondary("b:27017", &hosts));
        assert_eq!(without.logical_session_timeout_minutes(), None);
    }

    #[test]
    fn update_ignores_untracked_addresses() {
        let topology = replica_set(&["a:27017"]);

        let updated = topology.update(secondary("q:27017", &["q:27017"]));

        assert_eq!(updated, topology);
        assert!(!updated.has_server(&address("q:27017")));
    }

    #[test]
    fn diff_reports_added_removed_and_changed_servers() {
        let topology = replica_set(&["a:27017", "z:27017"]);
        let updated = topology.update(primary("a:27017", &["a:27017", "b:27017"], 1, 1));

        let diff = topology.diff(&updated).unwrap();

        assert!(diff.added_addresses.contains(&address("b:27017")));
        assert!(diff.removed_addresses.contains(&address("z:27017")));
        assert!(diff.changed_servers.contains_key(&address("a:27017")));
    }

    #[test]
    fn stale_topology_version_is_detected() {
        let topology = TopologyDescription::new(&topology_options(&["a:27017"])).update(
            description(
                "a:27017",
                json!({ "ok": 1, "ismaster": true,
                        "topologyVersion": { "processId": "000000000000000000000001", "counter": 5 } }),
            ),
        );

        let older = description(
            "a:27017",
            json!({ "ok": 1, "ismaster": true,
                    "topologyVersion": { "processId": "000000000000000000000001", "counter": 4 } }),
        );
        let other_process = description(
            "a:27017",
            json!({ "ok": 1, "ismaster": true,
                    "topologyVersion": { "processId": "000000000000000000000002", "counter": 0 } }),
        );

        assert!(topology.is_stale_server_description(&older));
        assert!(!topology.is_stale_server_description(&other_process));
    }
}
