use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

use crate::{
    hello_reply::{ElectionId, HelloReply, TopologyVersion},
    SdamError, ServerAddress,
};

pub const MIN_SUPPORTED_WIRE_VERSION: i32 = 2;
pub const MAX_SUPPORTED_WIRE_VERSION: i32 = 9;

/// The believed role of a single server.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Serialize)]
pub enum ServerType {
    #[default]
    Unknown,
    Standalone,
    Mongos,
    PossiblePrimary,
    RsPrimary,
    RsSecondary,
    RsArbiter,
    RsOther,
    RsGhost,
}

impl ServerType {
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Standalone | Self::Mongos | Self::RsPrimary)
    }

    pub fn is_readable(self) -> bool {
        self.is_writable() || self == Self::RsSecondary
    }

    pub fn is_data_bearing(self) -> bool {
        matches!(
            self,
            Self::Standalone | Self::Mongos | Self::RsPrimary | Self::RsSecondary
        )
    }

    pub fn is_replica_set_member(self) -> bool {
        matches!(
            self,
            Self::RsPrimary | Self::RsSecondary | Self::RsArbiter | Self::RsOther
        )
    }
}

/// Classifies a reply. Precedence matters: a ghost or a mongos can also carry
/// fields that would otherwise look like a replica set member.
pub(crate) fn parse_server_type(reply: &HelloReply) -> ServerType {
    if !reply.ok {
        return ServerType::Unknown;
    }
    if reply.is_replica_set {
        return ServerType::RsGhost;
    }
    if reply.msg.as_deref() == Some("isdbgrid") {
        return ServerType::Mongos;
    }
    if reply.set_name.is_some() {
        return if reply.hidden {
            ServerType::RsOther
        } else if reply.is_master {
            ServerType::RsPrimary
        } else if reply.secondary {
            ServerType::RsSecondary
        } else if reply.arbiter_only {
            ServerType::RsArbiter
        } else {
            ServerType::RsOther
        };
    }
    ServerType::Standalone
}

/// An immutable snapshot of what is known about one server.
#[derive(Clone, Debug)]
pub struct ServerDescription {
    pub(crate) address: ServerAddress,
    pub(crate) server_type: ServerType,
    pub(crate) error: Option<SdamError>,
    /// Averaged round trip time, `-1.0` if never measured.
    pub(crate) round_trip_time_ms: f64,
    pub(crate) min_wire_version: i32,
    pub(crate) max_wire_version: i32,
    pub(crate) max_bson_object_size: Option<i64>,
    pub(crate) max_message_size_bytes: Option<i64>,
    pub(crate) max_write_batch_size: Option<i64>,
    pub(crate) logical_session_timeout_minutes: Option<i64>,
    pub(crate) me: Option<ServerAddress>,
    pub(crate) hosts: Vec<ServerAddress>,
    pub(crate) passives: Vec<ServerAddress>,
    pub(crate) arbiters: Vec<ServerAddress>,
    pub(crate) set_name: Option<String>,
    pub(crate) set_version: Option<i32>,
    pub(crate) election_id: Option<ElectionId>,
    pub(crate) primary: Option<ServerAddress>,
    pub(crate) tags: HashMap<String, String>,
    /// Milliseconds since the unix epoch.
    pub(crate) last_write_date: Option<i64>,
    pub(crate) op_time: Option<serde_json::Value>,
    /// Milliseconds since the unix epoch.
    pub(crate) last_update_time: i64,
    pub(crate) topology_version: Option<TopologyVersion>,
}

impl ServerDescription {
    /// A description for an address that has not been checked yet.
    pub fn new(address: &ServerAddress) -> Self {
        Self {
            address: address.clone(),
            server_type: ServerType::Unknown,
            error: None,
            round_trip_time_ms: -1.0,
            min_wire_version: 0,
            max_wire_version: 0,
            max_bson_object_size: None,
            max_message_size_bytes: None,
            max_write_batch_size: None,
            logical_session_timeout_minutes: None,
            me: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            set_name: None,
            set_version: None,
            election_id: None,
            primary: None,
            tags: HashMap::new(),
            last_write_date: None,
            op_time: None,
            last_update_time: now_millis(),
            topology_version: None,
        }
    }

    /// A description recording a failed check.
    pub fn new_from_error(address: &ServerAddress, error: SdamError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(address)
        }
    }

    /// Builds a description from a successful heartbeat reply.
    pub fn from_hello_reply(
        address: &ServerAddress,
        reply: HelloReply,
        round_trip_time_ms: f64,
    ) -> Self {
        let server_type = parse_server_type(&reply);
        let error = if reply.ok {
            None
        } else {
            Some(SdamError::Command {
                code: reply.code.unwrap_or_default(),
                code_name: String::new(),
                message: reply
                    .errmsg
                    .clone()
                    .unwrap_or_else(|| "heartbeat reply was not ok".to_string()),
            })
        };
        let (last_write_date, op_time) = match reply.last_write {
            Some(last_write) => (last_write.last_write_date, last_write.op_time),
            None => (None, None),
        };

        Self {
            address: address.clone(),
            server_type,
            error,
            round_trip_time_ms,
            min_wire_version: reply.min_wire_version,
            max_wire_version: reply.max_wire_version,
            max_bson_object_size: reply.max_bson_object_size,
            max_message_size_bytes: reply.max_message_size_bytes,
            max_write_batch_size: reply.max_write_batch_size,
            logical_session_timeout_minutes: reply.logical_session_timeout_minutes,
            me: reply.me.as_deref().and_then(parse_reported_address),
            hosts: parse_reported_addresses(&reply.hosts),
            passives: parse_reported_addresses(&reply.passives),
            arbiters: parse_reported_addresses(&reply.arbiters),
            set_name: reply.set_name,
            set_version: reply.set_version,
            election_id: reply.election_id,
            primary: reply.primary.as_deref().and_then(parse_reported_address),
            tags: reply.tags,
            last_write_date,
            op_time,
            last_update_time: now_millis(),
            topology_version: reply.topology_version,
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    pub fn error(&self) -> Option<&SdamError> {
        self.error.as_ref()
    }

    pub fn round_trip_time_ms(&self) -> f64 {
        self.round_trip_time_ms
    }

    pub fn min_wire_version(&self) -> i32 {
        self.min_wire_version
    }

    pub fn max_wire_version(&self) -> i32 {
        self.max_wire_version
    }

    pub fn max_bson_object_size(&self) -> Option<i64> {
        self.max_bson_object_size
    }

    pub fn max_message_size_bytes(&self) -> Option<i64> {
        self.max_message_size_bytes
    }

    pub fn max_write_batch_size(&self) -> Option<i64> {
        self.max_write_batch_size
    }

    pub fn logical_session_timeout_minutes(&self) -> Option<i64> {
        self.logical_session_timeout_minutes
    }

    pub fn me(&self) -> Option<&ServerAddress> {
        self.me.as_ref()
    }

    pub fn hosts(&self) -> &[ServerAddress] {
        &self.hosts
    }

    pub fn passives(&self) -> &[ServerAddress] {
        &self.passives
    }

    pub fn arbiters(&self) -> &[ServerAddress] {
        &self.arbiters
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    pub fn set_version(&self) -> Option<i32> {
        self.set_version
    }

    pub fn election_id(&self) -> Option<ElectionId> {
        self.election_id
    }

    pub fn primary(&self) -> Option<&ServerAddress> {
        self.primary.as_ref()
    }

    pub fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    pub fn last_write_date(&self) -> Option<i64> {
        self.last_write_date
    }

    pub fn op_time(&self) -> Option<&serde_json::Value> {
        self.op_time.as_ref()
    }

    pub fn last_update_time(&self) -> i64 {
        self.last_update_time
    }

    pub fn topology_version(&self) -> Option<&TopologyVersion> {
        self.topology_version.as_ref()
    }

    pub fn is_writable(&self) -> bool {
        self.server_type.is_writable()
    }

    pub fn is_readable(&self) -> bool {
        self.server_type.is_readable()
    }

    pub fn is_data_bearing(&self) -> bool {
        self.server_type.is_data_bearing()
    }

    pub fn is_known(&self) -> bool {
        self.server_type != ServerType::Unknown
    }

    /// All members this server reports, in hosts/passives/arbiters order.
    pub fn known_hosts(&self) -> impl Iterator<Item = &ServerAddress> {
        self.hosts
            .iter()
            .chain(self.passives.iter())
            .chain(self.arbiters.iter())
    }

    /// True when the server reported a canonical address different from the
    /// one it was reached at.
    pub fn has_mismatched_me(&self) -> bool {
        matches!(&self.me, Some(me) if *me != self.address)
    }

    /// Describes why this server cannot be used by a driver supporting wire
    /// versions `MIN_SUPPORTED_WIRE_VERSION..=MAX_SUPPORTED_WIRE_VERSION`.
    pub fn compatibility_error_message(&self) -> Option<String> {
        if !self.is_known() {
            return None;
        }
        if self.min_wire_version > MAX_SUPPORTED_WIRE_VERSION {
            return Some(format!(
                "Server at {} requires wire version {}, but this version of the driver only supports up to {}.",
                self.address, self.min_wire_version, MAX_SUPPORTED_WIRE_VERSION
            ));
        }
        if self.max_wire_version < MIN_SUPPORTED_WIRE_VERSION {
            return Some(format!(
                "Server at {} reports wire version {}, but this version of the driver requires at least {}.",
                self.address, self.max_wire_version, MIN_SUPPORTED_WIRE_VERSION
            ));
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn with_round_trip_time(mut self, round_trip_time_ms: f64) -> Self {
        self.round_trip_time_ms = round_trip_time_ms;
        self
    }
}

/// Equality over the fields that matter to discovery; timing fields and the
/// error are ignored so that routine heartbeats do not look like changes.
impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.server_type == other.server_type
            && self.min_wire_version == other.min_wire_version
            && self.max_wire_version == other.max_wire_version
            && self.me == other.me
            && sorted(&self.hosts) == sorted(&other.hosts)
            && sorted(&self.passives) == sorted(&other.passives)
            && sorted(&self.arbiters) == sorted(&other.arbiters)
            && self.tags == other.tags
            && self.set_name == other.set_name
            && self.set_version == other.set_version
            && self.election_id == other.election_id
            && self.primary == other.primary
            && self.logical_session_timeout_minutes == other.logical_session_timeout_minutes
    }
}

fn sorted(addresses: &[ServerAddress]) -> Vec<&ServerAddress> {
    let mut sorted = addresses.iter().collect::<Vec<_>>();
    sorted.sort();
    sorted
}

fn parse_reported_address(address: &str) -> Option<ServerAddress> {
    match ServerAddress::parse(address) {
        Ok(address) => Some(address),
        Err(e) => {
            tracing::warn!("Ignoring unparseable reported address. Caused by: {}", e);
            None
        }
    }
}

fn parse_reported_addresses(addresses: &[String]) -> Vec<ServerAddress> {
    addresses
        .iter()
        .filter_map(|a| parse_reported_address(a))
        .collect()
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
