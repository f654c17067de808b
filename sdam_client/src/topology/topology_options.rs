use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::{ServerAddress, TopologyType};

pub const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(10_000);
pub const DEFAULT_MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// The recognised configuration surface. Field names follow the usual
/// connection string spelling when deserialized, e.g.
///
/// ```
/// let options: sdam_client::TopologyOptions = serde_json::from_str(
///     r#"{ "hosts": ["a:27017", "b:27017"], "replicaSet": "rs0", "heartbeatFrequencyMS": 2000 }"#,
/// ).unwrap();
/// assert_eq!(options.heartbeat_frequency.as_millis(), 2000);
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TopologyOptions {
    pub hosts: Vec<ServerAddress>,
    #[serde(rename = "replicaSet", alias = "setName")]
    pub replica_set: Option<String>,
    pub direct_connection: Option<bool>,
    #[serde(rename = "heartbeatFrequencyMS", deserialize_with = "deserialize_millis")]
    pub heartbeat_frequency: Duration,
    #[serde(rename = "minHeartbeatFrequencyMS", deserialize_with = "deserialize_millis")]
    pub min_heartbeat_frequency: Duration,
    #[serde(rename = "serverSelectionTimeoutMS", deserialize_with = "deserialize_millis")]
    pub server_selection_timeout: Duration,
    #[serde(rename = "localThresholdMS", deserialize_with = "deserialize_millis")]
    pub local_threshold: Duration,
    #[serde(rename = "connectTimeoutMS", deserialize_with = "deserialize_millis")]
    pub connect_timeout: Duration,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            replica_set: None,
            direct_connection: None,
            heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
            min_heartbeat_frequency: DEFAULT_MIN_HEARTBEAT_FREQUENCY,
            server_selection_timeout: DEFAULT_SERVER_SELECTION_TIMEOUT,
            local_threshold: DEFAULT_LOCAL_THRESHOLD,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl TopologyOptions {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The topology type before any server has been contacted.
    pub fn initial_topology_type(&self) -> TopologyType {
        if self.direct_connection == Some(true) {
            TopologyType::Single
        } else if self.replica_set.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else if self.direct_connection.is_none() && self.hosts.len() == 1 {
            TopologyType::Single
        } else {
            TopologyType::Unknown
        }
    }
}

fn deserialize_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
}
