//! Typed view of a heartbeat (`ismaster`/`hello`) reply document.
//!
//! The wire layer hands replies over as JSON documents; BSON-only types arrive
//! in their extended-JSON form (`{"$oid": ..}`, `{"$date": ..}`) or as plain
//! scalars, and both shapes are accepted here.
use std::{collections::HashMap, fmt, str::FromStr};

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};

#[derive(Clone, Debug, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelloReply {
    #[serde(default, deserialize_with = "deserialize_truthy")]
    pub ok: bool,
    #[serde(
        default,
        rename = "ismaster",
        alias = "isWritablePrimary",
        deserialize_with = "deserialize_truthy"
    )]
    pub is_master: bool,
    #[serde(default, deserialize_with = "deserialize_truthy")]
    pub secondary: bool,
    #[serde(default, deserialize_with = "deserialize_truthy")]
    pub arbiter_only: bool,
    #[serde(default, deserialize_with = "deserialize_truthy")]
    pub hidden: bool,
    #[serde(default, rename = "isreplicaset", deserialize_with = "deserialize_truthy")]
    pub is_replica_set: bool,
    pub msg: Option<String>,
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<ElectionId>,
    pub primary: Option<String>,
    pub me: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub passives: Vec<String>,
    #[serde(default)]
    pub arbiters: Vec<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub min_wire_version: i32,
    #[serde(default)]
    pub max_wire_version: i32,
    pub max_bson_object_size: Option<i64>,
    pub max_message_size_bytes: Option<i64>,
    pub max_write_batch_size: Option<i64>,
    pub logical_session_timeout_minutes: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub last_write: Option<LastWrite>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub topology_version: Option<TopologyVersion>,
    pub errmsg: Option<String>,
    pub code: Option<i32>,
}

impl HelloReply {
    pub fn from_document(document: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(document.clone())
    }
}

#[derive(Clone, Debug, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastWrite {
    #[serde(default, deserialize_with = "deserialize_date_millis")]
    pub last_write_date: Option<i64>,
    pub op_time: Option<serde_json::Value>,
}

/// Server-side fencing token for the streaming protocol. Two versions are only
/// comparable when they come from the same server process.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
    #[serde(deserialize_with = "deserialize_object_id_string")]
    pub process_id: String,
    pub counter: i64,
}

impl TopologyVersion {
    /// True when `self` is known to predate `other`.
    pub fn is_older_than(&self, other: &TopologyVersion) -> bool {
        self.process_id == other.process_id && self.counter < other.counter
    }

    pub fn to_document(&self) -> serde_json::Value {
        serde_json::json!({
            "processId": { "$oid": self.process_id },
            "counter": self.counter,
        })
    }
}

/// A replica set election id (a 12 byte ObjectId). Ordering is the byte-wise
/// ordering used for stale primary detection.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ElectionId([u8; 12]);

impl ElectionId {
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }
}

impl FromStr for ElectionId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 || !s.is_ascii() {
            return Err(anyhow::anyhow!(
                "Election id `{}` is not a 24 character hex string",
                s
            ));
        }
        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|e| anyhow::anyhow!("Invalid election id `{}`. Caused by: {}", s, e))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for ElectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ElectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ElectionId({})", self)
    }
}

impl Serialize for ElectionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.to_string().as_str())
    }
}

impl<'de> Deserialize<'de> for ElectionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = deserialize_object_id_string(deserializer)?;
        hex.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ObjectIdRepr {
    Hex(String),
    Extended {
        #[serde(rename = "$oid")]
        oid: String,
    },
}

fn deserialize_object_id_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<String, D::Error> {
    Ok(match ObjectIdRepr::deserialize(deserializer)? {
        ObjectIdRepr::Hex(hex) => hex,
        ObjectIdRepr::Extended { oid } => oid,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DateRepr {
    Millis(i64),
    Extended {
        #[serde(rename = "$date")]
        date: DateValue,
    },
}

/// The `$date` payload in canonical (`{"$numberLong": ..}`) or relaxed
/// (millis or ISO-8601 string) extended JSON.
#[derive(Deserialize)]
#[serde(untagged)]
enum DateValue {
    Millis(i64),
    NumberLong {
        #[serde(rename = "$numberLong")]
        number_long: String,
    },
    Iso(String),
}

impl DateValue {
    fn to_millis(&self) -> Result<i64, String> {
        match self {
            Self::Millis(ms) => Ok(*ms),
            Self::NumberLong { number_long } => number_long
                .parse()
                .map_err(|e| format!("invalid $numberLong `{}`: {}", number_long, e)),
            Self::Iso(iso) => chrono::DateTime::parse_from_rfc3339(iso)
                .map(|date| date.timestamp_millis())
                .map_err(|e| format!("invalid ISO-8601 date `{}`: {}", iso, e)),
        }
    }
}

fn deserialize_date_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<i64>, D::Error> {
    match Option::<DateRepr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(DateRepr::Millis(ms)) => Ok(Some(ms)),
        Some(DateRepr::Extended { date }) => {
            date.to_millis().map(Some).map_err(serde::de::Error::custom)
        }
    }
}

/// Optional sub-documents that only refine a description. A malformed one is
/// dropped with a warning rather than failing the whole reply.
fn deserialize_lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => return Ok(None),
        Some(value) => value,
    };
    match serde_json::from_value(value) {
        Ok(parsed) => Ok(Some(parsed)),
        Err(e) => {
            tracing::warn!(
                "Ignoring malformed `{}` in handshake reply. Caused by: {}",
                std::any::type_name::<T>(),
                e
            );
            Ok(None)
        }
    }
}

/// Servers send flags as booleans or as numbers (`ok: 1.0`).
fn deserialize_truthy<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Bool(b)) => b,
        Some(serde_json::Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    })
}
