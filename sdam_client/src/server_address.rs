use std::{fmt, str::FromStr};

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

pub const DEFAULT_PORT: u16 = 27017;

/// The `host:port` identity of a server. Hosts are always stored lower-cased so
/// that addresses reported by different servers compare equal.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_lowercase(),
            port,
        }
    }

    /// Parses `host[:port]`, defaulting the port to 27017. IPv6 hosts must be
    /// bracketed, e.g. `[::1]:27017`.
    pub fn parse(address: &str) -> anyhow::Result<Self> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(anyhow::anyhow!("Server address is empty"));
        }

        // A non-special scheme keeps the url crate from applying http rules
        // (default ports, path normalisation) to our addresses.
        let url = Url::parse(format!("mongodb://{}", trimmed).as_str())
            .with_context(|| format!("Invalid server address `{}`", trimmed))?;

        if !url.path().is_empty() || url.query().is_some() || url.fragment().is_some() {
            return Err(anyhow::anyhow!(
                "Server address `{}` must be of the form host[:port]",
                trimmed
            ));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(anyhow::anyhow!(
                "Server address `{}` must not carry credentials",
                trimmed
            ));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .with_context(|| format!("Server address `{}` has no host", trimmed))?;

        Ok(Self::new(host, url.port().unwrap_or(DEFAULT_PORT)))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ServerAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.to_string().as_str())
    }
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ServerAddress::parse(s.as_str()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::ServerAddress;

    #[test]
    fn parse_defaults_port_and_lowercases_host() {
        let address = ServerAddress::parse("DB.Example.COM").unwrap();

        assert_eq!(address.host(), "db.example.com");
        assert_eq!(address.port(), 27017);
        assert_eq!(address.to_string(), "db.example.com:27017");
    }

    #[test]
    fn parse_keeps_explicit_port() {
        let address = ServerAddress::parse("a:27018").unwrap();

        assert_eq!(address, ServerAddress::new("a", 27018));
    }

    #[test]
    fn parse_accepts_bracketed_IPv6() {
        let address = ServerAddress::parse("[::1]:27019").unwrap();

        assert_eq!(address.port(), 27019);
        assert_eq!(address.to_string(), "[::1]:27019");
    }

    #[test]
    fn parse_rejects_empty_paths_and_bad_ports() {
        assert!(ServerAddress::parse("").is_err());
        assert!(ServerAddress::parse("a:27017/db").is_err());
        assert!(ServerAddress::parse("a:notaport").is_err());
        assert!(ServerAddress::parse("a:99999").is_err());
    }
}
