use std::time::Duration;

use tracing::instrument;

use crate::{connection::ConnectionFactory, ServerAddress, Topology, TopologyError, TopologyOptions};

#[derive(Debug, Default)]
pub struct TopologyBuilder {
    connection_factory: Option<Box<dyn ConnectionFactory>>,
    hosts: Vec<String>,
    options: TopologyOptions,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from parsed options, e.g. from [`TopologyOptions::from_json`].
    pub fn from_options(options: TopologyOptions) -> Self {
        Self {
            hosts: options.hosts.iter().map(ToString::to_string).collect(),
            options,
            ..Default::default()
        }
    }

    pub fn set_hosts<T>(mut self, hosts: &[T]) -> Self
    where
        T: AsRef<str>,
    {
        for h in hosts {
            self.hosts.push(h.as_ref().to_string());
        }
        self
    }

    pub fn set_replica_set(mut self, replica_set: &str) -> Self {
        self.options.replica_set = Some(replica_set.to_string());
        self
    }

    pub fn set_direct_connection(mut self, direct_connection: bool) -> Self {
        self.options.direct_connection = Some(direct_connection);
        self
    }

    pub fn set_heartbeat_frequency(mut self, heartbeat_frequency: Duration) -> Self {
        self.options.heartbeat_frequency = heartbeat_frequency;
        self
    }

    pub fn set_min_heartbeat_frequency(mut self, min_heartbeat_frequency: Duration) -> Self {
        self.options.min_heartbeat_frequency = min_heartbeat_frequency;
        self
    }

    pub fn set_server_selection_timeout(mut self, server_selection_timeout: Duration) -> Self {
        self.options.server_selection_timeout = server_selection_timeout;
        self
    }

    pub fn set_local_threshold(mut self, local_threshold: Duration) -> Self {
        self.options.local_threshold = local_threshold;
        self
    }

    pub fn set_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.options.connect_timeout = connect_timeout;
        self
    }

    pub fn set_connection_factory(mut self, factory: impl ConnectionFactory + 'static) -> Self {
        self.connection_factory = Some(Box::new(factory));
        self
    }

    /// Validates the configuration, spawns a topology actor and returns a
    /// handle to it. The topology does nothing until
    /// [`Topology::connect`] is called.
    ///
    /// Each call creates a new actor, so a configured builder can serve as a
    /// template. Must be called from within a tokio runtime.
    #[instrument(level = "debug", name = "Build TopologyBuilder", skip(self))]
    pub fn build(&self) -> Result<Topology, TopologyError> {
        if self.hosts.is_empty() {
            tracing::error!(
                "No hosts were supplied and a topology can't exist without at least one"
            );
            return Err(TopologyError::MissingHostsError);
        }
        let hosts = validate_hosts(&self.hosts)?;

        let options = TopologyOptions {
            hosts,
            ..self.options.clone()
        };
        validate_options(&options)?;

        let factory = self.connection_factory.clone().ok_or_else(|| {
            let err = anyhow::anyhow!("No connection factory was supplied");
            tracing::error!("{}", &err);
            err
        })?;

        tracing::trace!("Topology options: {:?}", &options);

        Ok(Topology::new(options, factory))
    }
}

/// Parses every host as `host[:port]`, dropping duplicates but keeping the
/// order they were given in.
#[instrument(level = "debug", name = "Validate Hosts")]
fn validate_hosts<T>(hosts: &[T]) -> Result<Vec<ServerAddress>, TopologyError>
where
    T: AsRef<str> + std::fmt::Debug,
{
    let mut clean_hosts = Vec::with_capacity(hosts.len());
    for host in hosts {
        let address =
            ServerAddress::parse(host.as_ref()).map_err(|e| TopologyError::InvalidHostError {
                host: host.as_ref().to_string(),
                reason: format!("{:#}", e),
            })?;
        if !clean_hosts.contains(&address) {
            clean_hosts.push(address);
        }
    }
    Ok(clean_hosts)
}

fn validate_options(options: &TopologyOptions) -> anyhow::Result<()> {
    if options.min_heartbeat_frequency > options.heartbeat_frequency {
        return Err(anyhow::anyhow!(
            "minHeartbeatFrequencyMS ({} ms) must not exceed heartbeatFrequencyMS ({} ms)",
            options.min_heartbeat_frequency.as_millis(),
            options.heartbeat_frequency.as_millis()
        ));
    }
    if options.direct_connection == Some(true) && options.hosts.len() > 1 {
        return Err(anyhow::anyhow!(
            "directConnection=true requires exactly one host, got {}",
            options.hosts.len()
        ));
    }
    Ok(())
}
