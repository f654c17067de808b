//! Fixtures and a scripted in-memory cluster for unit tests.
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{Connection, ConnectionFactory, ConnectionOptions},
    hello_reply::HelloReply,
    SdamError, ServerAddress, ServerDescription, TopologyOptions,
};

pub(crate) fn address(address: &str) -> ServerAddress {
    ServerAddress::parse(address).unwrap()
}

/// A description built from `reply` as if it took 10ms to arrive.
pub(crate) fn description(host: &str, reply: Value) -> ServerDescription {
    let reply = HelloReply::from_document(&reply).unwrap();
    ServerDescription::from_hello_reply(&address(host), reply, 10.0)
}

pub(crate) fn election_id(n: u8) -> String {
    format!("{:024x}", n)
}

pub(crate) fn topology_options(hosts: &[&str]) -> TopologyOptions {
    TopologyOptions {
        hosts: hosts.iter().map(|h| address(h)).collect(),
        ..Default::default()
    }
}

/// Routes `log` records into tracing and prints spans when `TEST_LOG` is set.
pub(crate) fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    if std::env::var("TEST_LOG").is_err() {
        return;
    }
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// How a scripted server answers.
#[derive(Clone, Debug)]
pub(crate) enum MockResponse {
    Reply(Value),
    NetworkError,
    /// Never answers; only a timeout or cancellation ends the wait.
    Hang,
}

#[derive(Debug, Default)]
struct MockClusterState {
    responses: HashMap<ServerAddress, MockResponse>,
    command_replies: HashMap<ServerAddress, VecDeque<Result<Value, SdamError>>>,
    commands: Vec<(ServerAddress, Value)>,
    connections: HashMap<ServerAddress, usize>,
}

/// An in-memory [`ConnectionFactory`]. Addresses without a scripted
/// response refuse connections.
#[derive(Clone, Debug, Default)]
pub(crate) struct MockCluster {
    state: Arc<Mutex<MockClusterState>>,
    changed: Arc<Notify>,
}

impl MockCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockClusterState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn set_response(&self, host: &str, response: MockResponse) {
        self.state().responses.insert(address(host), response);
        self.changed.notify_waiters();
    }

    pub(crate) fn set_reply(&self, host: &str, reply: Value) {
        self.set_response(host, MockResponse::Reply(reply));
    }

    /// Queues the result of the next non-handshake command sent to `host`.
    /// Without one queued, commands answer `{ "ok": 1 }`.
    pub(crate) fn queue_command_reply(&self, host: &str, reply: Result<Value, SdamError>) {
        self.state()
            .command_replies
            .entry(address(host))
            .or_default()
            .push_back(reply);
    }

    pub(crate) fn commands_sent_to(&self, host: &str) -> Vec<Value> {
        let host = address(host);
        self.state()
            .commands
            .iter()
            .filter(|(a, _)| a == &host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub(crate) fn connection_count(&self, host: &str) -> usize {
        self.state()
            .connections
            .get(&address(host))
            .copied()
            .unwrap_or_default()
    }

    fn response(&self, address: &ServerAddress) -> MockResponse {
        self.state()
            .responses
            .get(address)
            .cloned()
            .unwrap_or(MockResponse::NetworkError)
    }
}

#[async_trait]
impl ConnectionFactory for MockCluster {
    async fn connect(
        &self,
        address: &ServerAddress,
        _options: &ConnectionOptions,
        cancel: CancellationToken,
    ) -> Result<Box<dyn Connection>, SdamError> {
        match self.response(address) {
            MockResponse::NetworkError => Err(SdamError::network(address, "connection refused")),
            MockResponse::Hang => {
                cancel.cancelled().await;
                Err(SdamError::network(address, "connection attempt cancelled"))
            }
            MockResponse::Reply(_) => {
                *self.state().connections.entry(address.clone()).or_default() += 1;
                Ok(Box::new(MockConnection {
                    address: address.clone(),
                    cluster: self.clone(),
                    closed: false,
                }))
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct MockConnection {
    address: ServerAddress,
    cluster: MockCluster,
    closed: bool,
}

fn is_handshake(command: &Value) -> bool {
    command.get("ismaster").is_some() || command.get("hello").is_some()
}

#[async_trait]
impl Connection for MockConnection {
    fn address(&self) -> &ServerAddress {
        &self.address
    }

    async fn command(&mut self, _db: &str, command: Value) -> Result<Value, SdamError> {
        if self.closed {
            return Err(SdamError::network(&self.address, "connection is closed"));
        }
        self.cluster
            .state()
            .commands
            .push((self.address.clone(), command.clone()));

        if is_handshake(&command) {
            if let Some(max_await) = command.get("maxAwaitTimeMS").and_then(Value::as_u64) {
                let changed = self.cluster.changed.notified();
                tokio::select! {
                    _ = changed => {},
                    _ = tokio::time::sleep(Duration::from_millis(max_await)) => {},
                }
            }
        }

        match self.cluster.response(&self.address) {
            MockResponse::NetworkError => {
                self.closed = true;
                Err(SdamError::network(&self.address, "connection reset"))
            }
            MockResponse::Hang => std::future::pending().await,
            MockResponse::Reply(reply) if is_handshake(&command) => Ok(reply),
            MockResponse::Reply(_) => self
                .cluster
                .state()
                .command_replies
                .get_mut(&self.address)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(json!({ "ok": 1 }))),
        }
    }

    fn destroy(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
