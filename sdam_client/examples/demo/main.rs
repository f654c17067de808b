//! Drives a topology against a scripted three member replica set and prints
//! the SDAM event stream while the primary fails over.
//!
//! Run with `RUST_LOG=sdam_client=debug` to see the actors' spans as well.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use sdam_client::{
    connection::{Connection, ConnectionFactory, ConnectionOptions},
    events::SdamEvent,
    CommandOptions, ReadPreference, SdamError, SelectionCriteria, ServerAddress, Topology,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::subscriber::set_global_default;
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

const HOSTS: [&str; 3] = ["a:27017", "b:27017", "c:27017"];

/// Hands out connections whose handshake replies come from a shared script.
#[derive(Clone, Debug, Default)]
struct ScriptedCluster {
    replies: Arc<Mutex<HashMap<ServerAddress, Value>>>,
}

impl ScriptedCluster {
    fn elect(&self, primary: &str) {
        let mut replies = self.replies.lock().expect("script lock poisoned");
        for host in HOSTS {
            let role = if host == primary { "ismaster" } else { "secondary" };
            let mut reply = json!({
                "ok": 1, "setName": "rs0", "hosts": HOSTS, "primary": primary,
                "me": host, "minWireVersion": 0, "maxWireVersion": 9,
                "setVersion": 1
            });
            reply[role] = json!(true);
            replies.insert(host.parse().expect("valid host"), reply);
        }
    }

    fn take_down(&self, host: &str) {
        let address: ServerAddress = host.parse().expect("valid host");
        self.replies
            .lock()
            .expect("script lock poisoned")
            .remove(&address);
    }

    fn reply(&self, address: &ServerAddress) -> Option<Value> {
        self.replies
            .lock()
            .expect("script lock poisoned")
            .get(address)
            .cloned()
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedCluster {
    async fn connect(
        &self,
        address: &ServerAddress,
        _options: &ConnectionOptions,
        _cancel: CancellationToken,
    ) -> Result<Box<dyn Connection>, SdamError> {
        match self.reply(address) {
            Some(_) => Ok(Box::new(ScriptedConnection {
                address: address.clone(),
                cluster: self.clone(),
                closed: false,
            })),
            None => Err(SdamError::network(address, "connection refused")),
        }
    }
}

#[derive(Debug)]
struct ScriptedConnection {
    address: ServerAddress,
    cluster: ScriptedCluster,
    closed: bool,
}

#[async_trait]
impl Connection for ScriptedConnection {
    fn address(&self) -> &ServerAddress {
        &self.address
    }

    async fn command(&mut self, _db: &str, command: Value) -> Result<Value, SdamError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        match self.cluster.reply(&self.address) {
            Some(reply) if command.get("ismaster").is_some() => Ok(reply),
            Some(_) => Ok(json!({ "ok": 1, "n": 1 })),
            None => {
                self.closed = true;
                Err(SdamError::network(&self.address, "connection reset"))
            }
        }
    }

    fn destroy(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();

    let cluster = ScriptedCluster::default();
    cluster.elect("a:27017");

    let topology = Topology::builder()
        .set_hosts(&HOSTS)
        .set_replica_set("rs0")
        .set_heartbeat_frequency(Duration::from_millis(1_000))
        .set_min_heartbeat_frequency(Duration::from_millis(100))
        .set_server_selection_timeout(Duration::from_secs(5))
        .set_connection_factory(cluster.clone())
        .build()?;

    let mut events = topology.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    topology.connect(None).await?;
    let reply = topology
        .command("app", json!({ "insert": "users" }), CommandOptions::default())
        .await?;
    println!("insert on the first primary: {}", reply);

    println!("--- a:27017 goes down, b:27017 takes over ---");
    cluster.elect("b:27017");
    cluster.take_down("a:27017");

    let reply = topology
        .command(
            "app",
            json!({ "insert": "users" }),
            CommandOptions {
                retryable: true,
                ..Default::default()
            },
        )
        .await?;
    println!("insert after failover: {}", reply);

    let criteria = SelectionCriteria::from(ReadPreference::secondary());
    let server = topology.select_server(&criteria, None).await?;
    println!("secondary read goes to {}", server.address());

    topology.close().await;
    // Let the printer drain the closing events.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

fn print_event(event: &SdamEvent) {
    match event {
        SdamEvent::TopologyDescriptionChanged(e) => println!(
            "{}: {:?} -> {:?}",
            event.name(),
            e.previous_description.topology_type(),
            e.new_description.topology_type()
        ),
        SdamEvent::ServerDescriptionChanged(e) => println!(
            "{}: {} {:?} -> {:?}",
            event.name(),
            e.address,
            e.previous_description.server_type(),
            e.new_description.server_type()
        ),
        SdamEvent::ServerOpening(e) => println!("{}: {}", event.name(), e.address),
        SdamEvent::ServerClosed(e) => println!("{}: {}", event.name(), e.address),
        SdamEvent::ServerHeartbeatFailed(e) => {
            println!("{}: {} ({})", event.name(), e.address, e.failure)
        }
        SdamEvent::ServerHeartbeatStarted(_) | SdamEvent::ServerHeartbeatSucceeded(_) => {}
        _ => println!("{}", event.name()),
    }
}

fn setup_tracing() {
    // Redirect all `log`'s events to the subscriber
    LogTracer::init().expect("Failed to set logger");
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = Registry::default()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer());
    set_global_default(subscriber).expect("Failed to set subscriber");
}
