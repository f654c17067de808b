use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::Instant,
};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    connection::ConnectionFactory,
    events::{EventEmitter, SdamEvent},
    server_selection::{choose_server, select_suitable_servers},
    ReadPreference, SdamError, SelectionCriteria, Server, ServerAddress, TopologyBuilder,
    TopologyDescription, TopologyOptions,
};

use super::{
    is_ok_reply, run_topology_actor, CommandOptions, TopologyActor, TopologyLifecycle,
    TopologyMessage, TopologySnapshot,
};

/**
A handle to the topology actor.

Cloning is cheap and every clone talks to the same actor; the actor closes
its servers and stops once the last handle is dropped.

```rust
# tokio_test::block_on(async {
use sdam_client::Topology;

let result = Topology::builder().set_hosts(&["localhost:27017"]).build();
// No connection factory was supplied.
assert!(result.is_err());
# })
```
*/
#[derive(Clone, Debug)]
pub struct Topology {
    id: Uuid,
    options: Arc<TopologyOptions>,
    sender: mpsc::Sender<TopologyMessage>,
    snapshot: watch::Receiver<TopologySnapshot>,
    events: EventEmitter,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    // Only the builder creates topologies, after validating the options.
    pub(crate) fn new(options: TopologyOptions, factory: Box<dyn ConnectionFactory>) -> Self {
        let id = Uuid::new_v4();
        let events = EventEmitter::new();
        let (sender, receiver) = mpsc::channel(8);
        let (snapshot_sender, snapshot) = watch::channel(TopologySnapshot {
            lifecycle: TopologyLifecycle::Closed,
            description: Arc::new(TopologyDescription::new(&options)),
            servers: Arc::default(),
        });
        let actor = TopologyActor::new(
            id,
            options.clone(),
            factory,
            events.clone(),
            receiver,
            snapshot_sender,
        );
        tokio::spawn(run_topology_actor(actor));

        Self {
            id,
            options: Arc::new(options),
            sender,
            snapshot,
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn options(&self) -> &TopologyOptions {
        &self.options
    }

    pub fn lifecycle(&self) -> TopologyLifecycle {
        self.snapshot.borrow().lifecycle
    }

    /// The current immutable snapshot of the deployment.
    pub fn description(&self) -> Arc<TopologyDescription> {
        self.snapshot.borrow().description.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SdamEvent> {
        self.events.subscribe()
    }

    /// Starts monitoring every seed, then waits until a server matching
    /// `read_preference` (the primary by default) can be selected. The
    /// topology is closed again if none can.
    #[instrument(level = "debug", name = "Topology Handle - Connect", skip(self), fields(topology_id = %self.id))]
    pub async fn connect(&self, read_preference: Option<ReadPreference>) -> Result<(), SdamError> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(TopologyMessage::Connect { respond_to: tx })
            .await;
        rx.await.context("TopologyActor task has been killed")?;

        let criteria = SelectionCriteria::ReadPreference(read_preference.unwrap_or_default());
        if let Err(e) = self.select_server(&criteria, None).await {
            tracing::error!("Initial server selection failed. Caused by: {}", e);
            self.close().await;
            return Err(e);
        }
        tracing::debug!("Topology connected");
        Ok(())
    }

    /// Closes every server. Pending selections fail with
    /// [`SdamError::TopologyClosed`].
    #[instrument(level = "debug", name = "Topology Handle - Close", skip(self), fields(topology_id = %self.id))]
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(TopologyMessage::Close { respond_to: tx })
            .await;
        if rx.await.is_err() {
            tracing::trace!("TopologyActor already stopped");
        }
    }

    /// Picks a server suitable for `criteria`, waiting for the topology to
    /// change until `timeout` (default `serverSelectionTimeoutMS`) runs out.
    #[instrument(level = "debug", name = "Topology Handle - Select Server", skip(self), fields(topology_id = %self.id))]
    pub async fn select_server(
        &self,
        criteria: &SelectionCriteria,
        timeout: Option<Duration>,
    ) -> Result<Arc<Server>, SdamError> {
        let timeout = timeout.unwrap_or(self.options.server_selection_timeout);
        // None when the timeout is too large to represent: wait forever.
        let deadline = Instant::now().checked_add(timeout);
        let mut snapshot = self.snapshot.clone();

        loop {
            if matches!(deadline, Some(deadline) if Instant::now() >= deadline) {
                return Err(selection_timeout(timeout, &snapshot.borrow()));
            }

            let selected = {
                let current = snapshot.borrow_and_update();
                if current.lifecycle != TopologyLifecycle::Connected {
                    return Err(SdamError::TopologyClosed);
                }
                if let Some(message) = current.description.compatibility_error() {
                    return Err(SdamError::Compatibility(message.to_string()));
                }
                let suitable = select_suitable_servers(criteria, &current.description)?;
                choose_server(&suitable)
                    .and_then(|description| current.servers.get(description.address()).cloned())
            };
            if let Some(server) = selected {
                tracing::debug!(address = %server.address(), "Selected server");
                return Ok(server);
            }

            tracing::trace!("No suitable server yet, requesting immediate checks");
            let _ = self
                .sender
                .send(TopologyMessage::RequestImmediateCheck)
                .await;

            let changed = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, snapshot.changed()).await,
                None => Ok(snapshot.changed().await),
            };
            match changed {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(SdamError::TopologyClosed),
                Err(_) => return Err(selection_timeout(timeout, &snapshot.borrow())),
            }
        }
    }

    /// Attributes an operation failure to `address`: network errors and
    /// state change errors mark the server unknown at once.
    #[instrument(level = "debug", name = "Topology Handle - Handle Application Error", skip(self), fields(topology_id = %self.id))]
    pub async fn handle_application_error(
        &self,
        address: &ServerAddress,
        error: &SdamError,
        generation: Option<u32>,
    ) {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(TopologyMessage::HandleApplicationError {
                address: address.clone(),
                error: error.clone(),
                generation,
                respond_to: tx,
            })
            .await;
        let _ = rx.await;
    }

    /// Runs `command` against a selected server. An `ok: 0` reply is
    /// returned as [`SdamError::Command`].
    #[instrument(level = "debug", name = "Topology Handle - Command", skip(self, command), fields(topology_id = %self.id))]
    pub async fn command(
        &self,
        db: &str,
        command: serde_json::Value,
        options: CommandOptions,
    ) -> Result<serde_json::Value, SdamError> {
        let criteria = options.selection_criteria.unwrap_or_default();
        let server = self.select_server(&criteria, None).await?;

        match self.execute_on(&server, db, command.clone()).await {
            Err(e) if options.retryable && e.is_retryable() => {
                tracing::debug!("Retrying command after retryable error. Caused by: {}", e);
                let server = self.select_server(&criteria, None).await?;
                self.execute_on(&server, db, command).await
            }
            result => result,
        }
    }

    async fn execute_on(
        &self,
        server: &Server,
        db: &str,
        command: serde_json::Value,
    ) -> Result<serde_json::Value, SdamError> {
        let _operation = server.begin_operation();
        let mut pooled = match server.pool().check_out().await {
            Ok(pooled) => pooled,
            Err(e) => {
                self.handle_application_error(server.address(), &e, None)
                    .await;
                return Err(e);
            }
        };
        let generation = pooled.generation();

        let result = pooled
            .connection()
            .command(db, command)
            .await
            .and_then(|reply| {
                if is_ok_reply(&reply) {
                    Ok(reply)
                } else {
                    Err(SdamError::from_error_reply(&reply))
                }
            });

        if let Err(e) = &result {
            if e.is_network_error() {
                pooled.connection().destroy();
            }
            server.pool().check_in(pooled);
            if e.is_network_error() || e.is_state_change_error() {
                self.handle_application_error(server.address(), e, Some(generation))
                    .await;
            }
        } else {
            server.pool().check_in(pooled);
        }
        result
    }
}

fn selection_timeout(timeout: Duration, snapshot: &TopologySnapshot) -> SdamError {
    SdamError::ServerSelectionTimeout {
        timeout_ms: timeout.as_millis() as u64,
        topology_error: snapshot.description.error().map(ToString::to_string),
    }
}
