use std::{collections::HashMap, sync::Arc};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Span};
use uuid::Uuid;

use crate::{
    connection::ConnectionFactory,
    events::{
        EventEmitter, SdamEvent, ServerClosedEvent, ServerDescriptionChangedEvent,
        ServerOpeningEvent, TopologyClosedEvent, TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    monitor::MonitorEvent,
    SdamError, Server, ServerAddress, ServerDescription, TopologyDescription, TopologyOptions,
};

use super::{reconcile_servers, TopologyLifecycle, TopologyMessage, TopologySnapshot};

/// Owns the topology description and the tracked servers. Every change to
/// either happens on this actor's task.
pub(crate) struct TopologyActor {
    id: Uuid,
    options: TopologyOptions,
    factory: Box<dyn ConnectionFactory>,
    events: EventEmitter,
    receiver: mpsc::Receiver<TopologyMessage>,
    /// Monitors report here.
    receiver_internal: mpsc::UnboundedReceiver<MonitorEvent>,
    sender_internal: mpsc::UnboundedSender<MonitorEvent>,
    snapshot: watch::Sender<TopologySnapshot>,
    lifecycle: TopologyLifecycle,
    description: Arc<TopologyDescription>,
    servers: HashMap<ServerAddress, Arc<Server>>,
    cancel: CancellationToken,
}

impl TopologyActor {
    pub(crate) fn new(
        id: Uuid,
        options: TopologyOptions,
        factory: Box<dyn ConnectionFactory>,
        events: EventEmitter,
        receiver: mpsc::Receiver<TopologyMessage>,
        snapshot: watch::Sender<TopologySnapshot>,
    ) -> Self {
        // Unbounded so a monitor never blocks on a topology that is busy closing it.
        let (tx, rx) = mpsc::unbounded_channel();
        let description = Arc::new(TopologyDescription::new(&options));
        Self {
            id,
            options,
            factory,
            events,
            receiver,
            receiver_internal: rx,
            sender_internal: tx,
            snapshot,
            lifecycle: TopologyLifecycle::Closed,
            description,
            servers: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[instrument(
        level = "debug",
        name = "Topology Actor - Handle Message",
        skip(self),
        fields(topology_id = %self.id, correlation_id)
    )]
    async fn handle_message(&mut self, msg: TopologyMessage) {
        Span::current().record("correlation_id", Uuid::new_v4().to_string());
        match msg {
            TopologyMessage::Connect { respond_to } => {
                self.connect().await;
                let _ = respond_to.send(());
            }
            TopologyMessage::Close { respond_to } => {
                self.close().await;
                let _ = respond_to.send(());
            }
            TopologyMessage::RequestImmediateCheck => {
                for server in self.servers.values() {
                    server.monitor().request_check().await;
                }
            }
            TopologyMessage::HandleApplicationError {
                address,
                error,
                generation,
                respond_to,
            } => {
                self.handle_application_error(address, error, generation)
                    .await;
                let _ = respond_to.send(());
            }
        }
    }

    async fn handle_monitor_event(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::ServerUpdated(description) => {
                self.server_updated(*description).await;
            }
            MonitorEvent::ResetConnectionPool(address) => {
                if let Some(server) = self.servers.get(&address) {
                    server.pool().clear();
                }
            }
        }
    }

    async fn connect(&mut self) {
        if self.lifecycle != TopologyLifecycle::Closed {
            tracing::debug!("Topology is already connected");
            return;
        }
        tracing::debug!("Connecting topology");
        self.cancel = CancellationToken::new();
        self.lifecycle = TopologyLifecycle::Connected;

        self.events
            .emit(SdamEvent::TopologyOpening(TopologyOpeningEvent {
                topology_id: self.id,
            }));
        let initial = Arc::new(TopologyDescription::new(&self.options));
        self.description = initial.clone();
        self.events.emit(SdamEvent::TopologyDescriptionChanged(Box::new(
            TopologyDescriptionChangedEvent {
                topology_id: self.id,
                previous_description: Arc::new(TopologyDescription::default()),
                new_description: initial,
            },
        )));

        self.reconcile().await;
        self.publish(true);
    }

    async fn close(&mut self) {
        if self.lifecycle != TopologyLifecycle::Connected {
            return;
        }
        tracing::debug!("Closing topology");
        self.lifecycle = TopologyLifecycle::Closing;
        self.publish(true);

        let servers = std::mem::take(&mut self.servers);
        for (address, server) in servers {
            self.destroy_server(address, server).await;
        }
        self.cancel.cancel();

        self.lifecycle = TopologyLifecycle::Closed;
        self.events.emit(SdamEvent::TopologyClosed(TopologyClosedEvent {
            topology_id: self.id,
        }));
        self.publish(true);
    }

    /// Folds a monitor's report into the description, then brings the
    /// server map in line with the result.
    #[instrument(level = "debug", skip(self, server_description), fields(address = %server_description.address()))]
    async fn server_updated(&mut self, server_description: ServerDescription) {
        if self.lifecycle != TopologyLifecycle::Connected {
            return;
        }
        let address = server_description.address().clone();
        let previous_server = match self.description.get_server_description(&address) {
            Some(previous_server) => previous_server.clone(),
            None => {
                tracing::trace!("Ignoring report from an untracked server");
                return;
            }
        };
        if self.description.is_stale_server_description(&server_description) {
            tracing::debug!("Ignoring report with an older topology version");
            return;
        }

        let next = Arc::new(self.description.update(server_description.clone()));
        let previous = std::mem::replace(&mut self.description, next.clone());

        if previous_server != server_description {
            self.events.emit(SdamEvent::ServerDescriptionChanged(Box::new(
                ServerDescriptionChangedEvent {
                    topology_id: self.id,
                    address,
                    previous_description: previous_server,
                    new_description: server_description,
                },
            )));
        }
        let changed = *previous != *next;
        if changed {
            self.events.emit(SdamEvent::TopologyDescriptionChanged(Box::new(
                TopologyDescriptionChangedEvent {
                    topology_id: self.id,
                    previous_description: previous,
                    new_description: next,
                },
            )));
        }

        self.reconcile().await;
        self.publish(changed);
    }

    /// Downgrades a server after an operation against it failed, unless the
    /// failure came from a connection opened before the pool was last cleared.
    #[instrument(level = "debug", skip(self))]
    async fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: SdamError,
        generation: Option<u32>,
    ) {
        let server = match self.servers.get(&address) {
            Some(server) => server.clone(),
            None => return,
        };
        if matches!(generation, Some(g) if g < server.pool().generation()) {
            tracing::debug!("Ignoring error from a stale connection");
            return;
        }

        if error.is_network_error() {
            tracing::debug!("Network error attributed to server, marking it unknown");
            server.pool().clear();
            server.monitor().reset().await;
            self.server_updated(ServerDescription::new_from_error(&address, error))
                .await;
        } else if error.is_state_change_error() {
            tracing::debug!("Server changed state, marking it unknown");
            if error.is_node_shutting_down() {
                server.pool().clear();
            }
            self.server_updated(ServerDescription::new_from_error(&address, error))
                .await;
            server.monitor().request_check().await;
        }
    }

    /// Opens servers for new addresses, closes those no longer described, and
    /// refreshes the in-place description of the rest.
    async fn reconcile(&mut self) {
        let reconciliation = reconcile_servers(self.servers.keys(), &self.description);

        for address in reconciliation.to_destroy {
            if let Some(server) = self.servers.remove(&address) {
                self.destroy_server(address, server).await;
            }
        }
        for address in reconciliation.to_create {
            let description = self
                .description
                .get_server_description(&address)
                .cloned()
                .unwrap_or_else(|| ServerDescription::new(&address));
            let server = Arc::new(Server::new(
                description,
                self.factory.clone(),
                &self.options,
                self.events.clone(),
                self.sender_internal.clone(),
                self.cancel.child_token(),
            ));
            self.events
                .emit(SdamEvent::ServerOpening(ServerOpeningEvent {
                    topology_id: self.id,
                    address: address.clone(),
                }));
            server.connect().await;
            self.servers.insert(address, server);
        }

        for (address, server) in &self.servers {
            if let Some(description) = self.description.get_server_description(address) {
                server.set_description(description.clone());
            }
        }
    }

    async fn destroy_server(&self, address: ServerAddress, server: Arc<Server>) {
        server.close().await;
        self.events.emit(SdamEvent::ServerClosed(ServerClosedEvent {
            topology_id: self.id,
            address,
        }));
    }

    /// Publishes the current state, waking selection waiters only when
    /// `notify` is set.
    fn publish(&self, notify: bool) {
        let snapshot = TopologySnapshot {
            lifecycle: self.lifecycle,
            description: self.description.clone(),
            servers: Arc::new(self.servers.clone()),
        };
        self.snapshot.send_if_modified(|current| {
            *current = snapshot;
            notify
        });
    }
}

#[instrument(level = "debug", name = "Running Topology Actor", skip(actor), fields(topology_id = %actor.id))]
pub(crate) async fn run_topology_actor(mut actor: TopologyActor) {
    loop {
        tokio::select! {
            opt_msg = actor.receiver.recv() => {
                let msg = match opt_msg {
                    Some(msg) => msg,
                    None => break,
                };
                actor.handle_message(msg).await;
            },
            Some(event) = actor.receiver_internal.recv() => {
                actor.handle_monitor_event(event).await;
            }
        }
    }
    // Every handle is gone.
    actor.close().await;
}
