use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{connection::ConnectionFactory, events::EventEmitter, ServerAddress};

use super::{run_monitor_actor, MonitorActor, MonitorEvent, MonitorMessage, MonitorOptions};

/// Handle to the heartbeat actor of one server. Dropping every handle stops
/// the actor.
#[derive(Clone, Debug)]
pub(crate) struct MonitorHandle {
    address: ServerAddress,
    sender: mpsc::Sender<MonitorMessage>,
}

impl MonitorHandle {
    pub(crate) fn new(
        address: ServerAddress,
        factory: Box<dyn ConnectionFactory>,
        options: MonitorOptions,
        events: EventEmitter,
        reports: mpsc::UnboundedSender<MonitorEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(8);
        let actor = MonitorActor::new(
            address.clone(),
            factory,
            options,
            events,
            receiver,
            reports,
            cancel,
        );
        tokio::spawn(run_monitor_actor(actor));

        Self { address, sender }
    }

    #[instrument(level = "trace", name = "Monitor Handle - Connect", skip(self), fields(address = %self.address))]
    pub(crate) async fn connect(&self) {
        self.send(MonitorMessage::Connect).await;
    }

    #[instrument(level = "trace", name = "Monitor Handle - Request Check", skip(self), fields(address = %self.address))]
    pub(crate) async fn request_check(&self) {
        self.send(MonitorMessage::RequestCheck).await;
    }

    #[instrument(level = "trace", name = "Monitor Handle - Reset", skip(self), fields(address = %self.address))]
    pub(crate) async fn reset(&self) {
        self.send(MonitorMessage::Reset).await;
    }

    /// Stops monitoring and waits for the actor to let go of its connections.
    #[instrument(level = "debug", name = "Monitor Handle - Close", skip(self), fields(address = %self.address))]
    pub(crate) async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(MonitorMessage::Close { respond_to: tx }).await;
        if rx.await.is_err() {
            tracing::trace!("Monitor actor already stopped");
        }
    }

    async fn send(&self, msg: MonitorMessage) {
        if self.sender.send(msg).await.is_err() {
            tracing::trace!("Monitor actor is gone, message dropped");
        }
    }
}
