use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{ConnectionFactory, ConnectionOptions},
    connection_pool::ConnectionPool,
    events::EventEmitter,
    monitor::{MonitorEvent, MonitorHandle, MonitorOptions},
    ServerAddress, ServerDescription, TopologyOptions,
};

/// A tracked server as handed out by server selection.
///
/// The description is replaced in place every time the topology accepts a
/// new one, so a held `Arc<Server>` always reads the latest state.
#[derive(Debug)]
pub struct Server {
    address: ServerAddress,
    description: ArcSwap<ServerDescription>,
    pool: ConnectionPool,
    monitor: MonitorHandle,
    operation_count: AtomicU32,
    cancel: CancellationToken,
}

impl Server {
    pub(crate) fn new(
        description: ServerDescription,
        factory: Box<dyn ConnectionFactory>,
        options: &TopologyOptions,
        events: EventEmitter,
        reports: mpsc::UnboundedSender<MonitorEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let address = description.address().clone();
        let pool = ConnectionPool::new(
            address.clone(),
            factory.clone(),
            ConnectionOptions {
                connect_timeout: options.connect_timeout,
                monitoring: false,
            },
            cancel.child_token(),
        );
        let monitor = MonitorHandle::new(
            address.clone(),
            factory,
            MonitorOptions::from(options),
            events,
            reports,
            cancel.child_token(),
        );

        Self {
            address,
            description: ArcSwap::from_pointee(description),
            pool,
            monitor,
            operation_count: AtomicU32::new(0),
            cancel,
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn description(&self) -> Arc<ServerDescription> {
        self.description.load_full()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Operations currently running against this server.
    pub fn operation_count(&self) -> u32 {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Counts an operation until the returned guard is dropped.
    pub fn begin_operation(&self) -> OperationGuard<'_> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        OperationGuard { server: self }
    }

    pub(crate) fn monitor(&self) -> &MonitorHandle {
        &self.monitor
    }

    pub(crate) fn set_description(&self, description: ServerDescription) {
        self.description.store(Arc::new(description));
    }

    pub(crate) async fn connect(&self) {
        self.monitor.connect().await;
    }

    pub(crate) async fn close(&self) {
        self.monitor.close().await;
        self.pool.close();
        self.cancel.cancel();
    }
}

pub struct OperationGuard<'a> {
    server: &'a Server,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.server.operation_count.fetch_sub(1, Ordering::Relaxed);
    }
}
