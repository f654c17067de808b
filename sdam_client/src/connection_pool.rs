use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    connection::{connect_with_timeout, Connection, ConnectionFactory, ConnectionOptions},
    SdamError, ServerAddress,
};

/// Application connections to one server.
///
/// Every connection is stamped with the pool generation it was opened in.
/// [`ConnectionPool::clear`] bumps the generation, so connections opened
/// before a failure are dropped when they come back instead of being reused.
pub struct ConnectionPool {
    address: ServerAddress,
    factory: Box<dyn ConnectionFactory>,
    options: ConnectionOptions,
    generation: AtomicU32,
    idle: Mutex<Vec<PooledConnection>>,
    cancel: CancellationToken,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.address)
            .field("generation", &self.generation())
            .field("idle", &self.idle_count())
            .finish()
    }
}

#[derive(Debug)]
pub struct PooledConnection {
    connection: Box<dyn Connection>,
    generation: u32,
}

impl PooledConnection {
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn connection(&mut self) -> &mut dyn Connection {
        self.connection.as_mut()
    }
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        factory: Box<dyn ConnectionFactory>,
        options: ConnectionOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            address,
            factory,
            options: ConnectionOptions {
                monitoring: false,
                ..options
            },
            generation: AtomicU32::new(0),
            idle: Mutex::new(Vec::new()),
            cancel,
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    /// Hands out an idle connection of the current generation, or opens a new one.
    #[instrument(level = "trace", skip(self), fields(address = %self.address))]
    pub async fn check_out(&self) -> Result<PooledConnection, SdamError> {
        if self.cancel.is_cancelled() {
            return Err(SdamError::network(&self.address, "connection pool is closed"));
        }

        let generation = self.generation();
        loop {
            let candidate = self.lock_idle().pop();
            match candidate {
                Some(pooled) if pooled.generation == generation && !pooled.connection.is_closed() => {
                    return Ok(pooled)
                }
                Some(mut stale) => stale.connection.destroy(),
                None => break,
            }
        }

        tracing::trace!("Opening a new pooled connection");
        let connection = connect_with_timeout(
            self.factory.as_ref(),
            &self.address,
            &self.options,
            self.cancel.child_token(),
        )
        .await?;
        Ok(PooledConnection {
            connection,
            generation,
        })
    }

    /// Returns a connection. Closed connections and those from an older
    /// generation are destroyed instead of kept.
    pub fn check_in(&self, mut pooled: PooledConnection) {
        if pooled.generation != self.generation()
            || pooled.connection.is_closed()
            || self.cancel.is_cancelled()
        {
            pooled.connection.destroy();
            return;
        }
        self.lock_idle().push(pooled);
    }

    /// Invalidates every connection opened so far.
    #[instrument(level = "debug", skip(self), fields(address = %self.address))]
    pub fn clear(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(generation, "Cleared connection pool");
        self.destroy_idle();
    }

    pub(crate) fn close(&self) {
        self.cancel.cancel();
        self.destroy_idle();
    }

    fn destroy_idle(&self) {
        let idle = std::mem::take(&mut *self.lock_idle());
        for mut pooled in idle {
            pooled.connection.destroy();
        }
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<PooledConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use std::time::Duration;

    use serde_json::json;
    use tokio_test::assert_ok;
    use tokio_util::sync::CancellationToken;

    use super::ConnectionPool;
    use crate::{
        connection::ConnectionOptions,
        test_util::{address, MockCluster},
    };

    fn pool(cluster: &MockCluster) -> ConnectionPool {
        ConnectionPool::new(
            address("a:27017"),
            Box::new(cluster.clone()),
            ConnectionOptions {
                connect_timeout: Duration::from_secs(1),
                monitoring: false,
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn checked_in_connections_are_reused() {
        let cluster = MockCluster::new();
        cluster.set_reply("a:27017", json!({ "ok": 1, "ismaster": true }));
        let pool = pool(&cluster);

        let connection = assert_ok!(pool.check_out().await);
        pool.check_in(connection);
        let _again = assert_ok!(pool.check_out().await);

        assert_eq!(cluster.connection_count("a:27017"), 1);
    }

    #[tokio::test]
    async fn clear_discards_connections_from_older_generations() {
        let cluster = MockCluster::new();
        cluster.set_reply("a:27017", json!({ "ok": 1, "ismaster": true }));
        let pool = pool(&cluster);

        let outstanding = assert_ok!(pool.check_out().await);
        let idle = assert_ok!(pool.check_out().await);
        pool.check_in(idle);
        assert_eq!(pool.idle_count(), 1);

        pool.clear();
        assert_eq!(pool.generation(), 1);
        assert_eq!(pool.idle_count(), 0);

        pool.check_in(outstanding);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn check_out_fails_for_unreachable_server() {
        let cluster = MockCluster::new();
        let pool = pool(&cluster);

        let error = pool.check_out().await.unwrap_err();

        assert!(error.is_network_error());
    }
}
