//! The collaborator seams: how the engine reaches a server.
//!
//! The engine never opens sockets itself. A [`ConnectionFactory`] supplied at
//! build time hands out [`Connection`]s, which run one command document at a
//! time and return the reply document.
use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use dyn_clone::DynClone;
use tokio_util::sync::CancellationToken;

use crate::{SdamError, ServerAddress};

#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    /// Monitoring connections only ever run handshakes and are never pooled.
    pub monitoring: bool,
}

#[async_trait]
pub trait Connection: Debug + Send + Sync {
    fn address(&self) -> &ServerAddress;

    /// Runs `command` against database `db`. A reply with a falsy `ok` is
    /// still returned as `Ok`; classifying it is up to the caller.
    async fn command(
        &mut self,
        db: &str,
        command: serde_json::Value,
    ) -> Result<serde_json::Value, SdamError>;

    fn destroy(&mut self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait ConnectionFactory: Debug + DynClone + Send + Sync {
    /// Opens a connection to `address`, giving up when `cancel` fires.
    async fn connect(
        &self,
        address: &ServerAddress,
        options: &ConnectionOptions,
        cancel: CancellationToken,
    ) -> Result<Box<dyn Connection>, SdamError>;
}

dyn_clone::clone_trait_object!(ConnectionFactory);

/// Connects with `options.connect_timeout` applied, mapping an expired
/// deadline to [`SdamError::Timeout`] and cancellation to a network error.
pub(crate) async fn connect_with_timeout(
    factory: &dyn ConnectionFactory,
    address: &ServerAddress,
    options: &ConnectionOptions,
    cancel: CancellationToken,
) -> Result<Box<dyn Connection>, SdamError> {
    let attempt = factory.connect(address, options, cancel.clone());
    tokio::select! {
        _ = cancel.cancelled() => Err(SdamError::network(address, "connection attempt cancelled")),
        result = tokio::time::timeout(options.connect_timeout, attempt) => match result {
            Ok(result) => result,
            Err(_) => Err(SdamError::Timeout {
                address: address.clone(),
                timeout_ms: options.connect_timeout.as_millis() as u64,
            }),
        },
    }
}

/// Runs one command with a socket timeout. On a network error or timeout
/// the connection is destroyed before the error is returned.
pub(crate) async fn command_with_timeout(
    connection: &mut dyn Connection,
    db: &str,
    command: serde_json::Value,
    timeout: Duration,
) -> Result<serde_json::Value, SdamError> {
    let address = connection.address().clone();
    let result = match tokio::time::timeout(timeout, connection.command(db, command)).await {
        Ok(result) => result,
        Err(_) => Err(SdamError::Timeout {
            address,
            timeout_ms: timeout.as_millis() as u64,
        }),
    };
    if let Err(e) = &result {
        if e.is_network_error() {
            connection.destroy();
        }
    }
    result
}
