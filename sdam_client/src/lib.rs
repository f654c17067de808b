/*!
sdam_client is the server discovery and monitoring engine of a MongoDB-style
database client.

Given a list of seed addresses it keeps a live, immutable
[`TopologyDescription`] of the deployment up to date by monitoring every
server with periodic handshakes, and answers "which server should this
operation go to?" through [`Topology::select_server`].

This library requires tokio and uses the actor pattern: a [`Topology`] is a
cheap, cloneable handle to a background actor that owns all mutable state,
and each tracked server additionally gets its own monitor actor. Sockets are not opened here: callers supply a
[`ConnectionFactory`](connection::ConnectionFactory) when building the
topology.

# Example
```rust,no_run
# async fn run(factory: impl sdam_client::connection::ConnectionFactory + 'static) -> anyhow::Result<()> {
use sdam_client::{ReadPreference, SelectionCriteria, Topology};

let topology = Topology::builder()
    .set_hosts(&["a.example.com:27017", "b.example.com:27017"])
    .set_replica_set("rs0")
    .set_connection_factory(factory)
    .build()?;
topology.connect(None).await?;

let criteria = SelectionCriteria::from(ReadPreference::secondary_preferred());
let server = topology.select_server(&criteria, None).await?;
println!("Reading from {}", server.address());

topology.close().await;
# Ok(())
# }
```
*/

mod monitor;
mod round_trip_time;
mod sdam_error;
mod server;
mod server_address;
mod server_description;
mod topology;
mod topology_description;

pub mod connection;
pub mod connection_pool;
pub mod events;
pub mod hello_reply;
pub mod read_preference;
pub mod server_selection;

#[cfg(test)]
mod test_util;

pub use read_preference::{ReadPreference, ReadPreferenceMode, TagSet};
pub use sdam_error::*;
pub use server::*;
pub use server_address::*;
pub use server_description::*;
pub use server_selection::SelectionCriteria;
pub use topology::*;
pub use topology_description::*;

pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}
