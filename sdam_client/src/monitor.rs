//! Per-server heartbeat monitoring.
//!
//! Each tracked server has one monitor actor. It owns a dedicated
//! handshake-only connection, runs one check at a time, and reports every
//! resulting [`ServerDescription`](crate::ServerDescription) to the topology
//! over a [`MonitorEvent`] channel.
mod interruptible_interval;
mod monitor_actor;
mod monitor_handle;
mod monitor_helpers;
mod monitor_state;
mod rtt_pinger;

pub(crate) use interruptible_interval::*;
pub(crate) use monitor_actor::*;
pub(crate) use monitor_handle::*;
pub(crate) use monitor_helpers::*;
pub(crate) use monitor_state::*;
pub(crate) use rtt_pinger::*;
