//! Process and network plumbing for the sender.
//!
//! - `diff`: the `btrfs send` subprocess and its bounded stdout reads
//! - `control`: control/ack connections to the receiver and the data forwarder

pub mod control;
pub mod diff;

pub use control::{ChannelConnector, ControlChannel, ControlConnector, Endpoint, TcpConnector};
pub use diff::{DiffCommand, DiffExit, DiffStreamProcess, ReadOutcome};
