//! snapsend: the sending side of btrfs share replication.
//!
//! A transfer announces itself to the receiver over a control connection,
//! streams `btrfs send` output as tagged data frames, and records the outcome
//! of every attempt as a replica trail.

pub mod cli;
pub mod config;
pub mod error;
pub mod replica;
pub mod snapshot;
pub mod streaming;
pub mod trail;
pub mod transport;

pub use config::Config;
pub use error::{ReplError, Result};
pub use replica::{Replica, ReplicaTrail, TrailStatus, TrailUpdate, TransferId};
