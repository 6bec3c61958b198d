//! Adaptive packetizer: locality-aware distribution of file-range work
//! across a heterogeneous worker pool.
//!
//! Architecture role:
//! - owns the set of unprocessed work and hands out packets (contiguous
//!   entry sub-ranges of one file) on worker pull;
//! - tracks per-worker processing rate and sizes future packets so that no
//!   slow worker holds up the query tail;
//! - prefers files cached on the requesting worker's host, trading locality
//!   against pool-wide balance;
//! - runs a one-shot startup validation round that turns builder-supplied
//!   element ranges into authoritative entry counts.
//!
//! Key modules:
//! - [`packetizer`]
//! - [`transport`]
//! - [`progress`]

pub mod packetizer;
pub mod progress;
pub mod transport;
mod validate;

pub use packetizer::{Packet, PacketReport, Packetizer};
pub use progress::{DatasetStatus, ProgressReporter};
pub use transport::{
    Monitor, MonitorEvent, ValidationRequest, WorkerEndpoint, WorkerInfo, WorkerLink,
    WorkerReply, WorkerSession,
};
