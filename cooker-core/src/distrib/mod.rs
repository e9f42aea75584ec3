//! Director/worker distribution.
//!
//! A director hands classified items to workers over a [`Connection`],
//! watches them with heartbeats and applies their results to its own item
//! table. Workers run a report-only scheduler and never request the
//! dependencies they discover.

/// Versioned JSON envelopes in length-delimited frames
pub mod codec;
/// Authoritative side of a distributed cook
pub mod director;
/// Protocol messages
pub mod message;
/// TCP transport
pub mod tcp;
/// Connection trait and in-process channel pair
pub mod transport;
/// Worker process loop
pub mod worker;
/// Director's view of one worker
pub mod worker_handle;

pub use director::Director;
pub use message::{Message, PROTOCOL_VERSION};
pub use tcp::TcpConnection;
pub use transport::{ChannelConnection, Connection, Inbound};
pub use worker::{WorkerClient, WorkerExit};
pub use worker_handle::ConnectionState;
