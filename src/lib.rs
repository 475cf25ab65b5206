//! In-process StatsD aggregation buffer
//!
//! Sits between high-frequency metric call sites and a network transport:
//! events sharing a key are merged in memory and flushed as one datapoint per
//! key on every flush interval.

pub mod buffer;
pub mod config;
pub mod dst;
pub mod event;
pub mod transport;

pub use buffer::{spawn_buffer, BufferConfig, BufferError, BufferStats, StatsdBuffer};
pub use config::{AgentConfig, ConfigError};
pub use event::{Event, EventKind, MergeError, TimingDistribution};
pub use transport::{InMemoryTransport, Transport, TransportError, UdpTransport, UdpTransportConfig};
