//! Transport Abstraction
//!
//! The buffer hands each flushed event to a `Transport`. Implementations:
//!
//! - `UdpTransport`: StatsD lines over UDP (production)
//! - `InMemoryTransport`: records deliveries, for tests
//! - `SimulatedTransport`: seeded fault injection around another transport, for DST

pub mod memory;
pub mod simulated;
pub mod udp;

pub use memory::InMemoryTransport;
pub use simulated::{SimulatedTransport, SimulatedTransportConfig, SimulatedTransportStats};
pub use udp::{UdpTransport, UdpTransportConfig};

use crate::event::Event;
use std::future::Future;
use std::io::Error as IoError;
use std::pin::Pin;

/// Error type for transport operations
#[derive(Debug)]
pub enum TransportError {
    /// Socket or encoding failure
    Io(IoError),
    /// Transport already closed
    Closed,
    /// Event refused by the transport
    Rejected(String),
    /// Send task panicked
    Panicked(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "transport I/O error: {}", e),
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Rejected(msg) => write!(f, "transport rejected event: {}", msg),
            TransportError::Panicked(msg) => write!(f, "transport send panicked: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for TransportError {
    fn from(e: IoError) -> Self {
        TransportError::Io(e)
    }
}

/// Downstream sink for aggregated events.
///
/// `send` may be called concurrently from several flush tasks. `close` is
/// called once, after the last flush has completed.
pub trait Transport: Send + Sync + 'static {
    /// Send one aggregated event
    fn send<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

    /// Release transport resources
    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;
}
