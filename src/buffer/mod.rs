//! Aggregation buffer
//!
//! Merges high-frequency metric events by key and flushes one aggregated
//! event per key to a [`Transport`](crate::transport::Transport) on every
//! tick of the flush interval, instead of one network send per event.
//!
//! ```ignore
//! let (buffer, task) = spawn_buffer(BufferConfig::default(), transport)?;
//! buffer.increment("requests", 1).await?;
//! buffer.timing("latency", elapsed).await?;
//! buffer.close().await?;
//! task.await??;
//! ```

pub mod actor;
pub mod config;
pub mod error;
pub mod handle;

pub use actor::{BufferActor, BufferMessage, BufferStats};
pub use config::BufferConfig;
pub use error::BufferError;
pub use handle::{spawn_buffer, StatsdBuffer};
