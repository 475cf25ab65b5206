//! Buffer Actor - single owner of the aggregation map
//!
//! Producers never touch the map. Everything they do arrives as a message on
//! one channel, so merges, flushes and shutdown are serialized by the actor
//! loop and the map needs no lock.
//!
//! ```text
//! Producer 1 ──┐
//! Producer 2 ──┤──► channel ──► BufferActor ──► merge into map
//! Producer 3 ──┘                    │
//!                  ticker ──────────┴──► flush: one send per key ──► Transport
//! ```
//!
//! A shutdown request travels through the same channel as events, so it is
//! handled only after every event enqueued before it has been merged.

use super::error::BufferError;
use crate::event::{Event, MergeError};
use crate::transport::{Transport, TransportError};
use ahash::AHashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Messages for the buffer actor
pub enum BufferMessage {
    /// Merge an event into the map
    Event(Event),
    /// Flush now and report the result
    Flush {
        reply: oneshot::Sender<Result<(), BufferError>>,
    },
    /// Report counters
    Stats { reply: oneshot::Sender<BufferStats> },
    /// Final flush, reply, then stop. If the reply can no longer be
    /// delivered, the actor closes the transport itself.
    Shutdown {
        reply: oneshot::Sender<Result<(), BufferError>>,
    },
}

/// Counters maintained by the actor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    /// Keys currently waiting for the next flush
    pub pending_keys: usize,
    /// Events received since start
    pub events_received: u64,
    /// Events folded into an existing entry
    pub events_merged: u64,
    /// Flush cycles run, empty ones included
    pub flushes: u64,
    pub sends_attempted: u64,
    pub sends_failed: u64,
}

/// Actor owning the aggregation map
pub struct BufferActor<T: Transport> {
    events: AHashMap<String, Event>,
    transport: Arc<T>,
    rx: mpsc::Receiver<BufferMessage>,
    flush_interval: Duration,
    stats: BufferStats,
}

impl<T: Transport> BufferActor<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        rx: mpsc::Receiver<BufferMessage>,
        flush_interval: Duration,
    ) -> Self {
        BufferActor {
            events: AHashMap::new(),
            transport,
            rx,
            flush_interval,
            stats: BufferStats::default(),
        }
    }

    /// Run the actor loop until shutdown, a fault, or every handle is dropped.
    ///
    /// On a merge fault the buffered metrics are flushed first and the fault
    /// is returned.
    pub async fn run(mut self) -> Result<(), BufferError> {
        info!(
            "Metrics buffer started (flush interval {:?})",
            self.flush_interval
        );

        // First tick one full interval from now, not immediately
        let mut ticker = time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        warn!("Periodic flush: {}", e);
                    }
                }
                msg = self.rx.recv() => {
                    let msg = match msg {
                        Some(msg) => msg,
                        None => {
                            info!("All buffer handles dropped, flushing metrics before exit");
                            if let Err(e) = self.flush().await {
                                warn!("Final flush: {}", e);
                            }
                            return Ok(());
                        }
                    };
                    if self.handle_message(msg).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Handle a single message. Returns true if shutdown.
    async fn handle_message(&mut self, msg: BufferMessage) -> Result<bool, BufferError> {
        match msg {
            BufferMessage::Event(event) => {
                if let Err(fault) = self.ingest(event) {
                    error!(
                        "Metrics buffer fault, flushing pending metrics before stopping: {}",
                        fault
                    );
                    if let Err(e) = self.flush().await {
                        error!("Flush after fault: {}", e);
                    }
                    return Err(fault.into());
                }
                Ok(false)
            }
            BufferMessage::Flush { reply } => {
                let _ = reply.send(self.flush().await);
                Ok(false)
            }
            BufferMessage::Stats { reply } => {
                let _ = reply.send(self.snapshot());
                Ok(false)
            }
            BufferMessage::Shutdown { reply } => {
                info!("Asked to terminate, flushing metrics before returning");
                let result = self.flush().await;
                if let Err(unclaimed) = reply.send(result) {
                    // The closer stopped waiting, so the transport is ours to close
                    if let Err(e) = unclaimed {
                        warn!("Final flush: {}", e);
                    }
                    info!("Closer gave up waiting, closing transport after final flush");
                    if let Err(e) = self.transport.close().await {
                        error!("Closing transport failed: {}", e);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Merge an event into the entry for its key, or insert it
    fn ingest(&mut self, event: Event) -> Result<(), MergeError> {
        self.stats.events_received += 1;
        match self.events.get_mut(event.key()) {
            Some(existing) => {
                existing.merge(event)?;
                self.stats.events_merged += 1;
            }
            None => {
                self.events.insert(event.key().to_string(), event);
            }
        }
        Ok(())
    }

    /// Send every buffered event and clear the map.
    ///
    /// Sends run concurrently, one task per key. A failed send is logged and
    /// dropped; it neither stops sibling sends nor gets retried. Returns the
    /// first error seen.
    async fn flush(&mut self) -> Result<(), BufferError> {
        self.stats.flushes += 1;
        if self.events.is_empty() {
            return Ok(());
        }

        let attempted = self.events.len();
        let mut sends = JoinSet::new();
        for (key, event) in self.events.drain() {
            let transport = Arc::clone(&self.transport);
            sends.spawn(async move {
                let result = transport.send(&event).await;
                (key, result)
            });
        }

        let mut failed = 0;
        let mut first_error: Option<TransportError> = None;
        while let Some(joined) = sends.join_next().await {
            let err = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((key, Err(e))) => {
                    warn!("Failed to send metric '{}': {}", key, e);
                    e
                }
                Err(join_err) => {
                    error!("Metric send task failed: {}", join_err);
                    TransportError::Panicked(join_err.to_string())
                }
            };
            failed += 1;
            first_error.get_or_insert(err);
        }

        self.stats.sends_attempted += attempted as u64;
        self.stats.sends_failed += failed as u64;
        debug!("Flushed {} metrics ({} failed)", attempted, failed);

        match first_error {
            Some(source) => Err(BufferError::Flush {
                failed,
                attempted,
                source,
            }),
            None => Ok(()),
        }
    }

    fn snapshot(&self) -> BufferStats {
        BufferStats {
            pending_keys: self.events.len(),
            ..self.stats.clone()
        }
    }
}
