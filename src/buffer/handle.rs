//! Public interface for submitting metrics to the buffer actor

use super::actor::{BufferActor, BufferMessage, BufferStats};
use super::config::BufferConfig;
use super::error::BufferError;
use crate::config::ConfigError;
use crate::event::{Event, MergeError};
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{error, warn};

/// Handle for submitting metrics to the aggregation buffer.
///
/// Cheap to clone; every clone feeds the same actor. Submissions wait only
/// when the channel is full.
pub struct StatsdBuffer<T: Transport> {
    tx: mpsc::Sender<BufferMessage>,
    transport: Arc<T>,
    closed: Arc<AtomicBool>,
    close_timeout: Option<Duration>,
}

impl<T: Transport> Clone for StatsdBuffer<T> {
    fn clone(&self) -> Self {
        StatsdBuffer {
            tx: self.tx.clone(),
            transport: Arc::clone(&self.transport),
            closed: Arc::clone(&self.closed),
            close_timeout: self.close_timeout,
        }
    }
}

impl<T: Transport> StatsdBuffer<T> {
    /// Increment a counter. A zero delta is dropped.
    pub async fn increment(&self, name: impl Into<String>, delta: i64) -> Result<(), BufferError> {
        if delta == 0 {
            return Ok(());
        }
        self.submit(Event::increment(name, delta)).await
    }

    /// Decrement a counter. A zero delta is dropped.
    ///
    /// `i64::MIN` has no negation and is refused with
    /// `MergeError::Overflow` without reaching the buffer.
    pub async fn decrement(&self, name: impl Into<String>, delta: i64) -> Result<(), BufferError> {
        if delta == 0 {
            return Ok(());
        }
        let name = name.into();
        match delta.checked_neg() {
            Some(negated) => self.submit(Event::increment(name, negated)).await,
            None => Err(BufferError::Merge(MergeError::Overflow { key: name })),
        }
    }

    /// Record a duration sample
    pub async fn timing(&self, name: impl Into<String>, duration: Duration) -> Result<(), BufferError> {
        self.submit(Event::timing(name, duration)).await
    }

    /// Set a gauge. Zero is a real reading and is always submitted.
    pub async fn gauge(&self, name: impl Into<String>, value: i64) -> Result<(), BufferError> {
        self.submit(Event::gauge(name, value)).await
    }

    /// Submit an absolute-valued metric
    pub async fn absolute(&self, name: impl Into<String>, value: i64) -> Result<(), BufferError> {
        self.submit(Event::absolute(name, value)).await
    }

    /// Submit a running total, e.g. read operations since boot
    pub async fn total(&self, name: impl Into<String>, value: i64) -> Result<(), BufferError> {
        self.submit(Event::total(name, value)).await
    }

    /// Enqueue an already-built event
    pub async fn submit(&self, event: Event) -> Result<(), BufferError> {
        self.tx
            .send(BufferMessage::Event(event))
            .await
            .map_err(|_| BufferError::Closed)
    }

    /// Flush now, after everything enqueued before this call
    pub async fn flush(&self) -> Result<(), BufferError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(BufferMessage::Flush { reply })
            .await
            .map_err(|_| BufferError::Closed)?;
        response.await.unwrap_or(Err(BufferError::Closed))
    }

    /// Actor counters, as of everything enqueued before this call
    pub async fn stats(&self) -> Result<BufferStats, BufferError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(BufferMessage::Stats { reply })
            .await
            .map_err(|_| BufferError::Closed)?;
        response.await.map_err(|_| BufferError::Closed)
    }

    /// Drain the buffer and close the transport.
    ///
    /// The shutdown request queues behind every event already submitted, so
    /// those are all part of the final flush. The transport is closed only
    /// after the actor has answered. A flush error takes priority over a
    /// transport-close error, which is logged instead.
    ///
    /// With a close timeout configured and exceeded, `CloseTimeout` is
    /// returned and the transport is still closed exactly once:
    ///
    /// - request queued but not answered in time: the actor closes the
    ///   transport itself after its final flush
    /// - request never queued (channel full): nothing changed, the buffer
    ///   stays open and `close` may be called again
    pub async fn close(&self) -> Result<(), BufferError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BufferError::Closed);
        }

        let flush_result = match self.close_timeout {
            Some(limit) => {
                let deadline = Instant::now() + limit;
                let (reply, mut response) = oneshot::channel();
                let queued =
                    time::timeout_at(deadline, self.tx.send(BufferMessage::Shutdown { reply })).await;
                match queued {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return self.close_transport(Err(BufferError::Closed)).await,
                    Err(_) => {
                        warn!("Shutdown request not queued within {:?}, buffer stays open", limit);
                        self.closed.store(false, Ordering::Release);
                        return Err(BufferError::CloseTimeout(limit));
                    }
                }

                let answered = time::timeout_at(deadline, &mut response).await;
                match answered {
                    Ok(result) => result.unwrap_or(Err(BufferError::Closed)),
                    Err(_) => {
                        // After this the actor either already replied or
                        // will see the reply refused and close the transport
                        response.close();
                        match response.try_recv() {
                            Ok(result) => result,
                            Err(_) => {
                                warn!(
                                    "Final flush did not complete within {:?}, transport left to the buffer task",
                                    limit
                                );
                                return Err(BufferError::CloseTimeout(limit));
                            }
                        }
                    }
                }
            }
            None => self.request_shutdown().await,
        };

        self.close_transport(flush_result).await
    }

    async fn close_transport(&self, flush_result: Result<(), BufferError>) -> Result<(), BufferError> {
        let transport_result = self.transport.close().await;
        match (flush_result, transport_result) {
            (Err(flush_err), Err(close_err)) => {
                error!(
                    "Closing transport failed after flush error ({}): {}",
                    flush_err, close_err
                );
                Err(flush_err)
            }
            (Err(flush_err), Ok(())) => Err(flush_err),
            (Ok(()), Err(close_err)) => Err(BufferError::Transport(close_err)),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// True once `close` has taken effect or the actor has stopped
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    async fn request_shutdown(&self) -> Result<(), BufferError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(BufferMessage::Shutdown { reply })
            .await
            .map_err(|_| BufferError::Closed)?;
        response.await.unwrap_or(Err(BufferError::Closed))
    }
}

/// Spawn a buffer actor and return its handle + join handle.
///
/// The join handle resolves to the actor's exit status: `Ok` after a
/// shutdown or once every handle is dropped, `Err` for a fatal fault (the
/// pending metrics were flushed first).
pub fn spawn_buffer<T: Transport>(
    config: BufferConfig,
    transport: T,
) -> Result<(StatsdBuffer<T>, JoinHandle<Result<(), BufferError>>), ConfigError> {
    config.validate()?;

    let transport = Arc::new(transport);
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let actor = BufferActor::new(Arc::clone(&transport), rx, config.flush_interval);

    let task = tokio::spawn(actor.run());

    let handle = StatsdBuffer {
        tx,
        transport,
        closed: Arc::new(AtomicBool::new(false)),
        close_timeout: config.close_timeout,
    };
    Ok((handle, task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;

    fn long_interval() -> BufferConfig {
        BufferConfig::with_interval(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_zero_delta_is_dropped() {
        let transport = InMemoryTransport::new();
        let (buffer, task) = spawn_buffer(long_interval(), transport.clone()).unwrap();

        buffer.increment("x", 0).await.unwrap();
        buffer.decrement("x", 0).await.unwrap();
        let stats = buffer.stats().await.unwrap();
        assert_eq!(stats.events_received, 0);
        assert_eq!(stats.pending_keys, 0);

        buffer.close().await.unwrap();
        task.await.unwrap().unwrap();
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_decrement_inverts_sign() {
        let transport = InMemoryTransport::new();
        let (buffer, task) = spawn_buffer(long_interval(), transport.clone()).unwrap();

        buffer.increment("q", 5).await.unwrap();
        buffer.decrement("q", 7).await.unwrap();
        buffer.close().await.unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(transport.sent(), vec![Event::increment("q", -2)]);
    }

    #[tokio::test]
    async fn test_zero_gauge_is_submitted() {
        let transport = InMemoryTransport::new();
        let (buffer, task) = spawn_buffer(long_interval(), transport.clone()).unwrap();

        buffer.gauge("idle", 0).await.unwrap();
        buffer.close().await.unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(transport.sent(), vec![Event::gauge("idle", 0)]);
    }

    #[tokio::test]
    async fn test_submit_after_close_fails() {
        let (buffer, task) = spawn_buffer(long_interval(), InMemoryTransport::new()).unwrap();
        buffer.close().await.unwrap();
        task.await.unwrap().unwrap();

        assert!(buffer.is_closed());
        assert!(matches!(
            buffer.increment("late", 1).await,
            Err(BufferError::Closed)
        ));
        assert!(matches!(buffer.close().await, Err(BufferError::Closed)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = BufferConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(spawn_buffer(config, InMemoryTransport::new()).is_err());
    }
}
