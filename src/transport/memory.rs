//! In-memory transport for unit tests and deterministic simulation
//!
//! Clones share state, so a test can keep one clone for assertions while the
//! buffer owns another.

use super::{Transport, TransportError};
use crate::event::Event;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct InMemoryState {
    sent: Mutex<Vec<Event>>,
    rejected_keys: Mutex<HashSet<String>>,
    panic_keys: Mutex<HashSet<String>>,
    attempts: AtomicUsize,
    closes: AtomicUsize,
    sends_after_close: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    closed: AtomicBool,
}

/// Recording transport
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<InMemoryState>,
    latency: Duration,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every send by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every send for `key` with `TransportError::Rejected`
    pub fn reject_key(&self, key: impl Into<String>) {
        self.state.rejected_keys.lock().insert(key.into());
    }

    /// Panic inside every send for `key`
    pub fn panic_on_key(&self, key: impl Into<String>) {
        self.state.panic_keys.lock().insert(key.into());
    }

    /// Successfully delivered events, in completion order
    pub fn sent(&self) -> Vec<Event> {
        self.state.sent.lock().clone()
    }

    /// Delivered events for one key
    pub fn sent_for(&self, key: &str) -> Vec<Event> {
        self.state
            .sent
            .lock()
            .iter()
            .filter(|e| e.key() == key)
            .cloned()
            .collect()
    }

    /// Remove and return everything delivered so far
    pub fn take_sent(&self) -> Vec<Event> {
        std::mem::take(&mut *self.state.sent.lock())
    }

    /// Number of send calls, failed ones included
    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Sends that arrived after `close`
    pub fn sends_after_close(&self) -> usize {
        self.state.sends_after_close.load(Ordering::SeqCst)
    }

    /// Highest number of sends observed in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn record(&self, event: &Event) -> Result<(), TransportError> {
        if self.state.closed.load(Ordering::SeqCst) {
            self.state.sends_after_close.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::Closed);
        }
        if self.state.panic_keys.lock().contains(event.key()) {
            panic!("injected panic sending '{}'", event.key());
        }
        if self.state.rejected_keys.lock().contains(event.key()) {
            return Err(TransportError::Rejected(format!(
                "key '{}' is rejected",
                event.key()
            )));
        }
        self.state.sent.lock().push(event.clone());
        Ok(())
    }
}

impl Transport for InMemoryTransport {
    fn send<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.state.attempts.fetch_add(1, Ordering::SeqCst);
            let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.record(event)
        })
    }

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
            self.state.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}
