//! Simulated Transport with Fault Injection
//!
//! DST wrapper that fails a seeded fraction of sends before they reach the
//! inner transport. Same seed, same failures (for a given call order).

use super::{Transport, TransportError};
use crate::dst::DeterministicRng;
use crate::event::Event;
use parking_lot::Mutex;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind};
use std::pin::Pin;
use std::sync::Arc;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedTransportConfig {
    /// Probability of a send failing with an I/O error
    pub send_fail_prob: f64,
    /// Probability of a send being rejected
    pub reject_prob: f64,
    /// Probability of close failing
    pub close_fail_prob: f64,
}

impl Default for SimulatedTransportConfig {
    fn default() -> Self {
        SimulatedTransportConfig {
            send_fail_prob: 0.02,  // 2%
            reject_prob: 0.01,     // 1%
            close_fail_prob: 0.01, // 1%
        }
    }
}

impl SimulatedTransportConfig {
    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedTransportConfig {
            send_fail_prob: 0.0,
            reject_prob: 0.0,
            close_fail_prob: 0.0,
        }
    }

    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedTransportConfig {
            send_fail_prob: 0.2,
            reject_prob: 0.1,
            close_fail_prob: 0.1,
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransportStats {
    pub send_attempts: u64,
    pub send_failures: u64,
    pub rejections: u64,
    pub close_attempts: u64,
    pub close_failures: u64,
}

struct SimulatedTransportInner {
    rng: DeterministicRng,
    stats: SimulatedTransportStats,
}

/// Transport wrapper that injects faults in front of another transport
pub struct SimulatedTransport<T: Transport> {
    inner: T,
    config: SimulatedTransportConfig,
    state: Arc<Mutex<SimulatedTransportInner>>,
}

impl<T: Transport> SimulatedTransport<T> {
    pub fn new(inner: T, rng: DeterministicRng, config: SimulatedTransportConfig) -> Self {
        SimulatedTransport {
            inner,
            config,
            state: Arc::new(Mutex::new(SimulatedTransportInner {
                rng,
                stats: SimulatedTransportStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> SimulatedTransportStats {
        self.state.lock().stats.clone()
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Roll the dice for one send, outside of any await point
    fn inject_send_fault(&self, key: &str) -> Option<TransportError> {
        let mut state = self.state.lock();
        state.stats.send_attempts += 1;
        if state.rng.gen_bool(self.config.send_fail_prob) {
            state.stats.send_failures += 1;
            return Some(TransportError::Io(IoError::new(
                ErrorKind::ConnectionRefused,
                format!("simulated send failure for '{}'", key),
            )));
        }
        if state.rng.gen_bool(self.config.reject_prob) {
            state.stats.rejections += 1;
            return Some(TransportError::Rejected(format!(
                "simulated rejection for '{}'",
                key
            )));
        }
        None
    }
}

impl<T: Transport + Clone> Clone for SimulatedTransport<T> {
    fn clone(&self) -> Self {
        SimulatedTransport {
            inner: self.inner.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Transport> Transport for SimulatedTransport<T> {
    fn send<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(err) = self.inject_send_fault(event.key()) {
                return Err(err);
            }
            self.inner.send(event).await
        })
    }

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let fail = {
                let mut state = self.state.lock();
                state.stats.close_attempts += 1;
                let fail = state.rng.gen_bool(self.config.close_fail_prob);
                if fail {
                    state.stats.close_failures += 1;
                }
                fail
            };
            // The inner transport is released either way
            let result = self.inner.close().await;
            if fail {
                return Err(TransportError::Io(IoError::new(
                    ErrorKind::Other,
                    "simulated close failure",
                )));
            }
            result
        })
    }
}
