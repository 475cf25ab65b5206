//! Buffer Deterministic Simulation Testing Harness
//!
//! Verifies the aggregation buffer under concurrent producers and transport
//! faults:
//!
//! - **Fold invariant**: without faults, what the transport received folds to
//!   exactly the shadow model of everything submitted
//! - **Isolation**: a failed send never suppresses another key's send
//! - **Clean close**: the transport is closed once, after its last send
//!
//! ## DST Methodology
//!
//! 1. Derive one workload per producer from the seed
//! 2. Fold every workload into a shadow model (shared keys only use
//!    commutative kinds; last-write-wins keys are owned by one producer)
//! 3. Run all producers concurrently against one buffer over a
//!    `SimulatedTransport`, then close it
//! 4. Fold what the transport delivered and compare with the shadow

mod rng;

pub use rng::DeterministicRng;

use crate::buffer::{spawn_buffer, BufferConfig, BufferError, StatsdBuffer};
use crate::event::Event;
use crate::transport::{
    InMemoryTransport, SimulatedTransport, SimulatedTransportConfig, SimulatedTransportStats,
    Transport,
};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::time::Duration;

/// One façade call made by a producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferOperation {
    Increment { key: String, delta: i64 },
    Decrement { key: String, delta: i64 },
    Gauge { key: String, value: i64 },
    Absolute { key: String, value: i64 },
    Total { key: String, value: i64 },
    Timing { key: String, sample: Duration },
}

impl BufferOperation {
    /// Apply through the public façade
    pub async fn apply<T: Transport>(&self, buffer: &StatsdBuffer<T>) -> Result<(), BufferError> {
        match self {
            BufferOperation::Increment { key, delta } => buffer.increment(key.as_str(), *delta).await,
            BufferOperation::Decrement { key, delta } => buffer.decrement(key.as_str(), *delta).await,
            BufferOperation::Gauge { key, value } => buffer.gauge(key.as_str(), *value).await,
            BufferOperation::Absolute { key, value } => buffer.absolute(key.as_str(), *value).await,
            BufferOperation::Total { key, value } => buffer.total(key.as_str(), *value).await,
            BufferOperation::Timing { key, sample } => buffer.timing(key.as_str(), *sample).await,
        }
    }
}

/// Folded view of one key, comparable between shadow and delivered state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldedMetric {
    Counter(i64),
    Timing { count: u64, sum: Duration },
    Last(Event),
}

/// Shadow model of the merged state per key
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShadowState {
    metrics: BTreeMap<String, FoldedMetric>,
}

impl ShadowState {
    /// Fold a submitted operation (zero deltas and `i64::MIN` decrements
    /// are dropped, like the façade)
    pub fn apply_operation(&mut self, op: &BufferOperation) {
        let event = match op {
            BufferOperation::Increment { delta: 0, .. } | BufferOperation::Decrement { delta: 0, .. } => {
                return
            }
            BufferOperation::Increment { key, delta } => Event::increment(key.as_str(), *delta),
            BufferOperation::Decrement { key, delta } => match delta.checked_neg() {
                Some(negated) => Event::increment(key.as_str(), negated),
                None => return,
            },
            BufferOperation::Gauge { key, value } => Event::gauge(key.as_str(), *value),
            BufferOperation::Absolute { key, value } => Event::absolute(key.as_str(), *value),
            BufferOperation::Total { key, value } => Event::total(key.as_str(), *value),
            BufferOperation::Timing { key, sample } => Event::timing(key.as_str(), *sample),
        };
        self.apply_event(&event);
    }

    /// Fold a delivered event
    pub fn apply_event(&mut self, event: &Event) {
        let key = event.key().to_string();
        match event {
            Event::Increment { value, .. } => {
                let entry = self.metrics.entry(key).or_insert(FoldedMetric::Counter(0));
                if let FoldedMetric::Counter(sum) = entry {
                    *sum = sum.saturating_add(*value);
                }
            }
            Event::Timing { distribution, .. } => {
                let entry = self.metrics.entry(key).or_insert(FoldedMetric::Timing {
                    count: 0,
                    sum: Duration::ZERO,
                });
                if let FoldedMetric::Timing { count, sum } = entry {
                    *count += distribution.count();
                    *sum += distribution.sum();
                }
            }
            Event::Gauge { .. } | Event::Absolute { .. } | Event::Total { .. } => {
                self.metrics.insert(key, FoldedMetric::Last(event.clone()));
            }
        }
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.metrics.keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<&FoldedMetric> {
        self.metrics.get(key)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// Configuration for the buffer DST harness
#[derive(Debug, Clone)]
pub struct BufferDSTConfig {
    /// Concurrent producer tasks
    pub num_producers: usize,
    /// Operations per producer
    pub ops_per_producer: usize,
    /// Counter and timing keys shared by every producer
    pub shared_keys: usize,
    /// Gauge and absolute keys owned by each producer
    pub owned_keys: usize,
    /// Buffer settings (short intervals force several flush cycles)
    pub buffer: BufferConfig,
    /// Fault injection config
    pub transport: SimulatedTransportConfig,
}

impl Default for BufferDSTConfig {
    fn default() -> Self {
        BufferDSTConfig {
            num_producers: 8,
            ops_per_producer: 200,
            shared_keys: 4,
            owned_keys: 2,
            buffer: BufferConfig {
                flush_interval: Duration::from_millis(5),
                channel_capacity: 32,
                close_timeout: Some(Duration::from_secs(10)),
            },
            transport: SimulatedTransportConfig::no_faults(),
        }
    }
}

impl BufferDSTConfig {
    /// No faults, many flush cycles - baseline correctness
    pub fn baseline() -> Self {
        Self::default()
    }

    /// No faults, only the shutdown flush - one send per key
    pub fn single_flush() -> Self {
        BufferDSTConfig {
            buffer: BufferConfig {
                flush_interval: Duration::from_secs(3600),
                ..Self::default().buffer
            },
            ..Self::default()
        }
    }

    /// Transport faults, only the shutdown flush
    pub fn chaos() -> Self {
        BufferDSTConfig {
            transport: SimulatedTransportConfig::high_chaos(),
            ..Self::single_flush()
        }
    }
}

/// Result of a single DST run
#[derive(Debug)]
pub struct BufferDSTResult {
    pub seed: u64,
    pub ops_submitted: usize,
    pub expected_keys: usize,
    pub delivered_sends: usize,
    pub missing_keys: usize,
    pub transport_stats: SimulatedTransportStats,
    pub passed: bool,
    pub error_message: Option<String>,
}

/// Buffer DST Harness
pub struct BufferDSTHarness {
    seed: u64,
    rng: DeterministicRng,
    config: BufferDSTConfig,
}

impl BufferDSTHarness {
    pub fn new(seed: u64, config: BufferDSTConfig) -> Self {
        BufferDSTHarness {
            seed,
            rng: DeterministicRng::new(seed),
            config,
        }
    }

    /// Generate the operation sequence for one producer
    pub fn generate_workload(&self, producer: usize, rng: &mut DeterministicRng) -> Vec<BufferOperation> {
        let shared = self.config.shared_keys.max(1) as u64;
        let owned = self.config.owned_keys.max(1) as u64;
        let mut running_total = 0i64;
        let mut ops = Vec::with_capacity(self.config.ops_per_producer);

        for _ in 0..self.config.ops_per_producer {
            let op = match rng.gen_range(0, 6) {
                0 => BufferOperation::Increment {
                    key: format!("counter.{}", rng.gen_range(0, shared)),
                    delta: rng.gen_i64(-2, 5),
                },
                1 => BufferOperation::Decrement {
                    key: format!("counter.{}", rng.gen_range(0, shared)),
                    delta: rng.gen_i64(0, 3),
                },
                2 => BufferOperation::Timing {
                    key: format!("timing.{}", rng.gen_range(0, shared)),
                    sample: Duration::from_micros(rng.gen_range(100, 500_000)),
                },
                3 => BufferOperation::Gauge {
                    key: format!("gauge.p{}.{}", producer, rng.gen_range(0, owned)),
                    value: rng.gen_i64(-100, 100),
                },
                4 => BufferOperation::Absolute {
                    key: format!("absolute.p{}.{}", producer, rng.gen_range(0, owned)),
                    value: rng.gen_i64(0, 1000),
                },
                _ => {
                    running_total += rng.gen_i64(0, 50);
                    BufferOperation::Total {
                        key: format!("total.p{}", producer),
                        value: running_total,
                    }
                }
            };
            ops.push(op);
        }
        ops
    }

    /// Run a single DST scenario
    pub async fn run(&mut self) -> BufferDSTResult {
        let mut workloads = Vec::with_capacity(self.config.num_producers);
        for producer in 0..self.config.num_producers {
            let mut producer_rng = self.rng.fork();
            workloads.push(self.generate_workload(producer, &mut producer_rng));
        }

        let mut shadow = ShadowState::default();
        for op in workloads.iter().flatten() {
            shadow.apply_operation(op);
        }
        let ops_submitted = workloads.iter().map(Vec::len).sum();

        let memory = InMemoryTransport::new();
        let transport = SimulatedTransport::new(
            memory.clone(),
            self.rng.fork(),
            self.config.transport.clone(),
        );

        let mut result = BufferDSTResult {
            seed: self.seed,
            ops_submitted,
            expected_keys: shadow.len(),
            delivered_sends: 0,
            missing_keys: 0,
            transport_stats: SimulatedTransportStats::default(),
            passed: false,
            error_message: None,
        };

        let (buffer, task) = match spawn_buffer(self.config.buffer.clone(), transport.clone()) {
            Ok(spawned) => spawned,
            Err(e) => {
                result.error_message = Some(format!("Failed to spawn buffer: {}", e));
                return result;
            }
        };

        let producers: Vec<_> = workloads
            .into_iter()
            .map(|ops| {
                let buffer = buffer.clone();
                tokio::spawn(async move {
                    for op in &ops {
                        op.apply(&buffer).await?;
                    }
                    Ok::<(), BufferError>(())
                })
            })
            .collect();

        for joined in futures::future::join_all(producers).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    result.error_message = Some(format!("Producer failed: {}", e));
                    return result;
                }
                Err(e) => {
                    result.error_message = Some(format!("Producer task failed: {}", e));
                    return result;
                }
            }
        }

        let close_result = buffer.close().await;
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                result.error_message = Some(format!("Buffer actor fault: {}", e));
                return result;
            }
            Err(e) => {
                result.error_message = Some(format!("Buffer actor task failed: {}", e));
                return result;
            }
        }

        let stats = transport.stats();
        let failures = (stats.send_failures + stats.rejections) as usize;
        let delivered = memory.sent();
        result.delivered_sends = delivered.len();
        result.transport_stats = stats;

        let mut observed = ShadowState::default();
        for event in &delivered {
            observed.apply_event(event);
        }
        result.missing_keys = shadow.keys().difference(&observed.keys()).count();

        result.error_message = self.check(&shadow, &observed, failures, &memory, close_result.is_ok());
        result.passed = result.error_message.is_none();
        result
    }

    fn check(
        &self,
        shadow: &ShadowState,
        observed: &ShadowState,
        failures: usize,
        memory: &InMemoryTransport,
        close_ok: bool,
    ) -> Option<String> {
        if memory.close_count() != 1 {
            return Some(format!("transport closed {} times", memory.close_count()));
        }
        if memory.sends_after_close() != 0 {
            return Some(format!("{} sends after transport close", memory.sends_after_close()));
        }

        let unexpected: Vec<_> = observed.keys().difference(&shadow.keys()).cloned().collect();
        if !unexpected.is_empty() {
            return Some(format!("delivered keys never submitted: {:?}", unexpected));
        }

        if failures == 0 {
            if !close_ok && self.config.transport.close_fail_prob == 0.0 {
                return Some("close failed without any injected fault".to_string());
            }
            for key in shadow.keys() {
                if shadow.get(&key) != observed.get(&key) {
                    return Some(format!(
                        "key '{}': expected {:?}, delivered {:?}",
                        key,
                        shadow.get(&key),
                        observed.get(&key)
                    ));
                }
            }
        } else {
            // Each failure can lose at most its own key
            let missing = shadow.keys().difference(&observed.keys()).count();
            if missing > failures {
                return Some(format!(
                    "{} keys missing but only {} sends failed",
                    missing, failures
                ));
            }
        }
        None
    }
}

/// Run the harness for every seed in `seeds`
pub async fn run_buffer_dst_batch(seeds: Range<u64>, config: BufferDSTConfig) -> Vec<BufferDSTResult> {
    let mut results = Vec::with_capacity(seeds.clone().count());
    for seed in seeds {
        let mut harness = BufferDSTHarness::new(seed, config.clone());
        results.push(harness.run().await);
    }
    results
}

/// Summarize a batch of DST results
pub fn summarize_buffer_dst_batch(results: &[BufferDSTResult]) -> String {
    let passed = results.iter().filter(|r| r.passed).count();
    let ops: usize = results.iter().map(|r| r.ops_submitted).sum();
    let sends: usize = results.iter().map(|r| r.delivered_sends).sum();
    let failures: u64 = results
        .iter()
        .map(|r| r.transport_stats.send_failures + r.transport_stats.rejections)
        .sum();
    let missing: usize = results.iter().map(|r| r.missing_keys).sum();

    let mut lines = vec![
        "Buffer DST Batch Summary:".to_string(),
        format!("  Runs: {} ({} passed, {} failed)", results.len(), passed, results.len() - passed),
        format!("  Operations submitted: {}", ops),
        format!("  Sends delivered: {}", sends),
        format!("  Sends failed (injected): {}", failures),
        format!("  Keys lost to failed sends: {}", missing),
    ];
    for r in results.iter().filter(|r| !r.passed) {
        lines.push(format!(
            "  Seed {} FAILED: {}",
            r.seed,
            r.error_message.as_deref().unwrap_or("unknown")
        ));
    }
    lines.join("\n")
}
