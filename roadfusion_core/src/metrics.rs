//! Pipeline performance counters.
//!
//! Lock-free counters the node logs periodically: message throughput comes
//! from the queue, engine counters from [`EngineStats`], and the worker's
//! cycle timing is tracked here as an exponential moving average.
//!
//! [`EngineStats`]: crate::fusion::EngineStats

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::fusion::EngineStats;
use crate::queue::MessageQueue;

const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Shared counters for the consumer loop.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    messages_consumed: AtomicU64,
    /// EWMA of cycle duration, stored as f64 bits.
    cycle_latency_us: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_message(&self) {
        self.messages_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle_latency(&self, micros: f64) {
        let prev = f64::from_bits(self.cycle_latency_us.load(Ordering::Relaxed));
        let next = if prev == 0.0 {
            micros
        } else {
            prev + LATENCY_EWMA_ALPHA * (micros - prev)
        };
        self.cycle_latency_us.store(next.to_bits(), Ordering::Relaxed);
    }

    pub fn messages_consumed(&self) -> u64 {
        self.messages_consumed.load(Ordering::Relaxed)
    }

    pub fn cycle_latency_us(&self) -> f64 {
        f64::from_bits(self.cycle_latency_us.load(Ordering::Relaxed))
    }

    /// Combines all counter sources into one loggable snapshot.
    pub fn snapshot(&self, queue: &MessageQueue, engine: EngineStats) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_pushed: queue.pushed(),
            messages_dropped: queue.dropped(),
            messages_consumed: self.messages_consumed(),
            queue_depth: queue.size(),
            cycle_latency_us: self.cycle_latency_us(),
            engine,
        }
    }
}

/// Point-in-time view of the whole pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages_pushed: u64,
    pub messages_dropped: u64,
    pub messages_consumed: u64,
    pub queue_depth: usize,
    pub cycle_latency_us: f64,
    pub engine: EngineStats,
}
