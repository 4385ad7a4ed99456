//! Multi-sensor fusion engine: association, track lifecycle, and periodic
//! snapshot output.
//!
//! Two paths operate on the engine state under one lock:
//!
//! 1. **Ingestion** — every message popped from the queue runs each
//!    detection through nearest-neighbour gating against the live track
//!    table; a detection either updates its best match or births a new
//!    track.
//! 2. **Periodic** — on a fixed cadence every track is predicted forward,
//!    aged, evicted when stale or implausible, and the survivors are
//!    published as a fresh snapshot batch for downstream consumers.
//!
//! [`FusionWorker`] drives both paths from a single consumer thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detection::{
    now_micros, BatchRef, Detection, DetectionBatch, GeoPosition, TargetType, FUSED_SENSOR_ID,
};
use crate::error::FusionError;
use crate::kalman::FilterState;
use crate::queue::{MessageQueue, PopTimeout};

/// Fusion cycle cadence.
pub const CYCLE_PERIOD: Duration = Duration::from_millis(50);

/// Tunable fusion parameters.
///
/// All of these may be replaced at runtime via
/// [`FusionEngine::apply_config`]; the track table capacity is fixed at
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Gating distance below which a detection associates with a track.
    pub association_threshold: f64,

    /// Weight of the positional residual in the gating metric.
    pub position_weight: f64,

    /// Weight of the velocity residual in the gating metric.
    pub velocity_weight: f64,

    /// Tracks whose blended confidence falls below this are evicted.
    pub confidence_threshold: f64,

    /// Cycles a track may go without an update before eviction.
    pub max_track_age: u32,

    /// Maximum number of live fused tracks.
    pub track_capacity: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            association_threshold: 5.0,
            position_weight: 1.0,
            velocity_weight: 0.1,
            confidence_threshold: 0.3,
            max_track_age: 50,
            track_capacity: 100,
        }
    }
}

/// One globally-identified fused object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedTrack {
    /// Assigned once at birth, strictly increasing, never reused in a run.
    pub global_id: u32,
    /// Copied from the birthing detection; never changed afterwards.
    pub target_type: TargetType,
    /// EWMA of contributing detection confidences.
    pub confidence: f64,
    /// Cycles since the last associated measurement.
    pub age: u32,
    /// Bit `k` set iff sensor `k` has ever updated this track.
    pub sensor_mask: u32,
    /// Timestamp of the most recent associated measurement, microseconds.
    pub last_update_us: i64,
    pub filter: FilterState,
}

/// Counters accumulated under the engine lock.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EngineStats {
    pub detections_ingested: u64,
    pub detections_rejected: u64,
    pub tracks_created: u64,
    pub tracks_dropped_table_full: u64,
    pub tracks_evicted: u64,
    pub cycles: u64,
}

/// The fusion engine state machine.
///
/// Not internally synchronized; callers share it as
/// `Arc<Mutex<FusionEngine>>` (see [`FusionWorker`]).
pub struct FusionEngine {
    config: FusionConfig,
    tracks: Vec<FusedTrack>,
    next_global_id: u32,
    snapshot: BatchRef,
    stats: EngineStats,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        info!(
            threshold = config.association_threshold,
            capacity = config.track_capacity,
            "fusion engine created"
        );
        let capacity = config.track_capacity;
        Self {
            config,
            tracks: Vec::with_capacity(capacity),
            next_global_id: 1,
            snapshot: DetectionBatch::new().into_shared(),
            stats: EngineStats::default(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(FusionConfig::default())
    }

    /// Replaces the tunable parameters (config reload path).
    ///
    /// The track table capacity is part of the engine's allocation and is
    /// deliberately not resized here.
    pub fn apply_config(&mut self, mut config: FusionConfig) {
        config.track_capacity = self.config.track_capacity;
        info!(
            threshold = config.association_threshold,
            max_age = config.max_track_age,
            "fusion parameters updated"
        );
        self.config = config;
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Ingestion path
    // ------------------------------------------------------------------

    /// Runs every detection of a batch through association.
    ///
    /// Detections are processed in batch order; each associates with at
    /// most one track, while one track may absorb several detections in the
    /// same call. Invalid detections are counted and skipped.
    pub fn ingest(&mut self, batch: &DetectionBatch) {
        for detection in batch {
            if let Err(err) = detection.validate() {
                self.stats.detections_rejected += 1;
                warn!(%err, sensor_id = detection.sensor_id, "rejecting detection");
                continue;
            }
            self.stats.detections_ingested += 1;

            match self.find_association(detection) {
                Some(index) => self.associate(index, detection),
                None => {
                    if let Err(err) = self.birth(detection) {
                        self.stats.tracks_dropped_table_full += 1;
                        warn!(%err, "dropping detection");
                    }
                }
            }
        }
    }

    /// Nearest-neighbour gating.
    ///
    /// Returns the index of the closest initialized track within the
    /// association threshold. Equidistant candidates resolve to the lowest
    /// index because only a strictly smaller distance replaces the best.
    fn find_association(&self, detection: &Detection) -> Option<usize> {
        let mut best: Option<usize> = None;
        let mut best_distance = self.config.association_threshold;
        for (index, track) in self.tracks.iter().enumerate() {
            if !track.filter.initialized {
                continue;
            }
            let distance = self.distance(track, detection);
            if distance < best_distance {
                best_distance = distance;
                best = Some(index);
            }
        }
        best
    }

    /// Gating metric: weighted sum of positional and velocity residual
    /// norms between the track estimate and the measurement.
    fn distance(&self, track: &FusedTrack, detection: &Detection) -> f64 {
        let s = &track.filter.state;
        let dx = s[0] - detection.position.longitude;
        let dy = s[1] - detection.position.latitude;
        let (vx_m, vy_m) = detection.velocity_vector();
        let dvx = s[2] - vx_m;
        let dvy = s[3] - vy_m;

        self.config.position_weight * dx.hypot(dy)
            + self.config.velocity_weight * dvx.hypot(dvy)
    }

    fn associate(&mut self, index: usize, detection: &Detection) {
        let track = &mut self.tracks[index];
        track.filter.update(detection);
        track.sensor_mask |= 1u32 << detection.sensor_id as u32;
        track.confidence = (track.confidence + detection.confidence) / 2.0;
        track.age = 0;
        track.last_update_us = detection.timestamp_us;
    }

    fn birth(&mut self, detection: &Detection) -> Result<(), FusionError> {
        if self.tracks.len() >= self.config.track_capacity {
            return Err(FusionError::TrackTableFull);
        }

        let global_id = self.next_global_id;
        self.next_global_id += 1;

        let track = FusedTrack {
            global_id,
            target_type: detection.target_type,
            confidence: detection.confidence,
            age: 0,
            sensor_mask: 1u32 << detection.sensor_id as u32,
            last_update_us: detection.timestamp_us,
            filter: FilterState::from_detection(detection),
        };
        debug!(global_id, sensor_id = detection.sensor_id, "fused track born");
        self.tracks.push(track);
        self.stats.tracks_created += 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Periodic path
    // ------------------------------------------------------------------

    /// One periodic cycle at wall-clock time `now_us`.
    ///
    /// Predicts every track to `now_us`, ages it, evicts the stale or
    /// poisoned ones by swap-remove (the moved-in slot is re-examined in
    /// the same pass), and republishes the snapshot.
    pub fn cycle(&mut self, now_us: i64) {
        let mut output = DetectionBatch::with_capacity(self.tracks.len());

        let mut i = 0;
        while i < self.tracks.len() {
            let track = &mut self.tracks[i];

            let dt = ((now_us - track.last_update_us) as f64 / 1e6).max(0.0);
            track.filter.predict(dt);
            track.age += 1;

            let expired = track.age > self.config.max_track_age
                || track.confidence < self.config.confidence_threshold
                || !track.filter.initialized
                || !track.filter.is_finite();
            if expired {
                debug!(global_id = track.global_id, age = track.age, "evicting track");
                self.tracks.swap_remove(i);
                self.stats.tracks_evicted += 1;
                continue;
            }

            output.push(Detection {
                id: track.global_id,
                target_type: track.target_type,
                position: GeoPosition::new(track.filter.state[1], track.filter.state[0], 0.0),
                velocity: track.filter.speed(),
                heading: track.filter.heading_deg(),
                confidence: track.confidence,
                timestamp_us: now_us,
                sensor_id: FUSED_SENSOR_ID,
            });
            i += 1;
        }

        self.snapshot = output.into_shared();
        self.stats.cycles += 1;
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The snapshot published by the most recent cycle.
    ///
    /// The returned handle is disconnected from the track table; consumers
    /// may hold it for as long as they like without blocking the engine.
    pub fn snapshot(&self) -> BatchRef {
        Arc::clone(&self.snapshot)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &FusedTrack> {
        self.tracks.iter()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }
}

/// The consumer thread: pops sensor messages and runs the periodic path on
/// the [`CYCLE_PERIOD`] cadence.
pub struct FusionWorker {
    engine: Arc<Mutex<FusionEngine>>,
    queue: Arc<MessageQueue>,
    running: Arc<AtomicBool>,
    period: Duration,
    metrics: Option<Arc<crate::metrics::PipelineMetrics>>,
}

impl FusionWorker {
    pub fn new(
        engine: Arc<Mutex<FusionEngine>>,
        queue: Arc<MessageQueue>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            engine,
            queue,
            running,
            period: CYCLE_PERIOD,
            metrics: None,
        }
    }

    /// Overrides the cycle cadence (tests drive the loop faster).
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period.max(Duration::from_millis(1));
        self
    }

    /// Attaches shared counters for consumption and cycle timing.
    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawns the consumer thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("fusion-worker".into())
            .spawn(move || self.run())
    }

    /// The consumer loop. Blocks until `running` clears or the queue
    /// closes; drains nothing on exit beyond the message it already holds.
    pub fn run(&self) {
        info!(period_ms = self.period.as_millis() as u64, "fusion worker started");
        let mut next_cycle = Instant::now() + self.period;

        while self.running.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= next_cycle {
                self.lock_engine().cycle(now_micros());
                if let Some(metrics) = &self.metrics {
                    metrics.record_cycle_latency(now.elapsed().as_micros() as f64);
                }
                next_cycle += self.period;
                if next_cycle < now {
                    // Fell behind by more than a full period; realign rather
                    // than burst-run catch-up cycles.
                    next_cycle = now + self.period;
                }
                continue;
            }

            match self.queue.pop(PopTimeout::After(next_cycle - now)) {
                Ok(msg) => {
                    self.lock_engine().ingest(&msg.batch);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_message();
                    }
                }
                Err(FusionError::QueueTimeout) => {} // cycle deadline reached
                Err(FusionError::QueueClosed) => break,
                Err(err) => warn!(%err, "unexpected queue error"),
            }
        }
        info!("fusion worker stopped");
    }

    fn lock_engine(&self) -> MutexGuard<'_, FusionEngine> {
        self.engine.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn detection(
        id: u32,
        sensor_id: i16,
        lon: f64,
        lat: f64,
        v: f64,
        heading: f64,
        t_us: i64,
    ) -> Detection {
        Detection {
            id,
            target_type: TargetType::Vehicle,
            position: GeoPosition::new(lat, lon, 0.0),
            velocity: v,
            heading,
            confidence: 0.9,
            timestamp_us: t_us,
            sensor_id,
        }
    }

    fn batch_of(detections: &[Detection]) -> DetectionBatch {
        detections.iter().copied().collect()
    }

    #[test]
    fn birth_assigns_increasing_global_ids() {
        let mut engine = FusionEngine::with_defaults();
        let batch = batch_of(&[
            detection(1, 1, 0.0, 0.0, 10.0, 0.0, 0),
            detection(2, 1, 100.0, 100.0, 10.0, 0.0, 0),
            detection(3, 1, 200.0, 200.0, 10.0, 0.0, 0),
        ]);
        engine.ingest(&batch);
        let ids: Vec<u32> = engine.tracks().map(|t| t.global_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn nearby_detection_associates_instead_of_birthing() {
        let mut engine = FusionEngine::with_defaults();
        engine.ingest(&batch_of(&[detection(1, 1, 10.0, 10.0, 10.0, 0.0, 0)]));
        engine.ingest(&batch_of(&[detection(9, 2, 10.5, 10.0, 10.0, 0.0, 100_000)]));
        assert_eq!(engine.track_count(), 1);
        let track = engine.tracks().next().unwrap();
        assert_eq!(track.sensor_mask, 0b110);
        assert_eq!(track.age, 0);
    }

    #[test]
    fn identical_detections_in_one_batch_share_a_track() {
        let mut engine = FusionEngine::with_defaults();
        let d = detection(1, 1, 10.0, 10.0, 10.0, 0.0, 0);
        engine.ingest(&batch_of(&[d, d]));
        assert_eq!(engine.track_count(), 1);
    }

    #[test]
    fn confidence_is_ewma_blended() {
        let mut engine = FusionEngine::with_defaults();
        engine.ingest(&batch_of(&[detection(1, 1, 0.0, 0.0, 0.0, 0.0, 0)]));
        let mut d = detection(2, 1, 0.0, 0.0, 0.0, 0.0, 100_000);
        d.confidence = 0.5;
        engine.ingest(&batch_of(&[d]));
        let track = engine.tracks().next().unwrap();
        assert_relative_eq!(track.confidence, (0.9 + 0.5) / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn distant_detection_births_second_track() {
        let mut engine = FusionEngine::with_defaults();
        engine.ingest(&batch_of(&[detection(1, 1, 0.0, 0.0, 10.0, 0.0, 0)]));
        engine.ingest(&batch_of(&[detection(2, 1, 50.0, 0.0, 10.0, 0.0, 0)]));
        assert_eq!(engine.track_count(), 2);
    }

    #[test]
    fn table_full_drops_new_detections_only() {
        let mut engine = FusionEngine::new(FusionConfig {
            track_capacity: 2,
            ..Default::default()
        });
        engine.ingest(&batch_of(&[
            detection(1, 1, 0.0, 0.0, 0.0, 0.0, 0),
            detection(2, 1, 100.0, 0.0, 0.0, 0.0, 0),
            detection(3, 1, 200.0, 0.0, 0.0, 0.0, 0),
        ]));
        assert_eq!(engine.track_count(), 2);
        assert_eq!(engine.stats().tracks_dropped_table_full, 1);
        // Existing tracks still update.
        engine.ingest(&batch_of(&[detection(4, 2, 0.0, 0.0, 0.0, 0.0, 100_000)]));
        assert_eq!(engine.tracks().next().unwrap().sensor_mask, 0b110);
    }

    #[test]
    fn cycle_outputs_snapshot_records() {
        let mut engine = FusionEngine::with_defaults();
        let t0 = 1_700_000_000_000_000;
        engine.ingest(&batch_of(&[detection(7, 1, 116.0, 40.0, 10.0, 0.0, t0)]));
        engine.cycle(t0);

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.len(), 1);
        let out = &snapshot.as_slice()[0];
        assert_eq!(out.id, 1);
        assert_eq!(out.sensor_id, FUSED_SENSOR_ID);
        assert_relative_eq!(out.position.longitude, 116.0, epsilon = 1e-9);
        assert_relative_eq!(out.position.latitude, 40.0, epsilon = 1e-9);
        assert_relative_eq!(out.velocity, 10.0, epsilon = 1e-9);
        assert_relative_eq!(out.heading, 0.0, epsilon = 1e-9);
        assert_eq!(out.timestamp_us, t0);
    }

    #[test]
    fn eviction_fires_when_age_exceeds_max() {
        let mut engine = FusionEngine::new(FusionConfig {
            max_track_age: 3,
            ..Default::default()
        });
        let t0 = 1_000_000;
        engine.ingest(&batch_of(&[detection(1, 1, 0.0, 0.0, 0.0, 0.0, t0)]));

        // Ages 1..=3 survive; age 4 exceeds max_track_age.
        for cycle in 1..=3 {
            engine.cycle(t0 + cycle * 50_000);
            assert_eq!(engine.track_count(), 1, "cycle {cycle}");
        }
        engine.cycle(t0 + 4 * 50_000);
        assert_eq!(engine.track_count(), 0);
    }

    #[test]
    fn low_confidence_track_is_evicted() {
        let mut engine = FusionEngine::with_defaults();
        let mut d = detection(1, 1, 0.0, 0.0, 0.0, 0.0, 0);
        d.confidence = 0.2; // below the 0.3 threshold
        engine.ingest(&batch_of(&[d]));
        assert_eq!(engine.track_count(), 1);
        engine.cycle(50_000);
        assert_eq!(engine.track_count(), 0);
    }

    #[test]
    fn eviction_reexamines_swapped_slot() {
        let mut engine = FusionEngine::new(FusionConfig {
            max_track_age: 1,
            ..Default::default()
        });
        // Three tracks, all destined to expire in the same cycle.
        engine.ingest(&batch_of(&[
            detection(1, 1, 0.0, 0.0, 0.0, 0.0, 0),
            detection(2, 1, 100.0, 0.0, 0.0, 0.0, 0),
            detection(3, 1, 200.0, 0.0, 0.0, 0.0, 0),
        ]));
        engine.cycle(50_000);
        engine.cycle(100_000);
        assert_eq!(engine.track_count(), 0);
    }

    #[test]
    fn snapshot_is_disconnected_from_later_cycles() {
        let mut engine = FusionEngine::with_defaults();
        engine.ingest(&batch_of(&[detection(1, 1, 0.0, 0.0, 0.0, 0.0, 0)]));
        engine.cycle(0);
        let first = engine.snapshot();
        assert_eq!(first.len(), 1);

        // Age the track out entirely.
        for c in 1..=60 {
            engine.cycle(c * 50_000);
        }
        assert_eq!(engine.snapshot().len(), 0);
        // The previously taken handle still sees the old contents.
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn apply_config_keeps_capacity() {
        let mut engine = FusionEngine::new(FusionConfig {
            track_capacity: 7,
            ..Default::default()
        });
        engine.apply_config(FusionConfig {
            association_threshold: 2.0,
            track_capacity: 9999,
            ..Default::default()
        });
        assert_eq!(engine.config().track_capacity, 7);
        assert_relative_eq!(engine.config().association_threshold, 2.0);
    }

    proptest! {
        /// Global ids are strictly increasing in birth order regardless of
        /// the detection stream.
        #[test]
        fn global_ids_strictly_increase(xs in proptest::collection::vec(-1000.0f64..1000.0, 1..40)) {
            let mut engine = FusionEngine::with_defaults();
            for (i, x) in xs.iter().enumerate() {
                engine.ingest(&batch_of(&[detection(i as u32, 1, *x, 0.0, 0.0, 0.0, i as i64)]));
            }
            let ids: Vec<u32> = engine.tracks().map(|t| t.global_id).collect();
            for w in ids.windows(2) {
                prop_assert!(w[0] < w[1]);
            }
            prop_assert!(engine.tracks().all(|t| t.sensor_mask != 0));
        }
    }
}
