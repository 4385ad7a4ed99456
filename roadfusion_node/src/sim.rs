//! Simulation-mode sensor producers.
//!
//! A seeded scripted scene of constant-velocity objects replaces the RTSP
//! and serial adapters: one producer thread impersonates the camera, one
//! the radar. Both sample the same ground truth with per-sensor noise and
//! push batches through the real message queue, so the whole fusion path
//! runs exactly as it would against hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use tracing::{debug, info};

use roadfusion_core::{
    now_micros, Detection, DetectionBatch, GeoPosition, MessageQueue, SensorMessage, TargetType,
};

/// One scripted object moving at constant velocity in the planar frame.
#[derive(Debug, Clone, Copy)]
struct SimObject {
    start_x: f64,
    start_y: f64,
    velocity: f64,
    heading_deg: f64,
    target_type: TargetType,
}

impl SimObject {
    fn position_at(&self, t_secs: f64) -> (f64, f64) {
        let heading = self.heading_deg.to_radians();
        (
            self.start_x + self.velocity * heading.cos() * t_secs,
            self.start_y + self.velocity * heading.sin() * t_secs,
        )
    }
}

/// Deterministic scene shared by both simulated sensors.
#[derive(Debug, Clone)]
pub struct SimScenario {
    objects: Vec<SimObject>,
}

impl SimScenario {
    /// Builds a scene of `count` objects crossing the intersection.
    pub fn generate(seed: u64, count: usize) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let objects = (0..count)
            .map(|i| SimObject {
                start_x: rng.gen_range(-80.0..80.0),
                start_y: rng.gen_range(-80.0..80.0),
                velocity: rng.gen_range(3.0..22.0),
                heading_deg: rng.gen_range(-180.0..180.0),
                target_type: if i % 4 == 3 {
                    TargetType::Pedestrian
                } else {
                    TargetType::Vehicle
                },
            })
            .collect();
        Self { objects }
    }

    /// Samples every object as seen by `sensor_id` at scene time `t_secs`.
    fn sample(
        &self,
        sensor_id: i16,
        id_base: u32,
        t_secs: f64,
        noise: &Normal<f64>,
        confidence: f64,
        rng: &mut ChaCha8Rng,
    ) -> DetectionBatch {
        let timestamp_us = now_micros();
        let mut batch = DetectionBatch::with_capacity(self.objects.len());
        for (i, obj) in self.objects.iter().enumerate() {
            let (x, y) = obj.position_at(t_secs);
            batch.push(Detection {
                id: id_base + i as u32,
                target_type: obj.target_type,
                position: GeoPosition::new(
                    y + noise.sample(rng),
                    x + noise.sample(rng),
                    0.0,
                ),
                velocity: (obj.velocity + noise.sample(rng) * 0.2).max(0.0),
                heading: obj.heading_deg,
                confidence,
                timestamp_us,
                sensor_id,
            });
        }
        batch
    }
}

struct ProducerSpec {
    name: &'static str,
    sensor_id: i16,
    id_base: u32,
    period: Duration,
    noise_std: f64,
    confidence: f64,
}

/// Spawns the camera and radar producer threads.
pub fn spawn_producers(
    queue: Arc<MessageQueue>,
    running: Arc<AtomicBool>,
    seed: u64,
    camera_id: i16,
    radar_id: i16,
) -> Vec<JoinHandle<()>> {
    let scenario = SimScenario::generate(seed, 6);
    info!(seed, objects = scenario.objects.len(), "simulation scene ready");

    let specs = [
        ProducerSpec {
            name: "sim-video",
            sensor_id: camera_id,
            id_base: 100,
            period: Duration::from_millis(100),
            noise_std: 0.8,
            confidence: 0.85,
        },
        ProducerSpec {
            name: "sim-radar",
            sensor_id: radar_id,
            id_base: 2000,
            period: Duration::from_millis(50),
            noise_std: 0.3,
            confidence: 0.8,
        },
    ];

    specs
        .into_iter()
        .map(|spec| {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            let scenario = scenario.clone();
            std::thread::Builder::new()
                .name(spec.name.into())
                .spawn(move || run_producer(spec, scenario, queue, running, seed))
                .expect("spawn producer thread")
        })
        .collect()
}

fn run_producer(
    spec: ProducerSpec,
    scenario: SimScenario,
    queue: Arc<MessageQueue>,
    running: Arc<AtomicBool>,
    seed: u64,
) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ spec.sensor_id as u64);
    let noise = Normal::new(0.0, spec.noise_std).expect("valid noise std");
    let start = Instant::now();
    let mut produced = 0u64;

    info!(sensor_id = spec.sensor_id, period_ms = spec.period.as_millis() as u64,
        "{} producer started", spec.name);

    while running.load(Ordering::Relaxed) {
        let t = start.elapsed().as_secs_f64();
        let batch = scenario.sample(
            spec.sensor_id,
            spec.id_base,
            t,
            &noise,
            spec.confidence,
            &mut rng,
        );
        let msg = SensorMessage {
            sensor_id: spec.sensor_id,
            batch: batch.into_shared(),
            timestamp_us: now_micros(),
        };
        // A full queue just drops the batch; the next sample supersedes it.
        if queue.push(msg).is_ok() {
            produced += 1;
        }
        std::thread::sleep(spec.period);
    }

    debug!(sensor_id = spec.sensor_id, produced, "{} producer stopped", spec.name);
}
