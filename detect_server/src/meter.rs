//! Throughput of the detection pipelines.
//!
//! Producers count frames passing the model, responses count frames handed to clients. A
//! background task logs both rates while there is traffic.
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

/// Interval of the rate log line.
const REPORT_EVERY: Duration = Duration::from_secs(2);

pub static METER: Meter = Meter::new();

#[derive(Default)]
pub struct Meter {
    inferred: AtomicU64,
    streamed: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            inferred: AtomicU64::new(0),
            streamed: AtomicU64::new(0),
        }
    }

    pub fn tick_inferred(&self) {
        self.inferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_streamed(&self) {
        self.streamed.fetch_add(1, Ordering::Relaxed);
    }

    /// Frame counts since the last call, as (inferred, streamed).
    pub fn take_counts(&self) -> (u64, u64) {
        (
            self.inferred.swap(0, Ordering::Relaxed),
            self.streamed.swap(0, Ordering::Relaxed),
        )
    }
}

fn per_second(frames: u64, elapsed: Duration) -> f32 {
    frames as f32 / elapsed.as_secs_f32().max(f32::EPSILON)
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut ticker = interval(REPORT_EVERY);
        ticker.tick().await;
        let mut last = Instant::now();

        loop {
            ticker.tick().await;
            let (inferred, streamed) = METER.take_counts();
            let elapsed = last.elapsed();
            last = Instant::now();

            if inferred > 0 || streamed > 0 {
                log::info!(
                    "Frames per second: {:.2} inferred, {:.2} streamed",
                    per_second(inferred, elapsed),
                    per_second(streamed, elapsed)
                );
            }
        }
    })
}
