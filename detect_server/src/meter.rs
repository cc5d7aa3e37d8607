//! Frame rate bookkeeping.
//!
//! [`METER`] counts frames over all streams and is logged periodically by
//! [`spawn_meter_logger`]. [`FrameTimer`] tracks the frame rate of a single
//! stream.
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

/// Frame counters shared by all streams.
#[derive(Default)]
pub struct Meter {
    captured_frames: AtomicU64,
    streamed_frames: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            captured_frames: AtomicU64::new(0),
            streamed_frames: AtomicU64::new(0),
        }
    }

    pub fn tick_captured(&self) {
        self.captured_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_streamed(&self) {
        self.streamed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_reset_captured(&self) -> u64 {
        self.captured_frames.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_streamed(&self) -> u64 {
        self.streamed_frames.swap(0, Ordering::Relaxed)
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let captured_frames = METER.get_reset_captured();
            let streamed_frames = METER.get_reset_streamed();
            let elapsed = start.elapsed().as_secs_f32();

            if captured_frames > 0 {
                log::info!(
                    "Captured frames per second: {:.2}",
                    captured_frames as f32 / elapsed
                );
            }
            if streamed_frames > 0 {
                log::info!(
                    "Streamed frames per second: {:.2}",
                    streamed_frames as f32 / elapsed
                );
            }
        }
    })
}

/// Average over the last `size` values.
#[derive(Debug)]
pub struct RunningAverage {
    values: Vec<i64>,
    index: usize,
    count: usize,
    sum: i64,
}

impl RunningAverage {
    /// A window of `size` values. A size of zero is treated as one.
    pub fn new(size: usize) -> Self {
        Self {
            values: vec![0; size.max(1)],
            index: 0,
            count: 0,
            sum: 0,
        }
    }

    /// Add `value` to the window and return the average of the window.
    pub fn run(&mut self, value: i64) -> i64 {
        self.sum -= self.values[self.index];
        self.values[self.index] = value;
        self.sum += value;
        self.index = (self.index + 1) % self.values.len();
        if self.count < self.values.len() {
            self.count += 1;
        }

        self.sum / self.count as i64
    }
}

/// Time between consecutive frames of one stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameStats {
    pub frame_time: Duration,
    pub average_frame_time: Duration,
}

impl FrameStats {
    pub fn fps(&self) -> f32 {
        fps(self.frame_time)
    }

    pub fn average_fps(&self) -> f32 {
        fps(self.average_frame_time)
    }
}

fn fps(frame_time: Duration) -> f32 {
    match frame_time.as_secs_f32() {
        secs if secs > 0.0 => 1.0 / secs,
        _ => 0.0,
    }
}

/// Measures the time between frames of a stream.
pub struct FrameTimer {
    last_frame: Instant,
    average: RunningAverage,
}

impl FrameTimer {
    pub fn new(average_window: usize) -> Self {
        Self {
            last_frame: Instant::now(),
            average: RunningAverage::new(average_window),
        }
    }

    /// Mark a frame as done.
    pub fn tick(&mut self) -> FrameStats {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> FrameStats {
        let frame_time = now.saturating_duration_since(self.last_frame);
        self.last_frame = now;
        let average_us = self.average.run(frame_time.as_micros() as i64);

        FrameStats {
            frame_time,
            average_frame_time: Duration::from_micros(average_us.max(0) as u64),
        }
    }
}
