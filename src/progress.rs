// src/progress.rs

//! Transfer progress reporting
//!
//! The `ProgressTracker` trait is the one interface the transfer code
//! reports through. Implementations:
//! - `BarProgress`: byte progress bars using indicatif
//! - `LogProgress`: percentage and rate logged to tracing
//! - `SilentProgress`: no-op for tests and list mode

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

/// Minimum time between two rate computations
const RATE_INTERVAL: Duration = Duration::from_secs(2);

/// Core trait for progress tracking
///
/// Implementations must be thread-safe so transfers running on task
/// queues can share them.
pub trait ProgressTracker: Send + Sync {
    /// Set the current status message
    fn set_message(&self, message: &str);

    /// Increment progress by the given amount of bytes
    fn increment(&self, amount: u64);

    /// Set the total length in bytes
    fn set_length(&self, length: u64);

    fn position(&self) -> u64;

    fn length(&self) -> u64;

    /// Finish progress successfully with a message
    fn finish_with_message(&self, message: &str);

    /// Finish progress with an error message
    fn finish_with_error(&self, message: &str);

    fn is_finished(&self) -> bool;
}

/// Creates one tracker per transfer
pub trait ProgressFactory: Send + Sync {
    fn start(&self, name: &str, length: u64) -> Box<dyn ProgressTracker>;
}

/// Silent progress tracker (no-op)
#[derive(Debug, Default)]
pub struct SilentProgress {
    position: AtomicU64,
    length: AtomicU64,
    finished: AtomicBool,
}

impl SilentProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_length(length: u64) -> Self {
        Self {
            length: AtomicU64::new(length),
            ..Default::default()
        }
    }
}

impl ProgressTracker for SilentProgress {
    fn set_message(&self, _message: &str) {}

    fn increment(&self, amount: u64) {
        self.position.fetch_add(amount, Ordering::Relaxed);
    }

    fn set_length(&self, length: u64) {
        self.length.store(length, Ordering::Relaxed);
    }

    fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    fn length(&self) -> u64 {
        self.length.load(Ordering::Relaxed)
    }

    fn finish_with_message(&self, _message: &str) {
        self.finished.store(true, Ordering::Relaxed);
    }

    fn finish_with_error(&self, _message: &str) {
        self.finished.store(true, Ordering::Relaxed);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct RateState {
    last_percent: u64,
    last_time: Instant,
    last_position: u64,
    kbit_per_sec: u64,
}

/// Logging progress tracker
///
/// Logs whenever the completed percentage changes. The transfer rate is
/// recomputed at most every two seconds.
#[derive(Debug)]
pub struct LogProgress {
    name: String,
    position: AtomicU64,
    length: AtomicU64,
    finished: AtomicBool,
    rate: Mutex<RateState>,
}

impl LogProgress {
    pub fn new(name: impl Into<String>, length: u64) -> Self {
        Self {
            name: name.into(),
            position: AtomicU64::new(0),
            length: AtomicU64::new(length),
            finished: AtomicBool::new(false),
            rate: Mutex::new(RateState {
                last_percent: 0,
                last_time: Instant::now(),
                last_position: 0,
                kbit_per_sec: 0,
            }),
        }
    }

    /// Current transfer rate in kbit/s
    pub fn kbit_per_sec(&self) -> u64 {
        self.rate.lock().map(|r| r.kbit_per_sec).unwrap_or(0)
    }
}

impl ProgressTracker for LogProgress {
    fn set_message(&self, message: &str) {
        info!("{}: {}", self.name, message);
    }

    fn increment(&self, amount: u64) {
        let position = self.position.fetch_add(amount, Ordering::Relaxed) + amount;
        let length = self.length.load(Ordering::Relaxed);
        if length == 0 {
            return;
        }
        let Ok(mut rate) = self.rate.lock() else {
            return;
        };

        let elapsed = rate.last_time.elapsed();
        if elapsed >= RATE_INTERVAL {
            let bytes = position.saturating_sub(rate.last_position);
            rate.kbit_per_sec = (bytes as f64 * 8.0 / 1000.0 / elapsed.as_secs_f64()) as u64;
            rate.last_time = Instant::now();
            rate.last_position = position;
        }

        let percent = position.saturating_mul(100) / length;
        if percent > rate.last_percent {
            rate.last_percent = percent;
            info!(
                "{}: {}% ({} kbit/s)",
                self.name, percent, rate.kbit_per_sec
            );
        }
    }

    fn set_length(&self, length: u64) {
        self.length.store(length, Ordering::Relaxed);
    }

    fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    fn length(&self) -> u64 {
        self.length.load(Ordering::Relaxed)
    }

    fn finish_with_message(&self, message: &str) {
        self.finished.store(true, Ordering::Relaxed);
        info!("{}: {}", self.name, message);
    }

    fn finish_with_error(&self, message: &str) {
        self.finished.store(true, Ordering::Relaxed);
        info!("{}: ERROR - {}", self.name, message);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

/// Progress bar tracker for interactive terminals
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(name: &str, length: u64) -> Self {
        let bar = ProgressBar::new(length);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg:30} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(name.to_string());
        Self { bar }
    }
}

impl ProgressTracker for BarProgress {
    fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    fn increment(&self, amount: u64) {
        self.bar.inc(amount);
    }

    fn set_length(&self, length: u64) {
        self.bar.set_length(length);
    }

    fn position(&self) -> u64 {
        self.bar.position()
    }

    fn length(&self) -> u64 {
        self.bar.length().unwrap_or(0)
    }

    fn finish_with_message(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    fn finish_with_error(&self, message: &str) {
        self.bar.abandon_with_message(format!("ERROR: {message}"));
    }

    fn is_finished(&self) -> bool {
        self.bar.is_finished()
    }
}

/// How transfers report progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressMode {
    /// Log percentage and rate (default for daemons and cron runs)
    #[default]
    Log,
    /// Draw progress bars
    Bar,
    Silent,
}

impl ProgressFactory for ProgressMode {
    fn start(&self, name: &str, length: u64) -> Box<dyn ProgressTracker> {
        match self {
            Self::Log => Box::new(LogProgress::new(name, length)),
            Self::Bar => Box::new(BarProgress::new(name, length)),
            Self::Silent => Box::new(SilentProgress::with_length(length)),
        }
    }
}
