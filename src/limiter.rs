//! Request throttling for respectful scraping.
//!
//! The limiter is an owned value injected into the session controller, never
//! ambient state. All timing goes through the [`Clock`] trait so tests can
//! drive a deterministic clock instead of sleeping for real.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Timelike;
use rand::Rng;
use tracing::debug;

use crate::config::ScrapeConfig;

/// Multiplier applied to the jittered delay inside the peak-hour window.
/// Peak traffic must be materially lower than off-peak, not exactly zero.
const PEAK_BACKOFF_FACTOR: f64 = 6.0;

/// Time source for the limiter: monotonic now, local wall-clock hour, and
/// the actual suspension primitive.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn local_hour(&self) -> u32;
    async fn sleep(&self, duration: Duration);
}

/// The real clock: `Instant`, local time via chrono, tokio sleeps.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn local_hour(&self) -> u32 {
        chrono::Local::now().hour()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Throttles a single ordered stream of page requests.
///
/// Never rejects, only delays: every call records an action, even when no
/// wait was required.
pub struct RateLimiter {
    min_delay: f64,
    max_delay: f64,
    max_per_minute: usize,
    avoid_peak_hours: bool,
    peak_start_hour: u32,
    peak_end_hour: u32,
    clock: Arc<dyn Clock>,
    window: VecDeque<Instant>,
    last_action: Option<Instant>,
}

impl RateLimiter {
    pub fn new(config: &ScrapeConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &ScrapeConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            min_delay: config.min_delay,
            max_delay: config.max_delay,
            max_per_minute: config.max_requests_per_minute as usize,
            avoid_peak_hours: config.avoid_peak_hours,
            peak_start_hour: config.peak_start_hour,
            peak_end_hour: config.peak_end_hour,
            clock,
            window: VecDeque::new(),
            last_action: None,
        }
    }

    /// Suspend the caller until the next network action is allowed.
    ///
    /// Applies, in order: the rolling per-minute ceiling, then a jittered
    /// inter-request delay (multiplied inside peak hours) minus the time
    /// already elapsed since the previous action.
    pub async fn wait_if_needed(&mut self) {
        self.prune(self.clock.now());

        while self.max_per_minute > 0 && self.window.len() >= self.max_per_minute {
            let Some(&oldest) = self.window.front() else {
                break;
            };
            let elapsed = self.clock.now().duration_since(oldest);
            if elapsed >= Duration::from_secs(60) {
                self.prune(self.clock.now());
                continue;
            }
            let wait = Duration::from_secs(60) - elapsed;
            debug!(wait_secs = wait.as_secs_f64(), "per-minute ceiling reached");
            self.clock.sleep(wait).await;
            self.prune(self.clock.now());
        }

        let mut delay = self.jittered_delay();
        if self.in_peak_hours() {
            delay *= PEAK_BACKOFF_FACTOR;
            debug!(
                delay_secs = delay,
                "inside peak hours, delay backed off"
            );
        }

        if let Some(last) = self.last_action {
            let since_last = self.clock.now().duration_since(last).as_secs_f64();
            if since_last < delay {
                let wait = Duration::from_secs_f64(delay - since_last);
                debug!(wait_secs = wait.as_secs_f64(), "respectful delay");
                self.clock.sleep(wait).await;
            }
        }

        let stamp = self.clock.now();
        self.window.push_back(stamp);
        self.last_action = Some(stamp);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.window.front() {
            if now.duration_since(*front) >= Duration::from_secs(60) {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn jittered_delay(&self) -> f64 {
        if self.max_delay > self.min_delay {
            rand::thread_rng().gen_range(self.min_delay..=self.max_delay)
        } else {
            self.min_delay
        }
    }

    fn in_peak_hours(&self) -> bool {
        if !self.avoid_peak_hours {
            return false;
        }
        let hour = self.clock.local_hour();
        hour >= self.peak_start_hour && hour < self.peak_end_hour
    }
}
