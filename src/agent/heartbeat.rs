use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::status::OperationMode;
use crate::transport::controller::HeartbeatApi;

/// Source of "now" as epoch seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    }
}

/// Multiplier applied to the time left before the deadline.
pub trait Jitter: Send + Sync {
    fn multiplier(&self) -> f64;
}

#[derive(Debug, Clone, Copy)]
pub struct RandomJitter {
    low: f64,
    high: f64,
}

impl RandomJitter {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }
}

impl Jitter for RandomJitter {
    fn multiplier(&self) -> f64 {
        if self.high <= self.low {
            return self.low;
        }
        rand::thread_rng().gen_range(self.low..self.high)
    }
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    300.0
}

fn default_backoff_factor() -> f64 {
    2.7
}

fn default_jitter_min() -> f64 {
    0.3
}

fn default_jitter_max() -> f64 {
    0.6
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    /// Retry delay after the first failure, and the value it resets to.
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_jitter_min")]
    pub jitter_min: f64,
    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
        }
    }
}

/// Deadline bookkeeping for one scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    settings: HeartbeatSettings,
    next_deadline: f64,
    error_delay: f64,
}

impl Schedule {
    pub fn new(settings: HeartbeatSettings) -> Self {
        Self {
            settings,
            next_deadline: 0.0,
            error_delay: settings.initial_delay,
        }
    }

    pub fn next_deadline(&self) -> f64 {
        self.next_deadline
    }

    pub fn error_delay(&self) -> f64 {
        self.error_delay
    }

    pub fn succeeded(&mut self, deadline: f64) {
        self.next_deadline = deadline;
        self.error_delay = self.settings.initial_delay;
    }

    pub fn failed(&mut self, now: f64) {
        self.next_deadline = now + self.error_delay;
        self.error_delay = (self.error_delay * self.settings.backoff_factor).min(self.settings.max_delay);
    }

    /// Seconds to sleep before the next heartbeat, never negative.
    pub fn wait(&self, now: f64, multiplier: f64) -> f64 {
        let wait = (self.next_deadline - now) * multiplier;
        if wait.is_nan() {
            0.0
        } else {
            wait.max(0.0)
        }
    }
}

/// Announces liveness to the controller until stopped.
pub struct Heartbeater {
    api: Arc<dyn HeartbeatApi>,
    hardware: Value,
    mode: OperationMode,
    version: String,
    clock: Box<dyn Clock>,
    jitter: Box<dyn Jitter>,
    schedule: Schedule,
}

impl Heartbeater {
    pub fn new(
        api: Arc<dyn HeartbeatApi>,
        hardware: Value,
        mode: OperationMode,
        settings: HeartbeatSettings,
    ) -> Self {
        Self {
            api,
            hardware,
            mode,
            version: crate::VERSION.to_string(),
            clock: Box::new(SystemClock),
            jitter: Box::new(RandomJitter::new(settings.jitter_min, settings.jitter_max)),
            schedule: Schedule::new(settings),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_jitter(mut self, jitter: impl Jitter + 'static) -> Self {
        self.jitter = Box::new(jitter);
        self
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// One heartbeat. Returns how many seconds to wait before the next.
    pub async fn beat(&mut self) -> f64 {
        match self.api.heartbeat(&self.hardware, self.mode, &self.version).await {
            Ok(deadline) => {
                debug!(deadline, "heartbeat accepted");
                self.schedule.succeeded(deadline);
            }
            Err(e) => {
                let now = self.clock.now();
                warn!(error = %e, retry_in_secs = self.schedule.error_delay(), "error heartbeating to agent API");
                self.schedule.failed(now);
            }
        }
        self.schedule.wait(self.clock.now(), self.jitter.multiplier())
    }

    /// Heartbeat loop. The first heartbeat goes out immediately.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(mode = %self.mode, "heartbeat loop starting");
        let mut wait = 0.0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX)) => {}
            }
            wait = self.beat().await;
            debug!(wait_secs = wait, "next heartbeat scheduled");
        }
        info!("heartbeat loop stopped");
    }
}
