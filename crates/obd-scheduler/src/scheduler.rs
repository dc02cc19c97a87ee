//! PID Scheduler Implementation

use obd_protocol::{ObdClient, ObdError, Pid, SensorFrame};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Errors that stop the scheduler
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The adapter session is gone
    #[error("Adapter connection lost: {0}")]
    ConnectionLost(#[from] ObdError),

    #[error("Invalid scheduler config: {0}")]
    InvalidConfig(String),
}

/// Configuration for the PID scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// RPM and speed sampling rate in Hz (default: 5.0)
    pub base_rate_hz: f64,
    /// Coolant temperature sampling rate in Hz (default: 1.0)
    pub coolant_rate_hz: f64,
    /// Consecutive failures before a PID is reported unhealthy
    pub max_retries: u8,
    /// Coolant temperature threshold for rate boost (°C)
    pub coolant_boost_threshold: f64,
    /// Boosted rate multiplier
    pub boost_multiplier: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_rate_hz: 5.0,
            coolant_rate_hz: 1.0,
            max_retries: 3,
            coolant_boost_threshold: 95.0,
            boost_multiplier: 2.0,
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<(), SchedulerError> {
        let rates = [
            ("base_rate_hz", self.base_rate_hz),
            ("coolant_rate_hz", self.coolant_rate_hz),
            ("boost_multiplier", self.boost_multiplier),
        ];
        for (name, value) in rates {
            if !(value.is_finite() && value > 0.0) {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// A scheduled PID with priority and timing info
#[derive(Debug, Clone)]
pub struct ScheduledPid {
    /// The PID to query
    pub pid: Pid,
    /// Current sampling rate in Hz
    pub rate_hz: f64,
    /// Next scheduled query time
    pub next_query: Instant,
    /// Priority (higher = more important)
    pub priority: u8,
    /// Consecutive failure count
    pub failures: u8,
}

impl ScheduledPid {
    /// Create a new scheduled PID
    pub fn new(pid: Pid, rate_hz: f64) -> Self {
        Self {
            pid,
            rate_hz,
            next_query: Instant::now(),
            priority: sampling_priority(pid),
            failures: 0,
        }
    }

    /// Calculate interval between queries
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }

    /// Schedule next query, stretched by the failure count
    pub fn schedule_next(&mut self) {
        self.next_query = Instant::now() + self.interval() * (u32::from(self.failures) + 1);
    }
}

fn sampling_priority(pid: Pid) -> u8 {
    match pid {
        Pid::Rpm | Pid::Speed => 10,
        Pid::CoolantTemp => 5,
    }
}

impl Eq for ScheduledPid {}

impl PartialEq for ScheduledPid {
    fn eq(&self, other: &Self) -> bool {
        self.next_query == other.next_query && self.priority == other.priority
    }
}

impl Ord for ScheduledPid {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior (earliest time first)
        // Then by priority (higher priority first)
        other
            .next_query
            .cmp(&self.next_query)
            .then_with(|| self.priority.cmp(&other.priority))
    }
}

impl PartialOrd for ScheduledPid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Polls live-data PIDs through an [`ObdClient`]
pub struct PidScheduler {
    /// Scheduled PIDs in priority queue
    queue: BinaryHeap<ScheduledPid>,
    /// Configuration
    config: SchedulerConfig,
    /// Last known coolant temperature
    last_coolant_temp: Option<f64>,
}

impl PidScheduler {
    /// Create a scheduler for RPM, speed and coolant temperature
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;

        let mut queue = BinaryHeap::new();
        queue.push(ScheduledPid::new(Pid::Rpm, config.base_rate_hz));
        queue.push(ScheduledPid::new(Pid::Speed, config.base_rate_hz));
        queue.push(ScheduledPid::new(Pid::CoolantTemp, config.coolant_rate_hz));

        info!("PID scheduler created with {} PIDs", queue.len());

        Ok(Self {
            queue,
            config,
            last_coolant_temp: None,
        })
    }

    /// Poll until the frame receiver is dropped or the connection is lost
    pub async fn run(
        &mut self,
        client: &ObdClient,
        frame_tx: mpsc::Sender<SensorFrame>,
    ) -> Result<(), SchedulerError> {
        info!("Starting PID scheduler");
        let mut current_frame = SensorFrame::default();

        while !frame_tx.is_closed() {
            let Some(mut scheduled) = self.queue.pop() else {
                break;
            };
            tokio::time::sleep_until(scheduled.next_query).await;

            match client.query_pid(scheduled.pid).await {
                Ok(Some(response)) => {
                    scheduled.failures = 0;
                    current_frame.update_from_response(&response);

                    if scheduled.pid == Pid::CoolantTemp {
                        self.adjust_coolant_rate(&mut scheduled, response.value);
                    }

                    match frame_tx.try_send(current_frame.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => debug!("Frame channel full, dropping frame"),
                        Err(TrySendError::Closed(_)) => debug!("Frame receiver dropped"),
                    }
                }
                Ok(None) => debug!("PID {:02X} returned no data", scheduled.pid.as_hex()),
                Err(ObdError::ProtocolBusy) => {
                    debug!("Adapter busy, skipping PID {:02X}", scheduled.pid.as_hex());
                }
                Err(e @ (ObdError::NoConnection | ObdError::Cancelled)) => {
                    warn!("PID scheduler stopping: {}", e);
                    return Err(e.into());
                }
                Err(e) if e.is_fatal() => {
                    warn!("PID scheduler stopping: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    scheduled.failures = scheduled.failures.saturating_add(1);
                    warn!(
                        "PID {:02X} query failed (attempt {}): {}",
                        scheduled.pid.as_hex(),
                        scheduled.failures,
                        e
                    );
                    if scheduled.failures >= self.config.max_retries {
                        warn!("Max retries reached for PID {:02X}", scheduled.pid.as_hex());
                    }
                }
            }

            scheduled.schedule_next();
            self.queue.push(scheduled);
        }

        info!("PID scheduler stopped");
        Ok(())
    }

    fn adjust_coolant_rate(&mut self, scheduled: &mut ScheduledPid, temp: f64) {
        self.last_coolant_temp = Some(temp);
        let boosted = self.config.coolant_rate_hz * self.config.boost_multiplier;

        if temp > self.config.coolant_boost_threshold {
            if scheduled.rate_hz != boosted {
                warn!("Coolant temp {} > threshold, boosting rate", temp);
                scheduled.rate_hz = boosted;
            }
        } else if scheduled.rate_hz != self.config.coolant_rate_hz {
            info!("Coolant temp {} back under threshold", temp);
            scheduled.rate_hz = self.config.coolant_rate_hz;
        }
    }

    /// Last coolant temperature seen by the scheduler
    pub fn last_coolant_temp(&self) -> Option<f64> {
        self.last_coolant_temp
    }

    /// Current polling rate of a PID
    pub fn rate_of(&self, pid: Pid) -> Option<f64> {
        self.queue.iter().find(|s| s.pid == pid).map(|s| s.rate_hz)
    }

    /// Get the number of scheduled PIDs
    pub fn pid_count(&self) -> usize {
        self.queue.len()
    }
}
