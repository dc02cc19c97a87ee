//! OBD-II Scheduler for Live-Data Polling
//!
//! Polls RPM, speed and coolant temperature at per-PID rates, with
//! adaptive rate boosting when the engine runs hot.

mod scheduler;

pub use scheduler::{PidScheduler, ScheduledPid, SchedulerConfig, SchedulerError};
