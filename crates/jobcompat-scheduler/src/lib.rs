//! `jobcompat-scheduler`: deferred-job dispatch over a ladder of platform
//! scheduling backends, with SQLite persistence.
//!
//! # Overview
//!
//! A [`JobRequest`] is written to the [`store::JobStore`] and registered
//! with the best backend the platform offers. The [`engine::DispatchEngine`]
//! keeps the two in step: it re-registers lost jobs after a restart, cancels
//! registrations nobody owns, and routes wakes back to the application's
//! [`manager::JobHandler`]s.
//!
//! Backends that cannot carry in-memory payloads get a direct launch from
//! the [`bridge::TransientBridge`] instead.
//!
//! # Backends
//!
//! | Backend            | Since | Periodic flex | Transient extras | Exact |
//! |--------------------|-------|---------------|------------------|-------|
//! | `job_scheduler_26` | 26    | yes           | native           | no    |
//! | `job_scheduler_24` | 24    | yes           | bridge           | no    |
//! | `job_scheduler_21` | 21    | no            | bridge           | no    |
//! | `exact_alarm_19`   | 19    | no            | bridge           | yes   |
//! | `alarm_14`         | 14    | no            | bridge           | no    |

pub mod adapter;
pub mod backend;
pub mod bridge;
pub mod db;
pub mod engine;
pub mod error;
pub mod manager;
pub mod platform;
pub mod prober;
pub mod schedule;
pub mod selector;
pub mod store;
pub mod types;

pub use backend::BackendDescriptor;
pub use engine::{BootReport, DispatchEngine, EngineOptions, FireOutcome, WakeDecision};
pub use error::{Result, SchedulerError};
pub use manager::{JobHandler, JobManager, JobOutcome, JobRegistry};
pub use platform::{SimulatedPlatform, Wake, WakeSource};
pub use types::{ExecutionConstraint, JobParams, JobRequest, JobRequestBuilder};
