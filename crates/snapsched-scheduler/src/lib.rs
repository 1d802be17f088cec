//! `snapsched-scheduler`: clock-aligned snapshot scheduling with SQLite persistence.
//!
//! # Overview
//!
//! Schedules are persisted to SQLite (see [`db`]). The [`engine::SchedulerEngine`]
//! wakes on a fixed, wall-clock aligned tick, creates a snapshot for every
//! active schedule whose next fire instant has arrived, prunes snapshots that
//! no retention rule protects, and deactivates schedules whose target keeps
//! failing for longer than the configured window.
//!
//! # Cadence specs
//!
//! | Spec | Period                         |
//! |------|--------------------------------|
//! | `Nm` | N minutes (opt-in)             |
//! | `Nh` | N hours                        |
//! | `Nd` | N days                         |
//! | `Nw` | N weeks                        |
//! | `NM` | N × 30 days                    |
//! | `Ny` | N × 365 days                   |
//!
//! # Retention specs
//!
//! `Nn` keeps the N newest scheduled snapshots; `Nx` (x being any cadence
//! unit) keeps the newest snapshot of each of the N most recent x-buckets.
//! A snapshot survives if any rule keeps it.

pub mod accessor;
pub mod cadence;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod failure;
pub mod handle;
pub mod retention;
pub mod store;
pub mod types;

pub use accessor::{LocalSnapDir, PathAccessor};
pub use cadence::Cadence;
pub use engine::{SchedulerEngine, TickReport};
pub use error::{AccessError, Result, SchedulerError};
pub use events::{EventBus, SchedulerEvent};
pub use failure::{FailureTracker, Health};
pub use handle::SnapScheduleHandle;
pub use retention::{RetentionPolicy, RetentionSpec};
pub use store::ScheduleStore;
pub use types::{ResolvedTarget, ScheduleListing, ScheduleRecord, ScheduleState, ScheduleStatus, Target};
