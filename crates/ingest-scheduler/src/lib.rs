//! Scheduler (§4.G): the single periodic tick loop that claims due
//! affiliate feeds, starts due adapter cycles, and keeps the caliber
//! snapshot repeatable job registered.

pub mod cron_util;
pub mod tick;

pub use cron_util::next_occurrence;
pub use tick::{compute_next_run, Scheduler, TickReport, SNAPSHOT_QUEUE, SNAPSHOT_REPEAT_KEY};
