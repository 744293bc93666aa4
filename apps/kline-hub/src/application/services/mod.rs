//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `IngestPipeline`: Validates exchange events and publishes accepted data
//! - `BackfillWorker`: Fetches missed bars over REST within the rate budget
//! - `Scheduler`: Pings, sweeps, expiry and metric snapshots

mod backfill;
mod pipeline;
mod scheduler;

pub use backfill::{BackfillConfig, BackfillHandle, BackfillWorker, backfill_channel};
pub use pipeline::IngestPipeline;
pub use scheduler::Scheduler;
