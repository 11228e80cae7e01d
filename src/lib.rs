//! PiVision Backend Library
//!
//! Edge camera activity detection: periodic frames in, durable activity
//! events with evidence images out, decided purely from frame-to-frame
//! pixel deltas.
//!
//! ## Architecture (pipeline order)
//!
//! 1. IngestService - capture rows, staging files, job enqueue
//! 2. JobQueue - durable FIFO with atomic per-device claims
//! 3. AnalysisWorker - the claim/process/complete driving loop
//! 4. FrameCache - previous frame per device for motion diff
//! 5. DeltaMetrics - pure motion / inventory-change scores
//! 6. InteractionTracker - idle/interacting/cooldown state machine
//! 7. BaselineManager - blended stable-scene reference per device
//! 8. EventEmitter - events, evidence promotion, decision traces
//! 9. RetentionJob - scheduled storage reclamation
//! 10. MetricsService - read-only observability
//!
//! ## Design Principles
//!
//! - All cross-worker coordination goes through the database; claims are
//!   single conditional updates, never read-then-write
//! - Per-device state is an explicit keyed context, never a singleton
//! - Timing decisions use capture timestamps so replays are deterministic

pub mod analysis_worker;
pub mod baseline_manager;
pub mod config_store;
pub mod delta_metrics;
pub mod detector;
pub mod error;
pub mod event_emitter;
pub mod frame_cache;
pub mod ingest;
pub mod interaction_tracker;
pub mod job_queue;
pub mod metrics;
pub mod models;
pub mod retention;
pub mod state;

#[cfg(test)]
pub mod test_support;

pub use error::{Error, Result};
pub use state::AppState;
