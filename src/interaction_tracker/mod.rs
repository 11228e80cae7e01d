//! InteractionTracker - Per-Device Interaction State Machine
//!
//! ## Responsibilities
//!
//! - Turn noisy per-frame motion scores into discrete interaction
//!   boundaries: `idle -> interacting -> cooldown -> idle`
//! - Track pre/during/post evidence candidates while an interaction runs
//! - Report which held captures are released so the worker can discard them
//! - Flag stuck-high devices as obstructed past a sanity ceiling
//!
//! All timing decisions use capture receive timestamps, never wall clock,
//! so replaying the same frames yields the same events. A device's frames
//! must be processed in sequence order; the queue's per-device claim
//! serialization guarantees that.

use crate::models::DeviceConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// One frame's input to the state machine
#[derive(Debug, Clone)]
pub struct FrameObservation {
    pub capture_id: i64,
    pub received_ts: DateTime<Utc>,
    /// Motion score vs the previous frame; `None` on cold start
    pub motion_score: Option<f32>,
}

/// Phase of a device, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Idle,
    Interacting,
    Cooldown,
}

/// Internal phase with per-phase data
#[derive(Debug, Clone)]
enum Phase {
    Idle {
        /// Consecutive above-threshold frames of the pending run
        above_count: u32,
        /// First above-threshold frame of the pending run
        run_first: Option<(i64, DateTime<Utc>)>,
        /// Captures of the pending run, held as evidence candidates
        run_captures: Vec<(i64, f32)>,
    },
    Interacting {
        started_at: DateTime<Utc>,
        pre_capture: Option<i64>,
        peak_score: f32,
        peak_capture: i64,
        /// Timestamp of the last above-threshold frame (end-timer anchor)
        last_above_ts: DateTime<Utc>,
        /// First below-threshold frame of the current dip
        post_candidate: Option<i64>,
        /// All captures held since the interaction began
        held: Vec<i64>,
    },
    Cooldown {
        until: DateTime<Utc>,
    },
}

/// Per-device machine state
#[derive(Debug, Clone)]
pub struct InteractionState {
    phase: Phase,
    /// Consecutive calm frames (for baseline stability gating)
    stable_count: u32,
    /// Most recent calm frame, the `pre` candidate; held while set
    last_stable_capture: Option<i64>,
}

impl Default for InteractionState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle {
                above_count: 0,
                run_first: None,
                run_captures: Vec::new(),
            },
            stable_count: 0,
            last_stable_capture: None,
        }
    }
}

impl InteractionState {
    pub fn phase_kind(&self) -> PhaseKind {
        match self.phase {
            Phase::Idle { .. } => PhaseKind::Idle,
            Phase::Interacting { .. } => PhaseKind::Interacting,
            Phase::Cooldown { .. } => PhaseKind::Cooldown,
        }
    }
}

/// A completed interaction, ready for the event emitter
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedInteraction {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub pre_capture: Option<i64>,
    pub during_capture: Option<i64>,
    pub post_capture: Option<i64>,
    pub peak_score: f32,
}

/// An interaction that exceeded the sanity ceiling (stuck obstruction)
#[derive(Debug, Clone, PartialEq)]
pub struct ObstructionReport {
    pub started_at: DateTime<Utc>,
    pub observed_until: DateTime<Utc>,
    pub during_capture: Option<i64>,
    pub peak_score: f32,
}

/// What a single frame produced
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    None,
    Completed(CompletedInteraction),
    Obstructed(ObstructionReport),
}

/// Result of stepping the machine by one frame
#[derive(Debug, Clone)]
pub struct StepResult {
    pub outcome: StepOutcome,
    /// Captures no longer needed as evidence candidates
    pub released: Vec<i64>,
    /// Whether this frame may feed the baseline
    pub is_stable: bool,
    /// Whether this frame is being held as an evidence candidate
    pub held: bool,
}

/// Advance the machine by one frame. Pure: same state + config + frame in,
/// same state + result out.
pub fn step(
    mut state: InteractionState,
    cfg: &DeviceConfig,
    obs: &FrameObservation,
) -> (InteractionState, StepResult) {
    let mut released = Vec::new();

    // leaving cooldown re-dispatches the frame into idle handling
    if let Phase::Cooldown { until } = state.phase {
        if obs.received_ts >= until {
            state.phase = Phase::Idle {
                above_count: 0,
                run_first: None,
                run_captures: Vec::new(),
            };
        }
    }

    let above = obs
        .motion_score
        .map(|s| s >= cfg.interaction_threshold)
        .unwrap_or(false);

    match state.phase {
        Phase::Idle {
            mut above_count,
            mut run_first,
            mut run_captures,
        } => {
            if above {
                let score = obs.motion_score.unwrap_or(0.0);
                above_count += 1;
                if run_first.is_none() {
                    run_first = Some((obs.capture_id, obs.received_ts));
                }
                run_captures.push((obs.capture_id, score));
                state.stable_count = 0;

                if above_count >= cfg.interaction_min_frames {
                    let (_, started_at) = run_first.expect("run_first set on first above frame");
                    let (peak_capture, peak_score) = run_captures
                        .iter()
                        .copied()
                        .max_by(|a, b| a.1.total_cmp(&b.1))
                        .expect("run_captures non-empty");
                    let held: Vec<i64> = run_captures.iter().map(|(id, _)| *id).collect();
                    state.phase = Phase::Interacting {
                        started_at,
                        pre_capture: state.last_stable_capture,
                        peak_score,
                        peak_capture,
                        last_above_ts: obs.received_ts,
                        post_candidate: None,
                        held,
                    };
                } else {
                    state.phase = Phase::Idle {
                        above_count,
                        run_first,
                        run_captures,
                    };
                }
                let result = StepResult {
                    outcome: StepOutcome::None,
                    released,
                    is_stable: false,
                    held: true,
                };
                (state, result)
            } else {
                // run broke before reaching min_frames: the spike was noise
                released.extend(run_captures.iter().map(|(id, _)| *id));
                if let Some(prev_stable) = state.last_stable_capture {
                    released.push(prev_stable);
                }
                state.last_stable_capture = Some(obs.capture_id);
                if obs.motion_score.is_some() {
                    state.stable_count += 1;
                } else {
                    state.stable_count = 0;
                }
                let is_stable = obs.motion_score.is_some()
                    && state.stable_count >= cfg.stability_frames_required;
                state.phase = Phase::Idle {
                    above_count: 0,
                    run_first: None,
                    run_captures: Vec::new(),
                };
                let result = StepResult {
                    outcome: StepOutcome::None,
                    released,
                    is_stable,
                    held: true, // held as the pre candidate until the next stable frame
                };
                (state, result)
            }
        }

        Phase::Interacting {
            started_at,
            pre_capture,
            mut peak_score,
            mut peak_capture,
            mut last_above_ts,
            mut post_candidate,
            mut held,
        } => {
            state.stable_count = 0;

            let duration = obs.received_ts.signed_duration_since(started_at);
            if duration > Duration::seconds(cfg.max_interaction_s as i64) {
                // stuck high: report obstruction instead of an interaction
                released.extend(
                    held.iter()
                        .filter(|&&id| Some(id) != pre_capture && id != peak_capture),
                );
                released.push(obs.capture_id);
                state.phase = Phase::Cooldown {
                    until: obs.received_ts + Duration::seconds(cfg.burst_cooldown_s as i64),
                };
                let result = StepResult {
                    outcome: StepOutcome::Obstructed(ObstructionReport {
                        started_at,
                        observed_until: obs.received_ts,
                        during_capture: Some(peak_capture),
                        peak_score,
                    }),
                    released,
                    is_stable: false,
                    held: false,
                };
                return (state, result);
            }

            held.push(obs.capture_id);

            if above {
                let score = obs.motion_score.unwrap_or(0.0);
                if score > peak_score {
                    peak_score = score;
                    peak_capture = obs.capture_id;
                }
                last_above_ts = obs.received_ts;
                // a re-spike cancels the end-timer; brief dips do not
                // fragment one interaction
                post_candidate = None;
                state.phase = Phase::Interacting {
                    started_at,
                    pre_capture,
                    peak_score,
                    peak_capture,
                    last_above_ts,
                    post_candidate,
                    held,
                };
                let result = StepResult {
                    outcome: StepOutcome::None,
                    released,
                    is_stable: false,
                    held: true,
                };
                (state, result)
            } else {
                if post_candidate.is_none() {
                    post_candidate = Some(obs.capture_id);
                }
                let below_for = obs.received_ts.signed_duration_since(last_above_ts);
                let timeout = Duration::milliseconds((cfg.interaction_end_timeout_s * 1000.0) as i64);
                if below_for >= timeout {
                    let post = post_candidate;
                    let evidence = [pre_capture, Some(peak_capture), post];
                    released.extend(
                        held.iter()
                            .chain(std::iter::once(&obs.capture_id))
                            .filter(|&&id| !evidence.contains(&Some(id))),
                    );
                    released.dedup();
                    state.last_stable_capture = None;
                    state.phase = Phase::Cooldown {
                        until: obs.received_ts + Duration::seconds(cfg.burst_cooldown_s as i64),
                    };
                    let result = StepResult {
                        outcome: StepOutcome::Completed(CompletedInteraction {
                            started_at,
                            ended_at: obs.received_ts,
                            pre_capture,
                            during_capture: Some(peak_capture),
                            post_capture: post,
                            peak_score,
                        }),
                        released,
                        is_stable: false,
                        held: false,
                    };
                    (state, result)
                } else {
                    state.phase = Phase::Interacting {
                        started_at,
                        pre_capture,
                        peak_score,
                        peak_capture,
                        last_above_ts,
                        post_candidate,
                        held,
                    };
                    let result = StepResult {
                        outcome: StepOutcome::None,
                        released,
                        is_stable: false,
                        held: true,
                    };
                    (state, result)
                }
            }
        }

        Phase::Cooldown { until } => {
            // burst suppression: no new interaction may start
            if above {
                state.stable_count = 0;
                let result = StepResult {
                    outcome: StepOutcome::None,
                    released: vec![obs.capture_id],
                    is_stable: false,
                    held: false,
                };
                (state, result)
            } else {
                if let Some(prev_stable) = state.last_stable_capture {
                    released.push(prev_stable);
                }
                state.last_stable_capture = Some(obs.capture_id);
                if obs.motion_score.is_some() {
                    state.stable_count += 1;
                } else {
                    state.stable_count = 0;
                }
                let is_stable = obs.motion_score.is_some()
                    && state.stable_count >= cfg.stability_frames_required;
                state.phase = Phase::Cooldown { until };
                let result = StepResult {
                    outcome: StepOutcome::None,
                    released,
                    is_stable,
                    held: true,
                };
                (state, result)
            }
        }
    }
}

/// Service wrapper holding per-device state.
///
/// Owned exclusively by the analysis pipeline; the queue guarantees at most
/// one worker processes a given device at a time, so the map is only ever
/// contended across different devices.
pub struct InteractionTracker {
    states: RwLock<HashMap<String, InteractionState>>,
}

impl InteractionTracker {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Step a device's machine by one frame
    pub async fn step(
        &self,
        device_id: &str,
        cfg: &DeviceConfig,
        obs: &FrameObservation,
    ) -> StepResult {
        let mut states = self.states.write().await;
        let state = states.remove(device_id).unwrap_or_default();
        let (next, result) = step(state, cfg, obs);

        if next.phase_kind() != PhaseKind::Idle || !matches!(result.outcome, StepOutcome::None) {
            tracing::debug!(
                device_id = %device_id,
                phase = ?next.phase_kind(),
                capture_id = obs.capture_id,
                score = ?obs.motion_score,
                "Interaction step"
            );
        }

        states.insert(device_id.to_string(), next);
        result
    }

    /// Current phase of a device, for diagnostics
    pub async fn phase(&self, device_id: &str) -> PhaseKind {
        let states = self.states.read().await;
        states
            .get(device_id)
            .map(|s| s.phase_kind())
            .unwrap_or(PhaseKind::Idle)
    }
}

impl Default for InteractionTracker {
    fn default() -> Self {
        Self::new()
    }
}
