//! Snapshot reconciliation for rendering clients
//!
//! Turns the server's per-tick snapshots into smooth per-frame poses:
//! estimate the local-to-server clock offset, keep a short history per
//! entity, render slightly in the past between two bracketing samples and
//! smooth the result once more against the previous frame.
//!
//! Runs in the renderer's own timing domain and never touches match state.

use std::collections::{HashMap, VecDeque};

use glam::{Quat, Vec3};

use crate::ws::protocol::{PlayerId, PlayerSnapshot, Snapshot};

/// Samples retained per entity
pub const HISTORY_LEN: usize = 10;

/// How far behind the estimated server clock frames are rendered
pub const RENDER_DELAY_MS: f64 = 150.0;

/// Weight of the previous offset estimate per new sample
pub const OFFSET_RETAIN: f64 = 0.9;

/// Fraction of the way from the previous rendered pose to the target per frame
pub const POSE_SMOOTHING: f32 = 0.3;

/// Exponentially smoothed `local - server` clock offset
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockOffset {
    offset_ms: Option<f64>,
}

impl ClockOffset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one arrival; the first sample seeds the estimate
    pub fn observe(&mut self, local_receive_ms: f64, server_time_ms: f64) -> f64 {
        let sample = local_receive_ms - server_time_ms;
        let offset = match self.offset_ms {
            Some(prev) => prev * OFFSET_RETAIN + sample * (1.0 - OFFSET_RETAIN),
            None => sample,
        };
        self.offset_ms = Some(offset);
        offset
    }

    pub fn offset_ms(&self) -> Option<f64> {
        self.offset_ms
    }

    /// Server time to render at, or `None` before the first snapshot
    pub fn render_time(&self, local_now_ms: f64, render_delay_ms: f64) -> Option<f64> {
        self.offset_ms
            .map(|offset| local_now_ms - offset - render_delay_ms)
    }
}

/// One timestamped pose in server time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSample {
    pub server_time_ms: f64,
    pub position: Vec3,
    pub rotation: Quat,
}

/// Pose handed to the renderer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPose {
    pub position: Vec3,
    pub rotation: Quat,
}

/// History and smoothing state of one entity
#[derive(Debug, Clone, Default)]
pub struct EntityInterpolator {
    history: VecDeque<PoseSample>,
    rendered: Option<RenderPose>,
}

impl EntityInterpolator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample. Older-than-newest samples are ignored and a repeated
    /// timestamp replaces the newest entry.
    pub fn push(&mut self, sample: PoseSample) {
        if let Some(last) = self.history.back_mut() {
            if sample.server_time_ms < last.server_time_ms {
                return;
            }
            if sample.server_time_ms == last.server_time_ms {
                *last = sample;
                return;
            }
        }
        self.history.push_back(sample);
        while self.history.len() > HISTORY_LEN {
            self.history.pop_front();
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Newest buffered server time
    pub fn newest_time(&self) -> Option<f64> {
        self.history.back().map(|s| s.server_time_ms)
    }

    /// Interpolated pose at `render_time`, clamped to the buffered range
    pub fn sample_at(&self, render_time: f64) -> Option<RenderPose> {
        let first = self.history.front()?;
        let last = self.history.back()?;

        if render_time <= first.server_time_ms {
            return Some(pose_of(first));
        }
        if render_time >= last.server_time_ms {
            return Some(pose_of(last));
        }

        let (a, b) = self
            .history
            .iter()
            .zip(self.history.iter().skip(1))
            .find(|(a, b)| a.server_time_ms <= render_time && render_time <= b.server_time_ms)?;

        let span = b.server_time_ms - a.server_time_ms;
        let alpha = if span > 0.0 {
            ((render_time - a.server_time_ms) / span).clamp(0.0, 1.0) as f32
        } else {
            0.0
        };
        Some(RenderPose {
            position: a.position.lerp(b.position, alpha),
            rotation: a.rotation.slerp(b.rotation, alpha).normalize(),
        })
    }

    /// Advance one render frame toward the interpolated target
    pub fn render(&mut self, render_time: f64) -> Option<RenderPose> {
        let target = self.sample_at(render_time)?;
        let pose = match self.rendered {
            // First frame snaps instead of sliding in from the origin
            None => target,
            Some(prev) => RenderPose {
                position: prev.position.lerp(target.position, POSE_SMOOTHING),
                rotation: prev.rotation.slerp(target.rotation, POSE_SMOOTHING).normalize(),
            },
        };
        self.rendered = Some(pose);
        Some(pose)
    }
}

fn pose_of(sample: &PoseSample) -> RenderPose {
    RenderPose {
        position: sample.position,
        rotation: sample.rotation,
    }
}

/// Client-side view of every entity in the match
#[derive(Debug, Clone)]
pub struct SnapshotReconciler {
    clock: ClockOffset,
    entities: HashMap<PlayerId, EntityInterpolator>,
    latest: HashMap<PlayerId, PlayerSnapshot>,
    local_id: Option<PlayerId>,
    /// Replay the local entity from snapshots too
    include_local: bool,
    render_delay_ms: f64,
    last_tick: Option<u64>,
}

impl SnapshotReconciler {
    pub fn new(local_id: Option<PlayerId>) -> Self {
        Self {
            clock: ClockOffset::new(),
            entities: HashMap::new(),
            latest: HashMap::new(),
            local_id,
            include_local: false,
            render_delay_ms: RENDER_DELAY_MS,
            last_tick: None,
        }
    }

    /// Interpolate the local entity as well, for full-authority rendering
    pub fn with_local_replay(mut self, include_local: bool) -> Self {
        self.include_local = include_local;
        self
    }

    pub fn clock(&self) -> &ClockOffset {
        &self.clock
    }

    fn tracks(&self, id: &PlayerId) -> bool {
        self.include_local || self.local_id.as_ref() != Some(id)
    }

    /// Drop all history and the clock estimate, e.g. on `gameStart`
    pub fn reset(&mut self) {
        self.clock = ClockOffset::new();
        self.entities.clear();
        self.latest.clear();
        self.last_tick = None;
    }

    /// A new match restarts the server timeline at tick 1
    fn is_new_timeline(&self, snapshot: &Snapshot) -> bool {
        let tick_went_back = self.last_tick.is_some_and(|last| snapshot.tick < last);
        let time_went_back = self
            .entities
            .values()
            .filter_map(EntityInterpolator::newest_time)
            .any(|newest| snapshot.server_time_ms < newest);
        tick_went_back || time_went_back
    }

    /// Consume a snapshot received at local time `local_receive_ms`
    pub fn on_snapshot(&mut self, snapshot: &Snapshot, local_receive_ms: f64) {
        if self.is_new_timeline(snapshot) {
            self.reset();
        }
        self.last_tick = Some(snapshot.tick);
        self.clock.observe(local_receive_ms, snapshot.server_time_ms);

        for (id, player) in &snapshot.players {
            if !self.tracks(id) {
                continue;
            }
            self.entities.entry(*id).or_default().push(PoseSample {
                server_time_ms: snapshot.server_time_ms,
                position: player.position,
                rotation: player.rotation,
            });
            self.latest.insert(*id, player.clone());
        }

        // Entities missing from a full-state snapshot have left
        self.entities.retain(|id, _| snapshot.players.contains_key(id));
        self.latest.retain(|id, _| snapshot.players.contains_key(id));
    }

    /// Forget an entity immediately, e.g. on `playerLeft`
    pub fn remove(&mut self, id: &PlayerId) {
        self.entities.remove(id);
        self.latest.remove(id);
    }

    /// Most recent gameplay flags for an entity
    pub fn latest(&self, id: &PlayerId) -> Option<&PlayerSnapshot> {
        self.latest.get(id)
    }

    pub fn entity(&self, id: &PlayerId) -> Option<&EntityInterpolator> {
        self.entities.get(id)
    }

    /// Produce this frame's pose for every tracked entity
    pub fn render_frame(&mut self, local_now_ms: f64) -> HashMap<PlayerId, RenderPose> {
        let Some(render_time) = self.clock.render_time(local_now_ms, self.render_delay_ms) else {
            return HashMap::new();
        };
        self.entities
            .iter_mut()
            .filter_map(|(id, entity)| entity.render(render_time).map(|pose| (*id, pose)))
            .collect()
    }
}
