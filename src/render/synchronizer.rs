//! Display-tick driven renderer: reads the slot, draws under the gate

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::CachePadded;
use tracing::{trace, warn};

use super::gate::Gate;
use super::slot::RenderSlot;
use crate::error::RenderError;
use crate::gpu::Texture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    TriangleList,
    TriangleStrip,
}

/// One draw call's geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuadDraw {
    pub topology: Topology,
    pub vertex_count: u32,
    pub instance_count: u32,
}

impl QuadDraw {
    /// A single quad covering the whole target
    pub const FULL_SCREEN: Self = Self {
        topology: Topology::TriangleStrip,
        vertex_count: 4,
        instance_count: 1,
    };
}

/// Called by the backend once the GPU has finished a submission
pub type Completion<H> = Box<dyn FnOnce(H) + Send>;

/// Draw encoder and pipeline owner behind a [`Renderer`]
pub trait RenderBackend {
    /// Per-tick drawable supplied by the display surface
    type Target;
    /// GPU handles handed to the post-render hook
    type Handles: Send + 'static;

    /// Run completion callbacks of finished submissions. Backends that
    /// complete asynchronously on their own may leave this empty.
    fn poll(&self) {}

    fn pipeline_ready(&self) -> bool;

    /// Encode `draw` sampling `texture` into `target` and submit it.
    /// `on_complete` must run exactly once when the GPU is done, or be
    /// dropped if submission fails.
    fn submit(
        &mut self,
        target: Self::Target,
        texture: &Texture,
        draw: QuadDraw,
        on_complete: Completion<Self::Handles>,
    ) -> Result<(), RenderError>;
}

/// Overridable pre/post render steps
pub trait RenderHooks<H>: Send + Sync {
    /// May substitute the texture about to be drawn
    fn will_render(&self, texture: Arc<Texture>) -> Arc<Texture> {
        texture
    }

    /// Runs on completion of the submission, before the gate opens
    fn did_render(&self, _texture: &Texture, _handles: &H) {}
}

/// Hooks that change nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl<H> RenderHooks<H> for NoHooks {}

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Submitted,
    NoTexture,
    PipelineUnavailable,
    TargetUnavailable,
    Failed,
}

impl TickOutcome {
    fn reason(self) -> &'static str {
        match self {
            TickOutcome::Submitted => "submitted",
            TickOutcome::NoTexture => "no_texture",
            TickOutcome::PipelineUnavailable => "pipeline_unavailable",
            TickOutcome::TargetUnavailable => "target_unavailable",
            TickOutcome::Failed => "failed",
        }
    }
}

#[derive(Default)]
struct Stats {
    // Written by the render thread
    ticks: AtomicU64,
    submitted: AtomicU64,
    skipped: AtomicU64,
    // Written from completion callbacks on the backend's thread
    completed: CachePadded<AtomicU64>,
}

/// Snapshot of a renderer's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub ticks: u64,
    pub submitted: u64,
    pub completed: u64,
    pub skipped: u64,
}

pub struct Renderer<B: RenderBackend> {
    slot: Arc<RenderSlot>,
    gate: Gate,
    backend: B,
    hooks: Arc<dyn RenderHooks<B::Handles>>,
    stats: Arc<Stats>,
}

impl<B: RenderBackend> Renderer<B> {
    pub fn new(slot: Arc<RenderSlot>, backend: B) -> Self {
        Self::with_hooks(slot, backend, Arc::new(NoHooks))
    }

    pub fn with_hooks(slot: Arc<RenderSlot>, backend: B, hooks: Arc<dyn RenderHooks<B::Handles>>) -> Self {
        Self {
            slot,
            gate: Gate::new(),
            backend,
            hooks,
            stats: Arc::default(),
        }
    }

    pub fn slot(&self) -> &Arc<RenderSlot> {
        &self.slot
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// One display tick. `target` is only asked for once there is
    /// something to draw.
    pub fn draw<F>(&mut self, target: F) -> TickOutcome
    where
        F: FnOnce() -> Option<B::Target>,
    {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        self.backend.poll();
        let permit = self.gate.acquire();

        let Some(texture) = self.slot.load() else {
            return self.skip(TickOutcome::NoTexture);
        };
        let texture = self.hooks.will_render(texture);

        if !self.backend.pipeline_ready() {
            return self.skip(TickOutcome::PipelineUnavailable);
        }
        let Some(target) = target() else {
            return self.skip(TickOutcome::TargetUnavailable);
        };

        let started = Instant::now();
        let hooks = self.hooks.clone();
        let stats = self.stats.clone();
        let drawn = texture.clone();
        let on_complete: Completion<B::Handles> = Box::new(move |handles| {
            hooks.did_render(&drawn, &handles);
            stats.completed.fetch_add(1, Ordering::Relaxed);
            metrics::histogram!("camtex_render_time_us").record(started.elapsed().as_micros() as f64);
            drop(permit);
        });

        match self
            .backend
            .submit(target, &texture, QuadDraw::FULL_SCREEN, on_complete)
        {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                trace!(buffer = %texture.key().buffer, "frame submitted");
                TickOutcome::Submitted
            }
            Err(e) => {
                warn!(error = %e, "render submission failed");
                self.skip(TickOutcome::Failed)
            }
        }
    }

    fn skip(&self, outcome: TickOutcome) -> TickOutcome {
        self.stats.skipped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camtex_render_ticks_skipped_total", "reason" => outcome.reason()).increment(1);
        trace!(?outcome, "render tick skipped");
        outcome
    }

    pub fn stats(&self) -> RenderStats {
        RenderStats {
            ticks: self.stats.ticks.load(Ordering::Relaxed),
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
        }
    }

    /// Whether no submission is currently in flight
    pub fn is_idle(&self) -> bool {
        self.gate.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_counter_has_its_own_cache_line() {
        let stats = Stats::default();
        let line = |addr: *const AtomicU64| addr as usize / 64;
        let completed = line(&*stats.completed);
        for counter in [&stats.ticks, &stats.submitted, &stats.skipped] {
            assert_ne!(line(counter), completed);
        }
    }
}
