//! Render side: the single-slot hand-off and the gate-synchronized renderer

pub mod gate;
pub mod slot;
pub mod synchronizer;
pub mod wgpu_backend;

pub use gate::{Gate, GatePermit};
pub use slot::RenderSlot;
pub use synchronizer::{
    Completion, NoHooks, QuadDraw, RenderBackend, RenderHooks, RenderStats, Renderer, TickOutcome,
    Topology,
};
pub use wgpu_backend::{WgpuBackend, WgpuHandles};
