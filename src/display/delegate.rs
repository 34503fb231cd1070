//! Session delegate that feeds the preview

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flume::Sender;
use tracing::trace;

use crate::error::CameraError;
use crate::gpu::Texture;
use crate::render::RenderSlot;
use crate::session::{SessionDelegate, SessionEvent, SessionState};

/// Puts the first texture of every frame into the render slot and
/// forwards state notifications to whoever holds the receiver.
pub struct PreviewDelegate {
    slot: Arc<RenderSlot>,
    events: Sender<SessionEvent>,
    frames: AtomicU64,
}

impl PreviewDelegate {
    pub fn new(slot: Arc<RenderSlot>, events: Sender<SessionEvent>) -> Self {
        Self {
            slot,
            events,
            frames: AtomicU64::new(0),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl SessionDelegate for PreviewDelegate {
    fn on_frame(&self, textures: &[Texture], timestamp: f64) {
        if let Some(texture) = textures.first() {
            self.slot.set(texture.clone());
        }
        let frames = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(frames, timestamp, "preview frame");
    }

    fn on_state_changed(&self, state: SessionState, error: Option<CameraError>) {
        // A closed receiver means nobody is supervising any more.
        let _ = self.events.send(SessionEvent { state, error });
    }
}
