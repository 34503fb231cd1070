//! Single-value texture hand-off between the capture and render contexts

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::gpu::Texture;

/// Holds the latest texture only. Writers overwrite, readers take a
/// reference to whatever is current; neither side ever waits.
#[derive(Default)]
pub struct RenderSlot {
    current: ArcSwapOption<Texture>,
    writes: AtomicU64,
}

impl RenderSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, texture: Texture) {
        self.set_shared(Arc::new(texture));
    }

    pub fn set_shared(&self, texture: Arc<Texture>) {
        self.current.store(Some(texture));
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn load(&self) -> Option<Arc<Texture>> {
        self.current.load_full()
    }

    pub fn clear(&self) {
        self.current.store(None);
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_none()
    }

    /// Total number of textures ever set
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}
