use std::sync::atomic::{AtomicU32, Ordering};

/// Frames rendered after a single redraw request
pub const MIN_REDRAWS: u32 = 3;

// Counter value meaning "redraw every frame until stopped"
const PERMANENT: u32 = u32::MAX;

/// Lock-free request to redraw the view for the next few frames.
///
/// Any thread may request a redraw; the render loop consumes one frame per tick.
#[derive(Debug, Default)]
pub struct RedrawSignal {
    remaining: AtomicU32,
}

impl RedrawSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures at least [`MIN_REDRAWS`] further frames are rendered
    pub fn request_redraw(&self) {
        self.remaining.fetch_or(MIN_REDRAWS, Ordering::AcqRel);
    }

    /// Redraw every frame until [`stop_permanent_redraw`](Self::stop_permanent_redraw)
    pub fn start_permanent_redraw(&self) {
        self.remaining.store(PERMANENT, Ordering::Release);
    }

    /// Leaves permanent mode, still rendering [`MIN_REDRAWS`] frames
    pub fn stop_permanent_redraw(&self) {
        self.remaining.store(MIN_REDRAWS, Ordering::Release);
    }

    pub fn is_permanent(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == PERMANENT
    }

    /// Frames still owed
    pub fn pending(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Called once per frame; true if this frame should be rendered
    pub fn consume_frame(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| match remaining {
                0 => None,
                PERMANENT => Some(PERMANENT),
                n => Some(n - 1),
            })
            .is_ok()
    }
}
