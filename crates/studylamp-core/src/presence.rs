//! Presence hysteresis.
//!
//! Converts per-frame hit/miss readings into a stable "someone is at the desk"
//! flag. The flag only flips after [`HYSTERESIS_FRAMES`] consecutive readings
//! that disagree with it.

use crate::types::Classification;
use serde::Serialize;

/// Consecutive identical readings required to flip the stable state.
pub const HYSTERESIS_FRAMES: u32 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PresenceState {
    pub is_present: bool,
    pub consecutive_hits: u32,
    pub consecutive_misses: u32,
}

#[derive(Debug, Clone)]
pub struct PresenceDebouncer {
    state: PresenceState,
    threshold: u32,
}

impl Default for PresenceDebouncer {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceDebouncer {
    /// Start in the absent state with the default threshold.
    pub fn new() -> Self {
        Self::with_threshold(HYSTERESIS_FRAMES)
    }

    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            state: PresenceState::default(),
            threshold: threshold.max(1),
        }
    }

    /// Feed one reading. Returns the new stable value if it flipped.
    pub fn observe(&mut self, reading: Classification) -> Option<bool> {
        let s = &mut self.state;
        match reading {
            Classification::Hit => {
                s.consecutive_hits = s.consecutive_hits.saturating_add(1);
                s.consecutive_misses = 0;
                if !s.is_present && s.consecutive_hits >= self.threshold {
                    s.is_present = true;
                    return Some(true);
                }
            }
            Classification::Miss => {
                s.consecutive_misses = s.consecutive_misses.saturating_add(1);
                s.consecutive_hits = 0;
                if s.is_present && s.consecutive_misses >= self.threshold {
                    s.is_present = false;
                    return Some(false);
                }
            }
        }
        None
    }

    /// Restart hysteresis without touching the stable value.
    pub fn reset_counters(&mut self) {
        self.state.consecutive_hits = 0;
        self.state.consecutive_misses = 0;
    }

    pub fn is_present(&self) -> bool {
        self.state.is_present
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }
}
