use log::debug;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt::Debug;

/// Consecutive identical readings needed before the display changes
pub const DEFAULT_WINDOW: usize = 3;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    pub window: usize,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
        }
    }
}

/// Change of a committed attribute, sent to the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeUpdate<T> {
    Show(T),
    /// The attribute is unknown for the current road; hide it
    Clear,
}

/// Debounces a noisy per-fix attribute reading.
///
/// A reading is `Some(value)` or `None` for unknown. The committed value only
/// changes after `window` consecutive identical readings, so a single
/// mismatched segment or missing tag never reaches the display.
#[derive(Debug, Clone)]
pub struct AttributeStabilizer<T> {
    window: VecDeque<Option<T>>,
    capacity: usize,
    committed: Option<T>,
}

impl<T: Clone + PartialEq + Debug> AttributeStabilizer<T> {
    pub fn new(config: &StabilizerConfig) -> Self {
        let capacity = config.window.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            committed: None,
        }
    }

    /// Value currently on display, `None` while unknown
    pub fn committed(&self) -> Option<&T> {
        self.committed.as_ref()
    }

    /// Feed one raw reading; returns the new display state if it changed
    pub fn push(&mut self, reading: Option<T>) -> Option<AttributeUpdate<T>> {
        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(reading);

        if self.window.len() < self.capacity {
            return None;
        }

        let candidate = self.window.front()?;
        if !self.window.iter().all(|r| r == candidate) || *candidate == self.committed {
            return None;
        }

        let candidate = candidate.clone();
        debug!("Committing {:?} (was {:?})", candidate, self.committed);
        self.committed = candidate.clone();

        Some(match candidate {
            Some(value) => AttributeUpdate::Show(value),
            None => AttributeUpdate::Clear,
        })
    }

    /// Forget pending readings and the committed value
    pub fn reset(&mut self) {
        self.window.clear();
        self.committed = None;
    }
}
