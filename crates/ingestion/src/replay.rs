//! Sequential bar replay.

use cta_core::Bar;

/// Feeds a loaded bar sequence to the engine one bar at a time.
///
/// The replayer does not reorder anything; ordering is checked by the
/// consumer so that a malformed sequence fails the run instead of being
/// silently repaired.
#[derive(Debug, Clone)]
pub struct MarketDataReplayer {
    bars: Vec<Bar>,
    cursor: usize,
}

impl MarketDataReplayer {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self { bars, cursor: 0 }
    }

    /// Advance and return the next bar.
    pub fn next_bar(&mut self) -> Option<&Bar> {
        let bar = self.bars.get(self.cursor)?;
        self.cursor += 1;
        Some(bar)
    }

    /// Next bar without advancing.
    pub fn peek(&self) -> Option<&Bar> {
        self.bars.get(self.cursor)
    }

    /// Most recently returned bar.
    pub fn current(&self) -> Option<&Bar> {
        self.cursor.checked_sub(1).and_then(|i| self.bars.get(i))
    }

    /// Number of bars already replayed.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.bars.len() - self.cursor
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Rewind to the first bar.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}
