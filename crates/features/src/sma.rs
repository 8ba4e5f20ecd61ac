//! Rolling simple moving average.

use std::collections::VecDeque;

/// Simple moving average over a fixed window.
pub struct RollingMean {
    /// Window size in periods.
    window: usize,
    /// Values in the window.
    values: VecDeque<f64>,
    /// Running sum of the window.
    sum: f64,
}

impl RollingMean {
    /// Create a new rolling mean. A zero window is treated as one.
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            values: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }

    /// Add an observation and return the mean once the window is full.
    pub fn add(&mut self, value: f64) -> Option<f64> {
        if self.values.len() >= self.window {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
        self.values.push_back(value);
        self.sum += value;
        self.value()
    }

    /// Current mean, if the window is full.
    pub fn value(&self) -> Option<f64> {
        if self.is_ready() {
            Some(self.sum / self.window as f64)
        } else {
            None
        }
    }

    /// Check if the window is full.
    pub fn is_ready(&self) -> bool {
        self.values.len() >= self.window
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Clear all data.
    pub fn clear(&mut self) {
        self.values.clear();
        self.sum = 0.0;
    }
}
