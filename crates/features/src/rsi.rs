//! Relative strength index with Wilder smoothing.

/// Wilder RSI over `window` price changes.
pub struct Rsi {
    window: usize,
    prev_price: Option<f64>,
    /// Changes seen so far, until the first average is seeded.
    seed_count: usize,
    avg_gain: f64,
    avg_loss: f64,
}

impl Rsi {
    /// Create a new RSI. A zero window is treated as one.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            prev_price: None,
            seed_count: 0,
            avg_gain: 0.0,
            avg_loss: 0.0,
        }
    }

    /// Add a close price and return the RSI once seeded.
    pub fn add_price(&mut self, price: f64) -> Option<f64> {
        let Some(prev) = self.prev_price.replace(price) else {
            return None;
        };

        let change = price - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        let n = self.window as f64;

        if self.seed_count < self.window {
            // Simple average over the first window.
            self.avg_gain += gain / n;
            self.avg_loss += loss / n;
            self.seed_count += 1;
        } else {
            self.avg_gain = (self.avg_gain * (n - 1.0) + gain) / n;
            self.avg_loss = (self.avg_loss * (n - 1.0) + loss) / n;
        }

        self.value()
    }

    /// Current RSI in [0, 100]. A series with no movement reads 50.
    pub fn value(&self) -> Option<f64> {
        if !self.is_ready() {
            return None;
        }
        let total = self.avg_gain + self.avg_loss;
        if total <= 0.0 {
            Some(50.0)
        } else {
            Some(100.0 * self.avg_gain / total)
        }
    }

    pub fn is_ready(&self) -> bool {
        self.seed_count >= self.window
    }

    /// Clear all data.
    pub fn clear(&mut self) {
        self.prev_price = None;
        self.seed_count = 0;
        self.avg_gain = 0.0;
        self.avg_loss = 0.0;
    }
}
