//! Per-core load smoothing, grounded on `vendor/nicscheduler/methods/rsspp.cc`'s
//! `_imbalance_alpha`-weighted exponential smoothing (spec §4.8 point 1).

/// Exponentially-smoothed per-core load: `L'[c] = α·L[c] + (1−α)·L'_prev[c]`.
pub struct LoadTracker {
    alpha: f64,
    smoothed: Vec<f64>,
}

impl LoadTracker {
    pub fn new(n_cores: usize, alpha: f64) -> Self {
        LoadTracker {
            alpha,
            smoothed: vec![0.0; n_cores],
        }
    }

    pub fn update(&mut self, raw: &[f64]) -> &[f64] {
        if raw.len() != self.smoothed.len() {
            self.smoothed.resize(raw.len(), 0.0);
        }
        for (prev, &l) in self.smoothed.iter_mut().zip(raw.iter()) {
            *prev = self.alpha * l + (1.0 - self.alpha) * *prev;
        }
        &self.smoothed
    }

    pub fn smoothed(&self) -> &[f64] {
        &self.smoothed
    }
}

/// A snapshot of per-core load plus the classification spec §4.8 point 1
/// asks for: target (the mean), and the under/overloaded sets relative to
/// `threshold`.
pub struct LoadSnapshot {
    pub load: Vec<f64>,
    pub target: f64,
    pub underloaded: Vec<usize>,
    pub overloaded: Vec<usize>,
}

impl LoadSnapshot {
    pub fn classify(load: Vec<f64>, threshold: f64) -> Self {
        let target = if load.is_empty() {
            0.0
        } else {
            load.iter().sum::<f64>() / load.len() as f64
        };
        let underloaded = load
            .iter()
            .enumerate()
            .filter(|&(_, &l)| target - l > threshold)
            .map(|(i, _)| i)
            .collect();
        let overloaded = load
            .iter()
            .enumerate()
            .filter(|&(_, &l)| l - target > threshold)
            .map(|(i, _)| i)
            .collect();
        LoadSnapshot {
            load,
            target,
            underloaded,
            overloaded,
        }
    }

    pub fn min_core(&self) -> Option<usize> {
        self.load
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
    }

    /// `total_supply` per spec §4.8 point 2/3: how much spare capacity the
    /// fleet has relative to the target, summed across cores.
    pub fn total_supply(&self) -> f64 {
        self.load.len() as f64 * self.target - self.load.iter().sum::<f64>()
    }
}
