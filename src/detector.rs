use std::collections::{HashMap, VecDeque};

use dashmap::DashMap;
use serde::Deserialize;
use tracing::debug;

/// Motion vector counts reported for one frame of a stream
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionSample {
    pub n_right: f64,
    pub n_left: f64,
    pub n_up: f64,
    pub n_down: f64,
}

const DIRECTIONS: [&str; 4] = ["right", "left", "up", "down"];

impl MotionSample {
    fn components(&self) -> [f64; 4] {
        [self.n_right, self.n_left, self.n_up, self.n_down]
    }
}

/// Running mean / standard deviation from plain sums
#[derive(Debug, Clone, Default)]
pub struct RunningNormalizer {
    sum: f64,
    sum_sq: f64,
    n: f64,
}

impl RunningNormalizer {
    pub fn update(&mut self, x: f64) {
        self.sum += x;
        self.sum_sq += x * x;
        self.n += 1.0;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.n > 0.0).then(|| self.sum / self.n)
    }

    pub fn stdev(&self) -> Option<f64> {
        if self.n < 2.0 {
            return None;
        }
        let var = (self.n * self.sum_sq - self.sum * self.sum) / (self.n * (self.n - 1.0));
        // Cancellation can push a flat series slightly negative
        let sd = var.max(0.0).sqrt();
        (sd > 0.0).then_some(sd)
    }

    pub fn z(&self, v: f64) -> Option<f64> {
        Some((v - self.mean()?) / self.stdev()?)
    }

    /// Probability that a sample lies below `v`
    pub fn valprob(&self, v: f64) -> Option<f64> {
        self.z(v).map(zprob)
    }
}

/// Standard normal CDF, polynomial approximation (accurate to ~1e-6).
pub fn zprob(z: f64) -> f64 {
    const Z_MAX: f64 = 6.0;

    let x = if z == 0.0 {
        0.0
    } else {
        let y = 0.5 * z.abs();
        if y >= Z_MAX * 0.5 {
            1.0
        } else if y < 1.0 {
            let w = y * y;
            ((((((((0.000124818987 * w - 0.001075204047) * w + 0.005198775019) * w - 0.019198292004) * w
                + 0.059054035642)
                * w
                - 0.151968751364)
                * w
                + 0.319152932694)
                * w
                - 0.531923007300)
                * w
                + 0.797884560593)
                * y
                * 2.0
        } else {
            let y = y - 2.0;
            (((((((((((((-0.000045255659 * y + 0.000152529290) * y - 0.000019538132) * y - 0.000676904986)
                * y
                + 0.001390604284)
                * y
                - 0.000794620820)
                * y
                - 0.002034254874)
                * y
                + 0.006549791214)
                * y
                - 0.010557625006)
                * y
                + 0.011630447319)
                * y
                - 0.009279453341)
                * y
                + 0.005353579108)
                * y
                - 0.002141268741)
                * y
                + 0.000535310849)
                * y
                + 0.999936657524
        }
    };

    if z > 0.0 {
        (x + 1.0) * 0.5
    } else {
        (1.0 - x) * 0.5
    }
}

/// Per-stream detector over a sliding window of motion samples.
///
/// The leading 90% of the window trains four normalizers (one per direction);
/// the trailing samples are averaged and scored against them.
#[derive(Debug, Clone)]
pub struct MotionDetector {
    history: VecDeque<[f64; 4]>,
    train_set: usize,
}

impl MotionDetector {
    pub fn new(train_set: usize) -> Self {
        Self { history: VecDeque::new(), train_set: train_set.max(2) }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn update(&mut self, sample: MotionSample) {
        self.history.push_back(sample.components());
        if self.history.len() >= self.train_set {
            self.history.pop_front();
        }
    }

    /// Mean CDF probability of the recent motion; `None` until there is
    /// enough history to train on.
    pub fn anomaly_probability(&self) -> Option<f64> {
        let len = self.history.len();
        let split = 9 * len / 10;
        if split < 2 || split >= len {
            return None;
        }

        let mut normalizers: [RunningNormalizer; 4] = Default::default();
        for row in self.history.iter().take(split) {
            for (norm, &v) in normalizers.iter_mut().zip(row) {
                norm.update(v);
            }
        }

        let tail = len - split;
        let mut mean = [0.0; 4];
        for row in self.history.iter().skip(split) {
            for (m, &v) in mean.iter_mut().zip(row) {
                *m += v / tail as f64;
            }
        }

        // A direction that never varied in training carries no signal
        let mut total = 0.0;
        let mut scored = 0;
        for ((norm, &v), direction) in normalizers.iter().zip(&mean).zip(DIRECTIONS) {
            match norm.valprob(v) {
                Some(p) => {
                    total += p;
                    scored += 1;
                }
                None => debug!("No {} motion variance in {} training samples, skipped", direction, split),
            }
        }
        (scored > 0).then(|| total / scored as f64)
    }

    /// `1 - anomaly_probability`
    pub fn normality(&self) -> Option<f64> {
        self.anomaly_probability().map(|p| 1.0 - p)
    }
}

/// Detectors for every known stream, fed concurrently from the web API.
pub struct DetectorBank {
    detectors: DashMap<String, MotionDetector>,
    train_set: usize,
}

impl DetectorBank {
    pub fn new(train_set: usize) -> Self {
        Self { detectors: DashMap::new(), train_set }
    }

    pub fn register(&self, names: &[String]) {
        for name in names {
            self.detectors
                .entry(name.clone())
                .or_insert_with(|| MotionDetector::new(self.train_set));
        }
        debug!("Detector bank tracking {} streams", self.detectors.len());
    }

    /// Adds a sample; returns the stream's history length, or `None` for an
    /// unregistered stream.
    pub fn feed(&self, name: &str, sample: MotionSample) -> Option<usize> {
        let mut detector = self.detectors.get_mut(name)?;
        detector.update(sample);
        Some(detector.len())
    }

    /// Normality per stream; streams without enough history are left out.
    pub fn normality_scores(&self, names: &[String]) -> HashMap<String, f64> {
        names
            .iter()
            .filter_map(|name| {
                let detector = self.detectors.get(name)?;
                detector.normality().map(|v| (name.clone(), v))
            })
            .collect()
    }

    pub fn get_stats(&self) -> serde_json::Value {
        let streams: HashMap<String, usize> = self
            .detectors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect();
        serde_json::json!({
            "train_set": self.train_set,
            "history": streams,
        })
    }
}
