// Time-indexed pose history with twist interpolation between samples

use std::collections::VecDeque;

use crate::geometry::Pose2d;

#[derive(Debug, Clone)]
pub struct PoseHistory {
    history_seconds: f64,
    // Strictly increasing timestamps
    samples: VecDeque<(f64, Pose2d)>,
}

impl PoseHistory {
    pub fn new(history_seconds: f64) -> Self {
        Self {
            history_seconds,
            samples: VecDeque::new(),
        }
    }

    pub fn history_seconds(&self) -> f64 {
        self.history_seconds
    }

    /// Append a sample, evicting anything older than the history window.
    /// Returns false, storing nothing, if `timestamp` is not newer than
    /// the latest sample.
    pub fn add_sample(&mut self, timestamp: f64, pose: Pose2d) -> bool {
        if self.newest_timestamp().is_some_and(|newest| timestamp <= newest) {
            return false;
        }
        while let Some(&(oldest, _)) = self.samples.front() {
            if timestamp - oldest >= self.history_seconds {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back((timestamp, pose));
        true
    }

    /// Pose at `timestamp`, clamped to the stored range
    pub fn sample(&self, timestamp: f64) -> Option<Pose2d> {
        let &(first_t, first) = self.samples.front()?;
        let &(last_t, last) = self.samples.back()?;
        if timestamp <= first_t {
            return Some(first);
        }
        if timestamp >= last_t {
            return Some(last);
        }

        // First sample at or after timestamp; always in 1..len here
        let upper = self.samples.partition_point(|(t, _)| *t < timestamp);
        let (t1, p1) = self.samples[upper];
        if t1 == timestamp {
            return Some(p1);
        }
        let (t0, p0) = self.samples[upper - 1];
        Some(p0.interpolate(p1, (timestamp - t0) / (t1 - t0)))
    }

    pub fn oldest_timestamp(&self) -> Option<f64> {
        self.samples.front().map(|(t, _)| *t)
    }

    pub fn newest_timestamp(&self) -> Option<f64> {
        self.samples.back().map(|(t, _)| *t)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rotation2d;
    use approx::assert_relative_eq;

    fn at(x: f64) -> Pose2d {
        Pose2d::new(x, 0.0, Rotation2d::ZERO)
    }

    #[test]
    fn test_interpolates_between_samples() {
        let mut history = PoseHistory::new(1.5);
        history.add_sample(0.0, at(0.0));
        history.add_sample(1.0, at(2.0));
        assert_relative_eq!(history.sample(0.25).unwrap().x(), 0.5, epsilon = 1e-9);
        assert_relative_eq!(history.sample(1.0).unwrap().x(), 2.0);
    }

    #[test]
    fn test_clamps_outside_range() {
        let mut history = PoseHistory::new(1.5);
        assert!(history.sample(0.0).is_none());
        history.add_sample(1.0, at(1.0));
        history.add_sample(2.0, at(3.0));
        assert_eq!(history.sample(-5.0), Some(at(1.0)));
        assert_eq!(history.sample(9.0), Some(at(3.0)));
    }

    #[test]
    fn test_old_samples_evicted() {
        let mut history = PoseHistory::new(1.5);
        for i in 0..100 {
            history.add_sample(i as f64 * 0.02, at(i as f64));
        }
        let newest = history.newest_timestamp().unwrap();
        let oldest = history.oldest_timestamp().unwrap();
        assert!(newest - oldest < 1.5);
        assert!(history.len() <= 76);
    }

    #[test]
    fn test_rejects_non_increasing_timestamps() {
        let mut history = PoseHistory::new(1.5);
        assert!(history.add_sample(1.0, at(1.0)));
        assert!(!history.add_sample(1.0, at(5.0)));
        assert!(!history.add_sample(0.5, at(5.0)));
        assert_eq!(history.len(), 1);
        assert_eq!(history.sample(1.0), Some(at(1.0)));
    }
}
