use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::{Position3, STATE_DIM, STATE_X, STATE_Y, STATE_Z};

/// Copyable state/covariance pair published by the estimator loop
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateSnapshot {
    pub timestamp: f64,
    /// Number of predict cycles the estimator had run
    pub sequence: u64,
    pub state: [f64; STATE_DIM],
    pub covariance: [[f64; STATE_DIM]; STATE_DIM],
}

impl EstimateSnapshot {
    pub fn position(&self) -> Position3 {
        Position3::new(
            self.state[STATE_X],
            self.state[STATE_Y],
            self.state[STATE_Z],
        )
    }

    pub fn position_variance(&self) -> f64 {
        self.covariance[STATE_X][STATE_X]
            + self.covariance[STATE_Y][STATE_Y]
            + self.covariance[STATE_Z][STATE_Z]
    }
}

/// Single-writer, multi-reader latest estimate.
///
/// Readers never block the writer and always see a whole snapshot.
#[derive(Clone, Default)]
pub struct SharedEstimate {
    cell: Arc<AtomicCell<Option<EstimateSnapshot>>>,
}

impl SharedEstimate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: EstimateSnapshot) {
        self.cell.store(Some(snapshot));
    }

    /// Latest published snapshot, `None` until the estimator's first publish
    pub fn latest(&self) -> Option<EstimateSnapshot> {
        self.cell.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::TdoaEkf;

    #[test]
    fn test_empty_until_published() {
        let shared = SharedEstimate::new();
        assert!(shared.latest().is_none());
    }

    #[test]
    fn test_publish_and_load() {
        let ekf = TdoaEkf::default();
        let shared = SharedEstimate::new();
        let reader = shared.clone();

        shared.publish(ekf.snapshot(0.25));
        let snap = reader.latest().unwrap();
        assert_eq!(snap.timestamp, 0.25);
        assert_eq!(snap.position(), ekf.location());
        assert_eq!(snap.position_variance(), 10000.0 + 10000.0 + 1.0);
    }

    #[test]
    fn test_reader_sees_whole_snapshots_across_threads() {
        let shared = SharedEstimate::new();
        let writer = shared.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..1000u64 {
                let v = i as f64;
                writer.publish(EstimateSnapshot {
                    timestamp: v,
                    sequence: i,
                    state: [v; STATE_DIM],
                    covariance: [[v; STATE_DIM]; STATE_DIM],
                });
            }
        });
        for _ in 0..1000 {
            if let Some(snap) = shared.latest() {
                let v = snap.sequence as f64;
                assert!(snap.state.iter().all(|s| *s == v));
                assert!(snap.covariance.iter().flatten().all(|c| *c == v));
            }
        }
        handle.join().unwrap();
        assert_eq!(shared.latest().unwrap().sequence, 999);
    }
}
