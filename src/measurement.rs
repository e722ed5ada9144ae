use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{NavError, NavResult};
use crate::filters::AnchorRegistry;
use crate::types::{Position3, TdoaObservation};

/// Noise-free `d(other) - d(reference)` for a tag at `position`
pub fn predicted_range_difference(
    position: &Position3,
    anchors: &AnchorRegistry,
    reference: usize,
    other: usize,
) -> NavResult<f64> {
    let d_ref = (position - anchors.get(reference)?).norm();
    let d_other = (position - anchors.get(other)?).norm();
    Ok(d_other - d_ref)
}

/// Which anchor pairs produce an observation each cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairScheme {
    /// Every unordered pair `(i, j)` with `i < j`, `i` as reference
    AllPairs,
    /// One anchor as the common reference against every other anchor
    ReferenceAnchor(usize),
}

impl PairScheme {
    pub fn pairs(&self, ids: &[usize]) -> Vec<(usize, usize)> {
        match *self {
            PairScheme::AllPairs => ids
                .iter()
                .enumerate()
                .flat_map(|(i, &a)| ids[i + 1..].iter().map(move |&b| (a, b)))
                .collect(),
            PairScheme::ReferenceAnchor(reference) => {
                if !ids.contains(&reference) {
                    return Vec::new();
                }
                ids.iter()
                    .filter(|&&id| id != reference)
                    .map(|&id| (reference, id))
                    .collect()
            }
        }
    }
}

/// Truth + Gaussian noise on every configured anchor pair
pub struct TdoaSimulator {
    anchors: AnchorRegistry,
    scheme: PairScheme,
    noise: Normal<f64>,
    rng: rand::rngs::StdRng,
}

impl TdoaSimulator {
    pub fn new(
        anchors: AnchorRegistry,
        scheme: PairScheme,
        noise_std: f64,
        seed: u64,
    ) -> NavResult<Self> {
        if let PairScheme::ReferenceAnchor(reference) = scheme {
            anchors.get(reference)?;
        }
        if anchors.len() < 2 {
            return Err(NavError::Configuration(
                "simulator needs at least two anchors".into(),
            ));
        }
        let noise = Normal::new(0.0, noise_std).map_err(|e| {
            NavError::Configuration(format!("invalid noise std {noise_std}: {e}"))
        })?;
        Ok(Self {
            anchors,
            scheme,
            noise,
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        })
    }

    pub fn anchors(&self) -> &AnchorRegistry {
        &self.anchors
    }

    /// One observation per anchor pair, in pair order
    pub fn observe(&mut self, truth: &Position3, timestamp: f64) -> Vec<TdoaObservation> {
        let pairs = self.scheme.pairs(&self.anchors.ids());
        let mut observations = Vec::with_capacity(pairs.len());
        for (reference, other) in pairs {
            // Pairs come from `ids()`, so both anchors are set
            let Ok(exact) = predicted_range_difference(truth, &self.anchors, reference, other)
            else {
                continue;
            };
            observations.push(TdoaObservation {
                timestamp,
                reference,
                other,
                range_difference: exact + self.noise.sample(&mut self.rng),
                truth: Some([truth.x, truth.y, truth.z]),
            });
        }
        observations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_all_pairs_order() {
        let pairs = PairScheme::AllPairs.pairs(&[0, 1, 2, 3]);
        assert_eq!(pairs, vec![(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)]);
    }

    #[test]
    fn test_reference_anchor_pairs() {
        let pairs = PairScheme::ReferenceAnchor(2).pairs(&[0, 1, 2, 3]);
        assert_eq!(pairs, vec![(2, 0), (2, 1), (2, 3)]);
        assert!(PairScheme::ReferenceAnchor(5).pairs(&[0, 1]).is_empty());
    }

    #[test]
    fn test_predicted_difference_is_antisymmetric() {
        let anchors = AnchorRegistry::default();
        let p = Position3::new(1.0, 2.0, 0.5);
        let ab = predicted_range_difference(&p, &anchors, 0, 2).unwrap();
        let ba = predicted_range_difference(&p, &anchors, 2, 0).unwrap();
        assert_abs_diff_eq!(ab, -ba, epsilon = 1e-12);
        assert!(predicted_range_difference(&p, &anchors, 0, 6).is_err());
    }

    #[test]
    fn test_noiseless_simulator_matches_prediction() {
        let anchors = AnchorRegistry::default();
        let truth = Position3::new(2.5, 2.0, 1.0);
        let mut sim = TdoaSimulator::new(anchors.clone(), PairScheme::AllPairs, 0.0, 1).unwrap();
        let obs = sim.observe(&truth, 0.5);
        assert_eq!(obs.len(), 6);
        for o in &obs {
            let exact = predicted_range_difference(&truth, &anchors, o.reference, o.other).unwrap();
            assert_abs_diff_eq!(o.range_difference, exact, epsilon = 1e-12);
            assert_eq!(o.timestamp, 0.5);
            assert_eq!(o.truth, Some([2.5, 2.0, 1.0]));
        }
    }

    #[test]
    fn test_seeded_simulator_is_repeatable() {
        let truth = Position3::new(1.0, 1.0, 1.0);
        let mut a = TdoaSimulator::new(AnchorRegistry::default(), PairScheme::AllPairs, 0.1, 42)
            .unwrap();
        let mut b = TdoaSimulator::new(AnchorRegistry::default(), PairScheme::AllPairs, 0.1, 42)
            .unwrap();
        assert_eq!(a.observe(&truth, 0.0), b.observe(&truth, 0.0));
    }

    #[test]
    fn test_simulator_rejects_bad_setup() {
        assert!(TdoaSimulator::new(AnchorRegistry::default(), PairScheme::AllPairs, -1.0, 0).is_err());
        assert!(TdoaSimulator::new(
            AnchorRegistry::default(),
            PairScheme::ReferenceAnchor(7),
            0.1,
            0
        )
        .is_err());
        assert!(TdoaSimulator::new(AnchorRegistry::empty(), PairScheme::AllPairs, 0.1, 0).is_err());
    }
}
