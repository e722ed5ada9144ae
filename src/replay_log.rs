//! Recorded observation logs: JSON or gzipped JSON, optionally carrying
//! the anchor survey and per-observation ground truth.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::config::AnchorConfig;
use crate::error::{NavError, NavResult};
use crate::filters::{AnchorRegistry, TdoaEkf};
use crate::measurement::{PairScheme, TdoaSimulator};
use crate::types::{Position3, TdoaObservation};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchors: Option<Vec<AnchorConfig>>,
    pub observations: Vec<TdoaObservation>,
}

fn is_gzip(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

impl ReplayLog {
    pub fn load(path: impl AsRef<Path>) -> NavResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let log = if is_gzip(path) {
            let gz = GzDecoder::new(file);
            serde_json::from_reader(BufReader::new(gz))?
        } else {
            serde_json::from_reader(BufReader::new(file))?
        };
        Ok(log)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> NavResult<()> {
        let path = path.as_ref();
        let file = File::create(path)?;
        if is_gzip(path) {
            let mut gz = GzEncoder::new(BufWriter::new(file), Compression::default());
            serde_json::to_writer(&mut gz, self)?;
            gz.finish()?.flush()?;
        } else {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.flush()?;
        }
        Ok(())
    }
}

/// Outcome of running a log through an estimator
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub observations: usize,
    pub applied: usize,
    pub rejected: usize,
    pub predictions: u64,
    pub final_position: [f64; 3],
    /// 3D RMSE over observations that carried ground truth
    pub rmse: Option<f64>,
    pub final_error: Option<f64>,
}

/// Longest observation gap that replay bridges with predictions [s]
pub const MAX_PREDICT_GAP: f64 = 60.0;

/// Feed `recording` through `ekf`, predicting once per estimator timestep crossed.
///
/// Rejected observations are counted and skipped; configuration errors
/// (unknown anchors, non-finite timestamps) abort the replay. A gap longer
/// than `MAX_PREDICT_GAP` is bridged with a capped number of predictions
/// and the prediction clock restarts at the new timestamp, as does a clock
/// that runs backwards by more than a couple of steps.
pub fn replay(ekf: &mut TdoaEkf, recording: &ReplayLog) -> NavResult<ReplaySummary> {
    let dt = ekf.config().timestep;
    let max_steps = (MAX_PREDICT_GAP / dt).ceil() as u64;
    let mut next_predict: Option<f64> = None;
    let mut applied = 0;
    let mut rejected = 0;
    let mut sq_errors = Vec::new();
    let mut final_error = None;

    for obs in &recording.observations {
        if !obs.timestamp.is_finite() {
            return Err(NavError::Configuration(format!(
                "observation timestamp must be finite, got {}",
                obs.timestamp
            )));
        }

        let next = *next_predict.get_or_insert(obs.timestamp);
        if obs.timestamp >= next {
            let crossed = ((obs.timestamp - next) / dt).floor();
            let steps = if crossed >= max_steps as f64 {
                log::warn!(
                    "{:.3} s gap before t={:.3}, predicting {max_steps} steps and resynchronizing",
                    obs.timestamp - next,
                    obs.timestamp
                );
                next_predict = Some(obs.timestamp + dt);
                max_steps
            } else {
                let steps = crossed as u64 + 1;
                next_predict = Some(next + steps as f64 * dt);
                steps
            };
            for _ in 0..steps {
                ekf.predict();
            }
        } else if obs.timestamp < next - 2.0 * dt {
            log::warn!(
                "timestamp went back from {:.3} to {:.3}, resynchronizing",
                next - dt,
                obs.timestamp
            );
            next_predict = Some(obs.timestamp + dt);
        }

        match ekf.scalar_range_difference_update(obs.reference, obs.other, obs.range_difference) {
            Ok(_) => applied += 1,
            Err(e) if e.is_recoverable() => {
                log::debug!("skipping observation at t={:.3}: {e}", obs.timestamp);
                rejected += 1;
            }
            Err(e) => return Err(e),
        }

        if let Some([x, y, z]) = obs.truth {
            let err = (ekf.location() - Position3::new(x, y, z)).norm();
            sq_errors.push(err * err);
            final_error = Some(err);
        }
    }

    let rmse = if sq_errors.is_empty() {
        None
    } else {
        Some((sq_errors.iter().sum::<f64>() / sq_errors.len() as f64).sqrt())
    };
    let loc = ekf.location();
    Ok(ReplaySummary {
        observations: recording.observations.len(),
        applied,
        rejected,
        predictions: ekf.get_state().predictions,
        final_position: [loc.x, loc.y, loc.z],
        rmse,
        final_error,
    })
}

/// Circular ground-truth trajectory for synthesized logs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SynthesisOptions {
    pub center: [f64; 2],
    pub radius: f64,
    pub height: f64,
    /// Tangential speed along the circle [m/s]
    pub speed: f64,
    pub duration: f64,
    /// Observation cycles per second
    pub rate_hz: f64,
    pub noise_std: f64,
    pub scheme: PairScheme,
    pub seed: u64,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            center: [2.3, 2.4],
            radius: 1.0,
            height: 0.0,
            speed: 0.5,
            duration: 20.0,
            rate_hz: 60.0,
            noise_std: 0.05,
            scheme: PairScheme::AllPairs,
            seed: 0,
        }
    }
}

/// Simulate a log of noisy observations along a circle
pub fn synthesize(anchors: &[AnchorConfig], options: &SynthesisOptions) -> NavResult<ReplayLog> {
    if !(options.rate_hz.is_finite() && options.rate_hz > 0.0)
        || !(options.duration.is_finite() && options.duration >= 0.0)
        || !(options.radius.is_finite() && options.radius >= 0.0)
    {
        return Err(NavError::Configuration(
            "synthesis needs a positive rate and non-negative duration and radius".into(),
        ));
    }
    let registry = AnchorRegistry::from_survey(anchors)?;
    let mut sim = TdoaSimulator::new(registry, options.scheme, options.noise_std, options.seed)?;

    let cycles = (options.duration * options.rate_hz).floor() as usize;
    let omega = if options.radius > 0.0 {
        options.speed / options.radius
    } else {
        0.0
    };
    let mut observations = Vec::new();
    for k in 0..cycles {
        let t = k as f64 / options.rate_hz;
        let theta = omega * t;
        let truth = Position3::new(
            options.center[0] + options.radius * theta.cos(),
            options.center[1] + options.radius * theta.sin(),
            options.height,
        );
        observations.extend(sim.observe(&truth, t));
    }

    Ok(ReplayLog {
        anchors: Some(anchors.to_vec()),
        observations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_anchor_survey, EstimatorConfig};

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tdoa_nav_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_save_load_plain_and_gzip() {
        let options = SynthesisOptions {
            duration: 0.5,
            ..SynthesisOptions::default()
        };
        let log = synthesize(&default_anchor_survey(), &options).unwrap();
        assert_eq!(log.observations.len(), 30 * 6);

        for name in ["log.json", "log.json.gz"] {
            let path = temp_path(name);
            log.save(&path).unwrap();
            let loaded = ReplayLog::load(&path).unwrap();
            assert_eq!(loaded.observations.len(), log.observations.len());
            assert_eq!(loaded.anchors, log.anchors);
            assert_eq!(loaded.observations[7].reference, log.observations[7].reference);
            let _ = std::fs::remove_file(&path);
        }
    }

    #[test]
    fn test_minimal_log_parses() {
        let json = r#"{ "observations": [ { "reference": 0, "other": 2, "range_difference": 0.3 } ] }"#;
        let log: ReplayLog = serde_json::from_str(json).unwrap();
        assert!(log.anchors.is_none());
        assert_eq!(log.observations[0].timestamp, 0.0);
        assert!(log.observations[0].truth.is_none());
    }

    #[test]
    fn test_replay_static_target() {
        let options = SynthesisOptions {
            center: [2.5, 2.0],
            radius: 0.0,
            height: 1.0,
            duration: 5.0,
            noise_std: 0.02,
            ..SynthesisOptions::default()
        };
        let log = synthesize(&default_anchor_survey(), &options).unwrap();
        let mut ekf = TdoaEkf::new(EstimatorConfig::default(), &default_anchor_survey()).unwrap();
        let summary = replay(&mut ekf, &log).unwrap();

        assert_eq!(summary.applied, log.observations.len());
        assert_eq!(summary.rejected, 0);
        assert!(summary.predictions >= 300);
        assert!(summary.final_error.unwrap() < 0.15);
        assert!(summary.rmse.unwrap().is_finite());
    }

    #[test]
    fn test_replay_unknown_anchor_aborts() {
        let log = ReplayLog {
            anchors: None,
            observations: vec![TdoaObservation {
                timestamp: 0.0,
                reference: 0,
                other: 6,
                range_difference: 0.1,
                truth: None,
            }],
        };
        let mut ekf = TdoaEkf::default();
        assert!(matches!(replay(&mut ekf, &log), Err(NavError::AnchorNotFound(6))));
    }

    fn static_log(duration: f64) -> ReplayLog {
        let options = SynthesisOptions {
            center: [2.5, 2.0],
            radius: 0.0,
            height: 1.0,
            duration,
            noise_std: 0.02,
            ..SynthesisOptions::default()
        };
        synthesize(&default_anchor_survey(), &options).unwrap()
    }

    #[test]
    fn test_replay_bounds_predictions_for_huge_timestamp() {
        let mut log = static_log(0.1);
        log.observations.truncate(2);
        log.observations[0].timestamp = 0.0;
        log.observations[1].timestamp = 1e300;

        let mut ekf = TdoaEkf::default();
        let max_steps = (MAX_PREDICT_GAP / ekf.config().timestep).ceil() as u64;
        let summary = replay(&mut ekf, &log).unwrap();
        assert_eq!(summary.predictions, 1 + max_steps);
        assert_eq!(summary.applied, 2);
    }

    #[test]
    fn test_replay_resyncs_after_epoch_jump() {
        let mut log = static_log(2.0);
        // Early entries without timestamps, the rest on a Unix-epoch clock
        for (k, obs) in log.observations.iter_mut().enumerate() {
            if k < 30 {
                obs.timestamp = 0.0;
            } else {
                obs.timestamp += 1.7e9;
            }
        }

        let mut ekf = TdoaEkf::default();
        let max_steps = (MAX_PREDICT_GAP / ekf.config().timestep).ceil() as u64;
        let summary = replay(&mut ekf, &log).unwrap();
        // One step for the zero block, the capped bridge, then ~2 s of regular steps
        assert!(summary.predictions > max_steps);
        assert!(summary.predictions < max_steps + 200);
        assert_eq!(summary.applied, log.observations.len());
        assert!(summary.final_position.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_replay_backwards_clock_does_not_predict() {
        let mut log = static_log(1.0);
        let n = log.observations.len();
        for (k, obs) in log.observations.iter_mut().enumerate() {
            obs.timestamp = if k < n / 2 { 1000.0 } else { 0.0 };
        }
        let mut ekf = TdoaEkf::default();
        let summary = replay(&mut ekf, &log).unwrap();
        // One step at t=1000, none after the clock resets to 0
        assert_eq!(summary.predictions, 1);
        assert_eq!(summary.applied, n);
    }

    #[test]
    fn test_replay_rejects_non_finite_timestamp() {
        let mut log = static_log(0.1);
        log.observations[3].timestamp = f64::INFINITY;
        let mut ekf = TdoaEkf::default();
        assert!(matches!(
            replay(&mut ekf, &log),
            Err(NavError::Configuration(_))
        ));
    }

    #[test]
    fn test_synthesize_rejects_bad_rate() {
        let options = SynthesisOptions {
            rate_hz: 0.0,
            ..SynthesisOptions::default()
        };
        assert!(synthesize(&default_anchor_survey(), &options).is_err());
    }
}
