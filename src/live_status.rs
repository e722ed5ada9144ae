use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::ControlCommand;

/// Periodic run summary written next to the session output
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: f64,
    // Estimator
    pub observations: u64,
    pub tdoa_updates: u64,
    pub rejected_updates: u64,
    pub predictions: u64,
    pub position: [f64; 3],
    pub position_std: f64,
    /// Distance between estimate and ground truth, when truth is known [m]
    pub position_error: Option<f64>,
    // Controller
    pub control_solves: u64,
    pub control_failures: u64,
    pub last_command: ControlCommand,
    pub last_solve_ms: f64,
    pub heading_deg: Option<f64>,
}

impl LiveStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            ..Self::default()
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        let path = std::env::temp_dir().join(format!("tdoa_nav_status_{}.json", std::process::id()));
        let mut status = LiveStatus::new();
        status.observations = 120;
        status.position = [2.5, 2.0, 1.0];
        status.position_error = Some(0.04);
        status.last_command = ControlCommand { steering: 0.1, speed: 1.0 };
        status.save(&path).unwrap();

        let loaded = LiveStatus::load(&path).unwrap();
        assert_eq!(loaded, status);
        let _ = fs::remove_file(&path);
    }
}
