//! Glue between position estimates and the trajectory controller:
//! heading from successive fixes and a reference polynomial from a waypoint path.

use serde::{Deserialize, Serialize};

use super::kinematics::{to_vehicle_frame, ReferencePolynomial};
use crate::error::{NavError, NavResult};
use crate::types::{LocalState, VehicleState};

/// Heading from the displacement between position fixes
#[derive(Clone, Debug)]
pub struct HeadingTracker {
    /// Displacements shorter than this keep the previous heading [m]
    min_step: f64,
    anchor: Option<(f64, f64)>,
    heading: Option<f64>,
}

impl HeadingTracker {
    pub fn new(min_step: f64) -> Self {
        Self {
            min_step: min_step.max(0.0),
            anchor: None,
            heading: None,
        }
    }

    /// Feed a position fix; returns the current heading once one is known
    pub fn update(&mut self, x: f64, y: f64) -> Option<f64> {
        if !x.is_finite() || !y.is_finite() {
            return self.heading;
        }
        match self.anchor {
            None => self.anchor = Some((x, y)),
            Some((ax, ay)) => {
                let (dx, dy) = (x - ax, y - ay);
                if dx.hypot(dy) >= self.min_step && (dx != 0.0 || dy != 0.0) {
                    self.heading = Some(dy.atan2(dx));
                    self.anchor = Some((x, y));
                }
            }
        }
        self.heading
    }

    pub fn heading(&self) -> Option<f64> {
        self.heading
    }

    pub fn reset(&mut self) {
        self.anchor = None;
        self.heading = None;
    }
}

/// Ordered waypoints in the world frame
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WaypointPath {
    waypoints: Vec<(f64, f64)>,
    /// Wrap around from the last waypoint to the first
    closed: bool,
    /// Waypoints handed to each polynomial fit
    lookahead: usize,
    fit_order: usize,
    /// Distance at which the final waypoint of an open path counts as reached [m]
    arrival_radius: f64,
}

impl WaypointPath {
    pub fn new(waypoints: Vec<(f64, f64)>, closed: bool) -> NavResult<Self> {
        if waypoints.len() < 2 {
            return Err(NavError::Configuration(format!(
                "waypoint path needs at least 2 points, got {}",
                waypoints.len()
            )));
        }
        if waypoints.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(NavError::Configuration("waypoints must be finite".into()));
        }
        Ok(Self {
            waypoints,
            closed,
            lookahead: 6,
            fit_order: 3,
            arrival_radius: 0.3,
        })
    }

    /// Closed circle sampled counter-clockwise
    pub fn circle(center: (f64, f64), radius: f64, count: usize) -> NavResult<Self> {
        if count < 3 || !(radius.is_finite() && radius > 0.0) {
            return Err(NavError::Configuration(format!(
                "circle needs radius > 0 and at least 3 points, got r={radius}, n={count}"
            )));
        }
        let waypoints = (0..count)
            .map(|i| {
                let theta = 2.0 * std::f64::consts::PI * i as f64 / count as f64;
                (center.0 + radius * theta.cos(), center.1 + radius * theta.sin())
            })
            .collect();
        Self::new(waypoints, true)
    }

    pub fn with_lookahead(mut self, lookahead: usize) -> Self {
        self.lookahead = lookahead.max(2);
        self
    }

    pub fn waypoints(&self) -> &[(f64, f64)] {
        &self.waypoints
    }

    /// Index of the waypoint closest to `(x, y)`
    pub fn nearest(&self, x: f64, y: f64) -> usize {
        self.waypoints
            .iter()
            .enumerate()
            .map(|(i, (wx, wy))| (i, (wx - x).hypot(wy - y)))
            .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
            .0
    }

    /// Up to `lookahead` waypoints starting at `start`
    pub fn window(&self, start: usize) -> Vec<(f64, f64)> {
        let n = self.waypoints.len();
        let count = self.lookahead.min(n);
        if self.closed {
            (0..count).map(|k| self.waypoints[(start + k) % n]).collect()
        } else {
            let first = start.min(n - 2);
            self.waypoints[first..(first + count).min(n)].to_vec()
        }
    }

    /// True once an open path's final waypoint is within the arrival radius
    pub fn reached_end(&self, pose: &VehicleState) -> bool {
        if self.closed {
            return false;
        }
        let (lx, ly) = self.waypoints[self.waypoints.len() - 1];
        (lx - pose.x).hypot(ly - pose.y) < self.arrival_radius
    }

    /// Vehicle-frame reference polynomial and controller input for `pose`
    pub fn reference_for(&self, pose: &VehicleState) -> NavResult<(ReferencePolynomial, LocalState)> {
        let nearest = self.nearest(pose.x, pose.y);
        // One waypoint behind keeps the fit anchored around the vehicle
        let n = self.waypoints.len();
        let start = if self.closed {
            (nearest + n - 1) % n
        } else {
            nearest.saturating_sub(1)
        };

        let local = to_vehicle_frame(pose, &self.window(start));
        let order = self.fit_order.min(local.len() - 1);
        let poly = ReferencePolynomial::fit(&local, order)?;
        Ok((poly, poly.local_state()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_heading_tracker() {
        let mut tracker = HeadingTracker::new(0.05);
        assert_eq!(tracker.update(0.0, 0.0), None);
        // Below the minimum step: no heading yet
        assert_eq!(tracker.update(0.01, 0.01), None);
        let heading = tracker.update(0.0, 1.0).unwrap();
        assert_abs_diff_eq!(heading, FRAC_PI_2, epsilon = 1e-12);
        // Jitter keeps the last heading
        assert_eq!(tracker.update(0.01, 1.0), Some(heading));
        tracker.reset();
        assert_eq!(tracker.heading(), None);
    }

    #[test]
    fn test_nearest_and_window() {
        let path = WaypointPath::circle((0.0, 0.0), 1.0, 8).unwrap().with_lookahead(4);
        assert_eq!(path.nearest(1.1, 0.0), 0);
        assert_eq!(path.nearest(0.0, -0.9), 6);
        let window = path.window(6);
        assert_eq!(window.len(), 4);
        assert_eq!(window[2], path.waypoints()[0]);
    }

    #[test]
    fn test_open_path_window_clamps() {
        let points = (0..5).map(|i| (i as f64, 0.0)).collect();
        let path = WaypointPath::new(points, false).unwrap().with_lookahead(3);
        assert_eq!(path.window(4), vec![(3.0, 0.0), (4.0, 0.0)]);
        assert!(path.reached_end(&VehicleState { x: 3.9, y: 0.1, heading: 0.0 }));
        assert!(!path.reached_end(&VehicleState { x: 2.0, y: 0.0, heading: 0.0 }));
    }

    #[test]
    fn test_reference_for_offset_vehicle() {
        let points = (0..10).map(|i| (i as f64 * 0.5, 0.0)).collect();
        let path = WaypointPath::new(points, false).unwrap();
        let pose = VehicleState { x: 1.0, y: 0.5, heading: 0.0 };
        let (poly, state) = path.reference_for(&pose).unwrap();
        // Path runs half a meter to the vehicle's right
        assert_abs_diff_eq!(state.cte, -0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(state.heading_error, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(poly.slope(0.0), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_invalid_paths_rejected() {
        assert!(WaypointPath::new(vec![(0.0, 0.0)], false).is_err());
        assert!(WaypointPath::new(vec![(0.0, 0.0), (f64::NAN, 1.0)], false).is_err());
        assert!(WaypointPath::circle((0.0, 0.0), 0.0, 8).is_err());
    }
}
