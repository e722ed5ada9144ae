//! Range-difference state estimation
//!
//! Anchor bookkeeping and the constant-velocity TDOA Extended Kalman Filter.

pub mod anchors;
pub mod tdoa_ekf;

pub use anchors::{AnchorRegistry, MAX_ANCHORS};
pub use tdoa_ekf::{TdoaEkf, TdoaEkfState};
