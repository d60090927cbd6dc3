//! # Polarity Detection
//!
//! Decides from one test movement whether a corner responds opposite to
//! what a positive trim should do.

use crate::device::types::ActuatorKey;

use super::correction::coupling;

/// Sign the corner's coupled response takes when a positive trim raises it.
#[must_use]
pub fn expected_sign(key: ActuatorKey) -> f64 {
    match key {
        ActuatorKey::FrontLeft | ActuatorKey::RearLeft => 1.0,
        ActuatorKey::FrontRight | ActuatorKey::RearRight => -1.0,
    }
}

/// Outcome of one test movement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolarityProbe {
    pub key: ActuatorKey,
    /// Coupled response to a positive trim step
    pub actual_change: f64,
}

impl PolarityProbe {
    /// Builds a probe from the measured orientation change.
    ///
    /// `direction` is the sign of the test step that produced the change.
    /// A negative step's response is negated so the probe always describes
    /// a positive step.
    #[must_use]
    pub fn measure(key: ActuatorKey, d_roll: f64, d_pitch: f64, direction: i32) -> Self {
        let mut actual_change = coupling(key, d_roll, d_pitch);
        if direction < 0 {
            actual_change = -actual_change;
        }
        Self { key, actual_change }
    }

    /// True when the corner moved against its expected direction by more
    /// than `threshold`.
    #[must_use]
    pub fn is_opposite(&self, threshold: f64) -> bool {
        expected_sign(self.key) * self.actual_change < -threshold
    }

    /// New `reversed` flag given the current one.
    #[must_use]
    pub fn resolve(&self, current: bool, threshold: f64) -> bool {
        if self.is_opposite(threshold) {
            !current
        } else {
            current
        }
    }
}
