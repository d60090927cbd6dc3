//! # Correction Module
//!
//! Rigid-body coupling between corner heights and body orientation, and the
//! bounded proportional step used while converging.
//!
//! ## Coupling
//!
//! Raising one corner tilts the body in a known direction. With roll
//! positive to the right and pitch positive nose-up:
//!
//! | corner     | response         |
//! |------------|------------------|
//! | frontLeft  | `roll − pitch`   |
//! | frontRight | `−roll − pitch`  |
//! | rearLeft   | `roll + pitch`   |
//! | rearRight  | `−roll + pitch`  |
//!
//! Polarity detection evaluates it on measured deltas; convergence evaluates
//! it on the step-limited error to get each corner's trim delta.
//!
//! ## Step limit
//!
//! Each axis contributes at most `step` degrees per iteration regardless of
//! how large the error is:
//!
//! `adj = min(|error|, step) × sign(error)`
//!
//! ## Usage
//!
//! ```
//! use suspension_tuner::device::ActuatorKey;
//! use suspension_tuner::leveling::correction::Correction;
//!
//! let correction = Correction::step(10.0, 0.0, 2.0);
//! assert_eq!(correction.delta(ActuatorKey::FrontLeft), 2.0);
//! assert_eq!(correction.delta(ActuatorKey::FrontRight), -2.0);
//! ```

use crate::device::types::ActuatorKey;

/// Signed response of one corner to a change in roll and pitch.
///
/// # Examples
///
/// ```
/// use suspension_tuner::device::ActuatorKey;
/// use suspension_tuner::leveling::correction::coupling;
///
/// assert_eq!(coupling(ActuatorKey::FrontRight, -4.0, -1.0), 5.0);
/// assert_eq!(coupling(ActuatorKey::RearLeft, 1.0, 2.0), 3.0);
/// ```
#[must_use]
pub fn coupling(key: ActuatorKey, roll: f64, pitch: f64) -> f64 {
    match key {
        ActuatorKey::FrontLeft => roll - pitch,
        ActuatorKey::FrontRight => -roll - pitch,
        ActuatorKey::RearLeft => roll + pitch,
        ActuatorKey::RearRight => -roll + pitch,
    }
}

/// Limits `error` to `step` in magnitude, keeping its sign. Zero and NaN
/// map to zero.
#[must_use]
pub fn limit(error: f64, step: f64) -> f64 {
    if error == 0.0 || error.is_nan() {
        return 0.0;
    }
    error.abs().min(step) * error.signum()
}

/// One iteration's step-limited correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    roll_adj: f64,
    pitch_adj: f64,
}

impl Correction {
    /// Builds the correction for a measured orientation.
    ///
    /// # Arguments
    ///
    /// * `roll` - Current roll in degrees
    /// * `pitch` - Current pitch in degrees
    /// * `step` - Per-axis cap in degrees
    #[must_use]
    pub fn step(roll: f64, pitch: f64, step: f64) -> Self {
        Self {
            roll_adj: limit(roll, step),
            pitch_adj: limit(pitch, step),
        }
    }

    #[must_use]
    pub fn roll_adj(&self) -> f64 {
        self.roll_adj
    }

    #[must_use]
    pub fn pitch_adj(&self) -> f64 {
        self.pitch_adj
    }

    /// Trim delta for one corner, before clamping.
    #[must_use]
    pub fn delta(&self, key: ActuatorKey) -> f64 {
        coupling(key, self.roll_adj, self.pitch_adj)
    }
}

/// Applies `delta` to `current`, clamps to `±max` and rounds to whole degrees.
///
/// # Examples
///
/// ```
/// use suspension_tuner::leveling::correction::next_trim;
///
/// assert_eq!(next_trim(5, 2.0, 20), 7);
/// assert_eq!(next_trim(19, 4.0, 20), 20);
/// assert_eq!(next_trim(-20, -2.0, 20), -20);
/// assert_eq!(next_trim(0, 1.4, 20), 1);
/// ```
#[must_use]
pub fn next_trim(current: i32, delta: f64, max: i32) -> i32 {
    let bound = f64::from(max.abs());
    let target = (f64::from(current) + delta).clamp(-bound, bound);
    // Clamped to ±max, so the cast cannot overflow
    target.round() as i32
}
