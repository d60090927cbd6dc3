//! # Auto-Level Controller
//!
//! Sequences polarity detection and convergence for one rig.
//!
//! The controller runs as a single sequential task. Corners are probed one
//! at a time because all four share the one orientation sensor. Settle
//! waits are plain sleeps that run to completion regardless of network
//! timeouts.
//!
//! Only one session (auto-level or manual calibration) may run at a time.
//! The slot is held by an RAII guard, so a session that errors or whose
//! future is dropped still frees it.
//!
//! If a step fails the session ends in `Failed`. A corner caught mid test
//! movement gets one best-effort restore; all other trims stay where they
//! were last commanded.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::correction::{next_trim, Correction};
use super::polarity::PolarityProbe;
use super::session::{Phase, Session, SessionOutcome, SessionReport, SessionStatus};
use crate::actuator::{Actuator, ServoParam, ServoValue};
use crate::config::LevelingConfig;
use crate::device::types::{ActuatorKey, ActuatorSet};
use crate::device::DeviceClient;
use crate::error::{DeviceError, Result, TunerError};
use crate::sensors::OrientationSource;

/// Stores the current orientation as the level reference.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LevelCalibrator: Send + Sync {
    async fn calibrate_orientation(&self) -> std::result::Result<(), DeviceError>;
}

#[async_trait]
impl LevelCalibrator for DeviceClient {
    async fn calibrate_orientation(&self) -> std::result::Result<(), DeviceError> {
        DeviceClient::calibrate_orientation(self).await
    }
}

/// Releases the session slot and resets the published status.
struct ActiveGuard {
    active: Arc<AtomicBool>,
    status: Arc<watch::Sender<SessionStatus>>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.status.send_replace(SessionStatus::idle());
        self.active.store(false, Ordering::Release);
    }
}

pub struct AutoLevelController {
    source: Arc<dyn OrientationSource>,
    actuator: Arc<dyn Actuator>,
    calibrator: Arc<dyn LevelCalibrator>,
    config: LevelingConfig,
    status: Arc<watch::Sender<SessionStatus>>,
    active: Arc<AtomicBool>,
}

impl AutoLevelController {
    pub fn new(
        source: Arc<dyn OrientationSource>,
        actuator: Arc<dyn Actuator>,
        calibrator: Arc<dyn LevelCalibrator>,
        config: LevelingConfig,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::idle());
        Self {
            source,
            actuator,
            calibrator,
            config,
            status: Arc::new(status),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Receiver for status updates. The controller is the only writer.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &LevelingConfig {
        &self.config
    }

    fn acquire(&self) -> Result<ActiveGuard> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TunerError::SessionActive)?;
        Ok(ActiveGuard {
            active: Arc::clone(&self.active),
            status: Arc::clone(&self.status),
        })
    }

    /// Runs one auto-level session to completion.
    ///
    /// Session failures are reported in the returned
    /// [`SessionReport::outcome`], not as an `Err`. The terminal status is
    /// held for the configured display time before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::SessionActive`] if a session is already running
    pub async fn trigger(&self) -> Result<SessionReport> {
        let _guard = self.acquire()?;
        let mut session = Session::default();
        info!("auto-level session started");

        let (report, hold) = match self.run(&mut session).await {
            Ok(()) => {
                session.status_message = "Level achieved!".to_string();
                let report = session.finish(SessionOutcome::Succeeded);
                (report, self.config.success_hold_ms)
            }
            Err(e) => {
                let reason = match &e {
                    TunerError::ConvergenceExhausted { .. } => format!("Auto-level failed: {}", e),
                    other => format!("Auto-level aborted: {}", other),
                };
                warn!(error = %e, iteration = session.iteration, "auto-level session failed");
                session.status_message = reason.clone();
                let report = session.finish(SessionOutcome::Failed(reason));
                (report, self.config.failure_hold_ms)
            }
        };

        info!(
            phase = %session.phase,
            iterations = report.iterations,
            writes = report.writes,
            "auto-level session finished"
        );
        self.publish(&session);
        sleep(Duration::from_millis(hold)).await;

        Ok(report)
    }

    /// Manual "set as level": stores the current orientation as level.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::SessionActive`] while an auto-level session or
    /// another calibration runs, or the device error if calibration fails
    pub async fn set_level(&self) -> Result<()> {
        let _guard = self.acquire()?;
        let mut session = Session::default();
        self.enter(&mut session, Phase::Calibrating, "Calibrating...");

        self.calibrator.calibrate_orientation().await?;
        info!("orientation calibrated");

        sleep(Duration::from_millis(self.config.success_hold_ms)).await;
        Ok(())
    }

    async fn run(&self, session: &mut Session) -> Result<()> {
        self.enter(session, Phase::DetectingPolarity, "Detecting servo directions...");

        let mut states = self.actuator.fetch_states().await?;
        self.clamp_initial(&mut states);

        self.detect_polarity(session, &mut states).await?;
        self.converge(session, &mut states).await
    }

    fn clamp_initial(&self, states: &mut ActuatorSet) {
        let max = self.config.max_adjustment_deg;
        for key in ActuatorKey::ALL {
            let state = states.get_mut(key);
            if state.trim.abs() > max {
                warn!(actuator = %key, trim = state.trim, max, "initial trim out of range, treating as clamped");
                state.trim = state.trim.clamp(-max, max);
            }
        }
    }

    async fn detect_polarity(&self, session: &mut Session, states: &mut ActuatorSet) -> Result<()> {
        let mut detected = BTreeMap::new();

        for key in ActuatorKey::ALL {
            self.announce(session, format!("Testing {}...", key));

            let initial = *states.get(key);
            let (test_trim, direction) = self.test_position(initial.trim);
            let baseline = self.orientation().await?;

            let moved = match self.probe(session, states, key, test_trim).await {
                Ok(moved) => moved,
                Err(e) => {
                    self.restore_after_abort(session, states, key, initial.trim).await;
                    return Err(e.into());
                }
            };

            self.write_trim(session, states, key, initial.trim).await?;
            sleep(Duration::from_millis(self.config.restore_settle_ms)).await;

            let probe = PolarityProbe::measure(key, moved.0 - baseline.0, moved.1 - baseline.1, direction);
            let reversed = probe.resolve(initial.reversed, self.config.polarity_threshold);
            debug!(actuator = %key, actual_change = probe.actual_change, reversed, "polarity probe");
            detected.insert(key, reversed);
        }

        session.detected_polarity = detected.clone();
        self.announce(session, "Applying reverse settings...");

        let mut flipped = false;
        for (key, reversed) in detected {
            if states.get(key).reversed != reversed {
                info!(actuator = %key, reversed, "actuator polarity changed");
                self.actuator
                    .write(key, ServoParam::Reversed, ServoValue::Flag(reversed))
                    .await?;
                session.writes += 1;
                states.get_mut(key).reversed = reversed;
                flipped = true;
            }
        }

        // A flipped flag mirrors the servo angle, so the corner moves
        if flipped {
            sleep(Duration::from_millis(self.config.polarity_settle_ms)).await;
        }

        Ok(())
    }

    /// Test position for a corner at `trim`, and the step's sign. Steps down
    /// instead of up when going up would leave the trim range.
    fn test_position(&self, trim: i32) -> (i32, i32) {
        let step = self.config.test_movement_deg;
        if trim + step <= self.config.max_adjustment_deg {
            (trim + step, 1)
        } else {
            (trim - step, -1)
        }
    }

    async fn probe(
        &self,
        session: &mut Session,
        states: &mut ActuatorSet,
        key: ActuatorKey,
        test_trim: i32,
    ) -> std::result::Result<(f64, f64), DeviceError> {
        self.write_trim(session, states, key, test_trim).await?;
        sleep(Duration::from_millis(self.config.detect_settle_ms)).await;
        self.orientation().await
    }

    async fn restore_after_abort(&self, session: &mut Session, states: &mut ActuatorSet, key: ActuatorKey, trim: i32) {
        match self.write_trim(session, states, key, trim).await {
            Ok(()) => info!(actuator = %key, trim, "restored test movement after error"),
            Err(e) => warn!(actuator = %key, trim, error = %e, "could not restore test movement"),
        }
    }

    async fn converge(&self, session: &mut Session, states: &mut ActuatorSet) -> Result<()> {
        let cfg = &self.config;
        self.enter(session, Phase::Converging, "Starting auto-level...");

        while session.iteration < cfg.max_iterations {
            let (roll, pitch) = self.orientation().await?;

            if roll.abs() < cfg.level_tolerance_deg && pitch.abs() < cfg.level_tolerance_deg {
                info!(roll, pitch, iterations = session.iteration, "level reached");
                return Ok(());
            }

            self.announce(
                session,
                format!("Adjusting... ({}/{})", session.iteration + 1, cfg.max_iterations),
            );

            let correction = Correction::step(roll, pitch, cfg.adjustment_step_deg);
            for key in ActuatorKey::ALL {
                let current = states.get(key).trim;
                let next = next_trim(current, correction.delta(key), cfg.max_adjustment_deg);
                if next != current {
                    self.write_trim(session, states, key, next).await?;
                }
            }

            sleep(Duration::from_millis(cfg.adjust_settle_ms)).await;
            session.iteration += 1;
            self.publish(session);
        }

        Err(TunerError::ConvergenceExhausted {
            iterations: session.iteration,
        })
    }

    async fn orientation(&self) -> std::result::Result<(f64, f64), DeviceError> {
        self.source.snapshot().await?.orientation()
    }

    async fn write_trim(
        &self,
        session: &mut Session,
        states: &mut ActuatorSet,
        key: ActuatorKey,
        trim: i32,
    ) -> std::result::Result<(), DeviceError> {
        self.actuator.write(key, ServoParam::Trim, ServoValue::Degrees(trim)).await?;
        session.writes += 1;
        states.get_mut(key).trim = trim;
        Ok(())
    }

    fn enter(&self, session: &mut Session, phase: Phase, message: &str) {
        info!(from = %session.phase, to = %phase, "session phase");
        session.phase = phase;
        session.status_message = message.to_string();
        self.publish(session);
    }

    fn announce(&self, session: &mut Session, message: impl Into<String>) {
        session.status_message = message.into();
        debug!(status = %session.status_message, "session status");
        self.publish(session);
    }

    fn publish(&self, session: &Session) {
        self.status.send_replace(session.status());
    }
}

impl std::fmt::Debug for AutoLevelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoLevelController")
            .field("config", &self.config)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
