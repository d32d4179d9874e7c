use std::time::{Duration, Instant};

use log::{debug, info};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Idle,
    Calibrating,
}

/// What happened on a call to `CalibrationController::update`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationTransition {
    /// Idle -> Calibrating; every sensor's background must be cleared now
    Started,
    /// Calibrating -> Idle
    Finished,
}

/// Timed calibration window shared by all sensors. While calibrating, the
/// sensors rebuild their backgrounds and report no foreground.
pub struct CalibrationController {
    state: CalibrationState,
    started_at: Option<Instant>,
    duration: Duration,
    requested: bool,
}

impl CalibrationController {
    pub fn new(duration: Duration) -> Self {
        CalibrationController {
            state: CalibrationState::Idle,
            started_at: None,
            duration,
            requested: false,
        }
    }

    /// Ask for a new calibration window. Ignored while already calibrating.
    pub fn request(&mut self) {
        match self.state {
            CalibrationState::Idle => {
                debug!("Calibration requested");
                self.requested = true;
            }
            CalibrationState::Calibrating => {
                debug!("Calibration already in progress; request ignored");
            }
        }
    }

    /// Applies to the window in progress, too
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    /// Called once per tick, before any sensor is updated
    pub fn update(&mut self, now: Instant) -> Option<CalibrationTransition> {
        match self.state {
            CalibrationState::Calibrating => {
                if self.elapsed(now) >= self.duration {
                    info!("Calibration finished after {:?}", self.elapsed(now));
                    self.state = CalibrationState::Idle;
                    self.started_at = None;
                    self.requested = false;
                    Some(CalibrationTransition::Finished)
                } else {
                    None
                }
            }
            CalibrationState::Idle => {
                if self.requested {
                    info!("Calibration started; duration {:?}", self.duration);
                    self.state = CalibrationState::Calibrating;
                    self.started_at = Some(now);
                    Some(CalibrationTransition::Started)
                } else {
                    None
                }
            }
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn is_calibrating(&self) -> bool {
        self.state == CalibrationState::Calibrating
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
    }

    /// Fraction of the window elapsed, in [0,1]; 0 when idle
    pub fn progress(&self, now: Instant) -> f32 {
        if !self.is_calibrating() {
            return 0.;
        }
        if self.duration.is_zero() {
            return 1.;
        }
        (self.elapsed(now).as_secs_f32() / self.duration.as_secs_f32()).clamp(0., 1.)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(2000);

    #[test]
    fn test_idle_without_request() {
        let mut controller = CalibrationController::new(WINDOW);
        assert_eq!(controller.update(Instant::now()), None);
        assert_eq!(controller.state(), CalibrationState::Idle);
    }

    #[test]
    fn test_exits_exactly_at_duration() {
        let start = Instant::now();
        let mut controller = CalibrationController::new(WINDOW);
        controller.request();
        assert_eq!(
            controller.update(start),
            Some(CalibrationTransition::Started)
        );
        assert!(controller.is_calibrating());

        let almost = start + WINDOW - Duration::from_millis(1);
        assert_eq!(controller.update(almost), None);
        assert!(controller.is_calibrating());

        assert_eq!(
            controller.update(start + WINDOW),
            Some(CalibrationTransition::Finished)
        );
        assert_eq!(controller.state(), CalibrationState::Idle);
        assert_eq!(controller.update(start + WINDOW * 2), None);
    }

    #[test]
    fn test_request_while_calibrating_is_ignored() {
        let start = Instant::now();
        let mut controller = CalibrationController::new(WINDOW);
        controller.request();
        controller.update(start);

        controller.request();
        let halfway = start + WINDOW / 2;
        assert_eq!(controller.update(halfway), None);

        // No restart: still ends at the first deadline
        assert_eq!(
            controller.update(start + WINDOW),
            Some(CalibrationTransition::Finished)
        );
        // ...and nothing was queued
        assert_eq!(controller.update(start + WINDOW * 3), None);
        assert!(!controller.is_calibrating());
    }

    #[test]
    fn test_progress() {
        let start = Instant::now();
        let mut controller = CalibrationController::new(WINDOW);
        assert_eq!(controller.progress(start), 0.);
        controller.request();
        controller.update(start);
        assert_eq!(controller.progress(start), 0.);
        assert!((controller.progress(start + WINDOW / 4) - 0.25).abs() < 0.001);
        assert_eq!(controller.progress(start + WINDOW * 2), 1.);
    }

    #[test]
    fn test_zero_duration_finishes_next_tick() {
        let start = Instant::now();
        let mut controller = CalibrationController::new(Duration::ZERO);
        controller.request();
        assert_eq!(
            controller.update(start),
            Some(CalibrationTransition::Started)
        );
        assert_eq!(controller.progress(start), 1.);
        assert_eq!(
            controller.update(start),
            Some(CalibrationTransition::Finished)
        );
    }
}
