//! Lift-actuator state machine
//!
//! Coordinates a stepper-motor waveform generator, two debounced limit
//! switches, a quadrature step counter, closed-loop position control,
//! open-loop speed control, and self-calibration. The state machine is a
//! plain step function driven from a poll loop — no coroutines, no owned
//! interrupt registration. The board wires real ISRs to
//! [`LiftActuator::on_limit_switch_update`] and [`LiftActuator::note_step`]
//! and polls [`LiftActuator::step`] from its foreground loop.
//!
//! Callers on hardware that services these from interrupt context must
//! call [`LiftActuator::process_event`] and [`LiftActuator::step`] with
//! interrupts disabled for the duration of the call, per the source
//! system's event-dispatch contract; this crate has no interrupt
//! mechanism of its own to enforce that.

#![no_std]

use fw_hal::{Direction, StepperDriver};

/// Default travel range discovered before the first calibration.
pub const DEFAULT_MAX_POSITION: i16 = 2000;
/// Fastest half-period the stepper waveform will run at.
pub const MINIMUM_HALF_PERIOD: i16 = 30;
/// Half-period used during calibration search.
pub const DEFAULT_HALF_PERIOD: u16 = 35;
/// Slowest half-period the stepper waveform will run at.
pub const MAXIMUM_HALF_PERIOD: i16 = 40;

/// Mechanical travel range of the end effector, in millimetres.
pub const RANGE_MM: i32 = 140;
/// Lower bound (inclusive, magnitude) of a valid speed-control setpoint.
pub const SPEED_MIN_MM_PER_SEC: i8 = 10;
/// Upper bound (inclusive, magnitude) of a valid speed-control setpoint.
pub const SPEED_MAX_MM_PER_SEC: i8 = 25;

const F_CPU: u32 = 8_000_000;
const TIMER0_PRESCALE: u32 = 1024;

/// Position error, in steps, below which the position controller
/// considers the target reached.
const POSITION_ERROR_THRESHOLD: i32 = 2;

/// Lift-actuator system state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Inactive,
    ActivePositionCtrl,
    ActiveSpeedCtrl,
    CalibrationSrchTop,
    CalibrationSrchBtm,
}

/// An event fed to [`LiftActuator::process_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    Stop,
    LimitSwitchPressed,
    StartCalibration,
    StartPositionCtrl,
    StartSpeedCtrl,
}

/// Rolling bit-shift debouncer for one interrupt's worth of switch lines.
///
/// Feed it hardware samples until it reports settled; matches the
/// original's "shift into a 32-bit register seeded with an alternating
/// pattern until it reads all-0 or all-1" technique, which converges in a
/// bounded, input-independent number of iterations.
pub struct Debouncer {
    upper: u32,
    lower: u32,
}

impl Debouncer {
    const SEED: u32 = 0xAAAA_AAAA;

    pub const fn new() -> Self {
        Debouncer {
            upper: Self::SEED,
            lower: Self::SEED,
        }
    }

    /// Feeds one raw sample of both switch lines. Returns the settled
    /// `(upper, lower)` states once both registers have converged to
    /// all-0 or all-1; `None` while still bouncing.
    pub fn sample(&mut self, upper_bit: bool, lower_bit: bool) -> Option<(bool, bool)> {
        self.upper = (self.upper << 1) | (upper_bit as u32);
        self.lower = (self.lower << 1) | (lower_bit as u32);
        let settled = |reg: u32| reg == 0 || reg == u32::MAX;
        if settled(self.upper) && settled(self.lower) {
            Some((self.upper == u32::MAX, self.lower == u32::MAX))
        } else {
            None
        }
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the quadrature step-timer compare-match sample and decides
/// whether the step counter should advance forward.
///
/// `channel_b_mask` selects the stepper's B-channel output bit within
/// `port`.
pub fn step_is_forward(port: u8, channel_b_mask: u8) -> bool {
    ((port ^ (port << 1)) & channel_b_mask) == 0
}

/// The lift-actuator state machine, generic over the concrete stepper
/// waveform generator `S`.
pub struct LiftActuator<S> {
    state: SystemState,
    stepper: S,
    max_position: i16,
    step_counter: i16,
    upper_switch: bool,
    lower_switch: bool,
    position_target: i16,
    position_half_period: u16,
    position_direction: Direction,
    speed_half_period: u16,
    speed_direction: Direction,
}

impl<S: StepperDriver> LiftActuator<S> {
    pub fn new(stepper: S) -> Self {
        LiftActuator {
            state: SystemState::Inactive,
            stepper,
            max_position: DEFAULT_MAX_POSITION,
            step_counter: 0,
            upper_switch: false,
            lower_switch: false,
            position_target: 0,
            position_half_period: DEFAULT_HALF_PERIOD,
            position_direction: Direction::Forward,
            speed_half_period: DEFAULT_HALF_PERIOD,
            speed_direction: Direction::Forward,
        }
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn max_position(&self) -> i16 {
        self.max_position
    }

    pub fn upper_switch(&self) -> bool {
        self.upper_switch
    }

    pub fn lower_switch(&self) -> bool {
        self.lower_switch
    }

    /// Raw step count since the last calibration or power-up. Callers on
    /// hardware where the step counter is updated from interrupt context
    /// must sample this under a critical section.
    pub fn step_counter(&self) -> i16 {
        self.step_counter
    }

    /// Dispatches a state-machine event. Must be called with interrupts
    /// disabled on hardware where the counterpart ISRs can also raise
    /// events, since it may itself be invoked from such an ISR.
    pub fn process_event(&mut self, event: SystemEvent) {
        match event {
            SystemEvent::LimitSwitchPressed => {
                self.stepper.disable();
                match self.state {
                    SystemState::CalibrationSrchBtm => {
                        if self.upper_switch {
                            self.step_counter = 0;
                            self.state = SystemState::CalibrationSrchTop;
                        }
                    }
                    SystemState::CalibrationSrchTop => {
                        if self.lower_switch {
                            self.max_position = self.step_counter;
                            self.state = SystemState::Inactive;
                        }
                    }
                    _ => self.state = SystemState::Inactive,
                }
            }
            SystemEvent::Stop => {
                self.stepper.disable();
                self.state = SystemState::Inactive;
            }
            SystemEvent::StartCalibration => self.state = SystemState::CalibrationSrchBtm,
            SystemEvent::StartPositionCtrl => self.state = SystemState::ActivePositionCtrl,
            SystemEvent::StartSpeedCtrl => self.state = SystemState::ActiveSpeedCtrl,
        }
    }

    /// Feeds one debounced limit-switch reading. Raises
    /// `LimitSwitchPressed` on a false-to-true transition of either
    /// switch, matching the source ISR's edge-triggering.
    pub fn on_limit_switch_update(&mut self, upper: bool, lower: bool) {
        let upper_prev = self.upper_switch;
        let lower_prev = self.lower_switch;
        self.upper_switch = upper;
        self.lower_switch = lower;
        if (upper && upper != upper_prev) || (lower && lower != lower_prev) {
            self.process_event(SystemEvent::LimitSwitchPressed);
        }
    }

    /// Feeds one quadrature step-timer sample.
    pub fn note_step(&mut self, forward: bool) {
        self.step_counter = if forward {
            self.step_counter.wrapping_add(1)
        } else {
            self.step_counter.wrapping_sub(1)
        };
    }

    /// Sets an open-loop speed target in mm/sec. Values with magnitude
    /// outside `[SPEED_MIN_MM_PER_SEC, SPEED_MAX_MM_PER_SEC]` are ignored.
    pub fn set_speed(&mut self, mm_per_sec: i8) {
        let magnitude = mm_per_sec.unsigned_abs();
        if magnitude >= SPEED_MIN_MM_PER_SEC as u8 && magnitude <= SPEED_MAX_MM_PER_SEC as u8 {
            let half_period = (RANGE_MM as u32 * F_CPU / (TIMER0_PRESCALE * self.max_position as u32))
                / magnitude as u32;
            self.speed_half_period = half_period as u16;
            self.speed_direction = if mm_per_sec < 0 {
                Direction::Reverse
            } else {
                Direction::Forward
            };
        }
    }

    /// Sets a closed-loop position target in mm. Values above
    /// `RANGE_MM` are ignored.
    pub fn set_position(&mut self, mm: u8) {
        if (mm as i32) <= RANGE_MM {
            self.position_target = (self.max_position as i32 * mm as i32 / RANGE_MM) as i16;
        }
    }

    /// The current position in mm, clamped to `[0, 255]`.
    pub fn position(&self) -> u8 {
        let position = self.step_counter as i32 * RANGE_MM / self.max_position as i32;
        if position > u8::MAX as i32 {
            u8::MAX
        } else if position < 0 {
            0
        } else {
            position as u8
        }
    }

    fn step_position_controller(&mut self) {
        let error = self.position_target as i32 - self.step_counter as i32;
        if error < POSITION_ERROR_THRESHOLD && error > -POSITION_ERROR_THRESHOLD {
            self.process_event(SystemEvent::Stop);
            return;
        }
        // Preserves the observed (inverted) speed-vs-error slope: the
        // half-period is smallest near zero error and largest near full
        // scale, rather than decelerating into the target.
        if error < 0 {
            let output = error * (-MAXIMUM_HALF_PERIOD as i32 + MINIMUM_HALF_PERIOD as i32) / self.max_position as i32
                - MAXIMUM_HALF_PERIOD as i32;
            self.position_half_period = if output < -(MAXIMUM_HALF_PERIOD as i32) {
                MAXIMUM_HALF_PERIOD as u16
            } else if output > -(MINIMUM_HALF_PERIOD as i32) {
                MINIMUM_HALF_PERIOD as u16
            } else {
                (-output) as u16
            };
            self.position_direction = Direction::Reverse;
        } else {
            let output = error * (MINIMUM_HALF_PERIOD as i32 - MAXIMUM_HALF_PERIOD as i32) / self.max_position as i32
                + MAXIMUM_HALF_PERIOD as i32;
            self.position_half_period = if output > MAXIMUM_HALF_PERIOD as i32 {
                MAXIMUM_HALF_PERIOD as u16
            } else if output < MINIMUM_HALF_PERIOD as i32 {
                MINIMUM_HALF_PERIOD as u16
            } else {
                output as u16
            };
            self.position_direction = Direction::Forward;
        }
    }

    /// Polled once per foreground-loop iteration. Computes the target
    /// waveform for the current state, refuses to drive into an
    /// already-pressed limit switch, and reprograms the stepper only
    /// when the waveform needs to change.
    pub fn step(&mut self) {
        let (mut half_period, mut direction) = self
            .stepper
            .current()
            .unwrap_or((DEFAULT_HALF_PERIOD, Direction::Forward));

        match self.state {
            SystemState::Inactive => return,
            SystemState::CalibrationSrchBtm => {
                half_period = DEFAULT_HALF_PERIOD;
                direction = Direction::Reverse;
            }
            SystemState::CalibrationSrchTop => {
                half_period = DEFAULT_HALF_PERIOD;
                direction = Direction::Forward;
            }
            SystemState::ActiveSpeedCtrl => {
                half_period = self.speed_half_period;
                direction = self.speed_direction;
            }
            SystemState::ActivePositionCtrl => {
                self.step_position_controller();
                half_period = self.position_half_period;
                direction = self.position_direction;
            }
        }

        if self.state == SystemState::Inactive {
            return;
        }

        let runaway = (direction == Direction::Reverse && self.upper_switch)
            || (direction == Direction::Forward && self.lower_switch);
        if runaway {
            self.process_event(SystemEvent::LimitSwitchPressed);
            return;
        }

        let reprogram = match self.stepper.current() {
            None => true,
            Some((current_period, current_direction)) => {
                current_period != half_period || current_direction != direction
            }
        };
        if reprogram {
            self.stepper.enable(half_period, direction);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeStepper {
        active: bool,
        half_period: u16,
        direction: Option<Direction>,
    }

    impl StepperDriver for FakeStepper {
        fn enable(&mut self, half_period: u16, direction: Direction) {
            self.active = true;
            self.half_period = half_period;
            self.direction = Some(direction);
        }

        fn disable(&mut self) {
            self.active = false;
        }

        fn is_active(&self) -> bool {
            self.active
        }

        fn current(&self) -> Option<(u16, Direction)> {
            if self.active {
                self.direction.map(|d| (self.half_period, d))
            } else {
                None
            }
        }
    }

    #[test]
    fn calibration_gates_bottom_to_top_on_the_upper_switch() {
        let mut lift = LiftActuator::new(FakeStepper::default());
        lift.process_event(SystemEvent::StartCalibration);
        assert_eq!(lift.state(), SystemState::CalibrationSrchBtm);

        // Lower switch alone must not advance the calibration search.
        lift.on_limit_switch_update(false, true);
        assert_eq!(lift.state(), SystemState::CalibrationSrchBtm);

        lift.on_limit_switch_update(true, true);
        assert_eq!(lift.state(), SystemState::CalibrationSrchTop);
        assert_eq!(lift.step_counter(), 0);
    }

    #[test]
    fn calibration_completes_on_the_lower_switch_and_records_travel() {
        let mut lift = LiftActuator::new(FakeStepper::default());
        lift.process_event(SystemEvent::StartCalibration);
        lift.on_limit_switch_update(true, false);
        assert_eq!(lift.state(), SystemState::CalibrationSrchTop);

        for _ in 0..1500 {
            lift.note_step(true);
        }
        lift.on_limit_switch_update(false, true);

        assert_eq!(lift.state(), SystemState::Inactive);
        assert_eq!(lift.max_position(), 1500);
    }

    #[test]
    fn position_is_reported_in_millimetres_and_clamped() {
        let mut lift = LiftActuator::new(FakeStepper::default());
        lift.process_event(SystemEvent::StartCalibration);
        lift.on_limit_switch_update(true, false);
        for _ in 0..2000 {
            lift.note_step(true);
        }
        lift.on_limit_switch_update(false, true);
        assert_eq!(lift.max_position(), 2000);

        for _ in 0..1000 {
            lift.note_step(false);
        }
        assert_eq!(lift.position(), 70);
    }

    #[test]
    fn a_runaway_motion_into_an_active_limit_switch_is_refused() {
        let mut lift = LiftActuator::new(FakeStepper::default());
        lift.on_limit_switch_update(false, true);
        lift.process_event(SystemEvent::StartPositionCtrl);
        // Target is far enough above the current position to require
        // forward motion, which the active lower switch must refuse.
        lift.set_position(100);
        lift.step();
        assert_eq!(lift.state(), SystemState::Inactive);
        assert!(!lift.stepper.active);
    }

    #[test]
    fn out_of_range_speed_setpoints_are_ignored() {
        let mut lift = LiftActuator::new(FakeStepper::default());
        lift.process_event(SystemEvent::StartSpeedCtrl);
        lift.set_speed(5);
        lift.step();
        // No valid speed was ever set, so the stepper keeps its default
        // programmed half-period instead of something derived from 5.
        assert_eq!(lift.stepper.half_period, DEFAULT_HALF_PERIOD);
    }

    #[test]
    fn out_of_range_position_setpoints_are_ignored() {
        let mut lift = LiftActuator::new(FakeStepper::default());
        lift.process_event(SystemEvent::StartPositionCtrl);
        lift.set_position(200);
        assert_eq!(lift.position_target, 0);
    }
}
