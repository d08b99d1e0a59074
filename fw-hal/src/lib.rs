//! Hardware-abstraction traits shared by the firmware core crates.
//!
//! Nothing in here touches a register. Each trait stands in for one of the
//! "opaque byte-addressable devices" the core subsystems are built against —
//! a byte stream, a stepper line, an H-bridge, a PMIC mirror, a USB hub. A
//! board crate supplies the concrete AVR implementation; the core crates
//! (`fw-pci`, `fw-lift`, `fw-drive`, `fw-power`) are generic over these
//! traits and never know which chip they're talking to.

#![no_std]

/// A byte source that can report whether a byte is ready before it is read.
///
/// Mirrors the way the packet parser consumes input: check availability,
/// then read exactly one byte.
pub trait ByteSource {
    /// Returns `true` if a byte is ready to be read without blocking.
    fn available(&mut self) -> bool;

    /// Reads one byte. Only called after `available()` returned `true`.
    fn read_byte(&mut self) -> u8;
}

/// A byte sink used to send framed packets back to the host.
pub trait ByteSink {
    /// Writes one byte, blocking until accepted by the underlying UART.
    fn write_byte(&mut self, byte: u8);
}

/// Monotonic millisecond clock, driven by a timer-overflow interrupt.
pub trait Clock {
    /// Milliseconds elapsed since the clock was started.
    fn millis(&self) -> u32;
}

/// A direction of rotation or travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// The stepper-motor waveform generator driving the lift actuator.
pub trait StepperDriver {
    /// Programs the waveform for the given half-period (timer compare
    /// ticks) and direction, and starts it if not already running.
    fn enable(&mut self, half_period: u16, direction: Direction);

    /// Stops pulse generation and leaves the motor coasting.
    fn disable(&mut self);

    /// `true` if the waveform is currently running.
    fn is_active(&self) -> bool;

    /// The half-period and direction last programmed, if the waveform is
    /// active.
    fn current(&self) -> Option<(u16, Direction)>;
}

/// One of the eight H-bridge drive modes for a differential-drive wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    ForwardPwmFastDecay,
    ForwardPwmSlowDecay,
    ReversePwmFastDecay,
    ReversePwmSlowDecay,
    Coast,
    Forward,
    Reverse,
    Brake,
}

/// A two-channel H-bridge motor driver, generic over a wheel identifier.
pub trait HBridge {
    type Wheel: Copy;

    /// Programs `wheel` into `mode` with the given 8-bit PWM duty cycle.
    /// `duty` is ignored by the static modes (`Coast`, `Forward`,
    /// `Reverse`, `Brake`).
    fn drive(&mut self, wheel: Self::Wheel, mode: BridgeMode, duty: u8);

    /// Gates power to the driver chip as a whole, independent of either
    /// wheel's mode.
    fn set_driver_enabled(&mut self, enabled: bool);
}

/// An ADC able to sample a numbered channel, returning a raw count.
pub trait AdcChannel {
    fn sample(&mut self, channel: u8) -> u16;
}

/// A three-axis accelerometer with an on-die temperature sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelSample {
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub temp: i16,
}

pub trait Accelerometer {
    fn read(&mut self) -> AccelSample;
}

/// A blocking SMBus/I²C master transaction primitive, as consumed by the
/// SMBus passthrough commands and the PMIC/USB-hub/LED drivers.
pub trait SmbusMaster {
    type Error;

    fn read_byte(&mut self, addr: u8) -> Result<u8, Self::Error>;
    fn write_byte(&mut self, addr: u8, value: u8) -> Result<(), Self::Error>;
    fn read_byte_data(&mut self, addr: u8, command: u8) -> Result<u8, Self::Error>;
    fn write_byte_data(&mut self, addr: u8, command: u8, value: u8) -> Result<(), Self::Error>;
    fn read_word_data(&mut self, addr: u8, command: u8) -> Result<u16, Self::Error>;
    fn write_word_data(&mut self, addr: u8, command: u8, value: u16) -> Result<(), Self::Error>;
    fn read_block_data(&mut self, addr: u8, command: u8, out: &mut [u8]) -> Result<usize, Self::Error>;
    fn write_block_data(&mut self, addr: u8, command: u8, data: &[u8]) -> Result<(), Self::Error>;
    fn read_i2c_block_data(&mut self, addr: u8, command: u8, out: &mut [u8]) -> Result<usize, Self::Error>;
    fn write_i2c_block_data(&mut self, addr: u8, command: u8, data: &[u8]) -> Result<(), Self::Error>;
}

/// The USB charger class reported by the hub's BC1.2 detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargerType {
    Disabled,
    Wait,
    Dcp,
    Cdp,
    Sdp,
    Se1L,
    Se1H,
    Se1S,
}

/// The USB hub sitting between the system PMIC's USB input and the host
/// port, as driven through its GPIO-expander strap pins.
pub trait UsbHub {
    fn enable(&mut self);
    fn disable(&mut self);
    fn is_enabled(&self) -> bool;
    fn is_suspended(&mut self) -> bool;
    fn detect_charger(&mut self) -> ChargerType;
    fn is_high_speed(&mut self) -> bool;
}

/// The steady/blink/off indication a status LED can show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedPattern {
    Off,
    Solid,
    Blink,
}

pub trait StatusLed {
    fn set_pattern(&mut self, pattern: LedPattern);
}

/// A four-channel LED driver (mirrors the PCA9633 banks used for input and
/// battery status indication), addressed by channel index.
pub trait LedBank {
    fn set_led(&mut self, index: u8, pattern: LedPattern);
}

/// Which upstream source a dual-input PMIC is drawing from or reporting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSource {
    None,
    Adapter,
    Usb,
}

/// Per-source input quality as classified by the system PMIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Normal,
    OverVoltage,
    WeakSource,
    UnderVoltage,
}

/// The input current limit programmed on the system (dual-input) PMIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysInputLimit {
    L0,
    L100,
    L150,
    L500,
    L800,
    L900,
    L1500,
    L2500,
}

impl SysInputLimit {
    /// Milliamps this limit permits.
    pub fn milliamps(self) -> u32 {
        match self {
            SysInputLimit::L0 => 0,
            SysInputLimit::L100 => 100,
            SysInputLimit::L150 => 150,
            SysInputLimit::L500 => 500,
            SysInputLimit::L800 => 800,
            SysInputLimit::L900 => 900,
            SysInputLimit::L1500 => 1500,
            SysInputLimit::L2500 => 2500,
        }
    }
}

/// System battery presence/health as classified by the system PMIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryState {
    Normal,
    OverVoltage,
    Disconnected,
    Undefined,
}

/// System PMIC fault condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysFault {
    None,
    DevThermalShdn,
    BattThermalShdn,
    WatchdogTmrExpr,
    SafetyTmrExpr,
    AdapterFault,
    UsbFault,
    BattFault,
}

/// Charger state common to both PMICs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Standby,
    Ready,
    Charging,
    Done,
    Fault,
}

/// A dual-input (adapter + USB) system PMIC, mirroring the BQ24161.
pub trait SystemPmic {
    fn reset_watchdog_timer(&mut self);
    fn synchronize(&mut self);
    fn input_state(&self, source: PowerSource) -> InputState;
    fn input_limit(&self, source: PowerSource) -> SysInputLimit;
    fn set_input_limit(&mut self, source: PowerSource, limit: SysInputLimit);
    fn preferred_source(&self) -> PowerSource;
    fn selected_source(&self) -> PowerSource;
    fn battery_state(&self) -> BatteryState;
    fn fault(&self) -> SysFault;
    fn device_state(&self) -> DeviceState;
    fn set_charging_enable(&mut self, enable: bool);
    fn set_battery_regulation_voltage(&mut self, millivolts: u16);
    fn set_battery_charging_current(&mut self, milliamps: u16);
    fn set_battery_termination_current(&mut self, milliamps: u16);
}

/// The input current limit programmed on the actuator PMIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActInputLimit {
    L100,
    L150,
    L500,
    L900,
    L1500,
    L2000,
    LExt,
    LPtm,
    LHiz,
}

/// Actuator PMIC fault condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActFault {
    None,
    InputOverVoltage,
    InputUnderVoltage,
    Sleep,
    BattThermalShdn,
    BattOverVoltage,
    DevThermalShdn,
    DevTimerFault,
    BattDisconnected,
    IsetShorted,
    InputFault,
    Undefined,
}

/// A single-input actuator PMIC, mirroring the BQ24250.
pub trait ActuatorPmic {
    fn reset_watchdog_timer(&mut self);
    fn synchronize(&mut self);
    fn device_state(&self) -> DeviceState;
    fn fault(&self) -> ActFault;
    fn set_charging_enable(&mut self, enable: bool);
    fn set_input_limit(&mut self, limit: ActInputLimit);
    fn input_limit(&self) -> ActInputLimit;
}

/// A single GPIO input line, sampled directly rather than through a PMIC
/// or I/O-expander mirror (e.g. the manip board's charger power-good and
/// charge-status monitor pins).
pub trait DigitalInput {
    fn is_high(&mut self) -> bool;
}

/// Selects which segment of a muxed I²C bus (behind a PCA9542A/9544A) is
/// currently connected to the master.
pub trait ChannelSelector {
    type Channel: Copy;

    fn select(&mut self, channel: Self::Channel);
    fn current(&self) -> Self::Channel;
}

/// An NFC front-end addressed as an opaque peer-to-peer transceiver; no
/// register map is modeled, matching the out-of-scope third-party
/// peripherals named in the command set.
pub trait NfcReaderWriter {
    type Error;

    /// Reads a passively received frame, if any, into `out`.
    fn read(&mut self, out: &mut [u8]) -> Result<usize, Self::Error>;

    /// Initiates a peer-to-peer exchange, writing `tx` and returning the
    /// number of bytes the peer replied with into `rx`.
    fn transceive(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<usize, Self::Error>;
}

/// An infrared proximity/ambient-light sensor, addressed opaquely.
pub trait RfProximitySensor {
    fn range(&mut self) -> u16;
    fn ambient(&mut self) -> u16;
}

/// The three load-switch enable lines gating system, actuator, and
/// adapter-passthrough power, driven directly from GPIO output pins.
pub trait PowerRails {
    fn set_system_power(&mut self, on: bool);
    fn is_system_power_on(&self) -> bool;
    fn set_actuator_power(&mut self, on: bool);
    fn is_actuator_power_on(&self) -> bool;
    fn set_passthrough_power(&mut self, on: bool);
    fn is_passthrough_power_on(&self) -> bool;
}
