//! Power budget arbitration.
//!
//! One `Update` pass synchronises the two PMICs, classifies whatever is
//! plugged into the USB hub, walks an ordered list of input sources to find
//! how much power is actually available, deducts the system load and
//! battery-charging share, then repeats the deduction for the actuator rail
//! downstream of a passthrough loss. Everything is reflected onto two LED
//! banks so a glance at the enclosure tells you the arbitration state
//! without a host connection.
//!
//! The whole thing is one big [`PowerManagementSystem::update`] method
//! rather than a state machine, mirroring the source system: there is no
//! latched "decision" to get wrong, since every tick recomputes the budget
//! from scratch off the PMICs' live registers.

#![no_std]

use fw_hal::{
    ActFault, ActInputLimit, ActuatorPmic, AdcChannel, BatteryState, ChargerType, DeviceState,
    InputState, LedBank, LedPattern, PowerRails, PowerSource, SysFault, SysInputLimit, SystemPmic,
    UsbHub,
};

const ADC_BATT_MV_COEFF: u32 = 17;

const SYS_INPUT_VOLTAGE_MV: u32 = 5000;
const ACT_INPUT_VOLTAGE_MV: u32 = 5000;

const SYS_POWER_REQ_MW: u32 = 2500;
const ACT_POWER_REQ_MW: u32 = 15000;
const SYS_ACT_PASSTHROUGH_LOSS_MW: u32 = 50;

const SYS_BATT_REG_VOLTAGE_MV: u16 = 4200;
const SYS_BATT_INIT_CHG_VOLTAGE_MV: u32 = 4100;
const SYS_BATT_CHG_CURRENT_MA: u16 = 740;
const SYS_BATT_TRM_CURRENT_MA: u16 = 50;
const SYS_BATT_LOW_VOLTAGE_MV: u32 = 3200;
const SYS_BATT_NOTPRESENT_VOLTAGE_MV: u32 = 500;
/// `(current_mA * voltage_mV) / 1000`, the source's fixed-point power estimate.
const SYS_BATT_CHG_POWER_MW: u32 =
    (SYS_BATT_CHG_CURRENT_MA as u32 * SYS_BATT_REG_VOLTAGE_MV as u32) / 1000;

const ACT_BATT_REG_VOLTAGE_MV: u16 = 4200;
const ACT_BATT_INIT_CHG_VOLTAGE_MV: u32 = 4100;
const ACT_BATT_CHG_CURRENT_MA: u16 = 740;
const ACT_BATT_TRM_CURRENT_MA: u16 = 50;
const ACT_BATT_NOTPRESENT_VOLTAGE_MV: u32 = 100;
const ACT_BATT_CHG_POWER_MW: u32 =
    (ACT_BATT_CHG_CURRENT_MA as u32 * ACT_BATT_REG_VOLTAGE_MV as u32) / 1000;

const ADP_LED: u8 = 0;
const USB_LP_LED: u8 = 1;
const USB_HP_LED: u8 = 2;
const USB_FP_LED: u8 = 3;

const BATT1_STAT_LED: u8 = 0;
const BATT1_CHRG_LED: u8 = 1;
const BATT2_STAT_LED: u8 = 2;
const BATT2_CHRG_LED: u8 = 3;

/// ADC channel wired to the system battery's resistive divider.
pub const SYSTEM_BATTERY_ADC_CHANNEL: u8 = 6;
/// ADC channel wired to the actuator battery's resistive divider.
pub const ACTUATOR_BATTERY_ADC_CHANNEL: u8 = 7;

fn sys_limit_milliwatts(limit: SysInputLimit) -> u32 {
    limit.milliamps() * (SYS_INPUT_VOLTAGE_MV / 1000)
}

/// Arbitrates the power budget across the system and actuator PMICs, the
/// USB hub, and the two LED status banks.
///
/// Generic over every peripheral it drives so a board only has to supply
/// concrete chip bindings; none of the arbitration logic below is aware of
/// register addresses.
pub struct PowerManagementSystem<S, A, H, R, D, LI, LB> {
    system: S,
    actuator: A,
    hub: H,
    rails: R,
    adc: D,
    input_leds: LI,
    battery_leds: LB,
    actuator_input_limit_override: Option<ActInputLimit>,
    system_battery_mv: u32,
    actuator_battery_mv: u32,
    system_battery_adc: u16,
    actuator_battery_adc: u16,
}

impl<S, A, H, R, D, LI, LB> PowerManagementSystem<S, A, H, R, D, LI, LB>
where
    S: SystemPmic,
    A: ActuatorPmic,
    H: UsbHub,
    R: PowerRails,
    D: AdcChannel,
    LI: LedBank,
    LB: LedBank,
{
    pub fn new(system: S, actuator: A, hub: H, rails: R, adc: D, input_leds: LI, battery_leds: LB) -> Self {
        PowerManagementSystem {
            system,
            actuator,
            hub,
            rails,
            adc,
            input_leds,
            battery_leds,
            actuator_input_limit_override: None,
            system_battery_mv: 0,
            actuator_battery_mv: 0,
            system_battery_adc: 0,
            actuator_battery_adc: 0,
        }
    }

    /// Brings both rails, both PMICs, and both LED banks to their power-on
    /// defaults, then runs one [`update`](Self::update) pass.
    pub fn init(&mut self) {
        self.rails.set_system_power(true);
        self.rails.set_passthrough_power(true);
        self.rails.set_actuator_power(false);

        self.actuator.set_input_limit(ActInputLimit::LHiz);
        self.system.set_charging_enable(false);
        self.actuator.set_charging_enable(false);

        self.system.set_battery_regulation_voltage(SYS_BATT_REG_VOLTAGE_MV);
        self.system.set_battery_charging_current(SYS_BATT_CHG_CURRENT_MA);
        self.system.set_battery_termination_current(SYS_BATT_TRM_CURRENT_MA);

        self.update();
    }

    pub fn set_system_power_on(&mut self, on: bool) {
        self.rails.set_system_power(on);
    }

    pub fn set_actuator_power_on(&mut self, on: bool) {
        self.rails.set_actuator_power(on);
    }

    pub fn set_passthrough_power_on(&mut self, on: bool) {
        self.rails.set_passthrough_power(on);
    }

    pub fn is_system_power_on(&self) -> bool {
        self.rails.is_system_power_on()
    }

    pub fn is_actuator_power_on(&self) -> bool {
        self.rails.is_actuator_power_on()
    }

    pub fn is_passthrough_power_on(&self) -> bool {
        self.rails.is_passthrough_power_on()
    }

    /// Pins the actuator input limit rather than letting `update` pick one
    /// from the remaining system budget. `None` restores automatic
    /// selection (the PMIC's `LHIZ` override slot).
    pub fn set_actuator_input_limit_override(&mut self, limit: Option<ActInputLimit>) {
        self.actuator_input_limit_override = limit;
    }

    pub fn is_system_battery_charging(&self) -> bool {
        self.system.device_state() == DeviceState::Charging
    }

    pub fn is_actuator_battery_charging(&self) -> bool {
        self.actuator.device_state() == DeviceState::Charging
    }

    pub fn actuator_input_limit(&self) -> ActInputLimit {
        self.actuator.input_limit()
    }

    pub fn system_input_limit(&self) -> SysInputLimit {
        self.system.input_limit(self.system.selected_source())
    }

    pub fn adapter_input_state(&self) -> InputState {
        self.system.input_state(PowerSource::Adapter)
    }

    pub fn usb_input_state(&self) -> InputState {
        self.system.input_state(PowerSource::Usb)
    }

    pub fn system_battery_millivolts(&self) -> u32 {
        self.system_battery_mv
    }

    pub fn actuator_battery_millivolts(&self) -> u32 {
        self.actuator_battery_mv
    }

    /// The system battery's last-sampled ADC reading, truncated to 8
    /// bits as it goes out over `GET_BATT_LVL`.
    pub fn system_battery_adc_byte(&self) -> u8 {
        (self.system_battery_adc >> 2) as u8
    }

    /// The actuator battery's last-sampled ADC reading, truncated to 8
    /// bits as it goes out over `GET_BATT_LVL`.
    pub fn actuator_battery_adc_byte(&self) -> u8 {
        (self.actuator_battery_adc >> 2) as u8
    }

    pub fn usb_hub_enabled(&self) -> bool {
        self.hub.is_enabled()
    }

    pub fn usb_hub_high_speed(&mut self) -> bool {
        self.hub.is_high_speed()
    }

    pub fn usb_hub_suspended(&mut self) -> bool {
        self.hub.is_suspended()
    }

    pub fn usb_charger_type(&mut self) -> ChargerType {
        self.hub.detect_charger()
    }

    /// Runs one full arbitration pass. Expected to be called on every
    /// iteration of the foreground loop.
    pub fn update(&mut self) {
        self.system.reset_watchdog_timer();
        self.system.synchronize();
        self.actuator.reset_watchdog_timer();
        self.actuator.synchronize();

        self.service_usb_hub();
        self.reflect_input_leds();

        let mut available_mw = self.select_available_power();

        self.system_battery_adc = self.adc.sample(SYSTEM_BATTERY_ADC_CHANNEL);
        self.actuator_battery_adc = self.adc.sample(ACTUATOR_BATTERY_ADC_CHANNEL);
        self.system_battery_mv = (self.system_battery_adc >> 2) as u32 * ADC_BATT_MV_COEFF;
        self.actuator_battery_mv = (self.actuator_battery_adc >> 2) as u32 * ADC_BATT_MV_COEFF;

        if self.rails.is_system_power_on() {
            available_mw = if available_mw > SYS_POWER_REQ_MW {
                available_mw - SYS_POWER_REQ_MW
            } else {
                0
            };
        }

        available_mw = self.arbitrate_system_battery(available_mw);

        available_mw = if available_mw > SYS_ACT_PASSTHROUGH_LOSS_MW {
            available_mw - SYS_ACT_PASSTHROUGH_LOSS_MW
        } else {
            0
        };

        let (actuator_limit, available_mw) = self.select_actuator_input_limit(available_mw);
        self.actuator.set_input_limit(actuator_limit);

        let mut available_mw = available_mw;
        if self.rails.is_actuator_power_on() {
            available_mw = if available_mw > ACT_POWER_REQ_MW {
                available_mw - ACT_POWER_REQ_MW
            } else {
                0
            };
        }

        self.arbitrate_actuator_battery(available_mw);
    }

    fn service_usb_hub(&mut self) {
        if self.system.input_state(PowerSource::Usb) == InputState::Normal {
            if !self.hub.is_enabled() {
                self.hub.enable();
            }
            let limit = if self.hub.is_suspended() {
                SysInputLimit::L0
            } else {
                match self.hub.detect_charger() {
                    ChargerType::Dcp | ChargerType::Se1S => SysInputLimit::L1500,
                    ChargerType::Se1H => SysInputLimit::L900,
                    ChargerType::Cdp => {
                        if self.hub.is_high_speed() {
                            SysInputLimit::L900
                        } else {
                            SysInputLimit::L1500
                        }
                    }
                    ChargerType::Sdp | ChargerType::Se1L => SysInputLimit::L500,
                    ChargerType::Wait | ChargerType::Disabled => SysInputLimit::L0,
                }
            };
            self.system.set_input_limit(PowerSource::Usb, limit);
            self.system.synchronize();
        } else if self.hub.is_enabled() {
            self.hub.disable();
        }
    }

    fn reflect_input_leds(&mut self) {
        let adapter_pattern = match self.system.input_state(PowerSource::Adapter) {
            InputState::Normal => LedPattern::Solid,
            InputState::UnderVoltage => LedPattern::Off,
            InputState::OverVoltage | InputState::WeakSource => LedPattern::Blink,
        };
        self.input_leds.set_led(ADP_LED, adapter_pattern);

        match self.system.input_state(PowerSource::Usb) {
            InputState::Normal => {
                let (lp, hp, fp) = match self.system.input_limit(PowerSource::Usb) {
                    SysInputLimit::L100 | SysInputLimit::L150 => {
                        (LedPattern::Solid, LedPattern::Off, LedPattern::Off)
                    }
                    SysInputLimit::L500 => (LedPattern::Solid, LedPattern::Solid, LedPattern::Off),
                    SysInputLimit::L800 | SysInputLimit::L900 | SysInputLimit::L1500 => {
                        (LedPattern::Solid, LedPattern::Solid, LedPattern::Solid)
                    }
                    SysInputLimit::L0 | SysInputLimit::L2500 => {
                        (LedPattern::Off, LedPattern::Off, LedPattern::Blink)
                    }
                };
                self.input_leds.set_led(USB_LP_LED, lp);
                self.input_leds.set_led(USB_HP_LED, hp);
                self.input_leds.set_led(USB_FP_LED, fp);
            }
            InputState::UnderVoltage => {
                self.input_leds.set_led(USB_LP_LED, LedPattern::Off);
                self.input_leds.set_led(USB_HP_LED, LedPattern::Off);
                self.input_leds.set_led(USB_FP_LED, LedPattern::Off);
            }
            InputState::OverVoltage | InputState::WeakSource => {
                self.input_leds.set_led(USB_LP_LED, LedPattern::Off);
                self.input_leds.set_led(USB_HP_LED, LedPattern::Off);
                self.input_leds.set_led(USB_FP_LED, LedPattern::Blink);
            }
        }
    }

    /// Walks the preferred-source-first list and returns the budget offered
    /// by the first source reporting a normal input state with a nonzero
    /// limit.
    fn select_available_power(&self) -> u32 {
        let order: [PowerSource; 2] = match self.system.preferred_source() {
            PowerSource::Adapter => [PowerSource::Adapter, PowerSource::Usb],
            PowerSource::Usb => [PowerSource::Usb, PowerSource::Adapter],
            PowerSource::None => return 0,
        };
        for source in order {
            if self.system.input_state(source) != InputState::Normal {
                continue;
            }
            let milliwatts = sys_limit_milliwatts(self.system.input_limit(source));
            if milliwatts > 0 {
                return milliwatts;
            }
        }
        0
    }

    /// Enables or terminates system battery charging depending on fault
    /// state, charge state, and remaining budget; deducts a third of the
    /// regulation power whenever charging is active or being started.
    /// Returns the budget left over for the actuator rail.
    fn arbitrate_system_battery(&mut self, mut available_mw: u32) -> u32 {
        let faulted = self.system.battery_state() != BatteryState::Normal
            || self.system.fault() == SysFault::BattFault
            || self.system.fault() == SysFault::BattThermalShdn;

        if faulted {
            self.system.set_battery_regulation_voltage(SYS_BATT_REG_VOLTAGE_MV);
            self.system.set_battery_charging_current(SYS_BATT_CHG_CURRENT_MA);
            self.system.set_battery_termination_current(SYS_BATT_TRM_CURRENT_MA);
            if self.system.device_state() == DeviceState::Charging {
                self.system.set_charging_enable(false);
            }
            self.battery_leds.set_led(BATT1_CHRG_LED, LedPattern::Off);
            if self.system_battery_mv < SYS_BATT_NOTPRESENT_VOLTAGE_MV {
                self.battery_leds.set_led(BATT1_STAT_LED, LedPattern::Off);
            } else {
                self.battery_leds.set_led(BATT1_STAT_LED, LedPattern::Blink);
            }
            return available_mw;
        }

        let third_charge_power = SYS_BATT_CHG_POWER_MW / 3;
        if self.system.device_state() == DeviceState::Charging {
            if available_mw > third_charge_power {
                available_mw -= third_charge_power;
                self.battery_leds.set_led(BATT1_CHRG_LED, LedPattern::Blink);
                self.battery_leds.set_led(BATT1_STAT_LED, LedPattern::Solid);
            } else {
                self.system.set_charging_enable(false);
                self.battery_leds.set_led(BATT1_CHRG_LED, LedPattern::Off);
                self.battery_leds.set_led(BATT1_STAT_LED, LedPattern::Solid);
            }
        } else if self.system_battery_mv < SYS_BATT_INIT_CHG_VOLTAGE_MV {
            if available_mw > third_charge_power {
                available_mw -= third_charge_power;
                self.system.set_battery_regulation_voltage(SYS_BATT_REG_VOLTAGE_MV);
                self.system.set_battery_charging_current(SYS_BATT_CHG_CURRENT_MA);
                self.system.set_battery_termination_current(SYS_BATT_TRM_CURRENT_MA);
                self.system.set_charging_enable(true);
                self.battery_leds.set_led(BATT1_CHRG_LED, LedPattern::Blink);
                self.battery_leds.set_led(BATT1_STAT_LED, LedPattern::Solid);
            } else if self.system_battery_mv > SYS_BATT_LOW_VOLTAGE_MV {
                self.battery_leds.set_led(BATT1_CHRG_LED, LedPattern::Off);
                self.battery_leds.set_led(BATT1_STAT_LED, LedPattern::Solid);
            } else {
                self.battery_leds.set_led(BATT1_CHRG_LED, LedPattern::Off);
                self.battery_leds.set_led(BATT1_STAT_LED, LedPattern::Blink);
            }
        } else {
            self.battery_leds.set_led(BATT1_CHRG_LED, LedPattern::Solid);
            self.battery_leds.set_led(BATT1_STAT_LED, LedPattern::Solid);
        }

        available_mw
    }

    /// Picks the input limit to program on the actuator PMIC: an explicit
    /// override, or an automatic step selected by however much budget
    /// survived the system deduction and passthrough loss.
    fn select_actuator_input_limit(&self, available_mw: u32) -> (ActInputLimit, u32) {
        match self.actuator_input_limit_override {
            Some(limit) => (limit, available_mw),
            None => {
                let threshold = |ma: u32| ma * (ACT_INPUT_VOLTAGE_MV / 1000);
                if available_mw > threshold(900) {
                    (ActInputLimit::L900, available_mw)
                } else if available_mw > threshold(500) {
                    (ActInputLimit::L500, available_mw)
                } else if available_mw > threshold(150) {
                    (ActInputLimit::L150, available_mw)
                } else if available_mw > threshold(100) {
                    (ActInputLimit::L100, available_mw)
                } else {
                    (ActInputLimit::LHiz, 0)
                }
            }
        }
    }

    fn arbitrate_actuator_battery(&mut self, mut available_mw: u32) {
        let third_charge_power = ACT_BATT_CHG_POWER_MW / 3;
        match self.actuator.device_state() {
            DeviceState::Fault => {
                self.actuator.set_charging_enable(false);
                let fault = self.actuator.fault();
                if fault == ActFault::BattOverVoltage || fault == ActFault::BattDisconnected {
                    self.battery_leds.set_led(BATT2_CHRG_LED, LedPattern::Off);
                    self.battery_leds.set_led(BATT2_STAT_LED, LedPattern::Blink);
                } else if fault == ActFault::BattThermalShdn {
                    self.battery_leds.set_led(BATT2_CHRG_LED, LedPattern::Off);
                    if self.actuator_battery_mv < ACT_BATT_NOTPRESENT_VOLTAGE_MV {
                        self.battery_leds.set_led(BATT2_STAT_LED, LedPattern::Off);
                    } else {
                        self.battery_leds.set_led(BATT2_STAT_LED, LedPattern::Blink);
                    }
                } else {
                    self.battery_leds.set_led(BATT2_CHRG_LED, LedPattern::Blink);
                    if self.actuator_battery_mv < ACT_BATT_NOTPRESENT_VOLTAGE_MV {
                        self.battery_leds.set_led(BATT2_STAT_LED, LedPattern::Off);
                    } else {
                        self.battery_leds.set_led(BATT2_STAT_LED, LedPattern::Solid);
                    }
                }
            }
            DeviceState::Standby | DeviceState::Ready => {
                if self.actuator_battery_mv > ACT_BATT_NOTPRESENT_VOLTAGE_MV {
                    self.battery_leds.set_led(BATT2_STAT_LED, LedPattern::Solid);
                    if self.actuator_battery_mv < ACT_BATT_INIT_CHG_VOLTAGE_MV
                        && available_mw > third_charge_power
                    {
                        available_mw -= third_charge_power;
                        self.actuator.set_charging_enable(true);
                        self.battery_leds.set_led(BATT2_CHRG_LED, LedPattern::Blink);
                    } else {
                        self.battery_leds.set_led(BATT2_CHRG_LED, LedPattern::Off);
                    }
                } else {
                    self.actuator.set_charging_enable(false);
                    self.battery_leds.set_led(BATT2_CHRG_LED, LedPattern::Off);
                    self.battery_leds.set_led(BATT2_STAT_LED, LedPattern::Off);
                }
            }
            DeviceState::Charging => {
                self.battery_leds.set_led(BATT2_STAT_LED, LedPattern::Solid);
                if available_mw > third_charge_power {
                    self.battery_leds.set_led(BATT2_CHRG_LED, LedPattern::Blink);
                } else {
                    self.actuator.set_charging_enable(false);
                    self.battery_leds.set_led(BATT2_CHRG_LED, LedPattern::Off);
                }
            }
            DeviceState::Done => {
                self.actuator.set_charging_enable(false);
                self.battery_leds.set_led(BATT2_CHRG_LED, LedPattern::Off);
                self.battery_leds.set_led(BATT2_STAT_LED, LedPattern::Solid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fw_hal::{ActFault, BatteryState as Bs, SysFault as Sf};

    struct FakeSystem {
        adapter_state: Option<InputState>,
        usb_state: Option<InputState>,
        adapter_limit: SysInputLimit,
        usb_limit: SysInputLimit,
        preferred: Option<PowerSource>,
        battery_state: Option<BatteryState>,
        fault: Option<SysFault>,
        device_state: Option<DeviceState>,
        charging_enable: Option<bool>,
    }

    impl Default for FakeSystem {
        fn default() -> Self {
            FakeSystem {
                adapter_state: None,
                usb_state: None,
                adapter_limit: SysInputLimit::L0,
                usb_limit: SysInputLimit::L0,
                preferred: None,
                battery_state: None,
                fault: None,
                device_state: None,
                charging_enable: None,
            }
        }
    }

    impl SystemPmic for FakeSystem {
        fn reset_watchdog_timer(&mut self) {}
        fn synchronize(&mut self) {}
        fn input_state(&self, source: PowerSource) -> InputState {
            match source {
                PowerSource::Adapter => self.adapter_state.unwrap_or(InputState::UnderVoltage),
                PowerSource::Usb => self.usb_state.unwrap_or(InputState::UnderVoltage),
                PowerSource::None => InputState::UnderVoltage,
            }
        }
        fn input_limit(&self, source: PowerSource) -> SysInputLimit {
            match source {
                PowerSource::Adapter => self.adapter_limit,
                PowerSource::Usb => self.usb_limit,
                PowerSource::None => SysInputLimit::L0,
            }
        }
        fn set_input_limit(&mut self, source: PowerSource, limit: SysInputLimit) {
            match source {
                PowerSource::Adapter => self.adapter_limit = limit,
                PowerSource::Usb => self.usb_limit = limit,
                PowerSource::None => {}
            }
        }
        fn preferred_source(&self) -> PowerSource {
            self.preferred.unwrap_or(PowerSource::Adapter)
        }
        fn selected_source(&self) -> PowerSource {
            self.preferred_source()
        }
        fn battery_state(&self) -> BatteryState {
            self.battery_state.unwrap_or(Bs::Normal)
        }
        fn fault(&self) -> SysFault {
            self.fault.unwrap_or(Sf::None)
        }
        fn device_state(&self) -> DeviceState {
            self.device_state.unwrap_or(DeviceState::Ready)
        }
        fn set_charging_enable(&mut self, enable: bool) {
            self.charging_enable = Some(enable);
        }
        fn set_battery_regulation_voltage(&mut self, _mv: u16) {}
        fn set_battery_charging_current(&mut self, _ma: u16) {}
        fn set_battery_termination_current(&mut self, _ma: u16) {}
    }

    struct FakeActuator {
        input_limit: ActInputLimit,
        device_state: Option<DeviceState>,
        fault: Option<ActFault>,
        charging_enable: Option<bool>,
    }

    impl Default for FakeActuator {
        fn default() -> Self {
            FakeActuator {
                input_limit: ActInputLimit::LHiz,
                device_state: None,
                fault: None,
                charging_enable: None,
            }
        }
    }

    impl ActuatorPmic for FakeActuator {
        fn reset_watchdog_timer(&mut self) {}
        fn synchronize(&mut self) {}
        fn device_state(&self) -> DeviceState {
            self.device_state.unwrap_or(DeviceState::Ready)
        }
        fn fault(&self) -> ActFault {
            self.fault.unwrap_or(ActFault::None)
        }
        fn set_charging_enable(&mut self, enable: bool) {
            self.charging_enable = Some(enable);
        }
        fn set_input_limit(&mut self, limit: ActInputLimit) {
            self.input_limit = limit;
        }
        fn input_limit(&self) -> ActInputLimit {
            self.input_limit
        }
    }

    #[derive(Default)]
    struct FakeHub {
        enabled: bool,
        suspended: bool,
        charger: Option<ChargerType>,
        high_speed: bool,
    }

    impl UsbHub for FakeHub {
        fn enable(&mut self) {
            self.enabled = true;
        }
        fn disable(&mut self) {
            self.enabled = false;
        }
        fn is_enabled(&self) -> bool {
            self.enabled
        }
        fn is_suspended(&mut self) -> bool {
            self.suspended
        }
        fn detect_charger(&mut self) -> ChargerType {
            self.charger.unwrap_or(ChargerType::Wait)
        }
        fn is_high_speed(&mut self) -> bool {
            self.high_speed
        }
    }

    #[derive(Default)]
    struct FakeRails {
        system: bool,
        actuator: bool,
        passthrough: bool,
    }

    impl PowerRails for FakeRails {
        fn set_system_power(&mut self, on: bool) {
            self.system = on;
        }
        fn is_system_power_on(&self) -> bool {
            self.system
        }
        fn set_actuator_power(&mut self, on: bool) {
            self.actuator = on;
        }
        fn is_actuator_power_on(&self) -> bool {
            self.actuator
        }
        fn set_passthrough_power(&mut self, on: bool) {
            self.passthrough = on;
        }
        fn is_passthrough_power_on(&self) -> bool {
            self.passthrough
        }
    }

    #[derive(Default)]
    struct FakeAdc {
        reading: u16,
    }

    impl AdcChannel for FakeAdc {
        fn sample(&mut self, _channel: u8) -> u16 {
            self.reading
        }
    }

    struct FakeLedBank {
        leds: [LedPattern; 4],
    }

    impl Default for FakeLedBank {
        fn default() -> Self {
            FakeLedBank {
                leds: [LedPattern::Off; 4],
            }
        }
    }

    impl LedBank for FakeLedBank {
        fn set_led(&mut self, index: u8, pattern: LedPattern) {
            self.leds[index as usize] = pattern;
        }
    }

    type Pms = PowerManagementSystem<FakeSystem, FakeActuator, FakeHub, FakeRails, FakeAdc, FakeLedBank, FakeLedBank>;

    fn make() -> Pms {
        PowerManagementSystem::new(
            FakeSystem::default(),
            FakeActuator::default(),
            FakeHub::default(),
            FakeRails::default(),
            FakeAdc::default(),
            FakeLedBank::default(),
            FakeLedBank::default(),
        )
    }

    #[test]
    fn adapter_normal_at_l2500_offers_the_full_system_budget_to_the_actuator() {
        let mut pms = make();
        pms.system.adapter_state = Some(InputState::Normal);
        pms.system.adapter_limit = SysInputLimit::L2500;
        pms.system.preferred = Some(PowerSource::Adapter);
        pms.system.battery_state = Some(BatteryState::Disconnected);
        pms.actuator.device_state = Some(DeviceState::Ready);
        pms.update();
        // 12500mW in, no system load (rail switched off), a disconnected
        // battery takes the no-further-deduction fault branch, minus 50mW
        // passthrough loss leaves well above the 900mA threshold (4500mW).
        assert_eq!(pms.actuator_input_limit(), ActInputLimit::L900);
    }

    #[test]
    fn usb_sdp_maps_to_the_500_milliamp_limit() {
        let mut pms = make();
        pms.system.usb_state = Some(InputState::Normal);
        pms.hub.charger = Some(ChargerType::Sdp);
        pms.update();
        assert_eq!(pms.system.usb_limit, SysInputLimit::L500);
        assert!(pms.hub.enabled);
    }

    #[test]
    fn usb_hub_is_disabled_when_its_input_is_not_normal() {
        let mut pms = make();
        pms.hub.enabled = true;
        pms.system.usb_state = Some(InputState::UnderVoltage);
        pms.update();
        assert!(!pms.hub.enabled);
    }

    #[test]
    fn an_unavailable_source_leaves_the_actuator_input_in_high_impedance() {
        let mut pms = make();
        pms.system.adapter_state = Some(InputState::UnderVoltage);
        pms.system.usb_state = Some(InputState::UnderVoltage);
        pms.update();
        assert_eq!(pms.actuator_input_limit(), ActInputLimit::LHiz);
    }

    #[test]
    fn a_battery_fault_disables_charging_and_resends_regulation_parameters() {
        let mut pms = make();
        pms.system.adapter_state = Some(InputState::Normal);
        pms.system.adapter_limit = SysInputLimit::L2500;
        pms.system.fault = Some(SysFault::BattFault);
        pms.system.device_state = Some(DeviceState::Charging);
        pms.update();
        assert_eq!(pms.system.charging_enable, Some(false));
    }

    #[test]
    fn explicit_override_bypasses_automatic_actuator_limit_selection() {
        let mut pms = make();
        pms.system.adapter_state = Some(InputState::Normal);
        pms.system.adapter_limit = SysInputLimit::L2500;
        pms.set_actuator_input_limit_override(Some(ActInputLimit::L100));
        pms.update();
        assert_eq!(pms.actuator_input_limit(), ActInputLimit::L100);
    }

    #[test]
    fn battery_voltages_are_converted_through_the_adc_coefficient() {
        let mut pms = make();
        pms.adc.reading = 400;
        pms.update();
        assert_eq!(pms.system_battery_millivolts(), 100 * 17);
        assert_eq!(pms.actuator_battery_millivolts(), 100 * 17);
    }
}
