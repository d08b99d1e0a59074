//! Power-management board firmware.
//!
//! Runs [`fw_power::PowerManagementSystem::update`] on a sync timer and
//! whenever a power-event interrupt demands it, walks the front-panel
//! switch through its press-duration state machine, and answers the
//! host's power-status and rail-enable requests directly from the
//! command loop.

#![no_std]
#![no_main]

mod hal;

use avr_device::atmega328p::Peripherals;
use avr_device::interrupt::{self, Mutex};
use core::cell::{Cell, RefCell};
use fw_hal::{ActInputLimit, Clock as ClockTrait};
use fw_pci::{CommandType, PacketControlInterface};
use fw_power::PowerManagementSystem;
use hal::{
    ActuatorPmicDriver, Adc, Clock, LedBankDriver, PowerRailsDriver, SharedTwi, SystemPmicDriver,
    Twi, UsbHubDriver, Uart,
};
use panic_halt as _;

const F_CPU: u32 = 8_000_000;
const UART_BAUD: u32 = 115_200;

const PORTC_SWITCH_IRQ: u8 = 0x01;
const PORTC_HUB_IRQ: u8 = 0x02;
const PORTC_SYSTEM_POWER_IRQ: u8 = 0x04;
const PORTC_ACTUATOR_POWER_IRQ: u8 = 0x08;

const SYNC_PERIOD: u32 = 5000;
const HARD_PWDN_PERIOD: u32 = 750;

const INPUT_STATUS_LEDS_ADDR: u8 = 0x60;
const BATT_STATUS_LEDS_ADDR: u8 = 0x61;

#[derive(Clone, Copy, PartialEq, Eq)]
enum SwitchState {
    Pressed,
    Released,
}

struct PowerEventState {
    port_last: u8,
    switch_state: SwitchState,
    switch_signal: bool,
    usb_signal: bool,
    system_power_signal: bool,
    actuator_power_signal: bool,
}

static EVENTS: Mutex<Cell<Option<PowerEventState>>> = Mutex::new(Cell::new(None));

type Pms<'a> = PowerManagementSystem<
    SystemPmicDriver<'a>,
    ActuatorPmicDriver<'a>,
    UsbHubDriver<'a>,
    PowerRailsDriver,
    Adc,
    LedBankDriver<'a>,
    LedBankDriver<'a>,
>;

#[avr_device::entry]
fn main() -> ! {
    let dp = Peripherals::take().unwrap();

    let uart = Uart::new(dp.USART0, UART_BAUD, F_CPU);
    let adc = Adc::new(dp.ADC);
    let twi_cell = RefCell::new(Twi::new(dp.TWI, F_CPU, 100_000));
    let clock = Clock::new(dp.TC2);

    let system = SystemPmicDriver::new(SharedTwi::new(&twi_cell));
    let actuator = ActuatorPmicDriver::new(SharedTwi::new(&twi_cell));
    let hub = UsbHubDriver::new(SharedTwi::new(&twi_cell), dp.PORTB);
    let rails = PowerRailsDriver::new(dp.PORTD);
    let input_leds = LedBankDriver::new(SharedTwi::new(&twi_cell), INPUT_STATUS_LEDS_ADDR);
    let battery_leds = LedBankDriver::new(SharedTwi::new(&twi_cell), BATT_STATUS_LEDS_ADDR);

    let mut pms: Pms = PowerManagementSystem::new(system, actuator, hub, rails, adc, input_leds, battery_leds);

    dp.PORTC
        .ddrc
        .modify(|r, w| unsafe { w.bits(r.bits() & !(PORTC_SWITCH_IRQ | PORTC_HUB_IRQ | PORTC_SYSTEM_POWER_IRQ | PORTC_ACTUATOR_POWER_IRQ)) });
    dp.PORTC
        .portc
        .modify(|r, w| unsafe { w.bits(r.bits() | PORTC_SWITCH_IRQ | PORTC_HUB_IRQ | PORTC_SYSTEM_POWER_IRQ | PORTC_ACTUATOR_POWER_IRQ) });

    let port_initial = !dp.PORTC.pinc.read().bits() | PORTC_SWITCH_IRQ;
    interrupt::free(|cs| {
        EVENTS.borrow(cs).set(Some(PowerEventState {
            port_last: port_initial,
            switch_state: SwitchState::Released,
            switch_signal: false,
            usb_signal: false,
            system_power_signal: false,
            actuator_power_signal: false,
        }));
    });

    dp.EXINT.pcicr.modify(|r, w| unsafe { w.bits(r.bits() | 0x02) });
    dp.EXINT
        .pcmsk1
        .write(|w| unsafe { w.bits(PORTC_SWITCH_IRQ | PORTC_HUB_IRQ | PORTC_SYSTEM_POWER_IRQ | PORTC_ACTUATOR_POWER_IRQ) });

    unsafe { interrupt::enable() };

    pms.init();

    let mut pci = PacketControlInterface::new(uart);

    let mut last_sync_time: u32 = 0;
    let mut switch_pressed_time: u32 = 0;
    let mut sync_required = false;

    loop {
        let (switch_signal, usb_signal, power_signal, switch_state) = interrupt::free(|cs| {
            let cell = EVENTS.borrow(cs);
            let mut state = cell.take().unwrap();
            let out = (
                state.switch_signal,
                state.usb_signal,
                state.system_power_signal || state.actuator_power_signal,
                state.switch_state,
            );
            state.switch_signal = false;
            state.usb_signal = false;
            state.system_power_signal = false;
            state.actuator_power_signal = false;
            cell.set(Some(state));
            out
        });

        if switch_signal && switch_state == SwitchState::Pressed {
            switch_pressed_time = clock.millis();
        }
        if power_signal {
            sync_required = true;
        }
        let _ = usb_signal;

        let now = clock.millis();
        if now.wrapping_sub(last_sync_time) > SYNC_PERIOD || sync_required {
            last_sync_time = now;
            sync_required = false;
            pms.update();
        }

        if switch_state == SwitchState::Pressed {
            if pms.is_system_power_on() {
                if clock.millis().wrapping_sub(switch_pressed_time) > HARD_PWDN_PERIOD {
                    pms.set_actuator_power_on(false);
                    pms.set_system_power_on(false);
                    set_switch_released();
                    sync_required = true;
                } else {
                    let _ = pci.send_packet(CommandType::ReqSoftPwdn, &[]);
                }
            } else {
                pms.set_system_power_on(true);
                set_switch_released();
                sync_required = true;
            }
        }

        pci.process_input();
        let Some(packet) = pci.packet().copied() else { continue };

        match packet.command() {
            CommandType::GetUptime if packet.data().is_empty() => {
                let _ = pci.send_packet(CommandType::GetUptime, &clock.millis().to_be_bytes());
            }
            CommandType::GetBattLvl if packet.data().is_empty() => {
                let reply = [pms.system_battery_adc_byte(), pms.actuator_battery_adc_byte()];
                let _ = pci.send_packet(CommandType::GetBattLvl, &reply);
            }
            CommandType::GetPmStatus if packet.data().is_empty() => {
                let reply = [
                    pms.is_system_power_on() as u8,
                    pms.is_actuator_power_on() as u8,
                    pms.is_passthrough_power_on() as u8,
                    pms.is_system_battery_charging() as u8,
                    pms.is_actuator_battery_charging() as u8,
                    pms.system_input_limit() as u8,
                    pms.actuator_input_limit() as u8,
                    pms.adapter_input_state() as u8,
                    pms.usb_input_state() as u8,
                ];
                let _ = pci.send_packet(CommandType::GetPmStatus, &reply);
            }
            CommandType::GetUsbStatus if packet.data().is_empty() => {
                let reply = [
                    pms.usb_hub_enabled() as u8,
                    pms.usb_hub_high_speed() as u8,
                    pms.usb_hub_suspended() as u8,
                    pms.usb_charger_type() as u8,
                ];
                let _ = pci.send_packet(CommandType::GetUsbStatus, &reply);
            }
            CommandType::SetSystemPowerEnable if packet.data().len() == 1 => {
                pms.set_system_power_on(packet.data()[0] != 0);
            }
            CommandType::SetActuatorPowerEnable if packet.data().len() == 1 => {
                pms.set_actuator_power_on(packet.data()[0] != 0);
            }
            CommandType::SetActuatorInputLimitOverride if packet.data().len() == 1 => {
                let limit = match packet.data()[0] {
                    1 => Some(ActInputLimit::L100),
                    2 => Some(ActInputLimit::L150),
                    3 => Some(ActInputLimit::L500),
                    4 => Some(ActInputLimit::L900),
                    _ => None,
                };
                pms.set_actuator_input_limit_override(limit);
            }
            _ => {
                log::warn!("unhandled or malformed command");
            }
        }
    }
}

fn set_switch_released() {
    interrupt::free(|cs| {
        let cell = EVENTS.borrow(cs);
        if let Some(mut state) = cell.take() {
            state.switch_state = SwitchState::Released;
            cell.set(Some(state));
        }
    });
}

/// Fires on an edge of any of the four status-input lines (`PCINT1`
/// group): the front-panel switch, the USB hub's interrupt line, and the
/// two PMICs' charge-state interrupt outputs.
#[avr_device::interrupt(atmega328p)]
fn PCINT1() {
    let snapshot = unsafe { (*avr_device::atmega328p::PORTC::ptr()).pinc.read().bits() };
    interrupt::free(|cs| {
        let cell = EVENTS.borrow(cs);
        if let Some(mut state) = cell.take() {
            let delta = state.port_last ^ snapshot;

            if delta & PORTC_SWITCH_IRQ != 0 {
                state.switch_signal = true;
                state.switch_state = if snapshot & PORTC_SWITCH_IRQ != 0 {
                    SwitchState::Released
                } else {
                    SwitchState::Pressed
                };
            }
            if delta & PORTC_HUB_IRQ != 0 {
                state.usb_signal = state.usb_signal || (snapshot & PORTC_HUB_IRQ == 0);
            }
            if delta & PORTC_SYSTEM_POWER_IRQ != 0 {
                state.system_power_signal = state.system_power_signal || (snapshot & PORTC_SYSTEM_POWER_IRQ == 0);
            }
            if delta & PORTC_ACTUATOR_POWER_IRQ != 0 {
                state.actuator_power_signal = state.actuator_power_signal || (snapshot & PORTC_ACTUATOR_POWER_IRQ == 0);
            }
            state.port_last = snapshot;
            cell.set(Some(state));
        }
    });
}
