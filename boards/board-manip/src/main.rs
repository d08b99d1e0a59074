//! Manipulator board firmware.
//!
//! Runs the lift actuator's state machine in the foreground loop (per
//! [`fw_lift::LiftActuator::step`]'s documented polling contract), feeds
//! it debounced limit-switch readings from `PCINT2` and step counts from
//! `TIMER0_COMPA`, and answers the host's electromagnet, charger-status,
//! NFC/RF, and SMBus passthrough requests directly from the command loop.

#![no_std]
#![no_main]

mod hal;

use avr_device::atmega328p::Peripherals;
use avr_device::interrupt::{self, Mutex};
use core::cell::RefCell;
use fw_hal::{AdcChannel, ChannelSelector, NfcReaderWriter, RfProximitySensor, SmbusMaster};
use fw_lift::{Debouncer, LiftActuator, SystemEvent};
use fw_pci::{CommandType, PacketControlInterface};
use hal::{
    adc_byte, Adc, Board, ChargerMonitor, DischargeMode, ElectromagnetController, NfcFrontEnd,
    Stepper, Twi, TwChannelMux, Uart,
};
use panic_halt as _;

const F_CPU: u32 = 8_000_000;
const UART_BAUD: u32 = 115_200;
const SYSTEM_BATTERY_ADC_CHANNEL: u8 = 6;
const EM_ACCUM_VOLTAGE_ADC_CHANNEL: u8 = 7;

type Lift = LiftActuator<Stepper>;

static LIFT: Mutex<RefCell<Option<Lift>>> = Mutex::new(RefCell::new(None));
static DEBOUNCE: Mutex<RefCell<Debouncer>> = Mutex::new(RefCell::new(Debouncer::new()));

#[avr_device::entry]
fn main() -> ! {
    let dp = Peripherals::take().unwrap();

    let uart = Uart::new(dp.USART0, UART_BAUD, F_CPU);
    dp.TC0.timsk0.write(|w| w.ocie0a().set_bit());
    let stepper = Stepper::new(dp.TC0, dp.PORTD);
    let mut adc = Adc::new(dp.ADC);
    let charger = ChargerMonitor::new(dp.PORTC);
    let mut electromagnet = ElectromagnetController::new(dp.PORTB, dp.PORTC);
    let mut twi = Twi::new(dp.TWI, F_CPU, 100_000);
    let mut tw_channel = Board::Interfaceboard;

    dp.EXINT.pcicr.modify(|r, w| unsafe { w.bits(r.bits() | 0x04) });
    dp.EXINT.pcmsk2.write(|w| unsafe { w.bits(0x90) });

    dp.TC1.tccr1b.write(|w| w.cs1().bits(0b101));

    interrupt::free(|cs| {
        LIFT.borrow(cs).replace(Some(LiftActuator::new(stepper)));
    });

    unsafe { interrupt::enable() };

    let mut pci = PacketControlInterface::new(uart);
    let mut reply = [0u8; 8];

    loop {
        interrupt::free(|cs| {
            if let Some(lift) = LIFT.borrow(cs).borrow_mut().as_mut() {
                lift.step();
            }
        });

        pci.process_input();
        let Some(packet) = pci.packet().copied() else { continue };

        match packet.command() {
            CommandType::GetUptime if packet.data().is_empty() => {
                let _ = pci.send_packet(CommandType::GetUptime, &[0, 0, 0, 0]);
            }
            CommandType::GetBattLvl if packet.data().is_empty() => {
                let level = adc_byte(&mut adc, SYSTEM_BATTERY_ADC_CHANNEL);
                let _ = pci.send_packet(CommandType::GetBattLvl, &[level]);
            }
            CommandType::GetChargerStatus if packet.data().is_empty() => {
                let (power_good, charging) = charger.read();
                reply[0] = if power_good { 0x00 } else { 0x01 };
                reply[1] = if charging { 0x00 } else { 0x01 };
                let _ = pci.send_packet(CommandType::GetChargerStatus, &reply[0..2]);
            }
            CommandType::SetLiftActuatorPosition if packet.data().len() == 1 => {
                let mm = packet.data()[0];
                interrupt::free(|cs| {
                    if let Some(lift) = LIFT.borrow(cs).borrow_mut().as_mut() {
                        lift.set_position(mm);
                        lift.process_event(SystemEvent::StartPositionCtrl);
                    }
                });
            }
            CommandType::SetLiftActuatorSpeed if packet.data().len() == 1 => {
                let speed = packet.data()[0] as i8;
                interrupt::free(|cs| {
                    if let Some(lift) = LIFT.borrow(cs).borrow_mut().as_mut() {
                        lift.set_speed(speed);
                        lift.process_event(SystemEvent::StartSpeedCtrl);
                    }
                });
            }
            CommandType::CalibrateLiftActuator if packet.data().is_empty() => {
                interrupt::free(|cs| {
                    if let Some(lift) = LIFT.borrow(cs).borrow_mut().as_mut() {
                        lift.process_event(SystemEvent::StartCalibration);
                    }
                });
            }
            CommandType::EmerStopLiftActuator if packet.data().is_empty() => {
                interrupt::free(|cs| {
                    if let Some(lift) = LIFT.borrow(cs).borrow_mut().as_mut() {
                        lift.process_event(SystemEvent::Stop);
                    }
                });
            }
            CommandType::GetLiftActuatorPosition if packet.data().is_empty() => {
                let position = interrupt::free(|cs| {
                    LIFT.borrow(cs)
                        .borrow()
                        .as_ref()
                        .map(|l| l.position())
                        .unwrap_or(0)
                });
                let _ = pci.send_packet(CommandType::GetLiftActuatorPosition, &[position]);
            }
            CommandType::GetLiftActuatorState if packet.data().is_empty() => {
                let state = interrupt::free(|cs| {
                    LIFT.borrow(cs)
                        .borrow()
                        .as_ref()
                        .map(|l| l.state() as u8)
                        .unwrap_or(0)
                });
                let _ = pci.send_packet(CommandType::GetLiftActuatorState, &[state]);
            }
            CommandType::GetLimitSwitchState if packet.data().is_empty() => {
                let (upper, lower) = interrupt::free(|cs| {
                    LIFT.borrow(cs)
                        .borrow()
                        .as_ref()
                        .map(|l| (l.upper_switch(), l.lower_switch()))
                        .unwrap_or((false, false))
                });
                reply[0] = upper as u8;
                reply[1] = lower as u8;
                let _ = pci.send_packet(CommandType::GetLimitSwitchState, &reply[0..2]);
            }
            CommandType::SetEmChargeEnable if packet.data().len() == 1 => {
                electromagnet.set_charge_enable(packet.data()[0] != 0);
            }
            CommandType::SetEmDischargeMode if packet.data().len() == 1 => {
                let mode = match packet.data()[0] {
                    0 => DischargeMode::Constructive,
                    1 => DischargeMode::Destructive,
                    _ => DischargeMode::Disable,
                };
                electromagnet.set_discharge_mode(mode);
            }
            CommandType::GetEmAccumVoltage if packet.data().is_empty() => {
                let voltage = adc_byte(&mut adc, EM_ACCUM_VOLTAGE_ADC_CHANNEL);
                let _ = pci.send_packet(CommandType::GetEmAccumVoltage, &[voltage]);
            }
            CommandType::GetRfRange if packet.data().is_empty() => {
                with_interface_channel(&mut twi, &mut tw_channel, |twi| {
                    let range = hal::InfraredProximitySensor::new(twi).range();
                    let _ = pci.send_packet(CommandType::GetRfRange, &range.to_be_bytes());
                });
            }
            CommandType::GetRfAmbient if packet.data().is_empty() => {
                with_interface_channel(&mut twi, &mut tw_channel, |twi| {
                    let ambient = hal::InfraredProximitySensor::new(twi).ambient();
                    let _ = pci.send_packet(CommandType::GetRfAmbient, &ambient.to_be_bytes());
                });
            }
            CommandType::ReadNfc if packet.data().is_empty() => {
                with_interface_channel(&mut twi, &mut tw_channel, |twi| {
                    let mut frame = [0u8; 8];
                    if let Ok(len) = NfcFrontEnd::new(twi).read(&mut frame) {
                        let _ = pci.send_packet(CommandType::ReadNfc, &frame[..len]);
                    }
                });
            }
            CommandType::WriteNfc if !packet.data().is_empty() => {
                with_interface_channel(&mut twi, &mut tw_channel, |twi| {
                    let mut rx = [0u8; 8];
                    let _ = NfcFrontEnd::new(twi).transceive(packet.data(), &mut rx);
                });
            }
            CommandType::ReadSmbusByte if packet.data().len() == 1 => {
                if let Ok(value) = twi.read_byte(packet.data()[0]) {
                    let _ = pci.send_packet(CommandType::ReadSmbusByte, &[value]);
                }
            }
            CommandType::WriteSmbusByte if packet.data().len() == 2 => {
                let data = packet.data();
                let _ = twi.write_byte(data[0], data[1]);
            }
            CommandType::ReadSmbusByteData if packet.data().len() == 2 => {
                let data = packet.data();
                if let Ok(value) = twi.read_byte_data(data[0], data[1]) {
                    let _ = pci.send_packet(CommandType::ReadSmbusByteData, &[value]);
                }
            }
            CommandType::WriteSmbusByteData if packet.data().len() == 3 => {
                let data = packet.data();
                let _ = twi.write_byte_data(data[0], data[1], data[2]);
            }
            CommandType::ReadSmbusWordData if packet.data().len() == 2 => {
                let data = packet.data();
                if let Ok(value) = twi.read_word_data(data[0], data[1]) {
                    let _ = pci.send_packet(CommandType::ReadSmbusWordData, &value.to_le_bytes());
                }
            }
            CommandType::WriteSmbusWordData if packet.data().len() == 4 => {
                let data = packet.data();
                let value = u16::from_le_bytes([data[2], data[3]]);
                let _ = twi.write_word_data(data[0], data[1], value);
            }
            CommandType::ReadSmbusBlockData if packet.data().len() == 3 => {
                let data = packet.data();
                let count = (data[2] as usize).min(reply.len());
                if let Ok(len) = twi.read_block_data(data[0], data[1], &mut reply[..count]) {
                    let _ = pci.send_packet(CommandType::ReadSmbusBlockData, &reply[..len]);
                }
            }
            CommandType::WriteSmbusBlockData if packet.data().len() >= 2 => {
                let data = packet.data();
                let _ = twi.write_block_data(data[0], data[1], &data[2..]);
            }
            CommandType::ReadSmbusI2cBlockData if packet.data().len() == 3 => {
                let data = packet.data();
                let count = (data[2] as usize).min(reply.len());
                if let Ok(len) = twi.read_i2c_block_data(data[0], data[1], &mut reply[..count]) {
                    let _ = pci.send_packet(CommandType::ReadSmbusI2cBlockData, &reply[..len]);
                }
            }
            CommandType::WriteSmbusI2cBlockData if packet.data().len() >= 2 => {
                let data = packet.data();
                let _ = twi.write_i2c_block_data(data[0], data[1], &data[2..]);
            }
            _ => {
                log::warn!("unhandled or malformed command");
            }
        }
    }
}

/// Selects the interface-board segment of the muxed bus for the duration
/// of `f`, then restores whatever segment was previously selected.
fn with_interface_channel(twi: &mut Twi, current: &mut Board, f: impl FnOnce(&mut Twi)) {
    let previous = *current;
    TwChannelMux::new(&mut *twi, &mut *current).select(Board::Interfaceboard);
    f(&mut *twi);
    TwChannelMux::new(&mut *twi, &mut *current).select(previous);
}

/// Fires on an edge of either limit-switch line (`PCINT2` group).
#[avr_device::interrupt(atmega328p)]
fn PCINT2() {
    let port = unsafe { (*avr_device::atmega328p::PORTD::ptr()).pind.read().bits() };
    interrupt::free(|cs| {
        let settled = DEBOUNCE.borrow(cs).borrow_mut().sample(port & 0x10 != 0, port & 0x80 != 0);
        if let Some((upper, lower)) = settled {
            if let Some(lift) = LIFT.borrow(cs).borrow_mut().as_mut() {
                lift.on_limit_switch_update(upper, lower);
            }
        }
    });
}

/// Fires on every stepper pulse compare-match, advancing the step
/// counter per the direction pin's state at the time of the pulse.
#[avr_device::interrupt(atmega328p)]
fn TIMER0_COMPA() {
    let port = unsafe { (*avr_device::atmega328p::PORTD::ptr()).portd.read().bits() };
    let forward = fw_lift::step_is_forward(port, 0x02);
    interrupt::free(|cs| {
        if let Some(lift) = LIFT.borrow(cs).borrow_mut().as_mut() {
            lift.note_step(forward);
        }
    });
}
