//! Sensor/actuator board firmware.
//!
//! Drives the differential-drive base and reports accelerometer readings
//! over the framed packet link. The encoder lines interrupt on every edge
//! (`PCINT1`) and the PID loop ticks off Timer1's compare match
//! (`TIMER1_COMPA`, ~61.3 Hz); both run the [`fw_drive::DifferentialDrive`]
//! logic directly from interrupt context, so the foreground loop in
//! [`exec`] only ever has to pump the packet parser and answer host
//! requests.

#![no_std]
#![no_main]

mod hal;

use avr_device::atmega328p::Peripherals;
use avr_device::interrupt::{self, Mutex};
use core::cell::RefCell;
use fw_drive::{DifferentialDrive, EncoderMasks};
use fw_hal::{Accelerometer, AdcChannel};
use fw_pci::{CommandType, PacketControlInterface};
use hal::{AnalogAccelerometer, HBridgeDriver, Uart};
use panic_halt as _;

const F_CPU: u32 = 8_000_000;
const UART_BAUD: u32 = 115_200;

type Drive = DifferentialDrive<HBridgeDriver>;

static DRIVE: Mutex<RefCell<Option<Drive>>> = Mutex::new(RefCell::new(None));

#[avr_device::entry]
fn main() -> ! {
    let dp = Peripherals::take().unwrap();

    let uart = Uart::new(dp.USART0, UART_BAUD, F_CPU);
    let bridge = HBridgeDriver::new(dp.TC0, dp.PORTD);
    let mut accel = AnalogAccelerometer::new(dp.ADC);

    dp.EXINT.pcicr.modify(|r, w| unsafe { w.bits(r.bits() | 0x02) });
    dp.EXINT.pcmsk1.write(|w| unsafe { w.bits(0x0F) });

    dp.TC1.tccr1b.write(|w| w.wgm1().bits(0b01).cs1().bits(0b011));
    dp.TC1.ocr1a.write(|w| unsafe { w.bits(2039) });
    dp.TC1.timsk1.write(|w| w.ocie1a().set_bit());

    interrupt::free(|cs| {
        DRIVE.borrow(cs).replace(Some(DifferentialDrive::new(bridge)));
    });

    unsafe { interrupt::enable() };

    let mut pci = PacketControlInterface::new(uart);
    exec(&mut pci, &mut accel)
}

fn exec(pci: &mut PacketControlInterface<Uart>, accel: &mut AnalogAccelerometer) -> ! {
    loop {
        pci.process_input();
        let Some(packet) = pci.packet().copied() else { continue };

        match packet.command() {
            CommandType::SetDdsEnable if packet.data().len() == 1 => {
                let enable = packet.data()[0] != 0;
                interrupt::free(|cs| {
                    if let Some(drive) = DRIVE.borrow(cs).borrow_mut().as_mut() {
                        if enable {
                            drive.enable();
                        } else {
                            drive.disable();
                        }
                    }
                });
            }
            CommandType::SetDdsParams if packet.data().len() == 12 => {
                let data = packet.data();
                let kp = f32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                let ki = f32::from_be_bytes([data[4], data[5], data[6], data[7]]);
                let kd = f32::from_be_bytes([data[8], data[9], data[10], data[11]]);
                interrupt::free(|cs| {
                    if let Some(drive) = DRIVE.borrow(cs).borrow_mut().as_mut() {
                        drive.set_pid_params(kp, ki, kd);
                    }
                });
            }
            CommandType::SetDdsSpeed if packet.data().len() == 4 => {
                let data = packet.data();
                let left = i16::from_be_bytes([data[0], data[1]]);
                let right = i16::from_be_bytes([data[2], data[3]]);
                interrupt::free(|cs| {
                    if let Some(drive) = DRIVE.borrow(cs).borrow_mut().as_mut() {
                        drive.set_target_velocity(left, right);
                    }
                });
            }
            CommandType::GetDdsSpeed if packet.data().is_empty() => {
                let (left, right) = interrupt::free(|cs| {
                    DRIVE
                        .borrow(cs)
                        .borrow()
                        .as_ref()
                        .map(|d| (d.left_velocity(), d.right_velocity()))
                        .unwrap_or((0, 0))
                });
                let mut reply = [0u8; 4];
                reply[0..2].copy_from_slice(&left.to_be_bytes());
                reply[2..4].copy_from_slice(&right.to_be_bytes());
                let _ = pci.send_packet(CommandType::GetDdsSpeed, &reply);
            }
            CommandType::GetUptime if packet.data().is_empty() => {
                let _ = pci.send_packet(CommandType::GetUptime, &[0, 0, 0, 0]);
            }
            CommandType::GetAccelReading if packet.data().is_empty() => {
                let reading = accel.read();
                let mut reply = [0u8; 8];
                reply[0..2].copy_from_slice(&reading.x.to_be_bytes());
                reply[2..4].copy_from_slice(&reading.y.to_be_bytes());
                reply[4..6].copy_from_slice(&reading.z.to_be_bytes());
                reply[6..8].copy_from_slice(&reading.temp.to_be_bytes());
                let _ = pci.send_packet(CommandType::GetAccelReading, &reply);
            }
            _ => {
                log::warn!("unhandled or malformed command");
            }
        }
    }
}

/// Fires on every edge of the four quadrature lines wired to Port C.
#[avr_device::interrupt(atmega328p)]
fn PCINT1() {
    let port = unsafe { (*avr_device::atmega328p::PORTC::ptr()).pinc.read().bits() } & 0x0F;
    interrupt::free(|cs| {
        if let Some(drive) = DRIVE.borrow(cs).borrow_mut().as_mut() {
            drive.note_encoder_sample(port, EncoderMasks::SENSACT_BOARD);
        }
    });
}

/// Fires at the PID control rate.
#[avr_device::interrupt(atmega328p)]
fn TIMER1_COMPA() {
    interrupt::free(|cs| {
        if let Some(drive) = DRIVE.borrow(cs).borrow_mut().as_mut() {
            drive.tick();
        }
    });
}
