//! ATmega328P peripheral bindings for the power-management board.

use avr_device::atmega328p::{ADC, PORTB, PORTC, PORTD, TC2, TWI, USART0};
use avr_device::interrupt::{self, Mutex};
use core::cell::{Cell, RefCell};
use fw_hal::{
    ActFault, ActInputLimit, ActuatorPmic, BatteryState, ChargerType, DeviceState, InputState,
    LedBank, LedPattern, PowerRails, PowerSource, SmbusMaster, SysFault, SysInputLimit,
    SystemPmic, UsbHub,
};

/// Blocking polled USART0 transport, matching the other boards' link.
pub struct Uart {
    usart0: USART0,
}

impl Uart {
    pub fn new(usart0: USART0, baud: u32, f_cpu: u32) -> Self {
        let ubrr = f_cpu / (16 * baud) - 1;
        usart0.ubrr0.write(|w| unsafe { w.bits(ubrr as u16) });
        usart0.ucsr0b.write(|w| w.txen0().set_bit().rxen0().set_bit());
        usart0.ucsr0c.write(|w| w.ucsz0().bits(0b11));
        Uart { usart0 }
    }
}

impl fw_hal::ByteSource for Uart {
    fn available(&mut self) -> bool {
        self.usart0.ucsr0a.read().rxc0().bit_is_set()
    }

    fn read_byte(&mut self) -> u8 {
        self.usart0.udr0.read().bits()
    }
}

impl fw_hal::ByteSink for Uart {
    fn write_byte(&mut self, byte: u8) {
        while self.usart0.ucsr0a.read().udre0().bit_is_clear() {}
        self.usart0.udr0.write(|w| unsafe { w.bits(byte) });
    }
}

/// Four-channel ADC used for the system and actuator battery-level
/// readback, exactly as on the manipulator board.
pub struct Adc {
    adc: ADC,
}

impl Adc {
    pub fn new(adc: ADC) -> Self {
        adc.adcsra.write(|w| w.aden().set_bit().adps().bits(0b111));
        Adc { adc }
    }
}

const ADMUX_REFS_INTERNAL: u8 = 0xC0;

impl fw_hal::AdcChannel for Adc {
    fn sample(&mut self, channel: u8) -> u16 {
        self.adc
            .admux
            .write(|w| unsafe { w.bits(ADMUX_REFS_INTERNAL | (channel & 0x0F)) });
        self.adc.adcsra.modify(|_, w| w.adsc().set_bit());
        while self.adc.adcsra.read().adsc().bit_is_set() {}
        self.adc.adc.read().bits()
    }
}

/// TWI bus error, carrying the raw status code for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwiError(pub u8);

/// Polled master-mode driver for the ATmega328P's single TWI peripheral,
/// shared by the two PMIC mirrors, the two LED banks, and the USB hub's
/// GPIO expander.
pub struct Twi {
    twi: TWI,
}

impl Twi {
    pub fn new(twi: TWI, f_cpu: u32, scl_hz: u32) -> Self {
        let twbr = (f_cpu / scl_hz).saturating_sub(16) / 2;
        twi.twbr.write(|w| unsafe { w.bits(twbr as u8) });
        twi.twsr.write(|w| unsafe { w.twps().bits(0) });
        Twi { twi }
    }

    fn wait(&self) {
        while self.twi.twcr.read().twint().bit_is_clear() {}
    }

    fn status(&self) -> u8 {
        self.twi.twsr.read().bits() & 0xF8
    }

    fn start(&mut self) -> Result<(), TwiError> {
        self.twi
            .twcr
            .write(|w| w.twint().set_bit().twsta().set_bit().twen().set_bit());
        self.wait();
        match self.status() {
            0x08 | 0x10 => Ok(()),
            s => Err(TwiError(s)),
        }
    }

    fn stop(&mut self) {
        self.twi
            .twcr
            .write(|w| w.twint().set_bit().twsto().set_bit().twen().set_bit());
    }

    fn address(&mut self, addr: u8, read: bool) -> Result<(), TwiError> {
        let sla = (addr << 1) | (read as u8);
        self.twi.twdr.write(|w| unsafe { w.bits(sla) });
        self.twi.twcr.write(|w| w.twint().set_bit().twen().set_bit());
        self.wait();
        match self.status() {
            0x18 | 0x40 => Ok(()),
            s => Err(TwiError(s)),
        }
    }

    fn put(&mut self, byte: u8) -> Result<(), TwiError> {
        self.twi.twdr.write(|w| unsafe { w.bits(byte) });
        self.twi.twcr.write(|w| w.twint().set_bit().twen().set_bit());
        self.wait();
        match self.status() {
            0x28 => Ok(()),
            s => Err(TwiError(s)),
        }
    }

    fn get(&mut self, ack: bool) -> u8 {
        self.twi.twcr.write(|w| {
            let w = w.twint().set_bit().twen().set_bit();
            if ack {
                w.twea().set_bit()
            } else {
                w
            }
        });
        self.wait();
        self.twi.twdr.read().bits()
    }

    fn write_transaction(&mut self, addr: u8, bytes: &[u8]) -> Result<(), TwiError> {
        self.start()?;
        self.address(addr, false)?;
        for &byte in bytes {
            self.put(byte)?;
        }
        self.stop();
        Ok(())
    }

    fn write_then_read(&mut self, addr: u8, out: &[u8], input: &mut [u8]) -> Result<(), TwiError> {
        self.start()?;
        self.address(addr, false)?;
        for &byte in out {
            self.put(byte)?;
        }
        self.start()?;
        self.address(addr, true)?;
        let last = input.len().saturating_sub(1);
        for (i, slot) in input.iter_mut().enumerate() {
            *slot = self.get(i != last);
        }
        self.stop();
        Ok(())
    }
}

impl SmbusMaster for Twi {
    type Error = TwiError;

    fn read_byte(&mut self, addr: u8) -> Result<u8, Self::Error> {
        self.start()?;
        self.address(addr, true)?;
        let value = self.get(false);
        self.stop();
        Ok(value)
    }

    fn write_byte(&mut self, addr: u8, value: u8) -> Result<(), Self::Error> {
        self.write_transaction(addr, &[value])
    }

    fn read_byte_data(&mut self, addr: u8, command: u8) -> Result<u8, Self::Error> {
        let mut out = [0u8; 1];
        self.write_then_read(addr, &[command], &mut out)?;
        Ok(out[0])
    }

    fn write_byte_data(&mut self, addr: u8, command: u8, value: u8) -> Result<(), Self::Error> {
        self.write_transaction(addr, &[command, value])
    }

    fn read_word_data(&mut self, addr: u8, command: u8) -> Result<u16, Self::Error> {
        let mut out = [0u8; 2];
        self.write_then_read(addr, &[command], &mut out)?;
        Ok(u16::from_le_bytes(out))
    }

    fn write_word_data(&mut self, addr: u8, command: u8, value: u16) -> Result<(), Self::Error> {
        let bytes = value.to_le_bytes();
        self.write_transaction(addr, &[command, bytes[0], bytes[1]])
    }

    fn read_block_data(&mut self, addr: u8, command: u8, out: &mut [u8]) -> Result<usize, Self::Error> {
        self.write_then_read(addr, &[command], out)?;
        Ok(out.len())
    }

    fn write_block_data(&mut self, addr: u8, command: u8, data: &[u8]) -> Result<(), Self::Error> {
        self.start()?;
        self.address(addr, false)?;
        self.put(command)?;
        for &byte in data {
            self.put(byte)?;
        }
        self.stop();
        Ok(())
    }

    fn read_i2c_block_data(&mut self, addr: u8, command: u8, out: &mut [u8]) -> Result<usize, Self::Error> {
        self.read_block_data(addr, command, out)
    }

    fn write_i2c_block_data(&mut self, addr: u8, command: u8, data: &[u8]) -> Result<(), Self::Error> {
        self.write_block_data(addr, command, data)
    }
}

/// A `&'a RefCell<Twi>` handle, cheap to copy, so the PMIC mirrors, LED
/// banks and USB hub driver can each hold their own independent view of
/// the one physical TWI peripheral without the borrow checker treating
/// them as aliasing `&mut` references to it.
#[derive(Clone, Copy)]
pub struct SharedTwi<'a> {
    cell: &'a RefCell<Twi>,
}

impl<'a> SharedTwi<'a> {
    pub fn new(cell: &'a RefCell<Twi>) -> Self {
        SharedTwi { cell }
    }
}

impl<'a> SmbusMaster for SharedTwi<'a> {
    type Error = TwiError;

    fn read_byte(&mut self, addr: u8) -> Result<u8, Self::Error> {
        self.cell.borrow_mut().read_byte(addr)
    }
    fn write_byte(&mut self, addr: u8, value: u8) -> Result<(), Self::Error> {
        self.cell.borrow_mut().write_byte(addr, value)
    }
    fn read_byte_data(&mut self, addr: u8, command: u8) -> Result<u8, Self::Error> {
        self.cell.borrow_mut().read_byte_data(addr, command)
    }
    fn write_byte_data(&mut self, addr: u8, command: u8, value: u8) -> Result<(), Self::Error> {
        self.cell.borrow_mut().write_byte_data(addr, command, value)
    }
    fn read_word_data(&mut self, addr: u8, command: u8) -> Result<u16, Self::Error> {
        self.cell.borrow_mut().read_word_data(addr, command)
    }
    fn write_word_data(&mut self, addr: u8, command: u8, value: u16) -> Result<(), Self::Error> {
        self.cell.borrow_mut().write_word_data(addr, command, value)
    }
    fn read_block_data(&mut self, addr: u8, command: u8, out: &mut [u8]) -> Result<usize, Self::Error> {
        self.cell.borrow_mut().read_block_data(addr, command, out)
    }
    fn write_block_data(&mut self, addr: u8, command: u8, data: &[u8]) -> Result<(), Self::Error> {
        self.cell.borrow_mut().write_block_data(addr, command, data)
    }
    fn read_i2c_block_data(&mut self, addr: u8, command: u8, out: &mut [u8]) -> Result<usize, Self::Error> {
        self.cell.borrow_mut().read_i2c_block_data(addr, command, out)
    }
    fn write_i2c_block_data(&mut self, addr: u8, command: u8, data: &[u8]) -> Result<(), Self::Error> {
        self.cell.borrow_mut().write_i2c_block_data(addr, command, data)
    }
}

const BQ24161_ADDR: u8 = 0x6B;

const R0_STAT_MASK: u8 = 0x70;
const R0_FAULT_MASK: u8 = 0x07;
const R0_SUPPLY_MASK: u8 = 0x08;
const R1_ADAPTER_STAT_MASK: u8 = 0xC0;
const R1_USB_STAT_MASK: u8 = 0x30;
const R1_BATT_STAT_MASK: u8 = 0x06;
const R1_NOBATT_OP_MASK: u8 = 0x01;
const R2_RST_MASK: u8 = 0x80;
const R2_USB_INPUT_LIMIT_MASK: u8 = 0x70;
const R2_CHG_EN_MASK: u8 = 0x02;
const R3_ADDR: u8 = 0x03;
const R3_ADP_INPUT_LIMIT_MASK: u8 = 0x02;
const R5_ADDR: u8 = 0x05;

const TERM_CURRENT_BASE: u16 = 50;
const TERM_CURRENT_OFFSET: u16 = 50;
const CHRG_CURRENT_BASE: u16 = 75;
const CHRG_CURRENT_OFFSET: u16 = 550;
const REG_VOLTAGE_BASE: u16 = 20;
const REG_VOLTAGE_OFFSET: u16 = 3500;

/// Dual-input (adapter + USB) system PMIC mirror over the BQ24161's
/// SMBus register map, synchronised into cached fields by
/// [`SystemPmic::synchronize`] exactly as the source module reads both
/// status registers once per `Synchronize()` call rather than on every
/// accessor.
pub struct SystemPmicDriver<'a> {
    twi: SharedTwi<'a>,
    preferred: PowerSource,
    selected: PowerSource,
    device_state: DeviceState,
    fault: SysFault,
    adapter_state: InputState,
    usb_state: InputState,
    battery_state: BatteryState,
}

impl<'a> SystemPmicDriver<'a> {
    pub fn new(twi: SharedTwi<'a>) -> Self {
        SystemPmicDriver {
            twi,
            preferred: PowerSource::None,
            selected: PowerSource::None,
            device_state: DeviceState::Standby,
            fault: SysFault::None,
            adapter_state: InputState::UnderVoltage,
            usb_state: InputState::UnderVoltage,
            battery_state: BatteryState::Undefined,
        }
    }

    fn source_reg(source: PowerSource) -> (u8, u8) {
        match source {
            PowerSource::Usb => (0x02, R2_USB_INPUT_LIMIT_MASK),
            _ => (R3_ADDR, R3_ADP_INPUT_LIMIT_MASK),
        }
    }
}

impl<'a> SystemPmic for SystemPmicDriver<'a> {
    fn reset_watchdog_timer(&mut self) {
        let _ = self.twi.write_byte_data(BQ24161_ADDR, 0x00, 0x80);
    }

    fn synchronize(&mut self) {
        let r0 = self.twi.read_byte_data(BQ24161_ADDR, 0x00).unwrap_or(0);
        let r1 = self.twi.read_byte_data(BQ24161_ADDR, 0x01).unwrap_or(0);

        self.preferred = if r0 & R0_SUPPLY_MASK == 0 {
            PowerSource::Adapter
        } else {
            PowerSource::Usb
        };

        let (selected, device_state) = match (r0 & R0_STAT_MASK) >> 4 {
            0x00 => (PowerSource::None, DeviceState::Standby),
            0x01 => (PowerSource::Adapter, DeviceState::Ready),
            0x02 => (PowerSource::Usb, DeviceState::Ready),
            0x03 => (PowerSource::Adapter, DeviceState::Charging),
            0x04 => (PowerSource::Usb, DeviceState::Charging),
            0x05 => (PowerSource::None, DeviceState::Done),
            _ => (PowerSource::None, DeviceState::Fault),
        };
        self.selected = selected;
        self.device_state = device_state;

        self.fault = match r0 & R0_FAULT_MASK {
            0x00 => SysFault::None,
            0x01 => SysFault::DevThermalShdn,
            0x02 => SysFault::BattThermalShdn,
            0x03 => SysFault::WatchdogTmrExpr,
            0x04 => SysFault::SafetyTmrExpr,
            0x05 => SysFault::AdapterFault,
            0x06 => SysFault::UsbFault,
            _ => SysFault::BattFault,
        };

        self.adapter_state = match (r1 & R1_ADAPTER_STAT_MASK) >> 6 {
            0x00 => InputState::Normal,
            0x01 => InputState::OverVoltage,
            0x02 => InputState::WeakSource,
            _ => InputState::UnderVoltage,
        };
        self.usb_state = match (r1 & R1_USB_STAT_MASK) >> 4 {
            0x00 => InputState::Normal,
            0x01 => InputState::OverVoltage,
            0x02 => InputState::WeakSource,
            _ => InputState::UnderVoltage,
        };
        self.battery_state = match (r1 & R1_BATT_STAT_MASK) >> 1 {
            0x00 => BatteryState::Normal,
            0x01 => BatteryState::OverVoltage,
            0x02 => BatteryState::Disconnected,
            _ => BatteryState::Undefined,
        };
    }

    fn input_state(&self, source: PowerSource) -> InputState {
        match source {
            PowerSource::Adapter => self.adapter_state,
            PowerSource::Usb => self.usb_state,
            PowerSource::None => InputState::UnderVoltage,
        }
    }

    fn input_limit(&self, source: PowerSource) -> SysInputLimit {
        let (reg, mask) = Self::source_reg(source);
        let value = self.twi.clone_for_read().read_byte_data(BQ24161_ADDR, reg).unwrap_or(0);
        match source {
            PowerSource::Usb => match (value & mask) >> 4 {
                0 => SysInputLimit::L100,
                1 => SysInputLimit::L150,
                2 => SysInputLimit::L500,
                3 => SysInputLimit::L800,
                4 => SysInputLimit::L900,
                5 => SysInputLimit::L1500,
                _ => SysInputLimit::L0,
            },
            _ => {
                if value & mask == 0 {
                    SysInputLimit::L1500
                } else {
                    SysInputLimit::L2500
                }
            }
        }
    }

    fn set_input_limit(&mut self, source: PowerSource, limit: SysInputLimit) {
        let (reg, mask) = Self::source_reg(source);
        let mut value = self.twi.read_byte_data(BQ24161_ADDR, reg).unwrap_or(0);
        value &= !R2_RST_MASK;
        match source {
            PowerSource::Usb => {
                value &= !mask;
                let code: u8 = match limit {
                    SysInputLimit::L100 => 0,
                    SysInputLimit::L150 => 1,
                    SysInputLimit::L500 => 2,
                    SysInputLimit::L800 => 3,
                    SysInputLimit::L900 => 4,
                    SysInputLimit::L1500 => 5,
                    _ => 5,
                };
                value |= code << 4;
                let _ = self.twi.write_byte_data(BQ24161_ADDR, reg, value);
            }
            _ => {
                value &= !mask;
                if matches!(limit, SysInputLimit::L2500) {
                    value |= mask;
                }
                let _ = self.twi.write_byte_data(BQ24161_ADDR, reg, value);
            }
        }
    }

    fn preferred_source(&self) -> PowerSource {
        self.preferred
    }

    fn selected_source(&self) -> PowerSource {
        self.selected
    }

    fn battery_state(&self) -> BatteryState {
        self.battery_state
    }

    fn fault(&self) -> SysFault {
        self.fault
    }

    fn device_state(&self) -> DeviceState {
        self.device_state
    }

    fn set_charging_enable(&mut self, enable: bool) {
        let mut value = self.twi.read_byte_data(BQ24161_ADDR, 0x02).unwrap_or(0);
        value &= !R2_RST_MASK;
        if enable {
            value &= !R2_CHG_EN_MASK;
        } else {
            value |= R2_CHG_EN_MASK;
        }
        let _ = self.twi.write_byte_data(BQ24161_ADDR, 0x02, value);
    }

    fn set_battery_regulation_voltage(&mut self, millivolts: u16) {
        let mut remaining = millivolts.saturating_sub(REG_VOLTAGE_OFFSET);
        let mut value = self.twi.read_byte_data(BQ24161_ADDR, R3_ADDR).unwrap_or(0);
        for idx in 0..6u16 {
            let inc = (1u16 << (5 - idx)) * REG_VOLTAGE_BASE;
            let bit = 1u8 << ((5 - idx) + 2);
            if remaining / inc > 0 {
                remaining -= inc;
                value |= bit;
            } else {
                value &= !bit;
            }
        }
        let _ = self.twi.write_byte_data(BQ24161_ADDR, R3_ADDR, value);
    }

    fn set_battery_charging_current(&mut self, milliamps: u16) {
        if milliamps < CHRG_CURRENT_OFFSET || milliamps > 2875 {
            return;
        }
        let mut remaining = milliamps - CHRG_CURRENT_OFFSET;
        let mut value = self.twi.read_byte_data(BQ24161_ADDR, R5_ADDR).unwrap_or(0);
        for idx in 0..5u16 {
            let inc = (1u16 << (4 - idx)) * CHRG_CURRENT_BASE;
            let bit = 1u8 << ((4 - idx) + 3);
            if remaining / inc > 0 {
                remaining -= inc;
                value |= bit;
            } else {
                value &= !bit;
            }
        }
        let _ = self.twi.write_byte_data(BQ24161_ADDR, R5_ADDR, value);
    }

    fn set_battery_termination_current(&mut self, milliamps: u16) {
        if milliamps < TERM_CURRENT_OFFSET || milliamps > 2875 {
            return;
        }
        let mut remaining = milliamps - TERM_CURRENT_OFFSET;
        let mut value = self.twi.read_byte_data(BQ24161_ADDR, R5_ADDR).unwrap_or(0);
        for idx in 0..3u16 {
            let inc = (1u16 << (2 - idx)) * TERM_CURRENT_BASE;
            let bit = 1u8 << (2 - idx);
            if remaining / inc > 0 {
                remaining -= inc;
                value |= bit;
            } else {
                value &= !bit;
            }
        }
        let _ = self.twi.write_byte_data(BQ24161_ADDR, R5_ADDR, value);
    }
}

impl<'a> SharedTwi<'a> {
    /// A second handle to the same cell, for the rare accessor (like
    /// `input_limit`) that needs a bus transaction from a `&self` method.
    fn clone_for_read(&self) -> SharedTwi<'a> {
        *self
    }
}

const BQ24250_ADDR: u8 = 0x6A;
const BQ24250_R0_STAT_MASK: u8 = 0x30;
const BQ24250_R0_FAULT_MASK: u8 = 0x0F;
const BQ24250_R1_ILIMIT_MASK: u8 = 0x70;
const BQ24250_R1_HIZ_MASK: u8 = 0x01;
const BQ24250_R1_RST_MASK: u8 = 0x80;
const BQ24250_R1_CHGEN_MASK: u8 = 0x02;

/// Single-input actuator PMIC mirror over the BQ24250's SMBus register
/// map.
pub struct ActuatorPmicDriver<'a> {
    twi: SharedTwi<'a>,
    device_state: DeviceState,
    fault: ActFault,
}

impl<'a> ActuatorPmicDriver<'a> {
    pub fn new(twi: SharedTwi<'a>) -> Self {
        ActuatorPmicDriver {
            twi,
            device_state: DeviceState::Standby,
            fault: ActFault::None,
        }
    }
}

impl<'a> ActuatorPmic for ActuatorPmicDriver<'a> {
    fn reset_watchdog_timer(&mut self) {
        let _ = self.twi.write_byte_data(BQ24250_ADDR, 0x00, 0x40);
    }

    fn synchronize(&mut self) {
        let r0 = self.twi.read_byte_data(BQ24250_ADDR, 0x00).unwrap_or(0);
        self.device_state = match (r0 & BQ24250_R0_STAT_MASK) >> 4 {
            0x00 => DeviceState::Ready,
            0x01 => DeviceState::Charging,
            0x02 => DeviceState::Done,
            _ => DeviceState::Fault,
        };
        self.fault = match r0 & BQ24250_R0_FAULT_MASK {
            0x00 => ActFault::None,
            0x01 => ActFault::InputOverVoltage,
            0x02 => ActFault::InputUnderVoltage,
            0x03 => ActFault::Sleep,
            0x04 => ActFault::BattThermalShdn,
            0x05 => ActFault::BattOverVoltage,
            0x06 => ActFault::DevThermalShdn,
            0x07 => ActFault::DevTimerFault,
            0x08 => ActFault::BattDisconnected,
            0x09 => ActFault::IsetShorted,
            0x0A => ActFault::InputFault,
            _ => ActFault::Undefined,
        };
    }

    fn device_state(&self) -> DeviceState {
        self.device_state
    }

    fn fault(&self) -> ActFault {
        self.fault
    }

    fn set_charging_enable(&mut self, enable: bool) {
        let mut value = self.twi.read_byte_data(BQ24250_ADDR, 0x01).unwrap_or(0);
        value &= !BQ24250_R1_RST_MASK;
        if enable {
            value &= !BQ24250_R1_CHGEN_MASK;
        } else {
            value |= BQ24250_R1_CHGEN_MASK;
        }
        let _ = self.twi.write_byte_data(BQ24250_ADDR, 0x01, value);
    }

    fn set_input_limit(&mut self, limit: ActInputLimit) {
        let mut value = self.twi.read_byte_data(BQ24250_ADDR, 0x01).unwrap_or(0);
        value &= !BQ24250_R1_ILIMIT_MASK;
        value &= !BQ24250_R1_HIZ_MASK;
        value &= !BQ24250_R1_RST_MASK;
        match limit {
            ActInputLimit::L100 => value |= 0x00 << 4,
            ActInputLimit::L150 => value |= 0x01 << 4,
            ActInputLimit::L500 => value |= 0x02 << 4,
            ActInputLimit::L900 => value |= 0x03 << 4,
            ActInputLimit::L2000 => value |= 0x05 << 4,
            ActInputLimit::LExt => value |= 0x06 << 4,
            ActInputLimit::LPtm => value |= 0x07 << 4,
            ActInputLimit::LHiz => value |= BQ24250_R1_HIZ_MASK,
        }
        let _ = self.twi.write_byte_data(BQ24250_ADDR, 0x01, value);
    }

    fn input_limit(&self) -> ActInputLimit {
        let value = self.twi.clone_for_read().read_byte_data(BQ24250_ADDR, 0x01).unwrap_or(BQ24250_R1_HIZ_MASK);
        if value & BQ24250_R1_HIZ_MASK != 0 {
            return ActInputLimit::LHiz;
        }
        match (value & BQ24250_R1_ILIMIT_MASK) >> 4 {
            0 => ActInputLimit::L100,
            1 => ActInputLimit::L150,
            2 => ActInputLimit::L500,
            3 => ActInputLimit::L900,
            4 => ActInputLimit::L1500,
            5 => ActInputLimit::L2000,
            6 => ActInputLimit::LExt,
            7 => ActInputLimit::LPtm,
            _ => ActInputLimit::LHiz,
        }
    }
}

/// The three load-switch enable lines, driven directly off Port D.
pub struct PowerRailsDriver {
    portd: PORTD,
}

const PIN_SYSTEM_EN: u8 = 0x10;
const PIN_PASSTHROUGH_EN: u8 = 0x40;
const PIN_ACTUATORS_EN: u8 = 0x80;

impl PowerRailsDriver {
    pub fn new(portd: PORTD) -> Self {
        portd
            .ddrd
            .modify(|r, w| unsafe { w.bits(r.bits() | PIN_SYSTEM_EN | PIN_PASSTHROUGH_EN | PIN_ACTUATORS_EN) });
        PowerRailsDriver { portd }
    }

    fn set(&mut self, pin: u8, on: bool) {
        self.portd.portd.modify(|r, w| unsafe {
            let bits = if on { r.bits() | pin } else { r.bits() & !pin };
            w.bits(bits)
        });
    }

    fn is_set(&self, pin: u8) -> bool {
        self.portd.portd.read().bits() & pin != 0
    }
}

impl PowerRails for PowerRailsDriver {
    fn set_system_power(&mut self, on: bool) {
        self.set(PIN_SYSTEM_EN, on);
    }
    fn is_system_power_on(&self) -> bool {
        self.is_set(PIN_SYSTEM_EN)
    }
    fn set_actuator_power(&mut self, on: bool) {
        self.set(PIN_ACTUATORS_EN, on);
    }
    fn is_actuator_power_on(&self) -> bool {
        self.is_set(PIN_ACTUATORS_EN)
    }
    fn set_passthrough_power(&mut self, on: bool) {
        self.set(PIN_PASSTHROUGH_EN, on);
    }
    fn is_passthrough_power_on(&self) -> bool {
        self.is_set(PIN_PASSTHROUGH_EN)
    }
}

/// PCA9633 four-channel LED driver. `MODE2`'s group-dimming bank is used
/// for [`LedPattern::Blink`], matching the chip's two steady-state
/// outputs (off, full-on) plus one blinking bank the way the original
/// status-LED banks are wired.
pub struct LedBankDriver<'a> {
    twi: SharedTwi<'a>,
    addr: u8,
}

const PCA9633_MODE1: u8 = 0x00;
const PCA9633_MODE2: u8 = 0x01;
const PCA9633_GRPPWM: u8 = 0x06;
const PCA9633_GRPFREQ: u8 = 0x07;
const PCA9633_LEDOUT: u8 = 0x08;

impl<'a> LedBankDriver<'a> {
    pub fn new(twi: SharedTwi<'a>, addr: u8) -> Self {
        let mut bank = LedBankDriver { twi, addr };
        let _ = bank.twi.write_byte_data(bank.addr, PCA9633_MODE1, 0x00);
        let _ = bank.twi.write_byte_data(bank.addr, PCA9633_MODE2, 0x20);
        let _ = bank.twi.write_byte_data(bank.addr, PCA9633_GRPPWM, 0x80);
        let _ = bank.twi.write_byte_data(bank.addr, PCA9633_GRPFREQ, 0x18);
        let _ = bank.twi.write_byte_data(bank.addr, PCA9633_LEDOUT, 0x00);
        bank
    }
}

impl<'a> LedBank for LedBankDriver<'a> {
    fn set_led(&mut self, index: u8, pattern: LedPattern) {
        let mut ledout = self.twi.read_byte_data(self.addr, PCA9633_LEDOUT).unwrap_or(0);
        let shift = (index & 0x03) * 2;
        ledout &= !(0x03 << shift);
        let mode = match pattern {
            LedPattern::Off => 0b00,
            LedPattern::Solid => 0b01,
            LedPattern::Blink => 0b11,
        };
        ledout |= mode << shift;
        let _ = self.twi.write_byte_data(self.addr, PCA9633_LEDOUT, ledout);
    }
}

const MCP23008_ADDR: u8 = 0x21;
const MCP23008_IODIR: u8 = 0x00;
const MCP23008_GPINTEN: u8 = 0x02;
const MCP23008_GPIO: u8 = 0x09;

const HUB_HS_IND: u8 = 0x01;
const HUB_CFG_STRAP1: u8 = 0x02;
const HUB_SUSP_IND: u8 = 0x04;
const HUB_CFG_STRAP2: u8 = 0x08;
const HUB_TW_SDA_PU: u8 = 0x10;
const HUB_TW_SCL_PU: u8 = 0x20;
const HUB_TW_INT_EN: u8 = 0x40;
const HUB_RST: u8 = 0x80;

const UIS_EN_PIN: u8 = 0x01;
const UIS_NRST_PIN: u8 = 0x02;

const USB2532_ADDR: u8 = 0x2C;
const USB2532_BC_DET_REG: u8 = 0x2D;
const HUB_CHGDET_DONE: u8 = 0x10;
const HUB_CHGDET_RES_SHIFT: u8 = 5;

/// USB2532 hub plus its MCP23008 strap/status GPIO expander, driven
/// through the board's `EN`/`NRST` lines on Port B and the expander's
/// `PORT`/`DIRECTION`/`GPINTEN` registers on the shared TWI bus.
pub struct UsbHubDriver<'a> {
    twi: SharedTwi<'a>,
    portb: PORTB,
}

impl<'a> UsbHubDriver<'a> {
    pub fn new(twi: SharedTwi<'a>, portb: PORTB) -> Self {
        portb
            .portb
            .modify(|r, w| unsafe { w.bits(r.bits() & !(UIS_EN_PIN | UIS_NRST_PIN)) });
        portb
            .ddrb
            .modify(|r, w| unsafe { w.bits(r.bits() | UIS_EN_PIN | UIS_NRST_PIN) });
        UsbHubDriver { twi, portb }
    }
}

impl<'a> UsbHub for UsbHubDriver<'a> {
    fn enable(&mut self) {
        self.portb
            .portb
            .modify(|r, w| unsafe { w.bits(r.bits() | UIS_EN_PIN | UIS_NRST_PIN) });

        let mut port = HUB_TW_SDA_PU | HUB_TW_SCL_PU;
        let _ = self.twi.write_byte_data(MCP23008_ADDR, MCP23008_GPIO, port);
        let outputs = !(HUB_CFG_STRAP1 | HUB_CFG_STRAP2 | HUB_TW_SDA_PU | HUB_TW_SCL_PU | HUB_TW_INT_EN | HUB_RST);
        let _ = self.twi.write_byte_data(MCP23008_ADDR, MCP23008_IODIR, outputs);
        port |= HUB_TW_INT_EN;
        let _ = self.twi.write_byte_data(MCP23008_ADDR, MCP23008_GPIO, port);
        port |= HUB_RST;
        let _ = self.twi.write_byte_data(MCP23008_ADDR, MCP23008_GPIO, port);
        let _ = self.twi.write_byte_data(MCP23008_ADDR, MCP23008_GPINTEN, HUB_HS_IND | HUB_SUSP_IND);
    }

    fn disable(&mut self) {
        let _ = self.twi.write_byte_data(MCP23008_ADDR, MCP23008_GPINTEN, 0x00);
        let port = HUB_TW_SDA_PU | HUB_TW_SCL_PU;
        let _ = self.twi.write_byte_data(MCP23008_ADDR, MCP23008_GPIO, port);
        self.portb.portb.modify(|r, w| unsafe { w.bits(r.bits() & !UIS_NRST_PIN) });
        self.portb.portb.modify(|r, w| unsafe { w.bits(r.bits() & !UIS_EN_PIN) });
    }

    fn is_enabled(&self) -> bool {
        self.portb.portb.read().bits() & UIS_EN_PIN != 0
    }

    fn is_suspended(&mut self) -> bool {
        let port = self.twi.read_byte_data(MCP23008_ADDR, MCP23008_GPIO).unwrap_or(0);
        (port & HUB_SUSP_IND) ^ ((port & HUB_CFG_STRAP2) >> 1) != 0
    }

    fn is_high_speed(&mut self) -> bool {
        let port = self.twi.read_byte_data(MCP23008_ADDR, MCP23008_GPIO).unwrap_or(0);
        (port & HUB_HS_IND) ^ ((port & HUB_CFG_STRAP1) >> 1) != 0
    }

    fn detect_charger(&mut self) -> ChargerType {
        let reg = self.twi.read_byte_data(USB2532_ADDR, USB2532_BC_DET_REG).unwrap_or(0);
        if reg & HUB_CHGDET_DONE == 0 {
            return ChargerType::Wait;
        }
        match reg >> HUB_CHGDET_RES_SHIFT {
            0x00 => ChargerType::Wait,
            0x01 => ChargerType::Dcp,
            0x02 => ChargerType::Cdp,
            0x03 => ChargerType::Sdp,
            0x04 => ChargerType::Se1L,
            0x05 => ChargerType::Se1H,
            0x06 => ChargerType::Se1S,
            _ => ChargerType::Disabled,
        }
    }
}

const TIMER2_COMPARE: u8 = 124;

/// Millisecond clock driven by Timer2 in CTC mode, counting a static
/// tick shared with the foreground loop via a critical-section cell —
/// matches the original's dedicated hardware timer object rather than a
/// software-decremented loop counter.
pub struct Clock {
    millis: &'static Mutex<Cell<u32>>,
}

static CLOCK_MILLIS: Mutex<Cell<u32>> = Mutex::new(Cell::new(0));

impl Clock {
    pub fn new(tc2: TC2) -> Self {
        tc2.tccr2a.write(|w| w.wgm2().bits(0b10));
        tc2.tccr2b.write(|w| w.cs2().bits(0b100));
        tc2.ocr2a.write(|w| unsafe { w.bits(TIMER2_COMPARE) });
        tc2.timsk2.write(|w| w.ocie2a().set_bit());
        Clock { millis: &CLOCK_MILLIS }
    }
}

impl fw_hal::Clock for Clock {
    fn millis(&self) -> u32 {
        interrupt::free(|cs| self.millis.borrow(cs).get())
    }
}

/// Fires once a millisecond (Timer2 in CTC mode at 8MHz/64 with a
/// 125-count compare value).
#[avr_device::interrupt(atmega328p)]
fn TIMER2_COMPA() {
    interrupt::free(|cs| {
        let cell = CLOCK_MILLIS.borrow(cs);
        cell.set(cell.get().wrapping_add(1));
    });
}
