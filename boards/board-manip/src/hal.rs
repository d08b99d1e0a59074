//! ATmega328P peripheral bindings for the manipulator board.

use avr_device::atmega328p::{ADC, PORTB, PORTC, PORTD, TC0, TWI, USART0};
use embedded_hal::blocking::delay::DelayMs;
use fw_hal::{
    ChannelSelector, Direction, NfcReaderWriter, RfProximitySensor, SmbusMaster, StepperDriver,
};

const F_CPU: u32 = 8_000_000;

/// Blocking polled USART0 transport, matching the host link's framing.
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

/// The lift actuator's stepper waveform, generated on Timer0 exactly as
/// on the sensact board's drive PWM, but toggling a single step/direction
/// pair instead of modulating duty cycle.
pub struct Stepper {
    tc0: TC0,
    portd: PORTD,
    half_period: u16,
    direction: Option<Direction>,
}

const PIN_STEP: u8 = 0x01;
const PIN_DIR: u8 = 0x02;

impl Stepper {
    pub fn new(tc0: TC0, portd: PORTD) -> Self {
        tc0.tccr0a.write(|w| w.wgm0().bits(0b10));
        portd
            .ddrd
            .modify(|r, w| unsafe { w.bits(r.bits() | PIN_STEP | PIN_DIR) });
        Stepper {
            tc0,
            portd,
            half_period: 0,
            direction: None,
        }
    }
}

impl StepperDriver for Stepper {
    fn enable(&mut self, half_period: u16, direction: Direction) {
        self.portd.portd.modify(|r, w| unsafe {
            let bits = match direction {
                Direction::Forward => r.bits() & !PIN_DIR,
                Direction::Reverse => r.bits() | PIN_DIR,
            };
            w.bits(bits)
        });
        self.tc0.ocr0a.write(|w| unsafe { w.bits(half_period as u8) });
        self.tc0.tccr0b.write(|w| w.cs0().bits(0b011));
        self.tc0.tccr0a.modify(|r, w| unsafe { w.bits(r.bits() | 0x40) });
        self.half_period = half_period;
        self.direction = Some(direction);
    }

    fn disable(&mut self) {
        self.tc0.tccr0b.write(|w| w.cs0().bits(0b000));
        self.tc0.tccr0a.modify(|r, w| unsafe { w.bits(r.bits() & !0x40) });
        self.direction = None;
    }

    fn is_active(&self) -> bool {
        self.direction.is_some()
    }

    fn current(&self) -> Option<(u16, Direction)> {
        self.direction.map(|d| (self.half_period, d))
    }
}

/// Four-channel ADC used for the battery-level readback and the
/// electromagnet capacitor bank's accumulated voltage.
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

/// Battery-level and capacitor-voltage readings are truncated to 8 bits
/// on the wire, matching `CADCController::GetValue`'s `uint8_t` return.
pub fn adc_byte(adc: &mut Adc, channel: u8) -> u8 {
    use fw_hal::AdcChannel;
    (adc.sample(channel) >> 2) as u8
}

const PWR_MON_CHG: u8 = 0x01;
const PWR_MON_PGOOD: u8 = 0x02;

/// The two charger power-good/charge-status monitor lines, sampled
/// directly off Port C rather than through a PMIC register.
pub struct ChargerMonitor {
    portc: PORTC,
}

impl ChargerMonitor {
    pub fn new(portc: PORTC) -> Self {
        portc
            .ddrc
            .modify(|r, w| unsafe { w.bits(r.bits() & !(PWR_MON_CHG | PWR_MON_PGOOD)) });
        portc
            .portc
            .modify(|r, w| unsafe { w.bits(r.bits() & !(PWR_MON_CHG | PWR_MON_PGOOD)) });
        ChargerMonitor { portc }
    }

    /// Returns `(power_good, charging)`. Both lines read active-low.
    pub fn read(&self) -> (bool, bool) {
        let pin = self.portc.pinc.read().bits();
        (pin & PWR_MON_PGOOD == 0, pin & PWR_MON_CHG == 0)
    }
}

const COILS_REG_EN: u8 = 0x08;
const COILS_CTRL_A: u8 = 0x01;
const COILS_CTRL_B: u8 = 0x02;

/// One of the three states the capacitor-discharge coil driver can be
/// put into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DischargeMode {
    Constructive,
    Destructive,
    Disable,
}

/// Drives the capacitor-bank electromagnet: a regulator enable line
/// (`COILS_REG_EN`, toggled via its data-direction bit rather than its
/// output level, matching the source quirk of leaving the pin's output
/// latch permanently driven high and instead switching it between input
/// and output) and a two-pin coil driver.
pub struct ElectromagnetController {
    portb: PORTB,
    portc: PORTC,
}

impl ElectromagnetController {
    pub fn new(portb: PORTB, portc: PORTC) -> Self {
        portc.portc.modify(|r, w| unsafe { w.bits(r.bits() | COILS_REG_EN) });
        portc.ddrc.modify(|r, w| unsafe { w.bits(r.bits() & !COILS_REG_EN) });
        portb
            .portb
            .modify(|r, w| unsafe { w.bits(r.bits() & !(COILS_CTRL_A | COILS_CTRL_B)) });
        portb
            .ddrb
            .modify(|r, w| unsafe { w.bits(r.bits() | COILS_CTRL_A | COILS_CTRL_B) });
        ElectromagnetController { portb, portc }
    }

    pub fn set_charge_enable(&mut self, enable: bool) {
        self.portc.ddrc.modify(|r, w| unsafe {
            let bits = if enable {
                r.bits() | COILS_REG_EN
            } else {
                r.bits() & !COILS_REG_EN
            };
            w.bits(bits)
        });
    }

    pub fn set_discharge_mode(&mut self, mode: DischargeMode) {
        self.portb
            .portb
            .modify(|r, w| unsafe { w.bits(r.bits() & !(COILS_CTRL_A | COILS_CTRL_B)) });
        let pin = match mode {
            DischargeMode::Constructive => COILS_CTRL_B,
            DischargeMode::Destructive => COILS_CTRL_A,
            DischargeMode::Disable => 0,
        };
        if pin != 0 {
            self.portb.portb.modify(|r, w| unsafe { w.bits(r.bits() | pin) });
        }
    }
}

/// TWI bus error, carrying the raw status code for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwiError(pub u8);

/// Polled master-mode driver for the ATmega328P's single TWI peripheral,
/// shared by the SMBus passthrough commands, the NFC front end, the RF
/// proximity sensor, and the mainboard/interfaceboard channel mux.
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

/// Which segment of the muxed bus is currently selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Board {
    Mainboard,
    Interfaceboard,
}

const PCA9544A_ADDRESS: u8 = 0x70;
const PCA9544A_EN_MASK: u8 = 0x04;

/// The PCA9544A mux gating the NFC/RF segment onto the shared bus.
pub struct TwChannelMux<'a> {
    twi: &'a mut Twi,
    selected: &'a mut Board,
}

impl<'a> TwChannelMux<'a> {
    pub fn new(twi: &'a mut Twi, selected: &'a mut Board) -> Self {
        TwChannelMux { twi, selected }
    }
}

impl<'a> ChannelSelector for TwChannelMux<'a> {
    type Channel = Board;

    fn select(&mut self, channel: Board) {
        let value = match channel {
            Board::Mainboard => PCA9544A_EN_MASK,
            Board::Interfaceboard => PCA9544A_EN_MASK | 0x01,
        };
        let _ = self.twi.write_byte(PCA9544A_ADDRESS, value);
        *self.selected = channel;
    }

    fn current(&self) -> Board {
        *self.selected
    }
}

const NFC_I2C_ADDRESS: u8 = 0x24;
const RF_I2C_ADDRESS: u8 = 0x13;

const VCNL40X0_COMMAND: u8 = 0x80;
const VCNL40X0_PROXIMITY_START_MASK: u8 = 0x08;
const VCNL40X0_AMBIENT_START_MASK: u8 = 0x10;
const VCNL40X0_PROXIMITY_READY_MASK: u8 = 0x20;
const VCNL40X0_AMBIENT_READY_MASK: u8 = 0x40;
const VCNL40X0_AMBIENT_RES_H: u8 = 0x85;
const VCNL40X0_PROXIMITY_RES_H: u8 = 0x87;

/// Busy-wait delay calibrated to the board's 8MHz clock, used only by the
/// RF proximity sensor's ready-bit poll.
struct Delay;

impl DelayMs<u8> for Delay {
    fn delay_ms(&mut self, ms: u8) {
        const CYCLES_PER_MS: u32 = F_CPU / 1000;
        for _ in 0..ms {
            for _ in 0..CYCLES_PER_MS {
                core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
            }
        }
    }
}

/// PN532-class NFC front end, addressed as a block-oriented I²C peer with
/// no register map modeled, per the documented opaque-device contract.
pub struct NfcFrontEnd<'a> {
    twi: &'a mut Twi,
}

impl<'a> NfcFrontEnd<'a> {
    pub fn new(twi: &'a mut Twi) -> Self {
        NfcFrontEnd { twi }
    }
}

impl<'a> NfcReaderWriter for NfcFrontEnd<'a> {
    type Error = TwiError;

    fn read(&mut self, out: &mut [u8]) -> Result<usize, Self::Error> {
        self.twi.read_i2c_block_data(NFC_I2C_ADDRESS, 0x00, out)
    }

    fn transceive(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<usize, Self::Error> {
        self.twi.write_i2c_block_data(NFC_I2C_ADDRESS, 0x00, tx)?;
        self.twi.read_i2c_block_data(NFC_I2C_ADDRESS, 0x00, rx)
    }
}

/// VCNL4010-class proximity/ambient sensor, read as two 16-bit result
/// registers.
pub struct InfraredProximitySensor<'a> {
    twi: &'a mut Twi,
}

impl<'a> InfraredProximitySensor<'a> {
    pub fn new(twi: &'a mut Twi) -> Self {
        InfraredProximitySensor { twi }
    }

    /// Writes the command register's start mask, then polls the same
    /// register with a 10ms delay between attempts until its ready bit
    /// is set.
    fn start_and_wait(&mut self, start_mask: u8, ready_mask: u8) {
        let _ = self.twi.write_byte_data(RF_I2C_ADDRESS, VCNL40X0_COMMAND, start_mask);
        let mut delay = Delay;
        loop {
            delay.delay_ms(10);
            let status = self
                .twi
                .read_byte_data(RF_I2C_ADDRESS, VCNL40X0_COMMAND)
                .unwrap_or(0);
            if status & ready_mask != 0 {
                break;
            }
        }
    }

    /// Reads the two result registers starting at `res_h`, which the
    /// chip streams high byte first.
    fn read_result(&mut self, res_h: u8) -> u16 {
        let mut out = [0u8; 2];
        let _ = self.twi.write_then_read(RF_I2C_ADDRESS, &[res_h], &mut out);
        u16::from_be_bytes(out)
    }
}

impl<'a> RfProximitySensor for InfraredProximitySensor<'a> {
    fn range(&mut self) -> u16 {
        self.start_and_wait(VCNL40X0_PROXIMITY_START_MASK, VCNL40X0_PROXIMITY_READY_MASK);
        self.read_result(VCNL40X0_PROXIMITY_RES_H)
    }

    fn ambient(&mut self) -> u16 {
        self.start_and_wait(VCNL40X0_AMBIENT_START_MASK, VCNL40X0_AMBIENT_READY_MASK);
        self.read_result(VCNL40X0_AMBIENT_RES_H)
    }
}
