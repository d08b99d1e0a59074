//! ATmega328P peripheral bindings for the traits in `fw_hal`.
//!
//! Nothing here is reusable outside this board: it owns the PAC peripheral
//! handles and pokes the exact registers the differential-drive system and
//! the host UART need.

use avr_device::atmega328p::{ADC, PORTC, PORTD, TC0, USART0};
use fw_hal::{AccelSample, Accelerometer, AdcChannel, BridgeMode, ByteSink, ByteSource, HBridge};
use fw_drive::Wheel;

/// Blocking polled USART0 transport, matching the host link's framing.
pub struct Uart {
    usart0: USART0,
}

impl Uart {
    pub fn new(usart0: USART0, baud: u32, f_cpu: u32) -> Self {
        let ubrr = f_cpu / (16 * baud) - 1;
        usart0.ubrr0.write(|w| unsafe { w.bits(ubrr as u16) });
        usart0.ucsr0b.write(|w| w.txen0().set_bit().rxen0().set_bit());
        usart0
            .ucsr0c
            .write(|w| w.ucsz0().bits(0b11));
        Uart { usart0 }
    }
}

impl ByteSource for Uart {
    fn available(&mut self) -> bool {
        self.usart0.ucsr0a.read().rxc0().bit_is_set()
    }

    fn read_byte(&mut self) -> u8 {
        self.usart0.udr0.read().bits()
    }
}

impl ByteSink for Uart {
    fn write_byte(&mut self, byte: u8) {
        while self.usart0.ucsr0a.read().udre0().bit_is_clear() {}
        self.usart0.udr0.write(|w| unsafe { w.bits(byte) });
    }
}

/// Two-channel H-bridge driver, driven by Timer0's two PWM comparators
/// (`OC0A` feeds the left channel, `OC0B` the right) plus a pair of
/// direction pins and one shared enable pin on Port D.
pub struct HBridgeDriver {
    tc0: TC0,
    portd: PORTD,
}

const PIN_LEFT_DIR: u8 = 0x01;
const PIN_RIGHT_DIR: u8 = 0x02;
const PIN_DRIVER_EN: u8 = 0x04;

impl HBridgeDriver {
    pub fn new(tc0: TC0, portd: PORTD) -> Self {
        tc0.tccr0a.write(|w| w.wgm0().bits(0b01));
        tc0.tccr0b.write(|w| w.cs0().bits(0b001));
        tc0.ocr0a.write(|w| unsafe { w.bits(0) });
        tc0.ocr0b.write(|w| unsafe { w.bits(0) });
        portd.ddrd.modify(|r, w| unsafe {
            w.bits(r.bits() | PIN_LEFT_DIR | PIN_RIGHT_DIR | PIN_DRIVER_EN)
        });
        HBridgeDriver { tc0, portd }
    }

    fn set_duty(&mut self, wheel: Wheel, duty: u8) {
        match wheel {
            Wheel::Right => {
                self.tc0.ocr0a.write(|w| unsafe { w.bits(duty) });
                if duty == 0 {
                    self.tc0.tccr0a.modify(|r, w| unsafe { w.bits(r.bits() & !0xC0) });
                } else {
                    self.tc0.tccr0a.modify(|r, w| unsafe { w.bits(r.bits() | 0x80) });
                }
            }
            Wheel::Left => {
                self.tc0.ocr0b.write(|w| unsafe { w.bits(duty) });
                if duty == 0 {
                    self.tc0.tccr0a.modify(|r, w| unsafe { w.bits(r.bits() & !0x30) });
                } else {
                    self.tc0.tccr0a.modify(|r, w| unsafe { w.bits(r.bits() | 0x20) });
                }
            }
        }
    }

    fn set_direction(&mut self, wheel: Wheel, reverse: bool) {
        let pin = match wheel {
            Wheel::Left => PIN_LEFT_DIR,
            Wheel::Right => PIN_RIGHT_DIR,
        };
        self.portd.portd.modify(|r, w| unsafe {
            let bits = if reverse { r.bits() | pin } else { r.bits() & !pin };
            w.bits(bits)
        });
    }
}

impl HBridge for HBridgeDriver {
    type Wheel = Wheel;

    fn drive(&mut self, wheel: Wheel, mode: BridgeMode, duty: u8) {
        match mode {
            BridgeMode::ForwardPwmFastDecay | BridgeMode::ForwardPwmSlowDecay => {
                self.set_direction(wheel, false);
                self.set_duty(wheel, duty);
            }
            BridgeMode::ReversePwmFastDecay | BridgeMode::ReversePwmSlowDecay => {
                self.set_direction(wheel, true);
                self.set_duty(wheel, duty);
            }
            BridgeMode::Coast => self.set_duty(wheel, 0),
            BridgeMode::Forward => {
                self.set_direction(wheel, false);
                self.set_duty(wheel, u8::MAX);
            }
            BridgeMode::Reverse => {
                self.set_direction(wheel, true);
                self.set_duty(wheel, u8::MAX);
            }
            BridgeMode::Brake => self.set_duty(wheel, 0),
        }
    }

    fn set_driver_enabled(&mut self, enabled: bool) {
        self.portd.portd.modify(|r, w| unsafe {
            let bits = if enabled {
                r.bits() | PIN_DRIVER_EN
            } else {
                r.bits() & !PIN_DRIVER_EN
            };
            w.bits(bits)
        });
    }
}

/// Snapshots the quadrature encoder lines wired to Port C, bits 0-3.
pub fn read_encoder_port(portc: &PORTC) -> u8 {
    portc.pinc.read().bits() & 0x0F
}

/// Four-channel analog accelerometer (X/Y/Z/temperature), read by
/// round-robin ADC conversion on channels 0-3.
pub struct AnalogAccelerometer {
    adc: ADC,
}

impl AnalogAccelerometer {
    pub fn new(adc: ADC) -> Self {
        adc.adcsra.write(|w| w.aden().set_bit().adps().bits(0b111));
        AnalogAccelerometer { adc }
    }

    fn sample_channel(&mut self, channel: u8) -> u16 {
        self.adc.admux.write(|w| unsafe { w.bits(channel & 0x0F) });
        self.adc.adcsra.modify(|_, w| w.adsc().set_bit());
        while self.adc.adcsra.read().adsc().bit_is_set() {}
        self.adc.adc.read().bits()
    }
}

impl Accelerometer for AnalogAccelerometer {
    fn read(&mut self) -> AccelSample {
        AccelSample {
            x: self.sample_channel(0) as i16,
            y: self.sample_channel(1) as i16,
            z: self.sample_channel(2) as i16,
            temp: self.sample_channel(3) as i16,
        }
    }
}

impl AdcChannel for AnalogAccelerometer {
    fn sample(&mut self, channel: u8) -> u16 {
        self.sample_channel(channel)
    }
}
