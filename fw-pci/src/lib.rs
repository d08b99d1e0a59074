//! Framed packet control interface (PCI)
//!
//! A byte-streaming parser with resync, checksum validation and a
//! buffer-compaction strategy, plus the matching packet sender. Generic
//! over [`fw_hal::ByteSource`] and [`fw_hal::ByteSink`] so the three boards
//! can share one implementation over whichever UART driver they own.

#![cfg_attr(not(test), no_std)]

use fw_hal::{ByteSink, ByteSource};

/// First preamble byte of every frame.
pub const PREAMBLE1: u8 = 0xF0;
/// Second preamble byte of every frame.
pub const PREAMBLE2: u8 = 0xCA;
/// First postamble byte of every frame.
pub const POSTAMBLE1: u8 = 0x53;
/// Second postamble byte of every frame.
pub const POSTAMBLE2: u8 = 0x0F;
/// Bytes of framing overhead per packet: 2 preamble + type + len + checksum + 2 postamble.
pub const NON_DATA_SIZE: u8 = 7;

const TYPE_OFFSET: usize = 2;
const DATA_LENGTH_OFFSET: usize = 3;
const DATA_START_OFFSET: usize = 4;

/// Receive/transmit buffer capacity, in bytes. Bounds the largest frame
/// (including the 7 bytes of framing overhead) either direction can carry.
pub const BUFFER_CAPACITY: usize = 32;

/// Largest payload a single frame can carry.
pub const MAX_DATA_LEN: usize = BUFFER_CAPACITY - NON_DATA_SIZE as usize;

/// Every command type the boards exchange with the host. Unknown wire
/// values decode to [`CommandType::Invalid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    GetUptime,
    GetBattLvl,

    SetDdsEnable,
    SetDdsSpeed,
    GetDdsSpeed,
    SetDdsParams,
    GetDdsParams,

    SetSystemPowerEnable,
    SetActuatorPowerEnable,
    SetActuatorInputLimitOverride,
    SetUsbIfEnable,
    ReqSoftPwdn,
    GetPmStatus,
    GetUsbStatus,

    GetChargerStatus,
    SetLiftActuatorPosition,
    GetLiftActuatorPosition,
    SetLiftActuatorSpeed,
    GetLimitSwitchState,
    CalibrateLiftActuator,
    EmerStopLiftActuator,
    GetLiftActuatorState,
    SetEmChargeEnable,
    SetEmDischargeMode,
    GetEmAccumVoltage,
    GetRfRange,
    GetRfAmbient,
    ReadNfc,
    WriteNfc,

    GetAccelReading,

    ReadSmbusByte,
    ReadSmbusByteData,
    ReadSmbusWordData,
    ReadSmbusBlockData,
    ReadSmbusI2cBlockData,
    WriteSmbusByte,
    WriteSmbusByteData,
    WriteSmbusWordData,
    WriteSmbusBlockData,
    WriteSmbusI2cBlockData,

    /// Unrecognised wire value. `get_packet()` surfaces this; callers
    /// ignore it.
    Invalid,
}

impl CommandType {
    /// Decodes a wire type byte. Unknown values map to `Invalid`.
    pub fn from_u8(byte: u8) -> Self {
        match byte {
            0x00 => CommandType::GetUptime,
            0x01 => CommandType::GetBattLvl,
            0x10 => CommandType::SetDdsEnable,
            0x11 => CommandType::SetDdsSpeed,
            0x13 => CommandType::GetDdsSpeed,
            0x14 => CommandType::SetDdsParams,
            0x15 => CommandType::GetDdsParams,
            0x39 => CommandType::SetSystemPowerEnable,
            0x40 => CommandType::SetActuatorPowerEnable,
            0x41 => CommandType::SetActuatorInputLimitOverride,
            0x42 => CommandType::SetUsbIfEnable,
            0x43 => CommandType::ReqSoftPwdn,
            0x44 => CommandType::GetPmStatus,
            0x45 => CommandType::GetUsbStatus,
            0x60 => CommandType::GetChargerStatus,
            0x70 => CommandType::SetLiftActuatorPosition,
            0x71 => CommandType::GetLiftActuatorPosition,
            0x72 => CommandType::SetLiftActuatorSpeed,
            0x73 => CommandType::GetLimitSwitchState,
            0x74 => CommandType::CalibrateLiftActuator,
            0x75 => CommandType::EmerStopLiftActuator,
            0x76 => CommandType::GetLiftActuatorState,
            0x80 => CommandType::SetEmChargeEnable,
            0x81 => CommandType::SetEmDischargeMode,
            0x82 => CommandType::GetEmAccumVoltage,
            0x90 => CommandType::GetRfRange,
            0x91 => CommandType::GetRfAmbient,
            0xA0 => CommandType::ReadNfc,
            0xA1 => CommandType::WriteNfc,
            0xA2 => CommandType::GetAccelReading,
            0xC0 => CommandType::ReadSmbusByte,
            0xC1 => CommandType::ReadSmbusByteData,
            0xC2 => CommandType::ReadSmbusWordData,
            0xC3 => CommandType::ReadSmbusBlockData,
            0xC4 => CommandType::ReadSmbusI2cBlockData,
            0xD0 => CommandType::WriteSmbusByte,
            0xD1 => CommandType::WriteSmbusByteData,
            0xD2 => CommandType::WriteSmbusWordData,
            0xD3 => CommandType::WriteSmbusBlockData,
            0xD4 => CommandType::WriteSmbusI2cBlockData,
            _ => CommandType::Invalid,
        }
    }

    /// Encodes back to the wire type byte. `Invalid` has no valid
    /// encoding and is never sent.
    pub fn as_u8(self) -> u8 {
        match self {
            CommandType::GetUptime => 0x00,
            CommandType::GetBattLvl => 0x01,
            CommandType::SetDdsEnable => 0x10,
            CommandType::SetDdsSpeed => 0x11,
            CommandType::GetDdsSpeed => 0x13,
            CommandType::SetDdsParams => 0x14,
            CommandType::GetDdsParams => 0x15,
            CommandType::SetSystemPowerEnable => 0x39,
            CommandType::SetActuatorPowerEnable => 0x40,
            CommandType::SetActuatorInputLimitOverride => 0x41,
            CommandType::SetUsbIfEnable => 0x42,
            CommandType::ReqSoftPwdn => 0x43,
            CommandType::GetPmStatus => 0x44,
            CommandType::GetUsbStatus => 0x45,
            CommandType::GetChargerStatus => 0x60,
            CommandType::SetLiftActuatorPosition => 0x70,
            CommandType::GetLiftActuatorPosition => 0x71,
            CommandType::SetLiftActuatorSpeed => 0x72,
            CommandType::GetLimitSwitchState => 0x73,
            CommandType::CalibrateLiftActuator => 0x74,
            CommandType::EmerStopLiftActuator => 0x75,
            CommandType::GetLiftActuatorState => 0x76,
            CommandType::SetEmChargeEnable => 0x80,
            CommandType::SetEmDischargeMode => 0x81,
            CommandType::GetEmAccumVoltage => 0x82,
            CommandType::GetRfRange => 0x90,
            CommandType::GetRfAmbient => 0x91,
            CommandType::ReadNfc => 0xA0,
            CommandType::WriteNfc => 0xA1,
            CommandType::GetAccelReading => 0xA2,
            CommandType::ReadSmbusByte => 0xC0,
            CommandType::ReadSmbusByteData => 0xC1,
            CommandType::ReadSmbusWordData => 0xC2,
            CommandType::ReadSmbusBlockData => 0xC3,
            CommandType::ReadSmbusI2cBlockData => 0xC4,
            CommandType::WriteSmbusByte => 0xD0,
            CommandType::WriteSmbusByteData => 0xD1,
            CommandType::WriteSmbusWordData => 0xD2,
            CommandType::WriteSmbusBlockData => 0xD3,
            CommandType::WriteSmbusI2cBlockData => 0xD4,
            CommandType::Invalid => 0xFF,
        }
    }
}

/// A decoded frame: a command type plus its payload.
#[derive(Debug, Clone, Copy)]
pub struct Packet {
    command: CommandType,
    data: [u8; MAX_DATA_LEN],
    len: u8,
}

impl Packet {
    pub fn command(&self) -> CommandType {
        self.command
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Things that can go wrong sending a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciError {
    /// `data.len() + NON_DATA_SIZE` exceeds `BUFFER_CAPACITY`.
    PayloadTooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    SrchPreamble1,
    SrchPreamble2,
    SrchPostamble1,
    SrchPostamble2,
    RecvCommand,
}

/// The framed packet control interface: parser plus sender, generic over
/// the byte-level transport `P`.
pub struct PacketControlInterface<P> {
    port: P,
    buffer: [u8; BUFFER_CAPACITY],
    used: usize,
    cursor: usize,
    state: ParserState,
    packet: Option<Packet>,
}

impl<P> PacketControlInterface<P>
where
    P: ByteSource + ByteSink,
{
    pub fn new(port: P) -> Self {
        PacketControlInterface {
            port,
            buffer: [0; BUFFER_CAPACITY],
            used: 0,
            cursor: 0,
            state: ParserState::SrchPreamble1,
            packet: None,
        }
    }

    /// Discards any retained frame and restarts the parser at `SrchPreamble1`.
    pub fn reset(&mut self) {
        self.used = 0;
        self.cursor = 0;
        self.state = ParserState::SrchPreamble1;
        self.packet = None;
    }

    /// The most recently decoded frame, valid once `state()` reports that
    /// a command has been received.
    pub fn packet(&self) -> Option<&Packet> {
        self.packet.as_ref()
    }

    /// Drains available input, advancing the parser until a frame is
    /// recognised or no more bytes are available.
    pub fn process_input(&mut self) {
        if self.state == ParserState::RecvCommand {
            self.state = ParserState::SrchPreamble1;
            self.adjust_rx_buffer();
        }

        while self.state != ParserState::RecvCommand {
            let byte = if self.cursor < self.used {
                let byte = self.buffer[self.cursor];
                self.cursor += 1;
                byte
            } else if self.cursor < BUFFER_CAPACITY && self.port.available() {
                let byte = self.port.read_byte();
                self.buffer[self.cursor] = byte;
                self.cursor += 1;
                self.used += 1;
                byte
            } else if self.cursor >= BUFFER_CAPACITY {
                // A frame longer than the buffer can hold; there is no
                // plausible preamble to resync to within it, so drop
                // everything and start over.
                self.reset();
                return;
            } else {
                return;
            };

            match self.state {
                ParserState::SrchPreamble1 => {
                    if byte != PREAMBLE1 {
                        self.adjust_rx_buffer();
                    } else {
                        self.state = ParserState::SrchPreamble2;
                    }
                }
                ParserState::SrchPreamble2 => {
                    if byte != PREAMBLE2 {
                        self.adjust_rx_buffer();
                    } else {
                        self.state = ParserState::SrchPostamble1;
                    }
                }
                ParserState::SrchPostamble1 => {
                    if self.cursor > DATA_LENGTH_OFFSET
                        && self.cursor
                            == self.buffer[DATA_LENGTH_OFFSET] as usize + NON_DATA_SIZE as usize - 1
                    {
                        if byte != POSTAMBLE1 {
                            self.adjust_rx_buffer();
                        } else {
                            self.state = ParserState::SrchPostamble2;
                        }
                    }
                }
                ParserState::SrchPostamble2 => {
                    if self.cursor > DATA_LENGTH_OFFSET
                        && self.cursor
                            == self.buffer[DATA_LENGTH_OFFSET] as usize + NON_DATA_SIZE as usize
                    {
                        if byte == POSTAMBLE2 {
                            self.receive_frame();
                        } else {
                            self.adjust_rx_buffer();
                        }
                    }
                }
                ParserState::RecvCommand => unreachable!(),
            }
        }
    }

    /// Search from offset 1 for the next plausible frame start, shift it
    /// (and everything after it) to offset 0, and restart the parser.
    fn adjust_rx_buffer(&mut self) {
        let mut offset = 1;
        while offset < self.used {
            if self.buffer[offset] == PREAMBLE1 {
                break;
            }
            offset += 1;
        }
        for idx in offset..self.used {
            self.buffer[idx - offset] = self.buffer[idx];
        }
        self.used -= offset;
        self.cursor = 0;
        self.state = ParserState::SrchPreamble1;
    }

    fn checksum(&self, data_len: usize) -> u8 {
        let end = DATA_START_OFFSET + data_len;
        self.buffer[TYPE_OFFSET..end]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b))
    }

    fn receive_frame(&mut self) {
        let data_len = self.buffer[DATA_LENGTH_OFFSET] as usize;
        let checksum_offset = DATA_START_OFFSET + data_len;
        if self.buffer[checksum_offset] == self.checksum(data_len) {
            self.state = ParserState::RecvCommand;
            let mut data = [0u8; MAX_DATA_LEN];
            data[..data_len].copy_from_slice(&self.buffer[DATA_START_OFFSET..checksum_offset]);
            self.packet = Some(Packet {
                command: CommandType::from_u8(self.buffer[TYPE_OFFSET]),
                data,
                len: data_len as u8,
            });
        } else {
            self.adjust_rx_buffer();
        }
    }

    /// Assembles and writes a frame. Fails without writing anything if
    /// `data` does not fit the buffer.
    pub fn send_packet(&mut self, command: CommandType, data: &[u8]) -> Result<(), PciError> {
        let len = data.len();
        if len + NON_DATA_SIZE as usize > BUFFER_CAPACITY {
            return Err(PciError::PayloadTooLong);
        }

        let mut out = [0u8; BUFFER_CAPACITY];
        let mut idx = 0;
        out[idx] = PREAMBLE1;
        idx += 1;
        out[idx] = PREAMBLE2;
        idx += 1;
        out[idx] = command.as_u8();
        idx += 1;
        out[idx] = len as u8;
        idx += 1;
        out[idx..idx + len].copy_from_slice(data);
        idx += len;
        let checksum = out[TYPE_OFFSET..idx]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b));
        out[idx] = checksum;
        idx += 1;
        out[idx] = POSTAMBLE1;
        idx += 1;
        out[idx] = POSTAMBLE2;
        idx += 1;

        for &byte in &out[..idx] {
            self.port.write_byte(byte);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakePort {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl FakePort {
        fn feed(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes.iter().copied());
        }
    }

    impl ByteSource for FakePort {
        fn available(&mut self) -> bool {
            !self.rx.is_empty()
        }

        fn read_byte(&mut self) -> u8 {
            self.rx.pop_front().unwrap()
        }
    }

    impl ByteSink for FakePort {
        fn write_byte(&mut self, byte: u8) {
            self.tx.push(byte);
        }
    }

    fn frame(command: u8, data: &[u8]) -> Vec<u8> {
        let mut bytes = vec![PREAMBLE1, PREAMBLE2, command, data.len() as u8];
        bytes.extend_from_slice(data);
        let checksum = bytes[TYPE_OFFSET..].iter().fold(0u8, |a, &b| a.wrapping_add(b));
        bytes.push(checksum);
        bytes.push(POSTAMBLE1);
        bytes.push(POSTAMBLE2);
        bytes
    }

    #[test]
    fn decodes_uptime_scenario_from_the_protocol_table() {
        let mut pci = PacketControlInterface::new(FakePort::default());
        pci.port.feed(&[0xF0, 0xCA, 0x00, 0x00, 0x00, 0x53, 0x0F]);
        pci.process_input();
        let packet = pci.packet().expect("a frame should have been decoded");
        assert_eq!(packet.command(), CommandType::GetUptime);
        assert!(packet.data().is_empty());
    }

    #[test]
    fn resyncs_past_leading_garbage() {
        let mut pci = PacketControlInterface::new(FakePort::default());
        let mut stream = vec![0x01, 0x02];
        stream.extend(frame(0x10, &[0xAA, 0xBB]));
        pci.port.feed(&stream);
        pci.process_input();
        let packet = pci.packet().expect("a frame should have been decoded");
        assert_eq!(packet.command(), CommandType::SetDdsEnable);
        assert_eq!(packet.data(), &[0xAA, 0xBB]);
    }

    #[test]
    fn rejects_a_frame_with_a_flipped_checksum_byte() {
        let mut pci = PacketControlInterface::new(FakePort::default());
        let mut bad = frame(0x01, &[0x10]);
        let checksum_idx = bad.len() - 3;
        bad[checksum_idx] ^= 0xFF;
        pci.port.feed(&bad);
        pci.process_input();
        assert!(pci.packet().is_none());
    }

    #[test]
    fn resyncs_after_a_rejected_frame_and_recovers_the_next_one() {
        let mut pci = PacketControlInterface::new(FakePort::default());
        let mut bad = frame(0x01, &[0x10]);
        let checksum_idx = bad.len() - 3;
        bad[checksum_idx] ^= 0xFF;
        bad.extend(frame(0x00, &[]));
        pci.port.feed(&bad);
        pci.process_input();
        let packet = pci.packet().expect("the second frame should still decode");
        assert_eq!(packet.command(), CommandType::GetUptime);
    }

    #[test]
    fn round_trips_a_frame_through_send_and_parse() {
        let mut sender = PacketControlInterface::new(FakePort::default());
        sender
            .send_packet(CommandType::GetDdsSpeed, &[1, 2, 3])
            .unwrap();
        let wire = sender.port.tx.clone();

        let mut receiver = PacketControlInterface::new(FakePort::default());
        receiver.port.feed(&wire);
        receiver.process_input();
        let packet = receiver.packet().unwrap();
        assert_eq!(packet.command(), CommandType::GetDdsSpeed);
        assert_eq!(packet.data(), &[1, 2, 3]);
    }

    #[test]
    fn refuses_to_send_a_payload_that_does_not_fit() {
        let mut pci = PacketControlInterface::new(FakePort::default());
        let data = [0u8; MAX_DATA_LEN + 1];
        assert_eq!(
            pci.send_packet(CommandType::GetUptime, &data),
            Err(PciError::PayloadTooLong)
        );
        assert!(pci.port.tx.is_empty());
    }

    #[test]
    fn a_second_frame_is_retrieved_after_the_first_is_consumed() {
        let mut pci = PacketControlInterface::new(FakePort::default());
        let mut stream = frame(0x00, &[]);
        stream.extend(frame(0x01, &[]));
        pci.port.feed(&stream);

        pci.process_input();
        assert_eq!(pci.packet().unwrap().command(), CommandType::GetUptime);

        pci.process_input();
        assert_eq!(pci.packet().unwrap().command(), CommandType::GetBattLvl);
    }
}
