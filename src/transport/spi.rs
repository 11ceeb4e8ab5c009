//! sdcard-blockio - Bit-level SPI transport
//!
//! Frames every command itself over a byte-oriented SPI bus: 6-byte frames
//! with a CRC7 trailer, response scanning, start/stop data tokens and a
//! CRC16 check on every data block. Identification and selection have no
//! equivalent exchanges on this wire, so the transport answers those
//! commands locally and the layers above never notice the difference.

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;
#[cfg(feature = "log")]
use log::{trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{trace, warn};

use super::{Reply, ReplyFlags, Transport};
use crate::poll::BoundedPoll;
use crate::proto::{
    crc16, pack_frame, Command, R1Status, CMD0, CMD10, CMD12, CMD2, CMD3, CMD58, CMD7,
    DATA_RESPONSE_ACCEPTED, DATA_RESPONSE_CRC_ERROR, DATA_RESPONSE_MASK, TOKEN_START_BLOCK,
    TOKEN_STOP_TRAN,
};
use crate::Error;

/// Dummy clock bytes with chip select deasserted before a reset command.
/// 10 bytes is 80 clocks, past the 74 the card needs to wake up.
const DUMMY_CLOCK_BYTES: usize = 10;
/// Filler bytes scanned for a response after a command frame.
const RESPONSE_SCAN_BYTES: usize = 8;
/// Busy polling budget, 5000 probes of 100 us.
const NOT_BUSY_ATTEMPTS: u32 = 5_000;
const NOT_BUSY_INTERVAL_US: u32 = 100;
/// Data token polling budget, roughly 200 ms.
const TOKEN_ATTEMPTS: u32 = 200_000;
const TOKEN_INTERVAL_US: u32 = 1;

/// [`Transport`] over raw SPI, a chip select line and a delay source.
pub struct BitSpiTransport<SPI, CS, D> {
    spi: SPI,
    cs: CS,
    delay: D,
}

impl<SPI, CS, D> BitSpiTransport<SPI, CS, D>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    /// Create a new transport. Nothing is clocked until the first reset
    /// command primes the bus.
    pub fn new(spi: SPI, cs: CS, delay: D) -> BitSpiTransport<SPI, CS, D> {
        BitSpiTransport { spi, cs, delay }
    }

    /// Destroy the transport and give back its parts.
    pub fn free(self) -> (SPI, CS, D) {
        (self.spi, self.cs, self.delay)
    }

    fn transfer_byte(&mut self, out: u8) -> Result<u8, Error> {
        let mut buffer = [out];
        self.spi.transfer(&mut buffer).map_err(|_| Error::Device)?;
        Ok(buffer[0])
    }

    fn send(&mut self, byte: u8) -> Result<(), Error> {
        self.transfer_byte(byte).map(|_| ())
    }

    fn receive(&mut self) -> Result<u8, Error> {
        self.transfer_byte(0xFF)
    }

    /// Wake the card: dummy clocks with chip select deasserted, then
    /// assert it for the session.
    fn prime(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::Device)?;
        for _ in 0..DUMMY_CLOCK_BYTES {
            self.send(0xFF)?;
        }
        self.cs.set_low().map_err(|_| Error::Device)
    }

    /// Send one framed command and scan for its short response.
    fn command_exchange(&mut self, index: u8, arg: u32) -> Result<u8, Error> {
        if index != CMD0 {
            self.wait_not_busy()?;
        }
        for &byte in pack_frame(index, arg).iter() {
            self.send(byte)?;
        }
        if index == CMD12 {
            // Stuff byte ahead of the stop-transmission response.
            self.receive()?;
        }
        for _ in 0..RESPONSE_SCAN_BYTES {
            let response = self.receive()?;
            if response & 0x80 == 0 {
                trace!("command {} -> {:x}", index, response);
                return Ok(response);
            }
        }
        warn!("command {}: no response", index);
        Err(Error::Timeout)
    }

    /// Screen a short response for error bits. Idle is state, not error,
    /// and is reported through the reply flags.
    fn screen_response(&self, index: u8, response: u8) -> Result<(), Error> {
        let status = R1Status::from_bits_truncate(response) - R1Status::IDLE_STATE;
        if status.is_empty() {
            return Ok(());
        }
        warn!("command {} rejected: {:x}", index, status.bits());
        if status.contains(R1Status::COM_CRC_ERROR) {
            Err(Error::Crc)
        } else if status.contains(R1Status::ILLEGAL_COMMAND) {
            Err(Error::Unsupported)
        } else if status.intersects(R1Status::ADDRESS_ERROR | R1Status::PARAMETER_ERROR) {
            Err(Error::Parameter)
        } else {
            Err(Error::Device)
        }
    }

    fn idle_flags(response: u8) -> ReplyFlags {
        let mut flags = ReplyFlags::IDLE_VALID;
        if response & R1Status::IDLE_STATE.bits() != 0 {
            flags |= ReplyFlags::IDLE;
        }
        flags
    }

    /// Four trailer bytes following the short response of an interface
    /// condition or register read command.
    fn read_trailer_word(&mut self) -> Result<u32, Error> {
        let mut word = 0u32;
        for _ in 0..4 {
            word = word << 8 | u32::from(self.receive()?);
        }
        Ok(word)
    }

    fn read_block_payload(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        let mut poll = BoundedPoll::new(TOKEN_ATTEMPTS, TOKEN_INTERVAL_US);
        let token = loop {
            let byte = self.receive()?;
            if byte != 0xFF {
                break byte;
            }
            poll.retry(|us| self.delay.delay_us(us), Error::Timeout)?;
        };
        if token != TOKEN_START_BLOCK {
            warn!("bad data token {:x}", token);
            return Err(Error::Device);
        }
        for byte in buffer.iter_mut() {
            *byte = self.receive()?;
        }
        let mut received = u16::from(self.receive()?) << 8;
        received |= u16::from(self.receive()?);
        if received != crc16(buffer) {
            warn!("data block crc mismatch");
            return Err(Error::Crc);
        }
        Ok(())
    }
}

impl<SPI, CS, D> Transport for BitSpiTransport<SPI, CS, D>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    fn send_command(&mut self, command: &Command) -> Result<Reply, Error> {
        match command.index {
            CMD0 => {
                self.prime()?;
                let response = self.command_exchange(CMD0, command.arg)?;
                self.screen_response(CMD0, response)?;
                Ok(Reply {
                    word: u32::from(response),
                    flags: Self::idle_flags(response),
                })
            }
            // This wire is point to point. There is no address publication
            // exchange, so hand out a fixed non-zero address.
            CMD3 => Ok(Reply {
                word: 0x0001_0000,
                flags: ReplyFlags::empty(),
            }),
            // No selection either: the chip select line is the selection.
            CMD7 => {
                self.wait_not_busy()?;
                Ok(Reply {
                    word: 0,
                    flags: ReplyFlags::empty(),
                })
            }
            CMD58 => {
                let response = self.command_exchange(CMD58, command.arg)?;
                self.screen_response(CMD58, response)?;
                let ocr = self.read_trailer_word()?;
                let mut flags = Self::idle_flags(response);
                if ocr & crate::proto::OCR_POWER_UP != 0 {
                    flags |= ReplyFlags::READY | ReplyFlags::CCS_VALID;
                    if ocr & crate::proto::OCR_CCS != 0 {
                        flags |= ReplyFlags::CCS;
                    }
                }
                Ok(Reply { word: ocr, flags })
            }
            _ => {
                let response = self.command_exchange(command.index, command.arg)?;
                self.screen_response(command.index, response)?;
                let mut flags = Self::idle_flags(response);
                let word = match command.shape {
                    crate::proto::ResponseShape::InterfaceCondition => self.read_trailer_word()?,
                    crate::proto::ResponseShape::OpCond => {
                        // The init command answers with a bare short
                        // response here; leaving idle means power-up done.
                        if response & R1Status::IDLE_STATE.bits() == 0 {
                            flags |= ReplyFlags::READY;
                        }
                        u32::from(response)
                    }
                    _ => u32::from(response),
                };
                if command.shape == crate::proto::ResponseShape::ShortBusy {
                    self.wait_not_busy()?;
                }
                Ok(Reply { word, flags })
            }
        }
    }

    fn read_long_register(&mut self, command: &Command) -> Result<[u8; 16], Error> {
        // Broadcast identification does not exist here; the point-to-point
        // register read returns the same bytes.
        let index = if command.index == CMD2 {
            CMD10
        } else {
            command.index
        };
        let response = self.command_exchange(index, command.arg)?;
        self.screen_response(index, response)?;
        let mut raw = [0u8; 16];
        self.read_block_payload(&mut raw)?;
        Ok(raw)
    }

    fn read_data_block(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        self.read_block_payload(buffer)
    }

    fn write_data_block(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        self.send(token)?;
        for &byte in buffer.iter() {
            self.send(byte)?;
        }
        let crc = crc16(buffer);
        self.send((crc >> 8) as u8)?;
        self.send(crc as u8)?;
        match self.receive()? & DATA_RESPONSE_MASK {
            DATA_RESPONSE_ACCEPTED => self.wait_not_busy(),
            DATA_RESPONSE_CRC_ERROR => Err(Error::Crc),
            response => {
                warn!("block write rejected: {:x}", response);
                Err(Error::Device)
            }
        }
    }

    fn end_multi_write(&mut self) -> Result<(), Error> {
        self.send(TOKEN_STOP_TRAN)?;
        // One skipped byte before the busy signal is observable.
        self.receive()?;
        self.wait_not_busy()
    }

    fn wait_not_busy(&mut self) -> Result<(), Error> {
        let mut poll = BoundedPoll::new(NOT_BUSY_ATTEMPTS, NOT_BUSY_INTERVAL_US);
        loop {
            if self.receive()? == 0xFF {
                return Ok(());
            }
            poll.retry(|us| self.delay.delay_us(us), Error::Timeout)?;
        }
    }

    fn io_align(&self) -> usize {
        1
    }

    fn delay_us(&mut self, us: u32) {
        self.delay.delay_us(us);
    }
}
