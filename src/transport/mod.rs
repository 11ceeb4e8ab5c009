//! sdcard-blockio - Transport abstraction
//!
//! The bring-up state machine and the block I/O engine never know which
//! wire they are talking over. Everything transport-specific (frame
//! assembly, response scanning, host controller registers, chip select)
//! lives behind [`Transport`]; the layers above only see commands going
//! out and [`Reply`] values coming back.

pub mod passthrough;
pub mod spi;

use bitflags::bitflags;

use crate::proto::Command;
use crate::Error;

pub use passthrough::{HostController, PassthroughTransport};
pub use spi::BitSpiTransport;

/// Which physical channel a transport drives. Used only for host wiring
/// and fallback bookkeeping, never for behavioral branches above the
/// transport boundary.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// A host controller executing framed commands on the driver's behalf.
    Passthrough,
    /// Bit-level SPI framing driven directly by this crate.
    BitSpi,
}

impl TransportKind {
    /// The other channel, for fallback.
    pub fn alternate(self) -> TransportKind {
        match self {
            TransportKind::Passthrough => TransportKind::BitSpi,
            TransportKind::BitSpi => TransportKind::Passthrough,
        }
    }
}

bitflags! {
    /// Capability and state bits a transport decodes out of a response.
    ///
    /// Not every wire carries every answer, so each datum travels with a
    /// validity bit. A transport that cannot answer a question leaves the
    /// `*_VALID` bit clear and the caller falls back to an explicit query.
    pub struct ReplyFlags: u8 {
        /// The card reports idle state.
        const IDLE = 1 << 0;
        /// The idle bit was actually observable on this wire.
        const IDLE_VALID = 1 << 1;
        /// Power-up is complete and the card left the init sequence.
        const READY = 1 << 2;
        /// The capacity-class answer is present in this reply.
        const CCS_VALID = 1 << 3;
        /// The card is block-addressed (high capacity).
        const CCS = 1 << 4;
    }
}

/// A decoded command response, normalized across transports.
#[derive(Debug, Copy, Clone)]
pub struct Reply {
    /// The 32-bit response payload. For short responses this is the raw
    /// status; for register reads it is the register word; for an address
    /// publication the new relative address sits in the top half.
    pub word: u32,
    pub flags: ReplyFlags,
}

impl Reply {
    pub fn idle(&self) -> bool {
        self.flags.contains(ReplyFlags::IDLE)
    }

    pub fn ready(&self) -> bool {
        self.flags.contains(ReplyFlags::READY)
    }

    /// The capacity-class bit, if this reply carried one.
    pub fn capacity_class(&self) -> Option<bool> {
        if self.flags.contains(ReplyFlags::CCS_VALID) {
            Some(self.flags.contains(ReplyFlags::CCS))
        } else {
            None
        }
    }

    /// The relative card address out of an address-publication reply.
    pub fn published_address(&self) -> u16 {
        (self.word >> 16) as u16
    }
}

/// One channel to an SD card.
///
/// Implementations map each operation onto their wire and surface failures
/// through the common error taxonomy, so the state machine and the block
/// I/O engine above run unchanged over either channel.
pub trait Transport {
    /// Send one command and decode its response.
    fn send_command(&mut self, command: &Command) -> Result<Reply, Error>;

    /// Fetch a 16-byte card register (identity or capacity). The command
    /// carries a long-register response shape.
    fn read_long_register(&mut self, command: &Command) -> Result<[u8; 16], Error>;

    /// Move one block of data from the card into `buffer`. Must follow a
    /// read data command on the same transport.
    fn read_data_block(&mut self, buffer: &mut [u8]) -> Result<(), Error>;

    /// Move one block of data to the card, framed with `token` where the
    /// wire needs it. Must follow a write data command on the same
    /// transport; returns only after the card has accepted the block and
    /// left busy.
    fn write_data_block(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error>;

    /// Terminate a multiple-block write sequence.
    fn end_multi_write(&mut self) -> Result<(), Error>;

    /// Block until the card reports not-busy, within a bounded budget.
    fn wait_not_busy(&mut self) -> Result<(), Error>;

    /// The buffer alignment this channel needs for data transfers, in
    /// bytes. Always a power of two.
    fn io_align(&self) -> usize;

    /// Busy-wait for `us` microseconds.
    fn delay_us(&mut self, us: u32);
}
