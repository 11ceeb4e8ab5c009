//! # sdcard-blockio
//!
//! A removable-media block driver for SD cards that can reach the card
//! over two very different wires:
//!
//! * a **passthrough** channel, where a host controller frames commands
//!   and moves data itself, or
//! * a **bit-level SPI** channel, where this crate assembles every frame,
//!   scans for responses and checks data CRCs byte by byte.
//!
//! One initialization state machine and one block I/O engine run over
//! both. The platform hands the driver a [`TransportHost`] describing
//! which channels it wires up; bring-up prefers the passthrough channel
//! and falls over to the alternate one at most once, on failures that
//! implicate the wire rather than the card.
//!
//! Cards are exposed as 512-byte blocks regardless of capacity class.
//! Callers snapshot the published media id and present it with every
//! request, so a swapped card is caught before any data moves.
//!
//! ```rust,ignore
//! let mut driver = SdCardDriver::new(host)?;
//! driver.bring_up()?;
//! let media_id = driver.media().media_id;
//! let mut sector = [0u8; 512];
//! driver.read_blocks(media_id, 0, &mut sector)?;
//! ```
//!
//! Misaligned caller buffers are bounced through an aligned allocation,
//! so the crate needs `alloc` but not `std`.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is
//! enabled.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
mod structure;

mod bounce;
#[cfg(test)]
mod test_util;

pub mod blockio;
pub mod driver;
pub mod init;
pub mod poll;
pub mod proto;
pub mod registers;
pub mod transport;

pub use crate::blockio::MediaDescriptor;
pub use crate::driver::{SdCardDriver, TransportHost};
pub use crate::init::{CardClass, CardSession};
pub use crate::proto::{Command, ResponseShape, BLOCK_SIZE};
pub use crate::registers::{Cid, Csd};
pub use crate::transport::{
    BitSpiTransport, HostController, PassthroughTransport, Reply, ReplyFlags, Transport,
    TransportKind,
};

/// The ways an operation can fail.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// A request parameter was out of range.
    Parameter,
    /// There is no card in the slot.
    MediaAbsent,
    /// The presented media id belongs to a previous card.
    MediaChanged,
    /// A CRC check failed, on a status word or a data block.
    Crc,
    /// The card, or the request, asks for something this driver does not
    /// do.
    Unsupported,
    /// A bounded wait expired.
    Timeout,
    /// The card misbehaved at the protocol level.
    Device,
    /// A write was attempted on read-only media.
    WriteProtected,
    /// The transfer length is not a whole number of blocks.
    BadBufferSize,
    /// An aligned bounce buffer could not be allocated.
    OutOfResources,
}

impl Error {
    /// Whether a bring-up failure with this error implicates the wire,
    /// justifying one attempt on the alternate transport. Card-level and
    /// caller-level failures would only repeat themselves there.
    pub(crate) fn triggers_fallback(self) -> bool {
        matches!(self, Error::Crc | Error::Device | Error::Timeout)
    }
}

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn only_wire_class_failures_trigger_fallback() {
        for err in &[Error::Crc, Error::Device, Error::Timeout] {
            assert!(err.triggers_fallback());
        }
        for err in &[
            Error::Parameter,
            Error::MediaAbsent,
            Error::MediaChanged,
            Error::Unsupported,
            Error::WriteProtected,
            Error::BadBufferSize,
            Error::OutOfResources,
        ] {
            assert!(!err.triggers_fallback());
        }
    }
}
