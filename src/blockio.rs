//! sdcard-blockio - Block I/O engine
//!
//! Request validation and block transfer sequencing. Validation runs in a
//! fixed order and rejects bad requests before anything is clocked out to
//! the card; transfers pick the single or multiple block command by count
//! and always terminate a multiple block stream, failed or not.

use crate::init::CardSession;
use crate::proto::{Command, BLOCK_SIZE, TOKEN_START_BLOCK, TOKEN_WRITE_MULTIPLE};
use crate::transport::Transport;
use crate::Error;

/// What the driver publishes about the inserted media. Callers snapshot
/// `media_id` and present it with every request; a stale id means the
/// card behind the descriptor is not the card they prepared for.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone)]
pub struct MediaDescriptor {
    /// Bumped on every media change.
    pub media_id: u32,
    pub media_present: bool,
    pub read_only: bool,
    /// Always 512 once a card is up.
    pub block_size: u32,
    /// Address of the last addressable block.
    pub last_block: u64,
    /// Buffer alignment the active transport needs, in bytes.
    pub io_align: usize,
}

impl MediaDescriptor {
    pub(crate) fn absent() -> MediaDescriptor {
        MediaDescriptor {
            media_id: 0,
            media_present: false,
            read_only: false,
            block_size: BLOCK_SIZE,
            last_block: 0,
            io_align: 1,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// Validate a request against the media. Returns the block count; zero
/// blocks means the request succeeds with nothing to transfer.
pub(crate) fn check_request(
    media: &MediaDescriptor,
    media_id: u32,
    lba: u64,
    len: usize,
    direction: Direction,
) -> Result<u64, Error> {
    if !media.media_present {
        return Err(Error::MediaAbsent);
    }
    if media_id != media.media_id {
        return Err(Error::MediaChanged);
    }
    if lba > media.last_block {
        return Err(Error::Parameter);
    }
    if len % media.block_size as usize != 0 {
        return Err(Error::BadBufferSize);
    }
    let blocks = (len / media.block_size as usize) as u64;
    if blocks == 0 {
        return Ok(0);
    }
    if blocks - 1 > media.last_block - lba {
        return Err(Error::Parameter);
    }
    if direction == Direction::Write && media.read_only {
        return Err(Error::WriteProtected);
    }
    Ok(blocks)
}

pub(crate) fn read(
    transport: &mut dyn Transport,
    session: &CardSession,
    lba: u64,
    buffer: &mut [u8],
) -> Result<(), Error> {
    let address = session.data_address(lba);
    if buffer.len() == BLOCK_SIZE as usize {
        transport.send_command(&Command::read_single(address))?;
        return transport.read_data_block(buffer);
    }

    transport.send_command(&Command::read_multiple(address))?;
    let mut result = Ok(());
    for chunk in buffer.chunks_mut(BLOCK_SIZE as usize) {
        if let Err(err) = transport.read_data_block(chunk) {
            result = Err(err);
            break;
        }
    }
    // The stream must be stopped even when a block failed mid-way.
    let stop = transport
        .send_command(&Command::stop_transmission())
        .map(|_| ());
    result.and(stop)
}

pub(crate) fn write(
    transport: &mut dyn Transport,
    session: &CardSession,
    lba: u64,
    buffer: &[u8],
) -> Result<(), Error> {
    let address = session.data_address(lba);
    if buffer.len() == BLOCK_SIZE as usize {
        transport.send_command(&Command::write_single(address))?;
        return transport.write_data_block(TOKEN_START_BLOCK, buffer);
    }

    transport.send_command(&Command::write_multiple(address))?;
    let mut result = Ok(());
    for chunk in buffer.chunks(BLOCK_SIZE as usize) {
        if let Err(err) = transport.write_data_block(TOKEN_WRITE_MULTIPLE, chunk) {
            result = Err(err);
            break;
        }
    }
    let stop = transport.end_multi_write();
    result.and(stop)
}
