//! sdcard-blockio - Removable-media block driver
//!
//! Owns the media descriptor, the card session and the transport choice.
//! Bring-up prefers the passthrough channel and falls over to the
//! alternate channel at most once, and only on failures that implicate
//! the wire rather than the card or the caller. Data paths re-validate
//! every request, bounce misaligned buffers and re-probe card presence
//! when a transfer fails.

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

use crate::blockio::{self, Direction, MediaDescriptor};
use crate::bounce::BounceBuffer;
use crate::init::{self, CardSession};
use crate::proto::BLOCK_SIZE;
use crate::transport::{Transport, TransportKind};
use crate::Error;

/// What the platform supplies to the driver: zero, one or two card
/// channels and a card-detect probe.
///
/// `transport` borrows a channel; the driver holds the borrow only for
/// the duration of one operation, so a host may lazily construct or
/// share the underlying peripherals. `reset_transport` is called before
/// the driver starts a card over on a channel it was not using.
pub trait TransportHost {
    /// Whether this channel is wired up at all. Probed once per driver.
    fn available(&self, kind: TransportKind) -> bool;

    /// Borrow the transport for a channel.
    fn transport(&mut self, kind: TransportKind) -> Result<&mut dyn Transport, Error>;

    /// Drop channel-local state ahead of a fresh bring-up on `kind`.
    fn reset_transport(&mut self, kind: TransportKind) -> Result<(), Error>;

    /// Probe card presence.
    fn media_present(&mut self) -> bool;
}

/// A removable SD card exposed as a 512-byte block device.
pub struct SdCardDriver<H> {
    host: H,
    active: TransportKind,
    // Channel availability is probed once, at attach.
    passthrough_available: bool,
    bitspi_available: bool,
    session: Option<CardSession>,
    media: MediaDescriptor,
}

impl<H> SdCardDriver<H>
where
    H: TransportHost,
{
    /// Attach to a host. The passthrough channel is preferred when both
    /// are wired up; a host with no channel at all is refused.
    pub fn new(host: H) -> Result<SdCardDriver<H>, Error> {
        let passthrough_available = host.available(TransportKind::Passthrough);
        let bitspi_available = host.available(TransportKind::BitSpi);
        let active = if passthrough_available {
            TransportKind::Passthrough
        } else if bitspi_available {
            TransportKind::BitSpi
        } else {
            return Err(Error::Unsupported);
        };
        Ok(SdCardDriver {
            host,
            active,
            passthrough_available,
            bitspi_available,
            session: None,
            media: MediaDescriptor::absent(),
        })
    }

    fn channel_available(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Passthrough => self.passthrough_available,
            TransportKind::BitSpi => self.bitspi_available,
        }
    }

    /// The published media state.
    pub fn media(&self) -> &MediaDescriptor {
        &self.media
    }

    /// The current card session, once bring-up has succeeded.
    pub fn session(&self) -> Option<&CardSession> {
        self.session.as_ref()
    }

    /// Which channel the card is being driven over.
    pub fn active_transport(&self) -> TransportKind {
        self.active
    }

    /// Detach and give the host back.
    pub fn free(self) -> H {
        self.host
    }

    /// Bring the inserted card up and publish its geometry.
    pub fn bring_up(&mut self) -> Result<(), Error> {
        self.session = None;
        if !self.host.media_present() {
            self.media.media_present = false;
            return Err(Error::MediaAbsent);
        }

        let result = match self.initialize_on(self.active) {
            Err(err) if err.triggers_fallback() => self.fall_back(err),
            other => other,
        };
        match result {
            Ok(session) => {
                self.media.media_id = self.media.media_id.wrapping_add(1);
                self.media.media_present = true;
                self.media.read_only = false;
                self.media.block_size = BLOCK_SIZE;
                self.media.last_block = session.last_block;
                self.media.io_align = self.host.transport(self.active)?.io_align();
                debug!(
                    "media {} up on {:?}: {} blocks",
                    self.media.media_id,
                    self.active,
                    session.last_block + 1
                );
                self.session = Some(session);
                Ok(())
            }
            Err(err) => {
                // The presence probe passed, so the card stays seated; it
                // just has no usable geometry until a bring-up succeeds.
                self.media.media_present = true;
                self.media.last_block = 0;
                Err(err)
            }
        }
    }

    fn initialize_on(&mut self, kind: TransportKind) -> Result<CardSession, Error> {
        let transport = self.host.transport(kind)?;
        init::bring_up(transport)
    }

    /// One-shot fallback to the alternate channel. The second attempt's
    /// failure is reported as its own error, not the first one's.
    fn fall_back(&mut self, original: Error) -> Result<CardSession, Error> {
        let alternate = self.active.alternate();
        if !self.channel_available(alternate) {
            return Err(original);
        }
        warn!(
            "bring-up failed on {:?} ({:?}), trying {:?}",
            self.active, original, alternate
        );
        self.host.reset_transport(alternate)?;
        self.active = alternate;
        self.initialize_on(alternate)
    }

    /// Read whole blocks starting at `lba` into `buffer`.
    pub fn read_blocks(&mut self, media_id: u32, lba: u64, buffer: &mut [u8]) -> Result<(), Error> {
        let blocks = blockio::check_request(
            &self.media,
            media_id,
            lba,
            buffer.len(),
            Direction::Read,
        )?;
        if blocks == 0 {
            return Ok(());
        }
        let result = self.dispatch_read(lba, buffer);
        self.screen_transfer_failure(result)
    }

    /// Write whole blocks starting at `lba` from `buffer`.
    pub fn write_blocks(&mut self, media_id: u32, lba: u64, buffer: &[u8]) -> Result<(), Error> {
        let blocks = blockio::check_request(
            &self.media,
            media_id,
            lba,
            buffer.len(),
            Direction::Write,
        )?;
        if blocks == 0 {
            return Ok(());
        }
        let result = self.dispatch_write(lba, buffer);
        self.screen_transfer_failure(result)
    }

    /// Writes complete synchronously, so this only confirms the media is
    /// still there.
    pub fn flush_blocks(&mut self) -> Result<(), Error> {
        if !self.media.media_present {
            return Err(Error::MediaAbsent);
        }
        Ok(())
    }

    /// Re-probe the media; an extended reset also re-runs bring-up.
    pub fn reset(&mut self, extended: bool) -> Result<(), Error> {
        if !self.host.media_present() {
            self.media.media_present = false;
            self.session = None;
            return Err(Error::MediaAbsent);
        }
        if extended {
            self.bring_up()
        } else {
            Ok(())
        }
    }

    fn dispatch_read(&mut self, lba: u64, buffer: &mut [u8]) -> Result<(), Error> {
        let align = self.media.io_align;
        // Present media without a session means a failed bring-up.
        let session = match self.session.as_ref() {
            Some(session) => session,
            None => return Err(Error::Device),
        };
        let transport = self.host.transport(self.active)?;
        if buffer.as_ptr() as usize % align == 0 {
            blockio::read(transport, session, lba, buffer)
        } else {
            // Aligned detour; released on success and failure alike.
            let mut bounce = BounceBuffer::new(buffer.len(), align)?;
            blockio::read(transport, session, lba, &mut bounce)?;
            buffer.copy_from_slice(&bounce);
            Ok(())
        }
    }

    fn dispatch_write(&mut self, lba: u64, buffer: &[u8]) -> Result<(), Error> {
        let align = self.media.io_align;
        let session = match self.session.as_ref() {
            Some(session) => session,
            None => return Err(Error::Device),
        };
        let transport = self.host.transport(self.active)?;
        if buffer.as_ptr() as usize % align == 0 {
            blockio::write(transport, session, lba, buffer)
        } else {
            let mut bounce = BounceBuffer::new(buffer.len(), align)?;
            bounce.copy_from_slice(buffer);
            blockio::write(transport, session, lba, &bounce)
        }
    }

    /// A failed transfer may really be a vanished card. Re-probe, and if
    /// the card is gone report that instead and invalidate the media.
    fn screen_transfer_failure(&mut self, result: Result<(), Error>) -> Result<(), Error> {
        if let Err(err) = result {
            if !self.host.media_present() {
                warn!("media removed mid-transfer");
                self.media.media_present = false;
                self.media.media_id = self.media.media_id.wrapping_add(1);
                self.session = None;
                return Err(Error::MediaAbsent);
            }
            return Err(err);
        }
        Ok(())
    }
}
