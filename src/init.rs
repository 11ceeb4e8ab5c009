//! sdcard-blockio - Card bring-up
//!
//! The initialization state machine. Runs the same fixed step order over
//! any [`Transport`]; the transport decides what each step means on its
//! wire. Progress is one way, any step failure abandons the card with no
//! partial session left behind.

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

use crate::poll::BoundedPoll;
use crate::proto::{Command, BLOCK_SIZE, IF_COND_CHECK_PATTERN};
use crate::registers::{Cid, Csd};
use crate::transport::{ReplyFlags, Transport};
use crate::Error;

/// Operating-condition poll budget: 100 attempts, 10 ms apart.
pub const OP_COND_ATTEMPTS: u32 = 100;
pub const OP_COND_INTERVAL_US: u32 = 10_000;

/// What kind of card bring-up found.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardClass {
    /// Pre-2.0 card, byte addressed.
    Legacy,
    /// Version 1 capacity register on a pre-2.0 card, byte addressed.
    StandardV1,
    /// 2.0 standard capacity, byte addressed.
    StandardV2,
    /// 2.0 high capacity, block addressed.
    HighCapacity,
}

impl CardClass {
    pub fn high_capacity(self) -> bool {
        self == CardClass::HighCapacity
    }
}

/// Everything bring-up learned about the card. Valid until the media
/// changes or a transport fallback rebuilds it.
#[derive(Debug, Clone)]
pub struct CardSession {
    pub class: CardClass,
    /// Published relative address, never zero.
    pub rca: u16,
    pub csd: Csd,
    /// Raw identity register bytes, kept even when they do not decode.
    pub cid: [u8; 16],
    /// Decoded identity, if the register decoded cleanly.
    pub identity: Option<Cid>,
    /// Operating-conditions word captured at power-up.
    pub ocr: u32,
    pub capacity_bytes: u64,
    /// Address of the last 512-byte block.
    pub last_block: u64,
}

impl CardSession {
    /// The command argument addressing `lba`: block units on a high
    /// capacity card, byte units otherwise.
    pub fn data_address(&self, lba: u64) -> u32 {
        if self.class.high_capacity() {
            lba as u32
        } else {
            (lba * u64::from(BLOCK_SIZE)) as u32
        }
    }
}

/// Run the card through reset, voltage check, the operating-condition
/// poll, identification, address assignment, register fetch, selection
/// and block length configuration.
pub fn bring_up(transport: &mut dyn Transport) -> Result<CardSession, Error> {
    // Reset. A card that can report its state and does not report idle
    // here did not actually reset.
    let reset = transport.send_command(&Command::go_idle())?;
    if reset.flags.contains(ReplyFlags::IDLE_VALID) && !reset.idle() {
        warn!("card did not enter idle state on reset");
        return Err(Error::Device);
    }

    // Voltage check. Only 2.0 cards answer; any failure or a mangled
    // check pattern marks the card legacy and bring-up continues.
    let supports_v2 = match transport.send_command(&Command::interface_condition()) {
        Ok(reply) => reply.word & 0xFFF == IF_COND_CHECK_PATTERN,
        Err(_) => {
            debug!("no interface condition answer, assuming legacy card");
            false
        }
    };

    // Operating-condition poll until the card reports power-up complete.
    let mut poll = BoundedPoll::new(OP_COND_ATTEMPTS, OP_COND_INTERVAL_US);
    let op_cond = loop {
        transport.send_command(&Command::app_prefix(0))?;
        let reply = transport.send_command(&Command::op_cond(supports_v2))?;
        if reply.ready() {
            break reply;
        }
        poll.retry(|us| transport.delay_us(us), Error::Timeout)?;
    };

    // The capacity class rides along with power-up where the wire allows;
    // otherwise ask for the operating-conditions register explicitly.
    let (block_addressed, ocr) = match op_cond.capacity_class() {
        Some(ccs) => (ccs, op_cond.word),
        None => {
            let reply = transport.send_command(&Command::read_ocr())?;
            (reply.capacity_class().unwrap_or(false), reply.word)
        }
    };
    let mut class = if block_addressed {
        CardClass::HighCapacity
    } else if supports_v2 {
        CardClass::StandardV2
    } else {
        CardClass::Legacy
    };

    // Identification. Losing the exchange is fatal, losing the decode is
    // not: the identity is informational.
    let raw_cid = transport.read_long_register(&Command::identify())?;
    let identity = match Cid::parse(raw_cid) {
        Ok(cid) => Some(cid),
        Err(_) => {
            warn!("identity register did not decode, continuing without it");
            None
        }
    };

    // Address assignment. Zero is the unassigned address.
    let published = transport.send_command(&Command::publish_address())?;
    let rca = published.published_address();
    if rca == 0 {
        warn!("card published the unassigned address");
        return Err(Error::Device);
    }

    // Capacity register. An undecodable layout abandons bring-up before
    // any capacity value is committed.
    let raw_csd = transport.read_long_register(&Command::send_csd(rca))?;
    let csd = Csd::parse(raw_csd)?;
    match csd {
        Csd::V1(_) => {
            if class == CardClass::Legacy {
                class = CardClass::StandardV1;
            }
        }
        Csd::V2(_) => class = CardClass::HighCapacity,
    }
    let capacity_bytes = csd.capacity_bytes();
    if csd.block_count() == 0 {
        // A card smaller than one block cannot be addressed.
        return Err(Error::Unsupported);
    }
    let last_block = csd.block_count() - 1;

    // Select the card for data transfers.
    transport.send_command(&Command::select(rca))?;

    // High capacity cards are fixed at 512-byte blocks already.
    if !class.high_capacity() {
        transport.send_command(&Command::set_block_length(BLOCK_SIZE))?;
    }

    debug!(
        "card ready: {:?}, rca {}, {} blocks",
        class,
        rca,
        last_block + 1
    );
    Ok(CardSession {
        class,
        rca,
        csd,
        cid: raw_cid,
        identity,
        ocr,
        capacity_bytes,
        last_block,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proto::{
        ACMD41, CMD0, CMD16, CMD2, CMD3, CMD55, CMD58, CMD7, CMD8, CMD9, OCR_CCS, OCR_POWER_UP,
        OP_COND_HIGH_CAPACITY,
    };
    use crate::test_util::{reply, ScriptTransport, CID_RAW, CSD_V1_RAW, CSD_V2_BLOCKS, CSD_V2_RAW};
    use crate::transport::ReplyFlags as F;

    fn idle() -> F {
        F::IDLE | F::IDLE_VALID
    }

    #[test]
    fn high_capacity_bring_up() {
        let mut t = ScriptTransport::new(4);
        t.push_high_capacity_bring_up();

        let session = bring_up(&mut t).unwrap();
        t.assert_done();

        assert_eq!(session.class, CardClass::HighCapacity);
        assert_eq!(session.rca, 1);
        assert_eq!(session.capacity_bytes, CSD_V2_BLOCKS * 512);
        assert_eq!(session.last_block, CSD_V2_BLOCKS - 1);
        assert_eq!(session.identity.unwrap().product_name(), b"SU08G");
        assert_eq!(session.cid, CID_RAW);
        assert_eq!(session.ocr, OCR_POWER_UP | OCR_CCS);
        // Block addressing: the address is the block number itself.
        assert_eq!(session.data_address(1000), 1000);
    }

    #[test]
    fn standard_capacity_card_gets_a_block_length() {
        let mut t = ScriptTransport::new(4);
        t.push_command(CMD0, Ok(reply(0x01, idle())));
        t.push_command(CMD8, Ok(reply(0x1AA, idle())));
        t.push_command(CMD55, Ok(reply(0x01, idle())));
        t.push_command(
            ACMD41,
            Ok(reply(OCR_POWER_UP, F::READY | F::CCS_VALID)),
        );
        t.push_long(CMD2, Ok(CID_RAW));
        t.push_command(CMD3, Ok(reply(0x0001_0000, F::empty())));
        t.push_long(CMD9, Ok(CSD_V1_RAW));
        t.push_command(CMD7, Ok(reply(0, F::empty())));
        t.push_command(CMD16, Ok(reply(0, F::IDLE_VALID)));

        let session = bring_up(&mut t).unwrap();
        t.assert_done();

        assert_eq!(session.class, CardClass::StandardV2);
        assert!(t.issued.contains(&(CMD16, 512)));
        // Byte addressing.
        assert_eq!(session.data_address(2), 1024);
    }

    #[test]
    fn legacy_card_skips_high_capacity_negotiation() {
        let mut t = ScriptTransport::new(4);
        t.push_command(CMD0, Ok(reply(0x01, idle())));
        t.push_command(CMD8, Err(Error::Unsupported));
        t.push_command(CMD55, Ok(reply(0x01, idle())));
        t.push_command(
            ACMD41,
            Ok(reply(OCR_POWER_UP, F::READY | F::CCS_VALID)),
        );
        t.push_long(CMD2, Ok(CID_RAW));
        t.push_command(CMD3, Ok(reply(0x0001_0000, F::empty())));
        t.push_long(CMD9, Ok(CSD_V1_RAW));
        t.push_command(CMD7, Ok(reply(0, F::empty())));
        t.push_command(CMD16, Ok(reply(0, F::IDLE_VALID)));

        let session = bring_up(&mut t).unwrap();
        t.assert_done();

        assert_eq!(session.class, CardClass::StandardV1);
        // The capacity-support bit must not be offered to a legacy card.
        let (_, acmd41_arg) = t
            .issued
            .iter()
            .cloned()
            .find(|&(index, _)| index == ACMD41)
            .unwrap();
        assert_eq!(acmd41_arg & OP_COND_HIGH_CAPACITY, 0);
    }

    #[test]
    fn op_cond_poll_succeeds_on_the_final_attempt() {
        let mut t = ScriptTransport::new(4);
        t.push_command(CMD0, Ok(reply(0x01, idle())));
        t.push_command(CMD8, Ok(reply(0x1AA, idle())));
        for _ in 0..OP_COND_ATTEMPTS - 1 {
            t.push_command(CMD55, Ok(reply(0x01, idle())));
            t.push_command(ACMD41, Ok(reply(0, idle())));
        }
        t.push_command(CMD55, Ok(reply(0x01, idle())));
        t.push_command(
            ACMD41,
            Ok(reply(
                OCR_POWER_UP | OCR_CCS,
                F::READY | F::CCS_VALID | F::CCS,
            )),
        );
        t.push_long(CMD2, Ok(CID_RAW));
        t.push_command(CMD3, Ok(reply(0x0001_0000, F::empty())));
        t.push_long(CMD9, Ok(CSD_V2_RAW));
        t.push_command(CMD7, Ok(reply(0, F::empty())));

        let session = bring_up(&mut t).unwrap();
        t.assert_done();
        assert_eq!(session.class, CardClass::HighCapacity);
        assert_eq!(
            t.slept_us,
            u64::from(OP_COND_ATTEMPTS - 1) * u64::from(OP_COND_INTERVAL_US)
        );
    }

    #[test]
    fn op_cond_poll_exhaustion_times_out() {
        let mut t = ScriptTransport::new(4);
        t.push_command(CMD0, Ok(reply(0x01, idle())));
        t.push_command(CMD8, Ok(reply(0x1AA, idle())));
        for _ in 0..OP_COND_ATTEMPTS {
            t.push_command(CMD55, Ok(reply(0x01, idle())));
            t.push_command(ACMD41, Ok(reply(0, idle())));
        }

        assert_eq!(bring_up(&mut t).unwrap_err(), Error::Timeout);
        t.assert_done();
    }

    #[test]
    fn reset_without_idle_fails() {
        let mut t = ScriptTransport::new(4);
        t.push_command(CMD0, Ok(reply(0x00, F::IDLE_VALID)));
        assert_eq!(bring_up(&mut t).unwrap_err(), Error::Device);
    }

    #[test]
    fn zero_published_address_fails() {
        let mut t = ScriptTransport::new(4);
        t.push_command(CMD0, Ok(reply(0x01, idle())));
        t.push_command(CMD8, Ok(reply(0x1AA, idle())));
        t.push_command(CMD55, Ok(reply(0x01, idle())));
        t.push_command(
            ACMD41,
            Ok(reply(
                OCR_POWER_UP | OCR_CCS,
                F::READY | F::CCS_VALID | F::CCS,
            )),
        );
        t.push_long(CMD2, Ok(CID_RAW));
        t.push_command(CMD3, Ok(reply(0x0000_0000, F::empty())));
        assert_eq!(bring_up(&mut t).unwrap_err(), Error::Device);
    }

    #[test]
    fn identity_decode_failure_is_not_fatal() {
        let mut bad_cid = CID_RAW;
        bad_cid[4] = 0x01;

        let mut t = ScriptTransport::new(4);
        t.push_command(CMD0, Ok(reply(0x01, idle())));
        t.push_command(CMD8, Ok(reply(0x1AA, idle())));
        t.push_command(CMD55, Ok(reply(0x01, idle())));
        t.push_command(
            ACMD41,
            Ok(reply(
                OCR_POWER_UP | OCR_CCS,
                F::READY | F::CCS_VALID | F::CCS,
            )),
        );
        t.push_long(CMD2, Ok(bad_cid));
        t.push_command(CMD3, Ok(reply(0x0001_0000, F::empty())));
        t.push_long(CMD9, Ok(CSD_V2_RAW));
        t.push_command(CMD7, Ok(reply(0, F::empty())));

        let session = bring_up(&mut t).unwrap();
        t.assert_done();
        assert!(session.identity.is_none());
        assert_eq!(session.class, CardClass::HighCapacity);
    }

    #[test]
    fn missing_capacity_class_falls_back_to_an_ocr_read() {
        // A wire whose op-cond answer has no capacity information.
        let mut t = ScriptTransport::new(1);
        t.push_command(CMD0, Ok(reply(0x01, idle())));
        t.push_command(CMD8, Ok(reply(0x1AA, idle())));
        t.push_command(CMD55, Ok(reply(0x01, idle())));
        t.push_command(ACMD41, Ok(reply(0x00, F::IDLE_VALID | F::READY)));
        t.push_command(
            CMD58,
            Ok(reply(
                OCR_POWER_UP | OCR_CCS,
                F::READY | F::CCS_VALID | F::CCS,
            )),
        );
        t.push_long(CMD2, Ok(CID_RAW));
        t.push_command(CMD3, Ok(reply(0x0001_0000, F::empty())));
        t.push_long(CMD9, Ok(CSD_V2_RAW));
        t.push_command(CMD7, Ok(reply(0, F::empty())));

        let session = bring_up(&mut t).unwrap();
        t.assert_done();
        assert_eq!(session.class, CardClass::HighCapacity);
    }
}
