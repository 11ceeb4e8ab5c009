//! sdcard-blockio - SD card wire protocol definitions
//!
//! Command indices, status bits, data tokens and the command/CRC codec.
//! Everything in here is bit-exact per the SD Physical Layer Specification;
//! a wrong bit is rejected silently by the card, not reported.

use bitflags::bitflags;

/// GO_IDLE_STATE - reset the card to idle state
pub const CMD0: u8 = 0x00;
/// ALL_SEND_CID - ask the card to send its identity register
pub const CMD2: u8 = 0x02;
/// SEND_RELATIVE_ADDR - ask the card to publish a relative address
pub const CMD3: u8 = 0x03;
/// SELECT_CARD - select the card by relative address
pub const CMD7: u8 = 0x07;
/// SEND_IF_COND - verify the card interface operating condition
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the capacity register
pub const CMD9: u8 = 0x09;
/// SEND_CID - read the identity register (point-to-point form)
pub const CMD10: u8 = 0x0A;
/// STOP_TRANSMISSION - end a multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// SEND_STATUS - read the card status register
pub const CMD13: u8 = 0x0D;
/// SET_BLOCKLEN - set the block length for standard capacity cards
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read data blocks until STOP_TRANSMISSION
pub const CMD18: u8 = 0x12;
/// WRITE_BLOCK - write a single data block
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write data blocks until the stop token
pub const CMD25: u8 = 0x19;
/// APP_CMD - escape for application specific commands
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the operating-conditions register
pub const CMD58: u8 = 0x3A;
/// SD_SEND_OP_COND - start card initialization, carries host capacity support
pub const ACMD41: u8 = 0x29;

/// Fixed check pattern carried in the interface-condition command.
pub const IF_COND_CHECK_PATTERN: u32 = 0x1AA;
/// Host capacity support bit in the operating-condition argument.
pub const OP_COND_HIGH_CAPACITY: u32 = 1 << 30;

/// Power-up-complete bit in the operating-conditions register.
pub const OCR_POWER_UP: u32 = 1 << 31;
/// Card capacity status bit in the operating-conditions register.
pub const OCR_CCS: u32 = 1 << 30;

/// The exposed block size. Fixed at 512 bytes after bring-up regardless of
/// the card's native block length.
pub const BLOCK_SIZE: u32 = 512;

/// Start token for single block reads and writes.
pub const TOKEN_START_BLOCK: u8 = 0xFE;
/// Start token for each block of a multiple block write.
pub const TOKEN_WRITE_MULTIPLE: u8 = 0xFC;
/// Stop token terminating a multiple block write.
pub const TOKEN_STOP_TRAN: u8 = 0xFD;

/// Mask for the 5-bit data response returned after a block write.
pub const DATA_RESPONSE_MASK: u8 = 0x1F;
/// Data response: block accepted.
pub const DATA_RESPONSE_ACCEPTED: u8 = 0x05;
/// Data response: block rejected, CRC error.
pub const DATA_RESPONSE_CRC_ERROR: u8 = 0x0B;
/// Data response: block rejected, write error.
pub const DATA_RESPONSE_WRITE_ERROR: u8 = 0x0D;

bitflags! {
    /// Status bits of a short (R1) card response.
    pub struct R1Status: u8 {
        const IDLE_STATE           = 1 << 0;
        const ERASE_RESET          = 1 << 1;
        const ILLEGAL_COMMAND      = 1 << 2;
        const COM_CRC_ERROR        = 1 << 3;
        const ERASE_SEQUENCE_ERROR = 1 << 4;
        const ADDRESS_ERROR        = 1 << 5;
        const PARAMETER_ERROR      = 1 << 6;
    }
}

/// The response shape a command expects on the wire.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseShape {
    /// Short status response (R1).
    Short,
    /// Short status response followed by a busy signal (R1b).
    ShortBusy,
    /// Long 136-bit register response (R2).
    LongRegister,
    /// Operating-conditions register response (R3).
    OpCond,
    /// Published relative address response (R6).
    AddressPublish,
    /// Interface-condition response (R7).
    InterfaceCondition,
}

/// One command exchange: index, argument and expected response shape.
/// Constructed fresh for every exchange.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone)]
pub struct Command {
    pub index: u8,
    pub arg: u32,
    pub shape: ResponseShape,
}

impl Command {
    pub fn go_idle() -> Self {
        Command {
            index: CMD0,
            arg: 0,
            shape: ResponseShape::Short,
        }
    }

    pub fn interface_condition() -> Self {
        Command {
            index: CMD8,
            arg: IF_COND_CHECK_PATTERN,
            shape: ResponseShape::InterfaceCondition,
        }
    }

    pub fn app_prefix(rca: u16) -> Self {
        Command {
            index: CMD55,
            arg: u32::from(rca) << 16,
            shape: ResponseShape::Short,
        }
    }

    pub fn op_cond(high_capacity: bool) -> Self {
        Command {
            index: ACMD41,
            arg: if high_capacity {
                OP_COND_HIGH_CAPACITY
            } else {
                0
            },
            shape: ResponseShape::OpCond,
        }
    }

    pub fn read_ocr() -> Self {
        Command {
            index: CMD58,
            arg: 0,
            shape: ResponseShape::OpCond,
        }
    }

    pub fn identify() -> Self {
        Command {
            index: CMD2,
            arg: 0,
            shape: ResponseShape::LongRegister,
        }
    }

    pub fn publish_address() -> Self {
        Command {
            index: CMD3,
            arg: 0,
            shape: ResponseShape::AddressPublish,
        }
    }

    pub fn send_csd(rca: u16) -> Self {
        Command {
            index: CMD9,
            arg: u32::from(rca) << 16,
            shape: ResponseShape::LongRegister,
        }
    }

    pub fn select(rca: u16) -> Self {
        Command {
            index: CMD7,
            arg: u32::from(rca) << 16,
            shape: ResponseShape::ShortBusy,
        }
    }

    pub fn set_block_length(len: u32) -> Self {
        Command {
            index: CMD16,
            arg: len,
            shape: ResponseShape::Short,
        }
    }

    pub fn read_single(addr: u32) -> Self {
        Command {
            index: CMD17,
            arg: addr,
            shape: ResponseShape::Short,
        }
    }

    pub fn read_multiple(addr: u32) -> Self {
        Command {
            index: CMD18,
            arg: addr,
            shape: ResponseShape::Short,
        }
    }

    pub fn write_single(addr: u32) -> Self {
        Command {
            index: CMD24,
            arg: addr,
            shape: ResponseShape::Short,
        }
    }

    pub fn write_multiple(addr: u32) -> Self {
        Command {
            index: CMD25,
            arg: addr,
            shape: ResponseShape::Short,
        }
    }

    pub fn stop_transmission() -> Self {
        Command {
            index: CMD12,
            arg: 0,
            shape: ResponseShape::ShortBusy,
        }
    }

    pub fn send_status(rca: u16) -> Self {
        Command {
            index: CMD13,
            arg: u32::from(rca) << 16,
            shape: ResponseShape::Short,
        }
    }
}

/// Pack a command into its 6-byte wire frame:
/// `[0x40|cmd][arg31:24][arg23:16][arg15:8][arg7:0][crc7<<1|1]`.
pub fn pack_frame(index: u8, arg: u32) -> [u8; 6] {
    let mut frame = [
        0x40 | (index & 0x3F),
        (arg >> 24) as u8,
        (arg >> 16) as u8,
        (arg >> 8) as u8,
        arg as u8,
        0,
    ];
    frame[5] = crc7(&frame[0..5]);
    frame
}

/// CRC7 over the first five frame bytes. Polynomial 0x89, MSB first, seed 0.
/// Returns the transmitted byte: the 7-bit remainder shifted left one with
/// the stop bit in the LSB.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for mut byte in data.iter().cloned() {
        for _ in 0..8 {
            crc <<= 1;
            if (byte & 0x80) ^ (crc & 0x80) != 0 {
                crc ^= 0x09;
            }
            byte <<= 1;
        }
    }
    (crc << 1) | 0x01
}

/// CRC16 over a data payload. CCITT polynomial 0x1021, MSB first, seed 0.
/// Transmitted big-endian on the wire.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
