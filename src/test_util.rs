//! Scripted transport for unit tests.
//!
//! Tests enqueue the exact exchanges they expect, in order; any deviation
//! panics with the command that went over the wire instead.

use std::collections::VecDeque;

use crate::proto::{
    Command, ACMD41, CMD0, CMD2, CMD3, CMD55, CMD7, CMD8, CMD9, OCR_CCS, OCR_POWER_UP,
};
use crate::transport::{Reply, ReplyFlags, Transport};
use crate::Error;

/// The identity register vector used across tests: manufacturer 0x03,
/// "SD" / "SU08G", manufactured 2018-11.
pub const CID_RAW: [u8; 16] = [
    0x03, 0x53, 0x44, 0x53, 0x55, 0x30, 0x38, 0x47, 0x80, 0x12, 0x34, 0x56, 0x78, 0x01, 0x2B,
    0x00,
];

/// A version 2 capacity register: (0x3B37 + 1) * 512 KiB.
pub const CSD_V2_RAW: [u8; 16] = [
    0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00, 0x3B, 0x37, 0x7F, 0x80, 0x0A, 0x40, 0x00,
    0x8D,
];

/// Block count described by [`CSD_V2_RAW`].
pub const CSD_V2_BLOCKS: u64 = (0x3B37 + 1) * 1024;

/// A version 1 capacity register: C_SIZE 3899, mult 7, block length 2^10.
pub const CSD_V1_RAW: [u8; 16] = [
    0x00, 0x26, 0x00, 0x32, 0x5F, 0x5A, 0x83, 0xCE, 0xFE, 0xFB, 0xCF, 0xFF, 0x92, 0x80, 0x40,
    0xDF,
];

#[derive(Debug)]
pub enum Exchange {
    Command {
        index: u8,
        reply: Result<Reply, Error>,
    },
    LongRegister {
        index: u8,
        raw: Result<[u8; 16], Error>,
    },
    ReadBlock(Result<Vec<u8>, Error>),
    WriteBlock {
        token: u8,
        result: Result<(), Error>,
    },
    EndMultiWrite(Result<(), Error>),
}

pub struct ScriptTransport {
    script: VecDeque<Exchange>,
    /// Index and argument of every command that went out.
    pub issued: Vec<(u8, u32)>,
    /// Payload of every block written.
    pub written: Vec<Vec<u8>>,
    pub align: usize,
    pub slept_us: u64,
}

pub fn reply(word: u32, flags: ReplyFlags) -> Reply {
    Reply { word, flags }
}

impl ScriptTransport {
    pub fn new(align: usize) -> ScriptTransport {
        let _ = env_logger::builder().is_test(true).try_init();
        ScriptTransport {
            script: VecDeque::new(),
            issued: Vec::new(),
            written: Vec::new(),
            align,
            slept_us: 0,
        }
    }

    pub fn push_command(&mut self, index: u8, reply: Result<Reply, Error>) {
        self.script.push_back(Exchange::Command { index, reply });
    }

    pub fn push_long(&mut self, index: u8, raw: Result<[u8; 16], Error>) {
        self.script.push_back(Exchange::LongRegister { index, raw });
    }

    pub fn push_read(&mut self, block: Result<Vec<u8>, Error>) {
        self.script.push_back(Exchange::ReadBlock(block));
    }

    pub fn push_write(&mut self, token: u8, result: Result<(), Error>) {
        self.script.push_back(Exchange::WriteBlock { token, result });
    }

    pub fn push_end_multi_write(&mut self, result: Result<(), Error>) {
        self.script.push_back(Exchange::EndMultiWrite(result));
    }

    /// Enqueue a complete, successful bring-up of a high capacity card.
    pub fn push_high_capacity_bring_up(&mut self) {
        let idle = ReplyFlags::IDLE | ReplyFlags::IDLE_VALID;
        self.push_command(CMD0, Ok(reply(0x01, idle)));
        self.push_command(CMD8, Ok(reply(0x1AA, idle)));
        self.push_command(CMD55, Ok(reply(0x01, idle)));
        self.push_command(
            ACMD41,
            Ok(reply(
                OCR_POWER_UP | OCR_CCS,
                ReplyFlags::READY | ReplyFlags::CCS_VALID | ReplyFlags::CCS,
            )),
        );
        self.push_long(CMD2, Ok(CID_RAW));
        self.push_command(CMD3, Ok(reply(0x0001_0000, ReplyFlags::empty())));
        self.push_long(CMD9, Ok(CSD_V2_RAW));
        self.push_command(CMD7, Ok(reply(0, ReplyFlags::empty())));
    }

    pub fn assert_done(&self) {
        assert!(
            self.script.is_empty(),
            "{} scripted exchanges never happened",
            self.script.len()
        );
    }

    fn next(&mut self, wanted: &str) -> Exchange {
        match self.script.pop_front() {
            Some(exchange) => exchange,
            None => panic!("unscripted {} exchange", wanted),
        }
    }
}

impl Transport for ScriptTransport {
    fn send_command(&mut self, command: &Command) -> Result<Reply, Error> {
        self.issued.push((command.index, command.arg));
        match self.next("command") {
            Exchange::Command { index, reply } => {
                assert_eq!(index, command.index, "unexpected command");
                reply
            }
            other => panic!("expected {:?}, got command {}", other, command.index),
        }
    }

    fn read_long_register(&mut self, command: &Command) -> Result<[u8; 16], Error> {
        self.issued.push((command.index, command.arg));
        match self.next("long register") {
            Exchange::LongRegister { index, raw } => {
                assert_eq!(index, command.index, "unexpected register fetch");
                raw
            }
            other => panic!("expected {:?}, got register fetch {}", other, command.index),
        }
    }

    fn read_data_block(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        match self.next("block read") {
            Exchange::ReadBlock(Ok(data)) => {
                assert_eq!(data.len(), buffer.len());
                buffer.copy_from_slice(&data);
                Ok(())
            }
            Exchange::ReadBlock(Err(err)) => Err(err),
            other => panic!("expected {:?}, got block read", other),
        }
    }

    fn write_data_block(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        match self.next("block write") {
            Exchange::WriteBlock {
                token: expected,
                result,
            } => {
                assert_eq!(expected, token, "unexpected write token");
                self.written.push(buffer.to_vec());
                result
            }
            other => panic!("expected {:?}, got block write", other),
        }
    }

    fn end_multi_write(&mut self) -> Result<(), Error> {
        match self.next("write termination") {
            Exchange::EndMultiWrite(result) => result,
            other => panic!("expected {:?}, got write termination", other),
        }
    }

    fn wait_not_busy(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn io_align(&self) -> usize {
        self.align
    }

    fn delay_us(&mut self, us: u32) {
        self.slept_us += u64::from(us);
    }
}
