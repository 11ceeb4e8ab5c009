//! sdcard-blockio - Card register decoding
//!
//! Parses the two layouts of the capacity register and the identity
//! register. Capacity decode failure is fatal to bring-up; identity decode
//! failure is informational only.

use crate::proto::BLOCK_SIZE;
use crate::Error;

/// Capacity register, version 1 layout (standard capacity).
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, Default)]
pub struct CsdV1 {
    /// The 16 raw bytes of the register.
    pub data: [u8; 16],
}

/// Capacity register, version 2 layout (high capacity).
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, Default)]
pub struct CsdV2 {
    /// The 16 raw bytes of the register.
    pub data: [u8; 16],
}

/// A decoded capacity register.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone)]
pub enum Csd {
    /// Version 1 layout, standard capacity.
    V1(CsdV1),
    /// Version 2 layout, high capacity.
    V2(CsdV2),
}

impl Csd {
    /// Decode a raw 16-byte capacity register. The structure version is the
    /// top two bits of byte 0; only versions 0 and 1 are defined. Any other
    /// version fails as unsupported and no capacity value is produced.
    pub fn parse(raw: [u8; 16]) -> Result<Csd, Error> {
        match (raw[0] & 0xC0) >> 6 {
            0 => Ok(Csd::V1(CsdV1 { data: raw })),
            1 => Ok(Csd::V2(CsdV2 { data: raw })),
            _ => Err(Error::Unsupported),
        }
    }

    /// Card capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.capacity_bytes(),
            Csd::V2(csd) => csd.capacity_bytes(),
        }
    }

    /// Card capacity in 512-byte blocks.
    pub fn block_count(&self) -> u64 {
        self.capacity_bytes() / u64::from(BLOCK_SIZE)
    }

    /// Raw register contents.
    pub fn raw(&self) -> &[u8; 16] {
        match self {
            Csd::V1(csd) => &csd.data,
            Csd::V2(csd) => &csd.data,
        }
    }
}

impl CsdV1 {
    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);

    /// Capacity in bytes:
    /// `(C_SIZE + 1) * 2^(C_SIZE_MULT + 2) * 2^READ_BL_LEN`.
    pub fn capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }
}

impl CsdV2 {
    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);

    /// Capacity in bytes: `(C_SIZE + 1) * 512 KiB`, fixed 512-byte blocks.
    pub fn capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }
}

/// Decoded identity register.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, Default)]
pub struct Cid {
    /// The 16 raw bytes of the register.
    pub data: [u8; 16],
}

impl Cid {
    /// Decode a raw identity register, checking that the text fields are
    /// printable and the manufacturing month is plausible. Failure here is
    /// never fatal to bring-up.
    pub fn parse(raw: [u8; 16]) -> Result<Cid, Error> {
        let cid = Cid { data: raw };
        let printable = |b: u8| (0x20..=0x7E).contains(&b);
        if !cid.oem_application_id().iter().cloned().all(printable) {
            return Err(Error::Device);
        }
        if !cid.product_name().iter().cloned().all(printable) {
            return Err(Error::Device);
        }
        if cid.manufacturing_month() == 0 || cid.manufacturing_month() > 12 {
            return Err(Error::Device);
        }
        Ok(cid)
    }

    /// Manufacturer id.
    pub fn manufacturer_id(&self) -> u8 {
        self.data[0]
    }

    /// Two-character OEM/application id.
    pub fn oem_application_id(&self) -> &[u8] {
        &self.data[1..3]
    }

    /// Five-character product name.
    pub fn product_name(&self) -> &[u8] {
        &self.data[3..8]
    }

    /// Major half of the BCD product revision.
    pub fn revision_major(&self) -> u8 {
        (self.data[8] >> 4) & 0x0F
    }

    /// Minor half of the BCD product revision.
    pub fn revision_minor(&self) -> u8 {
        self.data[8] & 0x0F
    }

    /// Assembled 32-bit serial number.
    pub fn serial_number(&self) -> u32 {
        u32::from(self.data[9]) << 24
            | u32::from(self.data[10]) << 16
            | u32::from(self.data[11]) << 8
            | u32::from(self.data[12])
    }

    /// Manufacturing year (8-bit offset from 2000).
    pub fn manufacturing_year(&self) -> u16 {
        2000 + (u16::from(self.data[13] & 0x0F) << 4 | u16::from(self.data[14] >> 4))
    }

    /// Manufacturing month, 1-12.
    pub fn manufacturing_month(&self) -> u8 {
        self.data[14] & 0x0F
    }
}
